// ===============================
// src/gateway.rs
// ===============================
//
// Execution gateways. The live gateway owns every order it has submitted:
// it validates against the current session, places through the broker client,
// polls the per-day execution inquiry to turn cumulative averages into delta
// fills, and escalates stale orders (buys get canceled, sells get re-priced
// and finally converted to market). The paper gateway keeps the same command
// surface but fills everything locally after a short delay.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use chrono::Local;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{
    ErrorNote, Event, Fill, OrderRequest, OrderStatus, OrderType, OrderUpdate, Payload, Side,
};
use crate::engine::EngineHandle;
use crate::kis::{KisClient, KisError};
use crate::metrics;
use crate::session::{MarketSession, SessionClock};

const FILL_POLL_SECS: u64 = 3;
const SWEEP_SECS: u64 = 30;
/// Resting buys older than this are given up on.
const STALE_BUY_SECS: u64 = 600;
/// Resting sells older than this start escalating.
const STALE_SELL_SECS: u64 = 90;
const MAX_SELL_FALLBACKS: u8 = 2;

#[derive(Debug)]
pub enum GatewayCmd {
    Submit(OrderRequest),
    Cancel { order_id: String },
    Modify { order_id: String, new_price: f64 },
    /// Symbols tradable in the extended session.
    SetNxt(Vec<String>),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session {0} does not accept orders")]
    SessionClosed(&'static str),
    #[error("session {0} only accepts limit orders")]
    AuctionLimitOnly(&'static str),
    #[error("{symbol} is not tradable in the extended session")]
    NotNxt { symbol: String },
    #[error(transparent)]
    Kis(#[from] KisError),
}

struct TrackedOrder {
    req: OrderRequest,
    broker_no: String,
    branch_no: String,
    filled_qty: i64,
    filled_avg: f64,
    submitted: Instant,
    fallbacks: u8,
}

/// Session admission the broker would reject anyway; failing fast keeps the
/// reject on our side with a readable reason.
fn admission(
    session: MarketSession,
    req: &OrderRequest,
    nxt: &AHashSet<String>,
) -> Result<(), GatewayError> {
    if !session.accepts_orders() {
        return Err(GatewayError::SessionClosed(session.as_str()));
    }
    if session.is_extended() && !nxt.contains(&req.symbol) {
        return Err(GatewayError::NotNxt { symbol: req.symbol.clone() });
    }
    if req.order_type == OrderType::Market && !session.allows_market_orders() {
        return Err(GatewayError::AuctionLimitOnly(session.as_str()));
    }
    Ok(())
}

/// The execution inquiry reports cumulative quantity and average price per
/// order; the newest slice falls out of the difference.
fn delta_fill_price(cum_qty: i64, cum_avg: f64, prev_qty: i64, prev_avg: f64) -> f64 {
    let delta = (cum_qty - prev_qty) as f64;
    if delta <= 0.0 {
        return cum_avg;
    }
    let raw = (cum_avg * cum_qty as f64 - prev_avg * prev_qty as f64) / delta;
    (raw * 100.0).round() / 100.0
}

pub struct LiveGateway {
    kis: Arc<KisClient>,
    engine: EngineHandle,
    clock: SessionClock,
    orders: AHashMap<String, TrackedOrder>,
    by_broker: AHashMap<String, String>,
    nxt: AHashSet<String>,
}

impl LiveGateway {
    pub fn new(kis: Arc<KisClient>, engine: EngineHandle, clock: SessionClock) -> Self {
        Self {
            kis,
            engine,
            clock,
            orders: AHashMap::new(),
            by_broker: AHashMap::new(),
            nxt: AHashSet::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<GatewayCmd>) {
        let mut poll = interval(Duration::from_secs(FILL_POLL_SECS));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(Duration::from_secs(SWEEP_SECS));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("live gateway started");
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = poll.tick() => self.poll_fills().await,
                _ = sweep.tick() => self.sweep_stale().await,
            }
        }
        info!(open = self.orders.len(), "live gateway stopped");
    }

    async fn handle(&mut self, cmd: GatewayCmd) {
        match cmd {
            GatewayCmd::Submit(req) => self.submit(req).await,
            GatewayCmd::Cancel { order_id } => self.cancel(&order_id).await,
            GatewayCmd::Modify { order_id, new_price } => self.modify(&order_id, new_price).await,
            GatewayCmd::SetNxt(symbols) => {
                info!(count = symbols.len(), "extended-session symbol list updated");
                self.nxt = symbols.into_iter().collect();
            }
        }
    }

    async fn submit(&mut self, req: OrderRequest) {
        let session = self.clock.now();
        if let Err(e) = admission(session, &req, &self.nxt) {
            self.reject(&req, e.to_string()).await;
            return;
        }
        match self.kis.place_order(&req, session.is_extended()).await {
            Ok(ack) => {
                info!(
                    id = %req.id,
                    broker_no = %ack.order_no,
                    symbol = %req.symbol,
                    side = req.side.as_str(),
                    qty = req.qty,
                    "order accepted"
                );
                metrics::ORDERS.with_label_values(&["submitted"]).inc();
                self.update(&req, OrderStatus::Submitted, Some(ack.order_no.clone()), None).await;
                self.by_broker.insert(ack.order_no.clone(), req.id.clone());
                self.orders.insert(
                    req.id.clone(),
                    TrackedOrder {
                        req,
                        broker_no: ack.order_no,
                        branch_no: ack.branch_no,
                        filled_qty: 0,
                        filled_avg: 0.0,
                        submitted: Instant::now(),
                        fallbacks: 0,
                    },
                );
            }
            Err(e) => self.reject(&req, e.to_string()).await,
        }
    }

    async fn cancel(&mut self, order_id: &str) {
        let Some(t) = self.orders.get(order_id) else {
            debug!(%order_id, "cancel for unknown order");
            return;
        };
        match self.kis.cancel_order(&t.branch_no, &t.broker_no).await {
            Ok(()) => {
                metrics::ORDERS.with_label_values(&["canceled"]).inc();
                let req = t.req.clone();
                self.update(&req, OrderStatus::Canceled, Some(t.broker_no.clone()), None).await;
                self.forget(order_id);
            }
            Err(e) => warn!(%order_id, err = %e, "cancel failed"),
        }
    }

    async fn modify(&mut self, order_id: &str, new_price: f64) {
        let Some(t) = self.orders.get_mut(order_id) else {
            debug!(%order_id, "modify for unknown order");
            return;
        };
        match self.kis.modify_order(&t.branch_no, &t.broker_no, new_price).await {
            Ok(ack) => {
                info!(%order_id, new_price, new_broker_no = %ack.order_no, "order re-priced");
                if !ack.order_no.is_empty() {
                    self.by_broker.remove(&t.broker_no);
                    self.by_broker.insert(ack.order_no.clone(), order_id.to_string());
                    t.broker_no = ack.order_no;
                }
                t.req.price = Some(new_price);
                t.submitted = Instant::now();
            }
            Err(e) => warn!(%order_id, err = %e, "modify failed"),
        }
    }

    async fn poll_fills(&mut self) {
        if self.orders.is_empty() {
            return;
        }
        let today = Local::now().date_naive();
        let rows = match self.kis.daily_fills(today).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(err = %e, "fill inquiry failed");
                self.engine
                    .send(Event::new(
                        "gateway",
                        Payload::Error(ErrorNote {
                            component: "gateway",
                            message: format!("fill inquiry failed: {e}"),
                            recoverable: true,
                        }),
                    ))
                    .await;
                return;
            }
        };

        let mut done: Vec<String> = Vec::new();
        for row in rows {
            let Some(order_id) = self.by_broker.get(&row.order_no).cloned() else {
                continue;
            };
            let Some(t) = self.orders.get_mut(&order_id) else {
                continue;
            };
            if row.qty <= t.filled_qty {
                continue;
            }
            let delta_qty = row.qty - t.filled_qty;
            let price = delta_fill_price(row.qty, row.price, t.filled_qty, t.filled_avg);
            t.filled_qty = row.qty;
            t.filled_avg = row.price;

            let fill = Fill {
                order_id: t.req.id.clone(),
                symbol: t.req.symbol.clone(),
                side: t.req.side,
                qty: delta_qty,
                price,
                ts: row.ts,
                strategy: t.req.strategy.clone(),
                reason: t.req.reason.clone(),
                score: t.req.score,
                exit: t.req.exit,
                stop_price: t.req.stop_price,
                target_price: t.req.target_price,
            };
            let complete = t.filled_qty >= t.req.qty;
            let status =
                if complete { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
            metrics::ORDERS.with_label_values(&[status.as_str()]).inc();
            let req = t.req.clone();
            let broker_no = t.broker_no.clone();
            self.engine.send(Event::new("gateway", Payload::Fill(fill))).await;
            self.update(&req, status, Some(broker_no), None).await;
            if complete {
                done.push(order_id);
            }
        }
        for id in done {
            self.forget(&id);
        }
    }

    /// Orders resting too long: buys are abandoned, sells chase the market.
    async fn sweep_stale(&mut self) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, t)| {
                let limit = match t.req.side {
                    Side::Buy => STALE_BUY_SECS,
                    Side::Sell => STALE_SELL_SECS,
                };
                now.duration_since(t.submitted) >= Duration::from_secs(limit)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            let Some(t) = self.orders.get(&id) else { continue };
            match t.req.side {
                Side::Buy => {
                    info!(order_id = %id, symbol = %t.req.symbol, "stale buy, canceling");
                    self.cancel(&id).await;
                }
                Side::Sell => self.escalate_sell(&id).await,
            }
        }
    }

    async fn escalate_sell(&mut self, order_id: &str) {
        let Some(t) = self.orders.get(order_id) else { return };
        if t.fallbacks >= MAX_SELL_FALLBACKS {
            warn!(%order_id, symbol = %t.req.symbol, "sell still resting after all fallbacks");
            return;
        }
        let symbol = t.req.symbol.clone();
        let fallbacks = t.fallbacks;
        let session = self.clock.now();

        if fallbacks == 0 || !session.allows_market_orders() {
            // chase the market with a fresh limit
            match self.kis.get_quote(&symbol).await {
                Ok(q) => {
                    info!(%order_id, %symbol, price = q.price, "stale sell, re-pricing");
                    self.modify(order_id, q.price).await;
                }
                Err(e) => {
                    warn!(%order_id, err = %e, "quote for re-price failed");
                    return;
                }
            }
        } else {
            info!(%order_id, %symbol, "stale sell, converting to market");
            let Some(t) = self.orders.get(order_id) else { return };
            let mut req = t.req.clone();
            let branch_no = t.branch_no.clone();
            let broker_no = t.broker_no.clone();
            if let Err(e) = self.kis.cancel_order(&branch_no, &broker_no).await {
                warn!(%order_id, err = %e, "cancel before market conversion failed");
                return;
            }
            self.by_broker.remove(&broker_no);
            req.order_type = OrderType::Market;
            req.qty -= self.orders.get(order_id).map(|t| t.filled_qty).unwrap_or(0);
            match self.kis.place_order(&req, session.is_extended()).await {
                Ok(ack) => {
                    self.by_broker.insert(ack.order_no.clone(), order_id.to_string());
                    if let Some(t) = self.orders.get_mut(order_id) {
                        t.req.order_type = OrderType::Market;
                        t.broker_no = ack.order_no;
                        t.branch_no = ack.branch_no;
                        t.submitted = Instant::now();
                    }
                }
                Err(e) => {
                    warn!(%order_id, err = %e, "market conversion failed");
                    // the original order is already canceled; let the exit
                    // watcher propose again
                    let req = self.orders.get(order_id).map(|t| t.req.clone());
                    if let Some(r) = req {
                        self.update(
                            &r,
                            OrderStatus::Canceled,
                            None,
                            Some(format!("market conversion failed: {e}")),
                        )
                        .await;
                    }
                    self.forget(order_id);
                    return;
                }
            }
        }
        if let Some(t) = self.orders.get_mut(order_id) {
            t.fallbacks = fallbacks + 1;
        }
    }

    async fn reject(&self, req: &OrderRequest, reason: String) {
        warn!(id = %req.id, symbol = %req.symbol, %reason, "order rejected");
        metrics::ORDERS.with_label_values(&["rejected"]).inc();
        self.update(req, OrderStatus::Rejected, None, Some(reason)).await;
    }

    async fn update(
        &self,
        req: &OrderRequest,
        status: OrderStatus,
        broker_no: Option<String>,
        reason: Option<String>,
    ) {
        self.engine
            .send(Event::new(
                "gateway",
                Payload::OrderUpdate(OrderUpdate {
                    order_id: req.id.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    status,
                    broker_no,
                    reason,
                }),
            ))
            .await;
    }

    fn forget(&mut self, order_id: &str) {
        if let Some(t) = self.orders.remove(order_id) {
            self.by_broker.remove(&t.broker_no);
        }
    }
}

/// Simulated executions with the live command surface: acknowledge, wait,
/// fill in full at the requested price.
pub async fn run_paper(engine: EngineHandle, mut rx: mpsc::Receiver<GatewayCmd>, fill_ms: u64) {
    info!(fill_ms, "paper gateway started");
    let mut seq: u64 = 0;
    while let Some(cmd) = rx.recv().await {
        let req = match cmd {
            GatewayCmd::Submit(req) => req,
            other => {
                debug!(?other, "paper gateway ignores command");
                continue;
            }
        };
        seq += 1;
        let broker_no = format!("paper-{seq:06}");

        let Some(price) = req.price else {
            metrics::ORDERS.with_label_values(&["rejected"]).inc();
            engine
                .send(Event::new(
                    "gateway",
                    Payload::OrderUpdate(OrderUpdate {
                        order_id: req.id.clone(),
                        symbol: req.symbol.clone(),
                        side: req.side,
                        status: OrderStatus::Rejected,
                        broker_no: None,
                        reason: Some("paper fill needs a reference price".into()),
                    }),
                ))
                .await;
            continue;
        };

        metrics::ORDERS.with_label_values(&["submitted"]).inc();
        engine
            .send(Event::new(
                "gateway",
                Payload::OrderUpdate(OrderUpdate {
                    order_id: req.id.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    status: OrderStatus::Submitted,
                    broker_no: Some(broker_no.clone()),
                    reason: None,
                }),
            ))
            .await;

        let jitter: u64 = rand::thread_rng().gen_range(0..200);
        sleep(Duration::from_millis(fill_ms + jitter)).await;

        metrics::ORDERS.with_label_values(&["filled"]).inc();
        engine
            .send(Event::new(
                "gateway",
                Payload::Fill(Fill {
                    order_id: req.id.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    qty: req.qty,
                    price,
                    ts: Local::now(),
                    strategy: req.strategy.clone(),
                    reason: req.reason.clone(),
                    score: req.score,
                    exit: req.exit,
                    stop_price: req.stop_price,
                    target_price: req.target_price,
                }),
            ))
            .await;
        engine
            .send(Event::new(
                "gateway",
                Payload::OrderUpdate(OrderUpdate {
                    order_id: req.id,
                    symbol: req.symbol,
                    side: req.side,
                    status: OrderStatus::Filled,
                    broker_no: Some(broker_no),
                    reason: None,
                }),
            ))
            .await;
    }
    info!("paper gateway stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, ExitKind};
    use chrono::Local;

    fn req(side: Side, order_type: OrderType, price: Option<f64>) -> OrderRequest {
        OrderRequest {
            id: "ord-20260825-00001".into(),
            symbol: "005930".into(),
            side,
            order_type,
            qty: 10,
            price,
            strategy: "momentum".into(),
            reason: "test".into(),
            score: 1.0,
            exit: None,
            stop_price: None,
            target_price: None,
            created: Local::now(),
        }
    }

    #[test]
    fn test_admission_rules() {
        let nxt: AHashSet<String> = ["005930".to_string()].into_iter().collect();
        let limit = req(Side::Buy, OrderType::Limit, Some(70_000.0));
        let market = req(Side::Sell, OrderType::Market, None);

        assert!(admission(MarketSession::Regular, &limit, &nxt).is_ok());
        assert!(admission(MarketSession::Regular, &market, &nxt).is_ok());
        assert!(matches!(
            admission(MarketSession::Closed, &limit, &nxt),
            Err(GatewayError::SessionClosed(_))
        ));
        assert!(matches!(
            admission(MarketSession::Closing, &market, &nxt),
            Err(GatewayError::AuctionLimitOnly(_))
        ));
        // extended session requires listing
        assert!(admission(MarketSession::NextMarket, &limit, &nxt).is_ok());
        let mut foreign = req(Side::Buy, OrderType::Limit, Some(1_000.0));
        foreign.symbol = "000660".into();
        assert!(matches!(
            admission(MarketSession::NextMarket, &foreign, &nxt),
            Err(GatewayError::NotNxt { .. })
        ));
    }

    #[test]
    fn test_delta_fill_price_recovers_slice() {
        // 4 @ 99 already booked, inquiry now says 10 @ 100 average
        let p = delta_fill_price(10, 100.0, 4, 99.0);
        assert!((p - 100.67).abs() < 1e-9);
        // first slice is just the average
        assert_eq!(delta_fill_price(5, 70_000.0, 0, 0.0), 70_000.0);
        // no growth: fall back to the cumulative average
        assert_eq!(delta_fill_price(5, 70_000.0, 5, 70_000.0), 70_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paper_gateway_acks_then_fills() {
        let (engine_tx, mut engine_rx) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        tokio::spawn(run_paper(EngineHandle::new(engine_tx), cmd_rx, 500));

        cmd_tx
            .send(GatewayCmd::Submit(req(Side::Buy, OrderType::Limit, Some(70_000.0))))
            .await
            .unwrap();

        let first = engine_rx.recv().await.unwrap();
        assert_eq!(first.kind(), EventKind::OrderUpdate);
        match &first.payload {
            Payload::OrderUpdate(up) => assert_eq!(up.status, OrderStatus::Submitted),
            other => panic!("unexpected payload {other:?}"),
        }

        let second = engine_rx.recv().await.unwrap();
        assert_eq!(second.kind(), EventKind::Fill);
        match &second.payload {
            Payload::Fill(f) => {
                assert_eq!(f.qty, 10);
                assert_eq!(f.price, 70_000.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let third = engine_rx.recv().await.unwrap();
        match &third.payload {
            Payload::OrderUpdate(up) => assert_eq!(up.status, OrderStatus::Filled),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paper_gateway_rejects_priceless_order() {
        let (engine_tx, mut engine_rx) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        tokio::spawn(run_paper(EngineHandle::new(engine_tx), cmd_rx, 0));

        let mut market = req(Side::Sell, OrderType::Market, None);
        market.exit = Some(ExitKind::Manual);
        cmd_tx.send(GatewayCmd::Submit(market)).await.unwrap();

        let ev = engine_rx.recv().await.unwrap();
        match &ev.payload {
            Payload::OrderUpdate(up) => {
                assert_eq!(up.status, OrderStatus::Rejected);
                assert!(up.reason.as_deref().unwrap_or("").contains("reference price"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
