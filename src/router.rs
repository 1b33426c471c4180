// ===============================
// src/router.rs
// ===============================
//
// Turns signals into orders. Entries pass the risk gate and get sized,
// stopped and targeted before anything reaches the broker; exits are clamped
// to what the book actually holds and never re-enter admission. The router
// also feeds round-trip results back into the gate, which is where cooldowns
// and the loss streak come from.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{
    Event, EventKind, ExitKind, OrderRequest, OrderType, Payload, PositionChange, Side, Signal,
};
use crate::engine::{EngineCtx, Handler, HandlerError};
use crate::exits::ExitCfg;
use crate::fees::FeeSchedule;
use crate::gateway::GatewayCmd;
use crate::metrics;
use crate::risk::{Blocked, RiskGate};

pub struct OrderRouter {
    gate: RiskGate,
    exit_cfg: ExitCfg,
    fees: FeeSchedule,
    gateway_tx: mpsc::Sender<GatewayCmd>,
    seq: u64,
}

impl OrderRouter {
    pub fn new(
        gate: RiskGate,
        exit_cfg: ExitCfg,
        fees: FeeSchedule,
        gateway_tx: mpsc::Sender<GatewayCmd>,
    ) -> Self {
        Self { gate, exit_cfg, fees, gateway_tx, seq: 0 }
    }

    pub fn gate(&self) -> &RiskGate {
        &self.gate
    }

    fn next_id(&mut self, ctx: &EngineCtx) -> String {
        self.seq += 1;
        format!("ord-{}-{:05}", ctx.now.format("%Y%m%d"), self.seq)
    }

    fn submit(&self, req: OrderRequest) {
        metrics::ORDERS.with_label_values(&["created"]).inc();
        if let Err(e) = self.gateway_tx.try_send(GatewayCmd::Submit(req)) {
            metrics::ORDERS.with_label_values(&["dropped"]).inc();
            warn!(err = %e, "gateway queue rejected order");
        }
    }

    fn handle_entry(&mut self, sig: &Signal, ctx: &mut EngineCtx) {
        if !ctx.session.accepts_orders() {
            metrics::RISK_BLOCKS.with_label_values(&["session_closed"]).inc();
            debug!(symbol = %sig.symbol, session = ctx.session.as_str(), "entry outside trading session");
            return;
        }
        let Some(price) = sig.price.or_else(|| ctx.ticks.latest(&sig.symbol)) else {
            debug!(symbol = %sig.symbol, "entry without a price, skipped");
            return;
        };

        if let Err(b) = self.gate.can_open(&sig.symbol, &sig.strategy, ctx.portfolio, ctx.now) {
            note_block(sig, &b);
            return;
        }
        let qty = self.gate.position_size(ctx.portfolio, sig.strength, price);
        if qty <= 0 {
            let available = ctx.portfolio.available_cash(self.gate.cfg().min_cash_reserve_pct);
            note_block(sig, &Blocked::TooSmall { available });
            return;
        }

        // wider stop for large caps, still bounded
        let mut stop_pct = self.exit_cfg.stop_loss_pct;
        if sig.meta.get("large_cap").map(|v| v == "true").unwrap_or(false) {
            stop_pct = (stop_pct * 1.5).min(5.0);
        }
        let stop_price = sig.stop_price.or(Some(self.fees.stop_price(price, stop_pct)));
        let target_price = sig
            .target_price
            .or(Some(self.fees.target_price(price, self.exit_cfg.first_target_pct)));

        let req = OrderRequest {
            id: self.next_id(ctx),
            symbol: sig.symbol.clone(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            strategy: sig.strategy.clone(),
            reason: sig.reason.clone(),
            score: sig.score,
            exit: None,
            stop_price,
            target_price,
            created: ctx.now,
        };
        info!(
            id = %req.id,
            symbol = %req.symbol,
            qty,
            price,
            strategy = %req.strategy,
            "buy order routed"
        );
        self.submit(req);
    }

    fn handle_exit(&mut self, sig: &Signal, ctx: &mut EngineCtx) {
        let Some(held) = ctx.portfolio.positions.get(&sig.symbol).map(|p| p.qty) else {
            warn!(symbol = %sig.symbol, "sell for a flat symbol, skipped");
            return;
        };
        if held <= 0 {
            return;
        }
        let qty = sig.qty.unwrap_or(held).min(held);

        // auctions and the extended session only take limit orders; market
        // sells still carry the reference price for simulation and the ledger
        let reference = sig.price.or_else(|| ctx.ticks.latest(&sig.symbol));
        let (order_type, price) = if ctx.session.allows_market_orders() {
            (OrderType::Market, reference)
        } else {
            match reference {
                Some(p) => (OrderType::Limit, Some(p)),
                None => {
                    warn!(symbol = %sig.symbol, "no reference price for a limit-only session");
                    return;
                }
            }
        };

        let req = OrderRequest {
            id: self.next_id(ctx),
            symbol: sig.symbol.clone(),
            side: Side::Sell,
            order_type,
            qty,
            price,
            strategy: sig.strategy.clone(),
            reason: sig.reason.clone(),
            score: sig.score,
            exit: sig.exit.or(Some(ExitKind::Manual)),
            stop_price: None,
            target_price: None,
            created: ctx.now,
        };
        info!(
            id = %req.id,
            symbol = %req.symbol,
            qty,
            kind = req.exit.map(|k| k.as_str()).unwrap_or("manual"),
            "sell order routed"
        );
        self.submit(req);
    }

    fn handle_position(&mut self, pc: &PositionChange, ctx: &mut EngineCtx) -> Vec<Event> {
        if pc.side == Side::Sell {
            if pc.qty_after == 0 {
                self.gate.record_result(pc.position_realized);
            }
            if pc.exit == Some(ExitKind::StopLoss) {
                self.gate.note_stop_loss(&pc.symbol, ctx.now);
            }
        }
        self.gate.save_stats(ctx.portfolio, ctx.now.date_naive());
        self.gate
            .breaker_alerts(ctx.portfolio)
            .into_iter()
            .map(|a| Event::new("router", Payload::RiskAlert(a)))
            .collect()
    }
}

fn note_block(sig: &Signal, b: &Blocked) {
    metrics::RISK_BLOCKS.with_label_values(&[b.label()]).inc();
    info!(symbol = %sig.symbol, strategy = %sig.strategy, reason = %b, "entry blocked");
}

impl Handler for OrderRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    fn wants(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::Signal | EventKind::Position)
    }

    fn on_event(&mut self, ev: &Event, ctx: &mut EngineCtx) -> Result<Vec<Event>, HandlerError> {
        match &ev.payload {
            Payload::Signal(sig) => {
                metrics::SIGNALS.with_label_values(&[sig.side.as_str()]).inc();
                match sig.side {
                    Side::Buy => self.handle_entry(sig, ctx),
                    Side::Sell => self.handle_exit(sig, ctx),
                }
                Ok(vec![])
            }
            Payload::Position(pc) => Ok(self.handle_position(pc, ctx)),
            _ => Ok(vec![]),
        }
    }

    fn on_daily_reset(&mut self, ctx: &mut EngineCtx) {
        self.gate.reset_daily();
        self.gate.save_stats(ctx.portfolio, ctx.now.date_naive());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Strength;
    use crate::portfolio::{Portfolio, TickCache};
    use crate::risk::RiskCfg;
    use crate::session::MarketSession;
    use chrono::Local;

    struct Rig {
        router: OrderRouter,
        rx: mpsc::Receiver<GatewayCmd>,
        pf: Portfolio,
        cache: TickCache,
        session: MarketSession,
    }

    impl Rig {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(8);
            Self {
                router: OrderRouter::new(
                    RiskGate::new(RiskCfg::default()),
                    ExitCfg::default(),
                    FeeSchedule::default(),
                    tx,
                ),
                rx,
                pf: Portfolio::new(10_000_000.0, FeeSchedule::default()),
                cache: TickCache::new(100, 16),
                session: MarketSession::Regular,
            }
        }

        fn dispatch(&mut self, payload: Payload) -> Vec<Event> {
            let mut ctx = EngineCtx {
                portfolio: &mut self.pf,
                ticks: &self.cache,
                session: self.session,
                now: Local::now(),
            };
            self.router.on_event(&Event::new("test", payload), &mut ctx).unwrap()
        }

        fn next_submit(&mut self) -> Option<OrderRequest> {
            match self.rx.try_recv() {
                Ok(GatewayCmd::Submit(req)) => Some(req),
                _ => None,
            }
        }
    }

    fn entry(symbol: &str, price: f64) -> Signal {
        let mut sig = Signal::entry(symbol, Strength::Normal, "momentum", "test entry");
        sig.price = Some(price);
        sig
    }

    fn sell(symbol: &str, qty: i64, kind: ExitKind) -> Signal {
        let mut sig = entry(symbol, 10_000.0);
        sig.side = Side::Sell;
        sig.qty = Some(qty);
        sig.exit = Some(kind);
        sig
    }

    #[test]
    fn test_entry_sized_and_protected() {
        let mut rig = Rig::new();
        rig.dispatch(Payload::Signal(entry("005930", 10_000.0)));
        let req = rig.next_submit().unwrap();
        assert_eq!(req.side, Side::Buy);
        assert_eq!(req.order_type, OrderType::Limit);
        // 15% of 10M at 10k
        assert_eq!(req.qty, 150);
        assert!(req.stop_price.unwrap() < 10_000.0);
        assert!(req.target_price.unwrap() > 10_000.0);
        assert!(req.id.starts_with("ord-"));
    }

    #[test]
    fn test_entry_blocked_by_soft_loss() {
        let mut rig = Rig::new();
        rig.pf.daily_realized_pnl = -400_000.0; // -4%
        rig.dispatch(Payload::Signal(entry("005930", 10_000.0)));
        assert!(rig.next_submit().is_none());
    }

    #[test]
    fn test_entry_blocked_outside_session() {
        let mut rig = Rig::new();
        rig.session = MarketSession::Closed;
        rig.dispatch(Payload::Signal(entry("005930", 10_000.0)));
        assert!(rig.next_submit().is_none());
    }

    #[test]
    fn test_sell_clamped_to_holdings() {
        let mut rig = Rig::new();
        rig.pf.seed_position("005930", "", 10, 10_000.0, 10_000.0);
        rig.dispatch(Payload::Signal(sell("005930", 50, ExitKind::StopLoss)));
        let req = rig.next_submit().unwrap();
        assert_eq!(req.side, Side::Sell);
        assert_eq!(req.qty, 10);
        assert_eq!(req.order_type, OrderType::Market);
        assert_eq!(req.exit, Some(ExitKind::StopLoss));
    }

    #[test]
    fn test_sell_for_flat_symbol_skipped() {
        let mut rig = Rig::new();
        rig.dispatch(Payload::Signal(sell("005930", 10, ExitKind::Manual)));
        assert!(rig.next_submit().is_none());
    }

    #[test]
    fn test_extended_session_sell_goes_limit() {
        let mut rig = Rig::new();
        rig.session = MarketSession::NextMarket;
        rig.pf.seed_position("005930", "", 10, 10_000.0, 10_000.0);
        rig.dispatch(Payload::Signal(sell("005930", 10, ExitKind::Trailing)));
        let req = rig.next_submit().unwrap();
        assert_eq!(req.order_type, OrderType::Limit);
        assert_eq!(req.price, Some(10_000.0));
    }

    #[test]
    fn test_stop_close_feeds_cooldown() {
        let mut rig = Rig::new();
        rig.dispatch(Payload::Position(PositionChange {
            symbol: "005930".into(),
            side: Side::Sell,
            fill_qty: 10,
            fill_price: 9_500.0,
            qty_after: 0,
            avg_price: 10_000.0,
            realized_pnl: -5_000.0,
            position_realized: -5_000.0,
            strategy: "momentum".into(),
            exit: Some(ExitKind::StopLoss),
        }));
        assert_eq!(rig.router.gate().consecutive_losses(), 1);
        // same symbol is now cooling down
        rig.dispatch(Payload::Signal(entry("005930", 10_000.0)));
        assert!(rig.next_submit().is_none());
        // a different symbol still trades
        rig.dispatch(Payload::Signal(entry("000660", 10_000.0)));
        assert!(rig.next_submit().is_some());
    }

    #[test]
    fn test_breaker_crossing_emits_alert() {
        let mut rig = Rig::new();
        rig.pf.daily_realized_pnl = -400_000.0;
        let out = rig.dispatch(Payload::Position(PositionChange {
            symbol: "005930".into(),
            side: Side::Sell,
            fill_qty: 10,
            fill_price: 9_000.0,
            qty_after: 0,
            avg_price: 10_000.0,
            realized_pnl: -10_000.0,
            position_realized: -10_000.0,
            strategy: "momentum".into(),
            exit: Some(ExitKind::StopLoss),
        }));
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].payload, Payload::RiskAlert(a) if a.code == "daily_loss_soft"));
    }

    #[test]
    fn test_large_cap_meta_widens_stop() {
        let mut rig = Rig::new();
        let mut sig = entry("005930", 10_000.0);
        sig.meta.insert("large_cap".into(), "true".into());
        rig.dispatch(Payload::Signal(sig));
        let wide = rig.next_submit().unwrap().stop_price.unwrap();

        let mut rig2 = Rig::new();
        rig2.dispatch(Payload::Signal(entry("005930", 10_000.0)));
        let base = rig2.next_submit().unwrap().stop_price.unwrap();
        assert!(wide < base);
    }
}
