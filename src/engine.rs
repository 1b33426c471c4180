// ===============================
// src/engine.rs
// ===============================
//
// The event bus. One task owns a bounded priority queue and the Portfolio;
// handlers run to completion one at a time in (priority, enqueue-order), so
// every portfolio mutation is serialized without locks. Producers reach the
// queue through EngineHandle; when the queue is full the lowest-priority
// oldest envelope is shed instead of blocking anyone.

use std::collections::BTreeMap;

use chrono::{DateTime, Local, NaiveDate};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{error, info, warn};

use crate::domain::{Event, EventKind, Payload};
use crate::metrics;
use crate::portfolio::{Portfolio, TickCache};
use crate::session::{MarketSession, SessionClock};

pub const QUEUE_CAP: usize = 1000;
const HEARTBEAT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// What a handler sees while the engine dispatches to it. The portfolio is
/// mutable here and nowhere else.
pub struct EngineCtx<'a> {
    pub portfolio: &'a mut Portfolio,
    pub ticks: &'a TickCache,
    pub session: MarketSession,
    pub now: DateTime<Local>,
}

pub trait Handler: Send {
    fn name(&self) -> &'static str;
    fn wants(&self, kind: EventKind) -> bool;
    /// Returned events are re-emitted into the queue. Errors are logged and
    /// the event moves on to the next handler.
    fn on_event(&mut self, ev: &Event, ctx: &mut EngineCtx) -> Result<Vec<Event>, HandlerError>;
    fn on_daily_reset(&mut self, _ctx: &mut EngineCtx) {}
}

/// Cheap clonable inlet for producers.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Event>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Non-blocking emit; sheds when the inlet is saturated.
    pub fn emit(&self, ev: Event) {
        if self.tx.try_send(ev).is_err() {
            metrics::EVENTS_DROPPED.inc();
            warn!("engine inlet full, event dropped");
        }
    }

    /// Waits for inlet space; for producers whose events must not be shed
    /// at the door (fills, order updates).
    pub async fn send(&self, ev: Event) {
        if self.tx.send(ev).await.is_err() {
            warn!("engine inlet closed");
        }
    }
}

pub struct Engine {
    rx: mpsc::Receiver<Event>,
    queue: BTreeMap<(u8, u64), Event>,
    seq: u64,
    portfolio: Portfolio,
    ticks: TickCache,
    handlers: Vec<Box<dyn Handler>>,
    clock: SessionClock,
    session: MarketSession,
    today: NaiveDate,
    started: Instant,
    priority_tx: watch::Sender<Vec<String>>,
    shutdown: watch::Receiver<bool>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<Event>,
        portfolio: Portfolio,
        ticks: TickCache,
        handlers: Vec<Box<dyn Handler>>,
        clock: SessionClock,
        priority_tx: watch::Sender<Vec<String>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let session = clock.now();
        Self {
            rx,
            queue: BTreeMap::new(),
            seq: 0,
            portfolio,
            ticks,
            handlers,
            clock,
            session,
            today: Local::now().date_naive(),
            started: Instant::now(),
            priority_tx,
            shutdown,
        }
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn available_cash(&self, reserve_pct: f64) -> f64 {
        self.portfolio.available_cash(reserve_pct)
    }

    /// Enqueue with the shedding policy: a full queue evicts the oldest
    /// envelope of the lowest-priority group, unless the incoming event is
    /// itself less important, in which case it is the one shed.
    fn push(&mut self, ev: Event) {
        if self.queue.len() >= QUEUE_CAP {
            metrics::EVENTS_DROPPED.inc();
            let lowest = match self.queue.last_key_value() {
                Some((&(p, _), _)) => p,
                None => return,
            };
            if ev.priority > lowest {
                return; // incoming is the least important; shed it
            }
            let victim = self.queue.range((lowest, 0)..).next().map(|(k, _)| *k);
            if let Some(k) = victim {
                self.queue.remove(&k);
            }
        }
        self.seq += 1;
        self.queue.insert((ev.priority, self.seq), ev);
    }

    fn pop(&mut self) -> Option<Event> {
        self.queue.pop_first().map(|(_, ev)| ev)
    }

    fn dispatch(&mut self, ev: Event) {
        metrics::EVENTS.with_label_values(&[ev.kind().as_str()]).inc();
        let mut follow: Vec<Event> = Vec::new();

        // engine-owned bookkeeping runs before any handler
        match &ev.payload {
            Payload::Tick(t) => {
                self.portfolio.mark_price(&t.symbol, t.price);
                self.ticks.push(&t.symbol, t.ts, t.price);
            }
            Payload::Fill(f) => {
                let change = self.portfolio.apply_fill(f);
                metrics::FILLS.with_label_values(&[f.side.as_str()]).inc();
                info!(
                    symbol = %f.symbol,
                    side = f.side.as_str(),
                    qty = f.qty,
                    price = f.price,
                    qty_after = change.qty_after,
                    realized = change.realized_pnl,
                    "fill applied"
                );
                follow.push(Event::new("engine", Payload::Position(change)));
                let _ = self.priority_tx.send(self.portfolio.held_symbols());
            }
            Payload::Heartbeat => self.log_heartbeat(),
            Payload::Error(note) => {
                if note.recoverable {
                    warn!(component = note.component, msg = %note.message, "component error");
                } else {
                    error!(component = note.component, msg = %note.message, "component error");
                }
            }
            _ => {}
        }

        let kind = ev.kind();
        let now = Local::now();
        let mut ctx = EngineCtx {
            portfolio: &mut self.portfolio,
            ticks: &self.ticks,
            session: self.session,
            now,
        };
        for h in self.handlers.iter_mut() {
            if !h.wants(kind) {
                continue;
            }
            match h.on_event(&ev, &mut ctx) {
                Ok(outs) => follow.extend(outs),
                Err(e) => {
                    metrics::HANDLER_ERRORS.with_label_values(&[h.name()]).inc();
                    warn!(handler = h.name(), err = %e, "handler failed, event skipped for it");
                }
            }
        }
        drop(ctx);

        for out in follow {
            self.push(out);
        }
    }

    fn log_heartbeat(&self) {
        info!(
            uptime_secs = self.started.elapsed().as_secs(),
            session = self.session.as_str(),
            positions = self.portfolio.positions.len(),
            cash = self.portfolio.cash,
            equity = self.portfolio.total_equity(),
            daily_pnl = self.portfolio.effective_daily_pnl(),
            trades = self.portfolio.daily_trades,
            queued = self.queue.len(),
            "heartbeat"
        );
    }

    fn on_heartbeat_tick(&mut self) {
        self.push(Event::new("engine", Payload::Heartbeat));

        metrics::EQUITY.set(self.portfolio.total_equity());
        metrics::CASH.set(self.portfolio.cash);
        metrics::DAILY_PNL.set(self.portfolio.effective_daily_pnl());
        metrics::POSITIONS_OPEN.set(self.portfolio.positions.len() as i64);

        let session = self.clock.now();
        if session != self.session {
            info!(from = self.session.as_str(), to = session.as_str(), "session change");
            self.session = session;
            self.push(Event::new("engine", Payload::Session(session)));
        }

        let today = Local::now().date_naive();
        if today != self.today {
            info!(%today, "date rollover, daily stats reset");
            self.today = today;
            self.portfolio.reset_daily();
            let mut ctx = EngineCtx {
                portfolio: &mut self.portfolio,
                ticks: &self.ticks,
                session: self.session,
                now: Local::now(),
            };
            for h in self.handlers.iter_mut() {
                h.on_daily_reset(&mut ctx);
            }
        }
    }

    pub async fn run(mut self) {
        info!(cap = QUEUE_CAP, handlers = self.handlers.len(), "engine started");
        let period = Duration::from_secs(HEARTBEAT_SECS);
        let mut next_hb = Instant::now() + period;
        loop {
            while let Ok(ev) = self.rx.try_recv() {
                self.push(ev);
            }
            if let Some(ev) = self.pop() {
                self.dispatch(ev);
                metrics::QUEUE_DEPTH.set(self.queue.len() as i64);
                if Instant::now() >= next_hb {
                    self.on_heartbeat_tick();
                    next_hb = Instant::now() + period;
                }
                // stay cooperative under sustained load
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                maybe = self.rx.recv() => {
                    if let Some(ev) = maybe {
                        self.push(ev);
                    }
                }
                _ = sleep_until(next_hb) => {
                    self.on_heartbeat_tick();
                    next_hb = Instant::now() + period;
                }
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let drained = self.drain();
        info!(drained, positions = self.portfolio.positions.len(), "engine stopped");
    }

    /// Finish what is already queued; new inlet traffic is left behind.
    fn drain(&mut self) -> usize {
        let mut n = 0;
        while let Some(ev) = self.pop() {
            self.dispatch(ev);
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorNote, Fill, Side, Signal, Strength};
    use crate::fees::FeeSchedule;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_engine(handlers: Vec<Box<dyn Handler>>) -> Engine {
        let (_tx, rx) = mpsc::channel(8);
        let (priority_tx, _priority_rx) = watch::channel(Vec::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        Engine::new(
            rx,
            Portfolio::new(10_000_000.0, FeeSchedule::default()),
            TickCache::new(100, 16),
            handlers,
            SessionClock::new(vec![], true, true),
            priority_tx,
            shutdown_rx,
        )
    }

    fn signal_event() -> Event {
        Event::new("test", Payload::Signal(Signal::entry("005930", Strength::Normal, "s", "r")))
    }

    fn fill_event(symbol: &str, qty: i64, price: f64) -> Event {
        Event::new(
            "test",
            Payload::Fill(Fill {
                order_id: "o-1".into(),
                symbol: symbol.into(),
                side: Side::Buy,
                qty,
                price,
                ts: Local::now(),
                strategy: "s".into(),
                reason: String::new(),
                score: 0.0,
                exit: None,
                stop_price: None,
                target_price: None,
            }),
        )
    }

    struct Failing;
    impl Handler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn wants(&self, _kind: EventKind) -> bool {
            true
        }
        fn on_event(&mut self, _ev: &Event, _ctx: &mut EngineCtx) -> Result<Vec<Event>, HandlerError> {
            Err(HandlerError::Other("boom".into()))
        }
    }

    struct Counting {
        seen: Arc<AtomicU32>,
        reply: Vec<Event>,
    }
    impl Handler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn wants(&self, kind: EventKind) -> bool {
            kind == EventKind::Signal
        }
        fn on_event(&mut self, _ev: &Event, _ctx: &mut EngineCtx) -> Result<Vec<Event>, HandlerError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(std::mem::take(&mut self.reply))
        }
    }

    #[test]
    fn test_dispatch_order_priority_then_fifo() {
        let mut eng = test_engine(vec![]);
        eng.push(Event::new("t", Payload::Heartbeat)); // 10
        eng.push(signal_event()); // 3
        eng.push(fill_event("005930", 1, 100.0)); // 1
        eng.push(signal_event()); // 3

        assert_eq!(eng.pop().map(|e| e.kind()), Some(EventKind::Fill));
        assert_eq!(eng.pop().map(|e| e.kind()), Some(EventKind::Signal));
        assert_eq!(eng.pop().map(|e| e.kind()), Some(EventKind::Signal));
        assert_eq!(eng.pop().map(|e| e.kind()), Some(EventKind::Heartbeat));
        assert!(eng.pop().is_none());
    }

    #[test]
    fn test_saturation_sheds_lowest_priority_oldest() {
        let mut eng = test_engine(vec![]);
        for _ in 0..QUEUE_CAP {
            eng.push(Event::new("t", Payload::Heartbeat));
        }
        assert_eq!(eng.queue.len(), QUEUE_CAP);
        let first_seq = *eng.queue.keys().next().map(|(_, s)| s).unwrap();

        eng.push(fill_event("005930", 1, 100.0));
        assert_eq!(eng.queue.len(), QUEUE_CAP);
        // the important event landed, the oldest heartbeat is gone
        assert_eq!(eng.pop().map(|e| e.kind()), Some(EventKind::Fill));
        assert!(eng.queue.keys().all(|(_, s)| *s != first_seq));
    }

    #[test]
    fn test_saturation_sheds_unimportant_incoming() {
        let mut eng = test_engine(vec![]);
        for _ in 0..QUEUE_CAP {
            eng.push(fill_event("005930", 1, 100.0));
        }
        eng.push(Event::new("t", Payload::Heartbeat));
        assert_eq!(eng.queue.len(), QUEUE_CAP);
        assert!(eng.queue.values().all(|e| e.kind() == EventKind::Fill));
    }

    #[test]
    fn test_handler_error_does_not_stop_others() {
        let seen = Arc::new(AtomicU32::new(0));
        let eng_handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(Failing),
            Box::new(Counting { seen: seen.clone(), reply: vec![] }),
        ];
        let mut eng = test_engine(eng_handlers);
        eng.dispatch(signal_event());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_followups_reenter_queue() {
        let seen = Arc::new(AtomicU32::new(0));
        let reply = vec![Event::new("t", Payload::Heartbeat)];
        let mut eng = test_engine(vec![Box::new(Counting { seen: seen.clone(), reply })]);
        eng.dispatch(signal_event());
        assert_eq!(eng.pop().map(|e| e.kind()), Some(EventKind::Heartbeat));
    }

    #[test]
    fn test_fill_dispatch_updates_portfolio_and_emits_position() {
        let mut eng = test_engine(vec![]);
        eng.dispatch(fill_event("005930", 10, 70_000.0));
        assert_eq!(eng.portfolio.positions.get("005930").map(|p| p.qty), Some(10));
        assert_eq!(eng.pop().map(|e| e.kind()), Some(EventKind::Position));
    }

    #[test]
    fn test_error_event_dispatch_is_harmless() {
        let mut eng = test_engine(vec![]);
        eng.dispatch(Event::new(
            "t",
            Payload::Error(ErrorNote { component: "x", message: "m".into(), recoverable: true }),
        ));
        assert!(eng.pop().is_none());
    }
}
