// ===============================
// src/ledger.rs
// ===============================
//
// Durable round-trip journal. A buy fill opens (or extends) a trade record,
// each sell fill closes part of one, and the day's records land in a
// per-day JSON file before anything else sees them. The SQLite mirror hangs
// off the store's write queue and never blocks dispatch.
//
// Reconciliation replays the broker's own fill history over the journal:
// buy quantity the journal never saw becomes a recovered entry, sell
// quantity beyond the recorded exits is appended FIFO against the oldest
// still-open trade. Sold quantity no open trade can absorb lands on the
// most recently touched record for the symbol and is reported upward.

use std::path::PathBuf;

use ahash::AHashMap;
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::domain::{
    BrokerFill, Event, EventKind, ExitKind, Fill, Payload, RiskAlert, Side,
};
use crate::engine::{EngineCtx, Handler, HandlerError};
use crate::fees::FeeSchedule;
use crate::metrics;
use crate::store::{StoreHandle, TradeEventRow};

const LOAD_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitEvent {
    pub ts: DateTime<Local>,
    pub qty: i64,
    pub price: f64,
    pub kind: ExitKind,
    pub reason: String,
    pub pnl: f64,
}

/// One full round-trip. Extended by partial entry fills, updated in place by
/// every exit event, never replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub strategy: String,
    pub entry_ts: DateTime<Local>,
    pub entry_price: f64,
    pub entry_qty: i64,
    #[serde(default)]
    pub entry_reason: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub order_no: String,
    #[serde(default)]
    pub exit_ts: Option<DateTime<Local>>,
    /// Weighted average over all exit events so far.
    #[serde(default)]
    pub exit_price: f64,
    #[serde(default)]
    pub exit_qty: i64,
    #[serde(default)]
    pub exit_reason: String,
    #[serde(default)]
    pub exit_kind: Option<ExitKind>,
    #[serde(default)]
    pub exits: Vec<ExitEvent>,
    #[serde(default)]
    pub pnl: f64,
    /// Against the full entry cost, not the exited slice.
    #[serde(default)]
    pub pnl_pct: f64,
    #[serde(default)]
    pub holding_minutes: i64,
    pub updated_at: DateTime<Local>,
}

impl TradeRecord {
    pub fn open_qty(&self) -> i64 {
        (self.entry_qty - self.exit_qty).max(0)
    }

    pub fn is_closed(&self) -> bool {
        self.open_qty() == 0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DayFile {
    date: NaiveDate,
    count: usize,
    trades: Vec<TradeRecord>,
    updated_at: DateTime<Local>,
}

#[derive(Debug, Default, PartialEq)]
pub struct ReconcileReport {
    pub recovered_entries: usize,
    pub recovered_exit_qty: i64,
    pub corrected: usize,
    /// Sold quantity no open trade could absorb, per symbol.
    pub unabsorbed: Vec<(String, i64)>,
}

impl ReconcileReport {
    pub fn touched(&self) -> bool {
        self.recovered_entries > 0 || self.recovered_exit_qty > 0 || self.corrected > 0
    }
}

pub struct TradeLedger {
    dir: PathBuf,
    fees: FeeSchedule,
    /// Chronological by entry, which is what makes FIFO matching a plain
    /// front-to-back scan.
    trades: Vec<TradeRecord>,
    store: Option<StoreHandle>,
}

impl TradeLedger {
    pub fn new(dir: impl Into<PathBuf>, fees: FeeSchedule, store: Option<StoreHandle>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!(dir = %dir.display(), err = %e, "ledger dir create failed");
        }
        let mut ledger = Self { dir, fees, trades: Vec::new(), store };
        ledger.load_recent(LOAD_DAYS);
        ledger
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("trades_{}.json", date.format("%Y%m%d")))
    }

    fn load_recent(&mut self, days: i64) {
        let today = Local::now().date_naive();
        for back in (0..days).rev() {
            let date = today - chrono::Duration::days(back);
            let path = self.day_path(date);
            let Ok(raw) = std::fs::read_to_string(&path) else { continue };
            match serde_json::from_str::<DayFile>(&raw) {
                Ok(day) => self.trades.extend(day.trades),
                Err(e) => error!(path = %path.display(), err = %e, "ledger day file corrupt, skipped"),
            }
        }
        info!(trades = self.trades.len(), days, "trade journal loaded");
    }

    fn save_day(&self, date: NaiveDate) {
        let trades: Vec<TradeRecord> = self
            .trades
            .iter()
            .filter(|t| t.entry_ts.date_naive() == date)
            .cloned()
            .collect();
        let day = DayFile { date, count: trades.len(), trades, updated_at: Local::now() };
        let out = match serde_json::to_string_pretty(&day) {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "ledger day serialize failed");
                return;
            }
        };
        if let Err(e) = std::fs::write(self.day_path(date), out) {
            error!(%date, err = %e, "ledger day write failed");
            return;
        }
        metrics::LEDGER_WRITES.inc();
    }

    fn mirror(&self, idx: usize) {
        if let Some(store) = &self.store {
            store.upsert_trade(&self.trades[idx]);
        }
    }

    pub fn get(&self, id: &str) -> Option<&TradeRecord> {
        self.trades.iter().find(|t| t.id == id)
    }

    pub fn open_trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.trades.iter().filter(|t| !t.is_closed())
    }

    /// Closed-trade count and realized P&L for trades entered on `date`.
    pub fn day_stats(&self, date: NaiveDate) -> (usize, f64) {
        let mut closed = 0;
        let mut pnl = 0.0;
        for t in self.trades.iter().filter(|t| t.entry_ts.date_naive() == date) {
            if t.is_closed() {
                closed += 1;
            }
            pnl += t.pnl;
        }
        (closed, pnl)
    }

    /// Records a buy fill. A second fill under the same order id is a
    /// partial and merges into the weighted entry average; an identical
    /// replay leaves the record untouched.
    pub fn record_entry(&mut self, fill: &Fill, name: &str) {
        let date = fill.ts.date_naive();
        let idx = match self.trades.iter().position(|t| t.id == fill.order_id) {
            Some(idx) => {
                let rec = &mut self.trades[idx];
                if rec.entry_ts == fill.ts
                    && rec.entry_qty == fill.qty
                    && (rec.entry_price - fill.price).abs() < f64::EPSILON
                {
                    debug!(id = %fill.order_id, "entry replay ignored");
                    return;
                }
                let total = rec.entry_qty + fill.qty;
                rec.entry_price = (rec.entry_price * rec.entry_qty as f64
                    + fill.price * fill.qty as f64)
                    / total as f64;
                rec.entry_qty = total;
                rec.updated_at = Local::now();
                idx
            }
            None => {
                self.trades.push(TradeRecord {
                    id: fill.order_id.clone(),
                    symbol: fill.symbol.clone(),
                    name: name.to_string(),
                    strategy: fill.strategy.clone(),
                    entry_ts: fill.ts,
                    entry_price: fill.price,
                    entry_qty: fill.qty,
                    entry_reason: fill.reason.clone(),
                    score: fill.score,
                    order_no: String::new(),
                    exit_ts: None,
                    exit_price: 0.0,
                    exit_qty: 0,
                    exit_reason: String::new(),
                    exit_kind: None,
                    exits: Vec::new(),
                    pnl: 0.0,
                    pnl_pct: 0.0,
                    holding_minutes: 0,
                    updated_at: Local::now(),
                });
                self.trades.len() - 1
            }
        };
        self.save_day(date);
        self.mirror(idx);
        if let Some(store) = &self.store {
            store.insert_event(TradeEventRow {
                trade_id: fill.order_id.clone(),
                symbol: fill.symbol.clone(),
                event_type: "BUY",
                ts: fill.ts,
                price: fill.price,
                qty: fill.qty,
                kind: None,
                reason: fill.reason.clone(),
                pnl: 0.0,
            });
        }
        let rec = &self.trades[idx];
        info!(
            symbol = %rec.symbol,
            qty = fill.qty,
            price = fill.price,
            strategy = %rec.strategy,
            "journal entry"
        );
    }

    /// Records a sell fill against the oldest open trades for the symbol.
    /// Returns the quantity no open trade could absorb.
    pub fn record_exit(&mut self, fill: &Fill) -> i64 {
        self.apply_sell(
            &fill.symbol,
            fill.qty,
            fill.price,
            fill.ts,
            fill.exit.unwrap_or(ExitKind::Manual),
            &fill.reason,
        )
    }

    pub fn set_order_no(&mut self, id: &str, order_no: &str) {
        let Some(idx) = self.trades.iter().position(|t| t.id == id) else { return };
        if self.trades[idx].order_no == order_no {
            return;
        }
        self.trades[idx].order_no = order_no.to_string();
        let date = self.trades[idx].entry_ts.date_naive();
        self.save_day(date);
        self.mirror(idx);
    }

    fn oldest_open(&self, symbol: &str) -> Option<usize> {
        self.trades.iter().position(|t| t.symbol == symbol && !t.is_closed())
    }

    fn most_recently_touched(&self, symbol: &str) -> Option<usize> {
        self.trades
            .iter()
            .enumerate()
            .filter(|(_, t)| t.symbol == symbol)
            .max_by_key(|(_, t)| t.updated_at)
            .map(|(idx, _)| idx)
    }

    fn apply_sell(
        &mut self,
        symbol: &str,
        qty: i64,
        price: f64,
        ts: DateTime<Local>,
        kind: ExitKind,
        reason: &str,
    ) -> i64 {
        let mut remaining = qty;
        while remaining > 0 {
            let Some(idx) = self.oldest_open(symbol) else { break };
            let take = remaining.min(self.trades[idx].open_qty());
            if !self.apply_exit_event(idx, take, price, ts, kind, reason) {
                // exact duplicate of the last recorded exit: a replayed fill
                return 0;
            }
            remaining -= take;
        }
        remaining
    }

    /// One exit event against one record. False when the event is an exact
    /// replay of the last one recorded.
    fn apply_exit_event(
        &mut self,
        idx: usize,
        qty: i64,
        price: f64,
        ts: DateTime<Local>,
        kind: ExitKind,
        reason: &str,
    ) -> bool {
        let partial;
        let date;
        {
            let rec = &mut self.trades[idx];
            if rec.exits.last().map_or(false, |e| {
                e.ts == ts
                    && e.qty == qty
                    && e.kind == kind
                    && (e.price - price).abs() < f64::EPSILON
            }) {
                debug!(id = %rec.id, "exit replay ignored");
                return false;
            }
            partial = self.fees.net_pnl(rec.entry_price, price, qty);
            rec.exits.push(ExitEvent {
                ts,
                qty,
                price,
                kind,
                reason: reason.to_string(),
                pnl: partial,
            });
            let sold_amount = rec.exit_price * rec.exit_qty as f64 + price * qty as f64;
            rec.exit_qty += qty;
            rec.exit_price = sold_amount / rec.exit_qty as f64;
            rec.exit_ts = Some(ts);
            rec.exit_kind = Some(kind);
            rec.exit_reason = reason.to_string();
            rec.pnl += partial;
            let invested = rec.entry_price * rec.entry_qty as f64;
            rec.pnl_pct = if invested > 0.0 { rec.pnl / invested * 100.0 } else { 0.0 };
            rec.holding_minutes = ts.signed_duration_since(rec.entry_ts).num_minutes();
            rec.updated_at = Local::now();
            date = rec.entry_ts.date_naive();
        }
        self.save_day(date);
        self.mirror(idx);
        let rec = &self.trades[idx];
        if let Some(store) = &self.store {
            store.insert_event(TradeEventRow {
                trade_id: rec.id.clone(),
                symbol: rec.symbol.clone(),
                event_type: if kind == ExitKind::Recovered { "SYNC" } else { "SELL" },
                ts,
                price,
                qty,
                kind: Some(kind),
                reason: reason.to_string(),
                pnl: partial,
            });
        }
        info!(
            symbol = %rec.symbol,
            qty,
            price,
            kind = kind.as_str(),
            pnl = rec.pnl,
            pnl_pct = rec.pnl_pct,
            "journal exit"
        );
        true
    }

    /// Patches the journal from the broker's fill history for `date`.
    /// Totals-based, so a second run over the same fills changes nothing.
    pub fn reconcile(&mut self, date: NaiveDate, fills: &[BrokerFill]) -> ReconcileReport {
        #[derive(Default)]
        struct Agg {
            qty: i64,
            amount: f64,
            first_ts: Option<DateTime<Local>>,
            last_ts: Option<DateTime<Local>>,
            order_no: String,
        }

        let mut buys: AHashMap<String, Agg> = AHashMap::new();
        let mut sells: AHashMap<String, Agg> = AHashMap::new();
        for f in fills.iter().filter(|f| f.qty > 0 && f.ts.date_naive() == date) {
            let agg = match f.side {
                Side::Buy => buys.entry(f.symbol.clone()).or_default(),
                Side::Sell => sells.entry(f.symbol.clone()).or_default(),
            };
            agg.qty += f.qty;
            agg.amount += f.price * f.qty as f64;
            if agg.first_ts.is_none() {
                agg.first_ts = Some(f.ts);
                agg.order_no = f.order_no.clone();
            }
            agg.last_ts = Some(f.ts);
        }

        let mut report = ReconcileReport::default();

        // buys the journal never saw become one recovered entry per symbol
        for (symbol, b) in &buys {
            let have: i64 = self
                .trades
                .iter()
                .filter(|t| t.symbol == *symbol && t.entry_ts.date_naive() == date)
                .map(|t| t.entry_qty)
                .sum();
            let missing = b.qty - have;
            if missing <= 0 {
                continue;
            }
            let price = b.amount / b.qty as f64;
            let ts = b.first_ts.unwrap_or_else(Local::now);
            let id = format!("sync-{}-{}", symbol, date.format("%Y%m%d"));
            let idx = match self.trades.iter().position(|t| t.id == id) {
                Some(idx) => {
                    let rec = &mut self.trades[idx];
                    let total = rec.entry_qty + missing;
                    rec.entry_price = (rec.entry_price * rec.entry_qty as f64
                        + price * missing as f64)
                        / total as f64;
                    rec.entry_qty = total;
                    rec.updated_at = Local::now();
                    idx
                }
                None => {
                    self.trades.push(TradeRecord {
                        id: id.clone(),
                        symbol: symbol.clone(),
                        name: String::new(),
                        strategy: "unknown".to_string(),
                        entry_ts: ts,
                        entry_price: price,
                        entry_qty: missing,
                        entry_reason: "broker fill history".to_string(),
                        score: 0.0,
                        order_no: b.order_no.clone(),
                        exit_ts: None,
                        exit_price: 0.0,
                        exit_qty: 0,
                        exit_reason: String::new(),
                        exit_kind: None,
                        exits: Vec::new(),
                        pnl: 0.0,
                        pnl_pct: 0.0,
                        holding_minutes: 0,
                        updated_at: Local::now(),
                    });
                    self.trades.len() - 1
                }
            };
            self.save_day(date);
            self.mirror(idx);
            if let Some(store) = &self.store {
                store.insert_event(TradeEventRow {
                    trade_id: id,
                    symbol: symbol.clone(),
                    event_type: "SYNC",
                    ts,
                    price,
                    qty: missing,
                    kind: None,
                    reason: "broker fill history".to_string(),
                    pnl: 0.0,
                });
            }
            report.recovered_entries += 1;
            metrics::RECOVERED.inc();
            warn!(%symbol, qty = missing, price, "entry recovered from broker fills");
        }

        // sell quantity beyond the recorded exits, FIFO into open trades
        for (symbol, s) in &sells {
            let have: i64 = self
                .trades
                .iter()
                .filter(|t| t.symbol == *symbol)
                .flat_map(|t| t.exits.iter())
                .filter(|e| e.ts.date_naive() == date)
                .map(|e| e.qty)
                .sum();
            let missing = s.qty - have;
            if missing <= 0 {
                continue;
            }
            let price = s.amount / s.qty as f64;
            let ts = s.last_ts.unwrap_or_else(Local::now);
            let leftover = self.apply_sell(
                symbol,
                missing,
                price,
                ts,
                ExitKind::Recovered,
                "broker fill history",
            );
            if leftover > 0 {
                if let Some(idx) = self.most_recently_touched(symbol) {
                    self.apply_exit_event(
                        idx,
                        leftover,
                        price,
                        ts,
                        ExitKind::Recovered,
                        "broker fill history",
                    );
                }
                error!(%symbol, qty = leftover, "broker sold more than the journal can absorb");
                report.unabsorbed.push((symbol.clone(), leftover));
            }
            report.recovered_exit_qty += missing;
            metrics::RECOVERED.inc();
            warn!(%symbol, qty = missing, price, "exit recovered from broker fills");
        }

        // broker prices are authoritative; re-price single-exit trades. A
        // multi-exit trade already carries exact per-event averages.
        for (symbol, s) in &sells {
            let broker_avg = s.amount / s.qty as f64;
            let idxs: Vec<usize> = self
                .trades
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    t.symbol == *symbol
                        && t.exits.len() == 1
                        && t.exits[0].ts.date_naive() == date
                })
                .map(|(idx, _)| idx)
                .collect();
            for idx in idxs {
                let date_entry;
                {
                    let rec = &mut self.trades[idx];
                    let qty = rec.exits[0].qty;
                    let corrected = self.fees.net_pnl(rec.entry_price, broker_avg, qty);
                    if (corrected - rec.pnl).abs() < 0.005 {
                        continue;
                    }
                    rec.exits[0].price = broker_avg;
                    rec.exits[0].pnl = corrected;
                    rec.exit_price = broker_avg;
                    rec.pnl = corrected;
                    let invested = rec.entry_price * rec.entry_qty as f64;
                    rec.pnl_pct =
                        if invested > 0.0 { corrected / invested * 100.0 } else { 0.0 };
                    rec.updated_at = Local::now();
                    date_entry = rec.entry_ts.date_naive();
                }
                self.save_day(date_entry);
                self.mirror(idx);
                report.corrected += 1;
                info!(%symbol, price = broker_avg, "trade pnl corrected from broker price");
            }
        }

        report
    }
}

// ---- engine handler ----

pub struct LedgerWriter {
    ledger: TradeLedger,
}

impl LedgerWriter {
    pub fn new(ledger: TradeLedger) -> Self {
        Self { ledger }
    }
}

impl Handler for LedgerWriter {
    fn name(&self) -> &'static str {
        "ledger"
    }

    fn wants(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::Fill | EventKind::OrderUpdate | EventKind::Reconcile)
    }

    fn on_event(&mut self, ev: &Event, ctx: &mut EngineCtx) -> Result<Vec<Event>, HandlerError> {
        match &ev.payload {
            Payload::Fill(fill) => {
                match fill.side {
                    Side::Buy => {
                        let name = ctx
                            .portfolio
                            .positions
                            .get(&fill.symbol)
                            .map(|p| p.name.clone())
                            .unwrap_or_default();
                        self.ledger.record_entry(fill, &name);
                    }
                    Side::Sell => {
                        let leftover = self.ledger.record_exit(fill);
                        if leftover > 0 {
                            warn!(
                                symbol = %fill.symbol,
                                qty = leftover,
                                "sell fill exceeds the journal's open quantity"
                            );
                        }
                    }
                }
                Ok(Vec::new())
            }
            Payload::OrderUpdate(update) => {
                if let Some(no) = &update.broker_no {
                    self.ledger.set_order_no(&update.order_id, no);
                }
                Ok(Vec::new())
            }
            Payload::Reconcile { date, fills } => {
                let report = self.ledger.reconcile(*date, fills);
                if report.touched() {
                    info!(
                        entries = report.recovered_entries,
                        exit_qty = report.recovered_exit_qty,
                        corrected = report.corrected,
                        "journal reconciled against broker fills"
                    );
                }
                let out = report
                    .unabsorbed
                    .iter()
                    .map(|(symbol, qty)| {
                        Event::new(
                            "ledger",
                            Payload::RiskAlert(RiskAlert {
                                code: "reconcile".to_string(),
                                message: format!(
                                    "{symbol}: broker sold {qty} more than the journal holds"
                                ),
                            }),
                        )
                    })
                    .collect();
                Ok(out)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn on_daily_reset(&mut self, ctx: &mut EngineCtx) {
        let today = ctx.now.date_naive();
        let prev = today.pred_opt().unwrap_or(today);
        let (closed, pnl) = self.ledger.day_stats(prev);
        if closed > 0 {
            info!(date = %prev, closed, pnl, "journal day closed");
        }
        let carried = self.ledger.open_trades().count();
        if carried > 0 {
            info!(carried, "open trades carried into the new day");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::Path;

    fn tmp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("krx_ledger_{}_{}", name, std::process::id()))
    }

    fn fresh(dir: &Path) -> TradeLedger {
        let _ = std::fs::remove_dir_all(dir);
        TradeLedger::new(dir, FeeSchedule::default(), None)
    }

    fn buy(id: &str, symbol: &str, qty: i64, price: f64) -> Fill {
        Fill {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            qty,
            price,
            ts: Local::now(),
            strategy: "momentum".to_string(),
            reason: "test entry".to_string(),
            score: 75.0,
            exit: None,
            stop_price: None,
            target_price: None,
        }
    }

    fn sell(symbol: &str, qty: i64, price: f64, kind: ExitKind) -> Fill {
        Fill {
            order_id: format!("sell-{symbol}-{qty}"),
            symbol: symbol.to_string(),
            side: Side::Sell,
            qty,
            price,
            ts: Local::now(),
            strategy: "momentum".to_string(),
            reason: "test exit".to_string(),
            score: 0.0,
            exit: Some(kind),
            stop_price: None,
            target_price: None,
        }
    }

    fn broker(symbol: &str, side: Side, qty: i64, price: f64) -> BrokerFill {
        BrokerFill {
            order_no: "0000012345".to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            ts: Local::now(),
        }
    }

    #[test]
    fn test_round_trip_accumulates() {
        let dir = tmp_dir("round_trip");
        let mut ledger = fresh(&dir);
        let fees = FeeSchedule::default();

        ledger.record_entry(&buy("ord-1", "005930", 100, 10_000.0), "samsung");
        ledger.record_exit(&sell("005930", 50, 10_300.0, ExitKind::FirstTarget));
        ledger.record_exit(&sell("005930", 50, 10_600.0, ExitKind::Trailing));

        let rec = ledger.get("ord-1").unwrap();
        assert!(rec.is_closed());
        assert_eq!(rec.exit_qty, 100);
        assert_eq!(rec.exits.len(), 2);
        let want =
            fees.net_pnl(10_000.0, 10_300.0, 50) + fees.net_pnl(10_000.0, 10_600.0, 50);
        assert!((rec.pnl - want).abs() < 0.01);
        assert!((rec.pnl_pct - want / 1_000_000.0 * 100.0).abs() < 0.001);
        assert!((rec.exit_price - 10_450.0).abs() < 0.01);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_entry_fills_merge() {
        let dir = tmp_dir("entry_merge");
        let mut ledger = fresh(&dir);

        ledger.record_entry(&buy("ord-1", "005930", 50, 10_000.0), "");
        ledger.record_entry(&buy("ord-1", "005930", 50, 10_100.0), "");

        let rec = ledger.get("ord-1").unwrap();
        assert_eq!(rec.entry_qty, 100);
        assert!((rec.entry_price - 10_050.0).abs() < 0.01);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_replays_are_ignored() {
        let dir = tmp_dir("replay");
        let mut ledger = fresh(&dir);

        let entry = buy("ord-1", "005930", 100, 10_000.0);
        ledger.record_entry(&entry, "");
        ledger.record_entry(&entry, "");
        assert_eq!(ledger.get("ord-1").unwrap().entry_qty, 100);

        let exit = sell("005930", 50, 10_300.0, ExitKind::FirstTarget);
        ledger.record_exit(&exit);
        assert_eq!(ledger.record_exit(&exit), 0);
        let rec = ledger.get("ord-1").unwrap();
        assert_eq!(rec.exits.len(), 1);
        assert_eq!(rec.exit_qty, 50);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sell_walks_oldest_entry_first() {
        let dir = tmp_dir("fifo");
        let mut ledger = fresh(&dir);

        let mut first = buy("ord-1", "005930", 30, 10_000.0);
        first.ts = Local::now() - Duration::minutes(10);
        ledger.record_entry(&first, "");
        ledger.record_entry(&buy("ord-2", "005930", 30, 10_200.0), "");

        let leftover = ledger.record_exit(&sell("005930", 40, 10_500.0, ExitKind::Manual));
        assert_eq!(leftover, 0);
        assert!(ledger.get("ord-1").unwrap().is_closed());
        assert_eq!(ledger.get("ord-2").unwrap().exit_qty, 10);
        assert_eq!(ledger.get("ord-2").unwrap().open_qty(), 20);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sell_without_entry_reports_leftover() {
        let dir = tmp_dir("leftover");
        let mut ledger = fresh(&dir);
        let leftover = ledger.record_exit(&sell("005930", 10, 10_000.0, ExitKind::Manual));
        assert_eq!(leftover, 10);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_day_files_reload() {
        let dir = tmp_dir("reload");
        {
            let mut ledger = fresh(&dir);
            ledger.record_entry(&buy("ord-1", "005930", 100, 10_000.0), "samsung");
            ledger.record_exit(&sell("005930", 40, 10_300.0, ExitKind::FirstTarget));
        }
        let ledger = TradeLedger::new(&dir, FeeSchedule::default(), None);
        let rec = ledger.get("ord-1").unwrap();
        assert_eq!(rec.entry_qty, 100);
        assert_eq!(rec.exit_qty, 40);
        assert_eq!(rec.name, "samsung");
        assert_eq!(rec.exits.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reconcile_recovers_missing_entry_once() {
        let dir = tmp_dir("sync_entry");
        let mut ledger = fresh(&dir);
        let today = Local::now().date_naive();

        let fills = vec![
            broker("005930", Side::Buy, 5, 70_000.0),
            broker("005930", Side::Buy, 5, 70_200.0),
        ];
        let report = ledger.reconcile(today, &fills);
        assert_eq!(report.recovered_entries, 1);

        let id = format!("sync-005930-{}", today.format("%Y%m%d"));
        let rec = ledger.get(&id).unwrap();
        assert_eq!(rec.entry_qty, 10);
        assert!((rec.entry_price - 70_100.0).abs() < 0.01);
        assert_eq!(rec.strategy, "unknown");

        // same fills again: totals already match
        let rerun = ledger.reconcile(today, &fills);
        assert_eq!(rerun, ReconcileReport::default());
        assert_eq!(ledger.get(&id).unwrap().entry_qty, 10);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reconcile_recovers_sell_delta_fifo() {
        let dir = tmp_dir("sync_exit");
        let mut ledger = fresh(&dir);
        let today = Local::now().date_naive();

        ledger.record_entry(&buy("ord-1", "005930", 100, 10_000.0), "");
        ledger.record_exit(&sell("005930", 20, 10_300.0, ExitKind::FirstTarget));

        // broker saw 70 sold in total; the journal only recorded 20
        let fills = vec![broker("005930", Side::Sell, 70, 10_300.0)];
        let report = ledger.reconcile(today, &fills);
        assert_eq!(report.recovered_exit_qty, 50);
        assert!(report.unabsorbed.is_empty());

        let rec = ledger.get("ord-1").unwrap();
        assert_eq!(rec.exit_qty, 70);
        assert_eq!(rec.exits.len(), 2);
        assert_eq!(rec.exits[1].kind, ExitKind::Recovered);
        assert_eq!(rec.exits[1].qty, 50);

        let rerun = ledger.reconcile(today, &fills);
        assert_eq!(rerun, ReconcileReport::default());
        assert_eq!(ledger.get("ord-1").unwrap().exits.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reconcile_unabsorbed_lands_on_latest_record() {
        let dir = tmp_dir("unabsorbed");
        let mut ledger = fresh(&dir);
        let today = Local::now().date_naive();

        ledger.record_entry(&buy("ord-1", "005930", 10, 10_000.0), "");
        ledger.record_exit(&sell("005930", 10, 10_300.0, ExitKind::FirstTarget));

        // broker reports 15 sold; only 10 ever entered the journal
        let fills = vec![broker("005930", Side::Sell, 15, 10_300.0)];
        let report = ledger.reconcile(today, &fills);
        assert_eq!(report.unabsorbed, vec![("005930".to_string(), 5)]);

        let rec = ledger.get("ord-1").unwrap();
        assert_eq!(rec.exit_qty, 15);
        assert_eq!(rec.exits.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_pnl_correction_skips_multi_exit_trades() {
        let dir = tmp_dir("correction");
        let mut ledger = fresh(&dir);
        let fees = FeeSchedule::default();
        let today = Local::now().date_naive();

        // single-exit trade, journalled at an estimated price
        ledger.record_entry(&buy("ord-a", "005930", 100, 10_000.0), "");
        ledger.record_exit(&sell("005930", 100, 10_250.0, ExitKind::Manual));
        // multi-exit trade on another symbol
        ledger.record_entry(&buy("ord-b", "000660", 100, 10_000.0), "");
        ledger.record_exit(&sell("000660", 50, 10_250.0, ExitKind::FirstTarget));
        ledger.record_exit(&sell("000660", 50, 10_250.0, ExitKind::Trailing));

        let fills = vec![
            broker("005930", Side::Sell, 100, 10_300.0),
            broker("000660", Side::Sell, 100, 10_300.0),
        ];
        let report = ledger.reconcile(today, &fills);
        assert_eq!(report.corrected, 1);

        let a = ledger.get("ord-a").unwrap();
        assert!((a.exit_price - 10_300.0).abs() < 0.01);
        assert!((a.pnl - fees.net_pnl(10_000.0, 10_300.0, 100)).abs() < 0.01);
        // two recorded exits: left alone
        let b = ledger.get("ord-b").unwrap();
        assert!((b.exit_price - 10_250.0).abs() < 0.01);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_handler_emits_alert_for_unabsorbed_sells() {
        use crate::portfolio::{Portfolio, TickCache};
        use crate::session::MarketSession;

        let dir = tmp_dir("handler_alert");
        let ledger = fresh(&dir);
        let mut writer = LedgerWriter::new(ledger);

        let mut pf = Portfolio::new(10_000_000.0, FeeSchedule::default());
        let cache = TickCache::new(100, 16);
        let mut ctx = EngineCtx {
            portfolio: &mut pf,
            ticks: &cache,
            session: MarketSession::Regular,
            now: Local::now(),
        };

        let ev = Event::new(
            "test",
            Payload::Reconcile {
                date: Local::now().date_naive(),
                fills: vec![broker("005930", Side::Sell, 15, 10_300.0)],
            },
        );
        let out = writer.on_event(&ev, &mut ctx).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0].payload,
            Payload::RiskAlert(a) if a.code == "reconcile"
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
