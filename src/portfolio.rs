// ===============================
// src/portfolio.rs
// ===============================
//
// The canonical cash/position book. Owned by the engine; every mutation runs
// inside the dispatch loop, so nothing here needs a lock. Buy fills move the
// weighted average, sell fills realize P&L, and the daily breaker math works
// off "effective" P&L: realized today plus the drift in unrealized since the
// daily reset.

use std::collections::VecDeque;

use ahash::AHashMap;
use chrono::{DateTime, Local};
use tracing::warn;

use crate::domain::{Fill, PositionChange, Side};
use crate::fees::FeeSchedule;

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub name: String,
    pub qty: i64,
    pub avg_price: f64,
    pub current_price: f64,
    pub highest_price: f64,
    pub strategy: String,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub entry_time: DateTime<Local>,
    /// Realized across this position's partial sells, for round-trip results.
    pub realized_pnl: f64,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.current_price * self.qty as f64
    }

    pub fn cost_basis(&self) -> f64 {
        self.avg_price * self.qty as f64
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.market_value() - self.cost_basis()
    }

    pub fn unrealized_pnl_pct(&self) -> f64 {
        let basis = self.cost_basis();
        if basis <= 0.0 {
            0.0
        } else {
            self.unrealized_pnl() / basis * 100.0
        }
    }
}

#[derive(Debug)]
pub struct Portfolio {
    pub cash: f64,
    pub positions: AHashMap<String, Position>,
    /// Equity at the daily reset; the base for daily loss percentages.
    pub initial_capital: f64,
    pub daily_realized_pnl: f64,
    pub daily_trades: u32,
    daily_start_unrealized: f64,
    fees: FeeSchedule,
}

impl Portfolio {
    pub fn new(cash: f64, fees: FeeSchedule) -> Self {
        Self {
            cash,
            positions: AHashMap::new(),
            initial_capital: cash,
            daily_realized_pnl: 0.0,
            daily_trades: 0,
            daily_start_unrealized: 0.0,
            fees,
        }
    }

    /// Seed one holding from the broker's account snapshot at startup.
    pub fn seed_position(&mut self, symbol: &str, name: &str, qty: i64, avg: f64, current: f64) {
        if qty <= 0 {
            return;
        }
        self.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                name: name.to_string(),
                qty,
                avg_price: avg,
                current_price: if current > 0.0 { current } else { avg },
                highest_price: current.max(avg),
                strategy: String::new(),
                stop_price: None,
                target_price: None,
                entry_time: Local::now(),
                realized_pnl: 0.0,
            },
        );
    }

    pub fn total_position_value(&self) -> f64 {
        self.positions.values().map(|p| p.market_value()).sum()
    }

    pub fn total_equity(&self) -> f64 {
        self.cash + self.total_position_value()
    }

    pub fn total_unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl()).sum()
    }

    /// Realized today plus the unrealized drift since the daily reset.
    pub fn effective_daily_pnl(&self) -> f64 {
        self.daily_realized_pnl + (self.total_unrealized_pnl() - self.daily_start_unrealized)
    }

    pub fn effective_daily_pnl_pct(&self) -> f64 {
        if self.initial_capital <= 0.0 {
            0.0
        } else {
            self.effective_daily_pnl() / self.initial_capital * 100.0
        }
    }

    /// Cash minus the equity-proportional reserve, floored at zero.
    pub fn available_cash(&self, reserve_pct: f64) -> f64 {
        (self.cash - self.total_equity() * reserve_pct / 100.0).max(0.0)
    }

    pub fn mark_price(&mut self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        if let Some(p) = self.positions.get_mut(symbol) {
            p.current_price = price;
            if price > p.highest_price {
                p.highest_price = price;
            }
        }
    }

    /// Apply one fill and report the resulting position state. Buys fold into
    /// the weighted average; sells realize `(price - avg) * qty - sell fee`.
    pub fn apply_fill(&mut self, fill: &Fill) -> PositionChange {
        match fill.side {
            Side::Buy => self.apply_buy(fill),
            Side::Sell => self.apply_sell(fill),
        }
    }

    fn apply_buy(&mut self, fill: &Fill) -> PositionChange {
        let pos = self.positions.entry(fill.symbol.clone()).or_insert_with(|| Position {
            symbol: fill.symbol.clone(),
            name: String::new(),
            qty: 0,
            avg_price: 0.0,
            current_price: fill.price,
            highest_price: fill.price,
            strategy: fill.strategy.clone(),
            stop_price: fill.stop_price,
            target_price: fill.target_price,
            entry_time: fill.ts,
            realized_pnl: 0.0,
        });
        let total_cost = pos.avg_price * pos.qty as f64 + fill.price * fill.qty as f64;
        pos.qty += fill.qty;
        pos.avg_price = total_cost / pos.qty as f64;
        pos.current_price = fill.price;
        if fill.price > pos.highest_price {
            pos.highest_price = fill.price;
        }
        if pos.strategy.is_empty() {
            pos.strategy = fill.strategy.clone();
        }
        if fill.stop_price.is_some() {
            pos.stop_price = fill.stop_price;
        }
        if fill.target_price.is_some() {
            pos.target_price = fill.target_price;
        }
        let change = PositionChange {
            symbol: fill.symbol.clone(),
            side: Side::Buy,
            fill_qty: fill.qty,
            fill_price: fill.price,
            qty_after: pos.qty,
            avg_price: pos.avg_price,
            realized_pnl: 0.0,
            position_realized: pos.realized_pnl,
            strategy: pos.strategy.clone(),
            exit: None,
        };
        self.cash -= self.fees.total_buy_cost(fill.price, fill.qty);
        self.daily_trades += 1;
        change
    }

    fn apply_sell(&mut self, fill: &Fill) -> PositionChange {
        let Some(pos) = self.positions.get_mut(&fill.symbol) else {
            warn!(symbol = %fill.symbol, qty = fill.qty, "sell fill for unknown position");
            return PositionChange {
                symbol: fill.symbol.clone(),
                side: Side::Sell,
                fill_qty: fill.qty,
                fill_price: fill.price,
                qty_after: 0,
                avg_price: 0.0,
                realized_pnl: 0.0,
                position_realized: 0.0,
                strategy: fill.strategy.clone(),
                exit: fill.exit,
            };
        };
        let qty = fill.qty.min(pos.qty);
        if qty < fill.qty {
            warn!(symbol = %fill.symbol, fill_qty = fill.qty, held = pos.qty, "sell fill exceeds held quantity, clamped");
        }
        let amount = fill.price * qty as f64;
        let sell_fee = self.fees.sell_fee(amount);
        let realized = (fill.price - pos.avg_price) * qty as f64 - sell_fee;
        pos.qty -= qty;
        pos.current_price = fill.price;
        pos.realized_pnl += realized;
        self.cash += amount - sell_fee;
        self.daily_realized_pnl += realized;
        let change = PositionChange {
            symbol: fill.symbol.clone(),
            side: Side::Sell,
            fill_qty: qty,
            fill_price: fill.price,
            qty_after: pos.qty,
            avg_price: pos.avg_price,
            realized_pnl: realized,
            position_realized: pos.realized_pnl,
            strategy: pos.strategy.clone(),
            exit: fill.exit,
        };
        if pos.qty <= 0 {
            self.positions.remove(&fill.symbol);
        }
        change
    }

    pub fn held_symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.positions.keys().cloned().collect();
        v.sort();
        v
    }

    /// Date-rollover hook: counters restart and the loss base becomes the
    /// current equity.
    pub fn reset_daily(&mut self) {
        self.daily_realized_pnl = 0.0;
        self.daily_trades = 0;
        self.daily_start_unrealized = self.total_unrealized_pnl();
        self.initial_capital = self.total_equity();
    }
}

// ---- recent-tick cache ----

/// Fixed-capacity per-symbol price history with explicit touch and
/// evict-oldest. Inserting past capacity drops the least-recently-touched
/// symbol.
#[derive(Debug)]
pub struct TickCache {
    cap: usize,
    per_symbol: usize,
    stamp: u64,
    slots: AHashMap<String, CacheSlot>,
}

#[derive(Debug)]
struct CacheSlot {
    touched: u64,
    prices: VecDeque<(DateTime<Local>, f64)>,
}

impl TickCache {
    pub fn new(cap: usize, per_symbol: usize) -> Self {
        Self { cap: cap.max(1), per_symbol: per_symbol.max(1), stamp: 0, slots: AHashMap::new() }
    }

    pub fn push(&mut self, symbol: &str, ts: DateTime<Local>, price: f64) {
        if price <= 0.0 {
            return;
        }
        self.stamp += 1;
        if !self.slots.contains_key(symbol) && self.slots.len() >= self.cap {
            self.evict_oldest();
        }
        let slot = self
            .slots
            .entry(symbol.to_string())
            .or_insert_with(|| CacheSlot { touched: 0, prices: VecDeque::new() });
        slot.touched = self.stamp;
        slot.prices.push_back((ts, price));
        while slot.prices.len() > self.per_symbol {
            slot.prices.pop_front();
        }
    }

    pub fn touch(&mut self, symbol: &str) {
        self.stamp += 1;
        if let Some(slot) = self.slots.get_mut(symbol) {
            slot.touched = self.stamp;
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<f64> {
        self.slots.get(symbol).and_then(|s| s.prices.back().map(|(_, p)| *p))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some(sym) = self
            .slots
            .iter()
            .min_by_key(|(_, s)| s.touched)
            .map(|(k, _)| k.clone())
        {
            self.slots.remove(&sym);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(symbol: &str, side: Side, qty: i64, price: f64) -> Fill {
        Fill {
            order_id: "t-1".into(),
            symbol: symbol.into(),
            side,
            qty,
            price,
            ts: Local::now(),
            strategy: "test".into(),
            reason: String::new(),
            score: 0.0,
            exit: None,
            stop_price: None,
            target_price: None,
        }
    }

    #[test]
    fn test_weighted_average_on_buys_only() {
        let mut pf = Portfolio::new(10_000_000.0, FeeSchedule::default());
        pf.apply_fill(&fill("005930", Side::Buy, 10, 70_000.0));
        pf.apply_fill(&fill("005930", Side::Buy, 30, 71_000.0));
        let avg = pf.positions.get("005930").map(|p| p.avg_price).unwrap_or(0.0);
        let expected = (10.0 * 70_000.0 + 30.0 * 71_000.0) / 40.0;
        assert!((avg - expected).abs() < 0.01);

        // a sell never moves the average
        pf.apply_fill(&fill("005930", Side::Sell, 15, 73_000.0));
        let after = pf.positions.get("005930").map(|p| p.avg_price).unwrap_or(0.0);
        assert!((after - expected).abs() < 0.01);
        assert_eq!(pf.positions.get("005930").map(|p| p.qty), Some(25));
    }

    #[test]
    fn test_sell_realizes_and_closes() {
        let fees = FeeSchedule::default();
        let mut pf = Portfolio::new(10_000_000.0, fees);
        pf.apply_fill(&fill("035720", Side::Buy, 100, 50_000.0));
        let change = pf.apply_fill(&fill("035720", Side::Sell, 100, 52_000.0));
        let amount = 52_000.0 * 100.0;
        let expected = (52_000.0 - 50_000.0) * 100.0 - fees.sell_fee(amount);
        assert!((change.realized_pnl - expected).abs() < 0.01);
        assert_eq!(change.qty_after, 0);
        assert!(pf.positions.is_empty());
        assert!((pf.daily_realized_pnl - expected).abs() < 0.01);
    }

    #[test]
    fn test_cash_moves_with_fees() {
        let fees = FeeSchedule::default();
        let mut pf = Portfolio::new(10_000_000.0, fees);
        pf.apply_fill(&fill("000660", Side::Buy, 10, 100_000.0));
        let expected_cash = 10_000_000.0 - fees.total_buy_cost(100_000.0, 10);
        assert!((pf.cash - expected_cash).abs() < 0.01);
        assert_eq!(pf.daily_trades, 1);
    }

    #[test]
    fn test_oversell_clamped() {
        let mut pf = Portfolio::new(10_000_000.0, FeeSchedule::default());
        pf.apply_fill(&fill("005930", Side::Buy, 10, 70_000.0));
        let change = pf.apply_fill(&fill("005930", Side::Sell, 25, 71_000.0));
        assert_eq!(change.fill_qty, 10);
        assert_eq!(change.qty_after, 0);
    }

    #[test]
    fn test_effective_daily_pnl_uses_baseline() {
        let mut pf = Portfolio::new(10_000_000.0, FeeSchedule::default());
        pf.apply_fill(&fill("005930", Side::Buy, 100, 10_000.0));
        pf.mark_price("005930", 10_500.0);
        // all unrealized drift counts before any reset
        assert!((pf.effective_daily_pnl() - 50_000.0).abs() < 0.01);
        pf.reset_daily();
        assert!(pf.effective_daily_pnl().abs() < 0.01);
        pf.mark_price("005930", 10_200.0);
        assert!((pf.effective_daily_pnl() + 30_000.0).abs() < 0.01);
    }

    #[test]
    fn test_available_cash_reserve() {
        let mut pf = Portfolio::new(1_000_000.0, FeeSchedule::default());
        // no positions: reserve comes straight off cash
        assert!((pf.available_cash(20.0) - 800_000.0).abs() < 0.01);
        pf.cash = 100_000.0;
        pf.seed_position("005930", "", 100, 9_000.0, 9_000.0);
        // equity 1_000_000, reserve 200_000 > cash -> floored at zero
        assert!(pf.available_cash(20.0).abs() < 0.01);
    }

    #[test]
    fn test_tick_cache_evicts_least_recently_touched() {
        let mut cache = TickCache::new(2, 10);
        let now = Local::now();
        cache.push("A", now, 1.0);
        cache.push("B", now, 2.0);
        cache.touch("A");
        cache.push("C", now, 3.0); // B is oldest-touched now
        assert_eq!(cache.len(), 2);
        assert!(cache.latest("B").is_none());
        assert_eq!(cache.latest("A"), Some(1.0));
        assert_eq!(cache.latest("C"), Some(3.0));
    }

    #[test]
    fn test_tick_cache_bounds_history() {
        let mut cache = TickCache::new(4, 3);
        let now = Local::now();
        for i in 0..10 {
            cache.push("A", now, 100.0 + i as f64);
        }
        assert_eq!(cache.latest("A"), Some(109.0));
    }
}
