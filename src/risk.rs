// ===============================
// src/risk.rs
// ===============================
//
// Admission control for new entries. The gate sits inside the order router
// and answers two questions before any buy goes out: may this entry open at
// all, and how big may it be. Daily-loss tiers, the loss streak and per-symbol
// cooldowns persist across a same-day restart through a small stats file.

use std::path::PathBuf;

use ahash::AHashMap;
use chrono::{DateTime, Duration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{RiskAlert, Strength};
use crate::portfolio::Portfolio;

#[derive(Debug, Clone)]
pub struct RiskCfg {
    /// Beyond this daily loss only defensive strategies may open.
    pub daily_loss_soft_pct: f64,
    /// Beyond this daily loss nothing opens.
    pub daily_loss_hard_pct: f64,
    pub daily_max_trades: u32,
    pub base_position_pct: f64,
    pub max_position_pct: f64,
    pub max_positions: usize,
    pub min_cash_reserve_pct: f64,
    pub min_position_value: f64,
    pub dynamic_sizing: bool,
    pub flex_extra_positions: usize,
    pub flex_cash_threshold_pct: f64,
    pub consecutive_loss_limit: u32,
    pub stop_loss_cooldown_mins: i64,
    pub defensive_strategies: Vec<String>,
    pub stats_path: Option<PathBuf>,
}

impl Default for RiskCfg {
    fn default() -> Self {
        Self {
            daily_loss_soft_pct: 3.0,
            daily_loss_hard_pct: 5.0,
            daily_max_trades: 15,
            base_position_pct: 15.0,
            max_position_pct: 35.0,
            max_positions: 5,
            min_cash_reserve_pct: 15.0,
            min_position_value: 500_000.0,
            dynamic_sizing: true,
            flex_extra_positions: 2,
            flex_cash_threshold_pct: 10.0,
            consecutive_loss_limit: 3,
            stop_loss_cooldown_mins: 60,
            defensive_strategies: Vec::new(),
            stats_path: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum Blocked {
    #[error("daily loss {pnl_pct:.2}% beyond hard limit -{limit:.1}%")]
    DailyLossHard { pnl_pct: f64, limit: f64 },
    #[error("daily loss {pnl_pct:.2}% beyond soft limit and {strategy} is not defensive")]
    DailyLossSoft { pnl_pct: f64, strategy: String },
    #[error("{count} consecutive losses, new entries paused")]
    LossStreak { count: u32 },
    #[error("daily trade limit {limit} reached")]
    TradeLimit { limit: u32 },
    #[error("position cap {cap} reached")]
    PositionCap { cap: usize },
    #[error("{symbol} cooling down until {until}")]
    Cooldown { symbol: String, until: DateTime<Local> },
    #[error("already holding {symbol}")]
    AlreadyHeld { symbol: String },
    #[error("sized below minimum (available {available:.0})")]
    TooSmall { available: f64 },
}

impl Blocked {
    pub fn label(&self) -> &'static str {
        match self {
            Blocked::DailyLossHard { .. } => "hard_loss",
            Blocked::DailyLossSoft { .. } => "soft_loss",
            Blocked::LossStreak { .. } => "loss_streak",
            Blocked::TradeLimit { .. } => "trade_limit",
            Blocked::PositionCap { .. } => "position_cap",
            Blocked::Cooldown { .. } => "cooldown",
            Blocked::AlreadyHeld { .. } => "already_held",
            Blocked::TooSmall { .. } => "too_small",
        }
    }
}

/// Round-trip outcome counters persisted so a same-day restart keeps the
/// breaker state instead of forgetting the morning's losses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    pub realized_pnl: f64,
}

pub struct RiskGate {
    cfg: RiskCfg,
    consecutive_losses: u32,
    wins: u32,
    losses: u32,
    cooldowns: AHashMap<String, DateTime<Local>>,
    alerted_soft: bool,
    alerted_hard: bool,
}

impl RiskGate {
    pub fn new(cfg: RiskCfg) -> Self {
        Self {
            cfg,
            consecutive_losses: 0,
            wins: 0,
            losses: 0,
            cooldowns: AHashMap::new(),
            alerted_soft: false,
            alerted_hard: false,
        }
    }

    pub fn cfg(&self) -> &RiskCfg {
        &self.cfg
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// All admission checks for a new entry, most severe first.
    pub fn can_open(
        &self,
        symbol: &str,
        strategy: &str,
        pf: &Portfolio,
        now: DateTime<Local>,
    ) -> Result<(), Blocked> {
        let pnl_pct = pf.effective_daily_pnl_pct();
        if pnl_pct <= -self.cfg.daily_loss_hard_pct {
            return Err(Blocked::DailyLossHard { pnl_pct, limit: self.cfg.daily_loss_hard_pct });
        }
        if pnl_pct <= -self.cfg.daily_loss_soft_pct
            && !self.cfg.defensive_strategies.iter().any(|s| s == strategy)
        {
            return Err(Blocked::DailyLossSoft { pnl_pct, strategy: strategy.to_string() });
        }
        if self.consecutive_losses >= self.cfg.consecutive_loss_limit {
            return Err(Blocked::LossStreak { count: self.consecutive_losses });
        }
        if pf.daily_trades >= self.cfg.daily_max_trades {
            return Err(Blocked::TradeLimit { limit: self.cfg.daily_max_trades });
        }
        if let Some(&until) = self.cooldowns.get(symbol) {
            if now < until {
                return Err(Blocked::Cooldown { symbol: symbol.to_string(), until });
            }
        }
        if pf.positions.contains_key(symbol) {
            return Err(Blocked::AlreadyHeld { symbol: symbol.to_string() });
        }
        let cap = self.max_positions_now(pf);
        if pf.positions.len() >= cap {
            return Err(Blocked::PositionCap { cap });
        }
        Ok(())
    }

    /// Position ceiling for the current equity. Shrinks as capital shrinks,
    /// gains flex slots while cash is plentiful.
    pub fn max_positions_now(&self, pf: &Portfolio) -> usize {
        if !self.cfg.dynamic_sizing {
            return self.cfg.max_positions;
        }
        let equity = pf.total_equity();
        if equity <= 0.0 {
            return 1;
        }
        let investable = equity * (1.0 - self.cfg.min_cash_reserve_pct / 100.0);
        let per_position =
            (equity * self.cfg.base_position_pct / 100.0).max(self.cfg.min_position_value);
        let mut cap = ((investable / per_position).floor() as usize)
            .max(1)
            .min(self.cfg.max_positions);

        let available = pf.available_cash(self.cfg.min_cash_reserve_pct);
        let cash_ratio = pf.cash / equity * 100.0;
        if cash_ratio >= self.cfg.flex_cash_threshold_pct
            && available >= self.cfg.min_position_value
        {
            cap = (cap + self.cfg.flex_extra_positions)
                .min(self.cfg.max_positions + self.cfg.flex_extra_positions);
        }
        cap
    }

    /// Shares to buy at `price`, or 0 when the sized value falls below the
    /// minimum worth holding.
    pub fn position_size(&self, pf: &Portfolio, strength: Strength, price: f64) -> i64 {
        if price <= 0.0 {
            return 0;
        }
        let equity = pf.total_equity();
        let mut value = equity * self.cfg.base_position_pct / 100.0 * strength.multiplier();
        if pf.effective_daily_pnl_pct() <= -self.cfg.daily_loss_soft_pct {
            value *= 0.5;
        }
        if self.consecutive_losses >= 2 {
            value *= 0.5;
        }
        value = value.min(equity * self.cfg.max_position_pct / 100.0);
        value = value.min(pf.available_cash(self.cfg.min_cash_reserve_pct));
        if value < self.cfg.min_position_value {
            return 0;
        }
        (value / price).floor() as i64
    }

    /// Closed-round-trip outcome; drives the streak counters.
    pub fn record_result(&mut self, realized: f64) {
        if realized < 0.0 {
            self.losses += 1;
            self.consecutive_losses += 1;
            if self.consecutive_losses >= self.cfg.consecutive_loss_limit {
                warn!(streak = self.consecutive_losses, "loss streak at limit, entries paused");
            }
        } else {
            if realized > 0.0 {
                self.wins += 1;
            }
            self.consecutive_losses = 0;
        }
    }

    pub fn note_stop_loss(&mut self, symbol: &str, now: DateTime<Local>) {
        let until = now + Duration::minutes(self.cfg.stop_loss_cooldown_mins);
        info!(%symbol, %until, "stop loss cooldown");
        self.cooldowns.insert(symbol.to_string(), until);
    }

    /// Alerts raised exactly once per tier crossing per day.
    pub fn breaker_alerts(&mut self, pf: &Portfolio) -> Vec<RiskAlert> {
        let pnl_pct = pf.effective_daily_pnl_pct();
        let mut alerts = Vec::new();
        if !self.alerted_soft && pnl_pct <= -self.cfg.daily_loss_soft_pct {
            self.alerted_soft = true;
            alerts.push(RiskAlert {
                code: "daily_loss_soft".into(),
                message: format!(
                    "daily loss {pnl_pct:.2}% beyond -{:.1}%, defensive entries only",
                    self.cfg.daily_loss_soft_pct
                ),
            });
        }
        if !self.alerted_hard && pnl_pct <= -self.cfg.daily_loss_hard_pct {
            self.alerted_hard = true;
            alerts.push(RiskAlert {
                code: "daily_loss_hard".into(),
                message: format!(
                    "daily loss {pnl_pct:.2}% beyond -{:.1}%, all entries blocked",
                    self.cfg.daily_loss_hard_pct
                ),
            });
        }
        alerts
    }

    pub fn reset_daily(&mut self) {
        self.consecutive_losses = 0;
        self.wins = 0;
        self.losses = 0;
        self.cooldowns.clear();
        self.alerted_soft = false;
        self.alerted_hard = false;
    }

    pub fn stats(&self, pf: &Portfolio, date: NaiveDate) -> DailyStats {
        DailyStats {
            date,
            trades: pf.daily_trades,
            wins: self.wins,
            losses: self.losses,
            consecutive_losses: self.consecutive_losses,
            realized_pnl: pf.daily_realized_pnl,
        }
    }

    /// Best-effort persistence; a failed write never blocks trading.
    pub fn save_stats(&self, pf: &Portfolio, date: NaiveDate) {
        let Some(path) = self.cfg.stats_path.as_ref() else {
            return;
        };
        let stats = self.stats(pf, date);
        let out = match serde_json::to_string_pretty(&stats) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "daily stats serialize failed");
                return;
            }
        };
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = std::fs::write(path, out) {
            warn!(path = %path.display(), err = %e, "daily stats write failed");
        }
    }

    /// Restore same-day streaks after a restart; stale files are ignored.
    pub fn load_stats(&mut self, today: NaiveDate) -> Option<DailyStats> {
        let path = self.cfg.stats_path.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        let stats: DailyStats = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "daily stats unreadable, starting fresh");
                return None;
            }
        };
        if stats.date != today {
            return None;
        }
        info!(
            trades = stats.trades,
            losses = stats.losses,
            streak = stats.consecutive_losses,
            "daily stats restored"
        );
        self.wins = stats.wins;
        self.losses = stats.losses;
        self.consecutive_losses = stats.consecutive_losses;
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeSchedule;

    fn gate() -> RiskGate {
        RiskGate::new(RiskCfg {
            defensive_strategies: vec!["dip_rebound".into()],
            ..RiskCfg::default()
        })
    }

    fn pf_with_pnl(capital: f64, realized: f64) -> Portfolio {
        let mut pf = Portfolio::new(capital, FeeSchedule::default());
        pf.daily_realized_pnl = realized;
        pf
    }

    #[test]
    fn test_soft_limit_allows_only_defensive() {
        let g = gate();
        let pf = pf_with_pnl(10_000_000.0, -400_000.0); // -4%
        let now = Local::now();
        assert!(matches!(
            g.can_open("005930", "momentum", &pf, now),
            Err(Blocked::DailyLossSoft { .. })
        ));
        assert!(g.can_open("005930", "dip_rebound", &pf, now).is_ok());
    }

    #[test]
    fn test_hard_limit_blocks_everything() {
        let g = gate();
        let pf = pf_with_pnl(10_000_000.0, -600_000.0); // -6%
        let now = Local::now();
        assert!(matches!(
            g.can_open("005930", "dip_rebound", &pf, now),
            Err(Blocked::DailyLossHard { .. })
        ));
    }

    #[test]
    fn test_sizing_halves_in_defensive_region() {
        let g = gate();
        let healthy = pf_with_pnl(10_000_000.0, 0.0);
        let hurting = pf_with_pnl(10_000_000.0, -400_000.0);
        let base = g.position_size(&healthy, Strength::Normal, 10_000.0);
        let cut = g.position_size(&hurting, Strength::Normal, 10_000.0);
        // 15% of 10M = 1.5M -> 150 shares, halved -> 75
        assert_eq!(base, 150);
        assert_eq!(cut, 75);
    }

    #[test]
    fn test_sizing_scales_with_strength_and_floors() {
        let g = gate();
        let pf = pf_with_pnl(10_000_000.0, 0.0);
        // 15% * 2.0 = 3M, under the 35% cap and available cash
        assert_eq!(g.position_size(&pf, Strength::VeryStrong, 10_000.0), 300);
        // 15% * 0.5 = 750k, above the 500k floor
        assert_eq!(g.position_size(&pf, Strength::Weak, 10_000.0), 75);
        // 15% * 0.5 of 2M = 150k, below the floor
        let tiny = Portfolio::new(2_000_000.0, FeeSchedule::default());
        assert_eq!(g.position_size(&tiny, Strength::Weak, 10_000.0), 0);
    }

    #[test]
    fn test_loss_streak_pauses_entries_and_win_resets() {
        let mut g = gate();
        let pf = pf_with_pnl(10_000_000.0, 0.0);
        let now = Local::now();
        for _ in 0..3 {
            g.record_result(-10_000.0);
        }
        assert!(matches!(
            g.can_open("005930", "momentum", &pf, now),
            Err(Blocked::LossStreak { count: 3 })
        ));
        g.record_result(5_000.0);
        assert!(g.can_open("005930", "momentum", &pf, now).is_ok());
    }

    #[test]
    fn test_streak_of_two_halves_size() {
        let mut g = gate();
        let pf = pf_with_pnl(10_000_000.0, 0.0);
        g.record_result(-1.0);
        g.record_result(-1.0);
        assert_eq!(g.position_size(&pf, Strength::Normal, 10_000.0), 75);
    }

    #[test]
    fn test_cooldown_blocks_reentry() {
        let mut g = gate();
        let pf = pf_with_pnl(10_000_000.0, 0.0);
        let now = Local::now();
        g.note_stop_loss("005930", now);
        assert!(matches!(
            g.can_open("005930", "momentum", &pf, now + Duration::minutes(30)),
            Err(Blocked::Cooldown { .. })
        ));
        assert!(g.can_open("005930", "momentum", &pf, now + Duration::minutes(61)).is_ok());
        assert!(g.can_open("000660", "momentum", &pf, now).is_ok());
    }

    #[test]
    fn test_dynamic_position_cap_shrinks_with_capital() {
        let g = gate();
        // 10M all cash: base cap 5, +2 flex
        assert_eq!(g.max_positions_now(&pf_with_pnl(10_000_000.0, 0.0)), 7);
        // 2M: investable 1.7M over per-position 500k -> 3, +2 flex
        assert_eq!(g.max_positions_now(&pf_with_pnl(2_000_000.0, 0.0)), 5);
        // 550k: investable 467.5k under one 500k slot -> 1, no flex (available < 500k)
        assert_eq!(g.max_positions_now(&pf_with_pnl(550_000.0, 0.0)), 1);
    }

    #[test]
    fn test_position_cap_and_duplicate_entry() {
        let cfg = RiskCfg {
            max_positions: 1,
            flex_extra_positions: 0,
            dynamic_sizing: false,
            ..RiskCfg::default()
        };
        let g = RiskGate::new(cfg);
        let mut pf = pf_with_pnl(10_000_000.0, 0.0);
        pf.seed_position("005930", "Samsung", 10, 70_000.0, 70_000.0);
        assert!(matches!(
            g.can_open("000660", "momentum", &pf, Local::now()),
            Err(Blocked::PositionCap { cap: 1 })
        ));
        assert!(matches!(
            g.can_open("005930", "momentum", &pf, Local::now()),
            Err(Blocked::AlreadyHeld { .. })
        ));
    }

    #[test]
    fn test_trade_limit() {
        let g = gate();
        let mut pf = pf_with_pnl(10_000_000.0, 0.0);
        pf.daily_trades = 15;
        assert!(matches!(
            g.can_open("005930", "momentum", &pf, Local::now()),
            Err(Blocked::TradeLimit { limit: 15 })
        ));
    }

    #[test]
    fn test_breaker_alerts_fire_once() {
        let mut g = gate();
        let pf = pf_with_pnl(10_000_000.0, -400_000.0);
        assert_eq!(g.breaker_alerts(&pf).len(), 1);
        assert!(g.breaker_alerts(&pf).is_empty());
        let worse = pf_with_pnl(10_000_000.0, -600_000.0);
        let alerts = g.breaker_alerts(&worse);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, "daily_loss_hard");
    }

    #[test]
    fn test_stats_roundtrip_same_day_only() {
        let dir = std::env::temp_dir().join(format!("risk-stats-{}", std::process::id()));
        let path = dir.join("daily_stats.json");
        let cfg = RiskCfg { stats_path: Some(path.clone()), ..RiskCfg::default() };
        let mut g = RiskGate::new(cfg.clone());
        let pf = pf_with_pnl(10_000_000.0, -50_000.0);
        g.record_result(-50_000.0);
        let today = Local::now().date_naive();
        g.save_stats(&pf, today);

        let mut fresh = RiskGate::new(cfg.clone());
        let restored = fresh.load_stats(today).unwrap();
        assert_eq!(restored.consecutive_losses, 1);
        assert_eq!(fresh.consecutive_losses(), 1);

        let mut other = RiskGate::new(cfg);
        assert!(other.load_stats(today + Duration::days(1)).is_none());
        let _ = std::fs::remove_dir_all(dir);
    }
}
