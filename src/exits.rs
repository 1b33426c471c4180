// ===============================
// src/exits.rs
// ===============================
//
// Staged exit state machine, one plan per open position:
//
//   None -> First -> Second -> Trailing
//
// Profit targets compare gross price move against the entry average; the
// stop and the trailing logic compare fee-inclusive P&L so a "break-even"
// exit never hides a real loss. A stage advances when the proposal goes out,
// not when it fills, so a repeated tick at the same price proposes nothing
// twice. Proposals are Sell signals re-emitted into the engine; the router
// turns them into orders.

use ahash::AHashMap;
use tracing::{debug, info};

use crate::domain::{
    Event, EventKind, ExitKind, OrderStatus, Payload, Side, Signal, Strength,
};
use crate::engine::{EngineCtx, Handler, HandlerError};
use crate::fees::FeeSchedule;
use crate::portfolio::Position;

#[derive(Debug, Clone)]
pub struct ExitCfg {
    /// Fee-inclusive loss that forces a full exit.
    pub stop_loss_pct: f64,
    /// Gross gain that takes the first partial.
    pub first_target_pct: f64,
    /// Gross gain that takes the second partial.
    pub second_target_pct: f64,
    /// Fee-inclusive gain that arms the trailing retrace.
    pub trailing_activate_pct: f64,
    /// Retrace from the high-water mark that fires the trailing exit.
    pub trailing_retrace_pct: f64,
    pub first_sell_ratio: f64,
    pub second_sell_ratio: f64,
    /// Remainders smaller than this are not worth keeping; sell everything.
    pub min_partial_qty: i64,
}

impl Default for ExitCfg {
    fn default() -> Self {
        Self {
            stop_loss_pct: 4.0,
            first_target_pct: 3.0,
            second_target_pct: 6.0,
            trailing_activate_pct: 3.0,
            trailing_retrace_pct: 2.5,
            first_sell_ratio: 0.5,
            second_sell_ratio: 0.5,
            min_partial_qty: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitStage {
    None,
    First,
    Second,
    Trailing,
}

#[derive(Debug)]
struct ExitPlan {
    stage: ExitStage,
    /// Entry size; the first partial is measured against this, not against
    /// whatever is left.
    original_qty: i64,
    stop_pct: f64,
    trailing_pct: f64,
    /// A proposal is out and its fill has not come back yet.
    in_flight: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct PlanOverride {
    stop_pct: Option<f64>,
    trailing_pct: Option<f64>,
}

pub struct ExitWatcher {
    cfg: ExitCfg,
    fees: FeeSchedule,
    plans: AHashMap<String, ExitPlan>,
    /// Per-symbol overrides carried on entry signals, consumed when the
    /// position opens.
    overrides: AHashMap<String, PlanOverride>,
}

impl ExitWatcher {
    pub fn new(cfg: ExitCfg, fees: FeeSchedule) -> Self {
        Self { cfg, fees, plans: AHashMap::new(), overrides: AHashMap::new() }
    }

    /// Register a plan for a position that existed before startup.
    pub fn adopt(&mut self, symbol: &str, qty: i64) {
        self.plans.entry(symbol.to_string()).or_insert(ExitPlan {
            stage: ExitStage::None,
            original_qty: qty,
            stop_pct: self.cfg.stop_loss_pct,
            trailing_pct: self.cfg.trailing_retrace_pct,
            in_flight: false,
        });
    }

    fn stash_overrides(&mut self, sig: &Signal) {
        let ov = PlanOverride {
            stop_pct: sig.meta.get("stop_pct").and_then(|v| v.parse().ok()),
            trailing_pct: sig.meta.get("trailing_pct").and_then(|v| v.parse().ok()),
        };
        if ov.stop_pct.is_some() || ov.trailing_pct.is_some() {
            self.overrides.insert(sig.symbol.clone(), ov);
        }
    }

    fn on_position(&mut self, symbol: &str, side: Side, qty_after: i64) {
        match side {
            Side::Buy => {
                let ov = self.overrides.remove(symbol).unwrap_or_default();
                let plan = self.plans.entry(symbol.to_string()).or_insert(ExitPlan {
                    stage: ExitStage::None,
                    original_qty: 0,
                    stop_pct: self.cfg.stop_loss_pct,
                    trailing_pct: self.cfg.trailing_retrace_pct,
                    in_flight: false,
                });
                // a pyramid buy re-bases the partial math on the merged size
                plan.original_qty = qty_after;
                plan.in_flight = false;
                if let Some(p) = ov.stop_pct {
                    plan.stop_pct = p;
                }
                if let Some(p) = ov.trailing_pct {
                    plan.trailing_pct = p;
                }
            }
            Side::Sell => {
                if qty_after <= 0 {
                    self.plans.remove(symbol);
                } else if let Some(plan) = self.plans.get_mut(symbol) {
                    plan.in_flight = false;
                }
            }
        }
    }

    fn evaluate(&mut self, symbol: &str, price: f64, ctx: &EngineCtx) -> Option<Signal> {
        let plan = self.plans.get_mut(symbol)?;
        if plan.in_flight {
            return None;
        }
        let pos = ctx.portfolio.positions.get(symbol)?;
        if pos.qty <= 0 || pos.avg_price <= 0.0 {
            return None;
        }
        let gross = (price - pos.avg_price) / pos.avg_price * 100.0;
        let net = self.fees.net_pnl_pct(pos.avg_price, price);

        // the stop outranks everything
        if net <= -plan.stop_pct {
            plan.in_flight = true;
            info!(%symbol, net = format!("{net:.2}"), stop = plan.stop_pct, "stop loss exit");
            return Some(sell(
                pos,
                price,
                pos.qty,
                ExitKind::StopLoss,
                format!("net {net:.2}% through -{:.1}%", plan.stop_pct),
            ));
        }

        // trailing retrace applies at any stage once fee-inclusive gain is real
        if net >= self.cfg.trailing_activate_pct && pos.highest_price > 0.0 {
            let retrace = (pos.highest_price - price) / pos.highest_price * 100.0;
            if retrace >= plan.trailing_pct {
                plan.in_flight = true;
                plan.stage = ExitStage::Trailing;
                info!(
                    %symbol,
                    high = pos.highest_price,
                    retrace = format!("{retrace:.2}"),
                    "trailing exit"
                );
                return Some(sell(
                    pos,
                    price,
                    pos.qty,
                    ExitKind::Trailing,
                    format!("retraced {retrace:.2}% from {:.0}", pos.highest_price),
                ));
            }
        }

        match plan.stage {
            ExitStage::None if gross >= self.cfg.first_target_pct => {
                let qty = partial_qty(
                    self.cfg.first_sell_ratio,
                    plan.original_qty,
                    pos.qty,
                    self.cfg.min_partial_qty,
                );
                plan.stage = ExitStage::First;
                plan.in_flight = true;
                info!(%symbol, gross = format!("{gross:.2}"), qty, "first target exit");
                Some(sell(
                    pos,
                    price,
                    qty,
                    ExitKind::FirstTarget,
                    format!("gross {gross:.2}% at first target"),
                ))
            }
            ExitStage::First if gross >= self.cfg.second_target_pct => {
                let qty = partial_qty(
                    self.cfg.second_sell_ratio,
                    pos.qty,
                    pos.qty,
                    self.cfg.min_partial_qty,
                );
                plan.stage = ExitStage::Second;
                plan.in_flight = true;
                info!(%symbol, gross = format!("{gross:.2}"), qty, "second target exit");
                Some(sell(
                    pos,
                    price,
                    qty,
                    ExitKind::SecondTarget,
                    format!("gross {gross:.2}% at second target"),
                ))
            }
            ExitStage::Second if net >= self.cfg.trailing_activate_pct => {
                plan.stage = ExitStage::Trailing;
                debug!(%symbol, "trailing armed for the remainder");
                None
            }
            _ => None,
        }
    }
}

/// Partial size with the degenerate cases folded in: too small to split,
/// or a remainder not worth keeping, becomes a full exit.
fn partial_qty(ratio: f64, base: i64, remaining: i64, min_partial: i64) -> i64 {
    let qty = (base as f64 * ratio).floor() as i64;
    if qty <= 0 || qty >= remaining || remaining - qty < min_partial {
        remaining
    } else {
        qty
    }
}

fn sell(pos: &Position, price: f64, qty: i64, kind: ExitKind, reason: String) -> Signal {
    Signal {
        symbol: pos.symbol.clone(),
        side: Side::Sell,
        strength: Strength::Normal,
        price: Some(price),
        target_price: None,
        stop_price: None,
        score: 0.0,
        reason,
        strategy: pos.strategy.clone(),
        qty: Some(qty),
        exit: Some(kind),
        meta: Default::default(),
    }
}

impl Handler for ExitWatcher {
    fn name(&self) -> &'static str {
        "exits"
    }

    fn wants(&self, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::Tick | EventKind::Position | EventKind::Signal | EventKind::OrderUpdate
        )
    }

    fn on_event(&mut self, ev: &Event, ctx: &mut EngineCtx) -> Result<Vec<Event>, HandlerError> {
        match &ev.payload {
            Payload::Signal(sig) if sig.side == Side::Buy && sig.exit.is_none() => {
                self.stash_overrides(sig);
                Ok(vec![])
            }
            Payload::Position(pc) => {
                self.on_position(&pc.symbol, pc.side, pc.qty_after);
                Ok(vec![])
            }
            Payload::OrderUpdate(up)
                if up.side == Side::Sell
                    && matches!(up.status, OrderStatus::Rejected | OrderStatus::Canceled) =>
            {
                // the proposal died; let the next tick try again
                if let Some(plan) = self.plans.get_mut(&up.symbol) {
                    plan.in_flight = false;
                }
                Ok(vec![])
            }
            Payload::Tick(t) => Ok(self
                .evaluate(&t.symbol, t.price, ctx)
                .map(|sig| Event::new("exits", Payload::Signal(sig)))
                .into_iter()
                .collect()),
            _ => Ok(vec![]),
        }
    }
}
