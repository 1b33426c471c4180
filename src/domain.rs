// ===============================
// src/domain.rs
// ===============================
//
// Core message types. Everything that travels the engine bus is a typed
// payload inside an envelope; the only loosely-typed escape hatch is the
// string map on Signal, for strategy-supplied annotations.

use std::collections::HashMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::session::MarketSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strength {
    VeryStrong,
    Strong,
    Normal,
    Weak,
}

impl Strength {
    pub fn multiplier(&self) -> f64 {
        match self {
            Strength::VeryStrong => 2.0,
            Strength::Strong => 1.5,
            Strength::Normal => 1.0,
            Strength::Weak => 0.5,
        }
    }
}

/// Why a sell happened. Carried from the exit proposal through the order and
/// its fills so the ledger and risk gate see the same classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    StopLoss,
    FirstTarget,
    SecondTarget,
    Trailing,
    Manual,
    Recovered,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::StopLoss => "stop_loss",
            ExitKind::FirstTarget => "first_target",
            ExitKind::SecondTarget => "second_target",
            ExitKind::Trailing => "trailing",
            ExitKind::Manual => "manual",
            ExitKind::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub ts: DateTime<Local>,
    pub price: f64,
    pub change_pct: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub cum_volume: i64,
    pub cum_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub strength: Strength,
    pub price: Option<f64>,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub score: f64,
    pub reason: String,
    pub strategy: String,
    /// Explicit quantity; set on exit proposals, absent on entries (sized by
    /// the risk gate).
    pub qty: Option<i64>,
    pub exit: Option<ExitKind>,
    pub meta: HashMap<String, String>,
}

impl Signal {
    pub fn entry(symbol: &str, strength: Strength, strategy: &str, reason: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Buy,
            strength,
            price: None,
            target_price: None,
            stop_price: None,
            score: 0.0,
            reason: reason.to_string(),
            strategy: strategy.to_string(),
            qty: None,
            exit: None,
            meta: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: i64,
    pub price: Option<f64>,
    pub strategy: String,
    pub reason: String,
    pub score: f64,
    pub exit: Option<ExitKind>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub created: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub broker_no: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: f64,
    pub ts: DateTime<Local>,
    pub strategy: String,
    pub reason: String,
    pub score: f64,
    pub exit: Option<ExitKind>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
}

/// Published by the engine after a fill is applied to the portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionChange {
    pub symbol: String,
    pub side: Side,
    pub fill_qty: i64,
    pub fill_price: f64,
    pub qty_after: i64,
    pub avg_price: f64,
    /// Realized on this fill (sells; zero on buys).
    pub realized_pnl: f64,
    /// Realized across the whole position so far.
    pub position_realized: f64,
    pub strategy: String,
    pub exit: Option<ExitKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ErrorNote {
    pub component: &'static str,
    pub message: String,
    pub recoverable: bool,
}

/// A broker-side fill row, already normalized, used by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerFill {
    pub order_no: String,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: f64,
    pub ts: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Tick(Tick),
    Signal(Signal),
    OrderUpdate(OrderUpdate),
    Fill(Fill),
    Position(PositionChange),
    RiskAlert(RiskAlert),
    Session(MarketSession),
    Reconcile { date: chrono::NaiveDate, fills: Vec<BrokerFill> },
    Heartbeat,
    Error(ErrorNote),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Tick,
    Signal,
    OrderUpdate,
    Fill,
    Position,
    RiskAlert,
    Session,
    Reconcile,
    Heartbeat,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Tick => "tick",
            EventKind::Signal => "signal",
            EventKind::OrderUpdate => "order_update",
            EventKind::Fill => "fill",
            EventKind::Position => "position",
            EventKind::RiskAlert => "risk_alert",
            EventKind::Session => "session",
            EventKind::Reconcile => "reconcile",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub ts: DateTime<Local>,
    pub source: &'static str,
    pub priority: u8,
    pub payload: Payload,
}

impl Event {
    /// Envelope with the default priority for the payload kind (1 = highest).
    pub fn new(source: &'static str, payload: Payload) -> Self {
        let priority = default_priority(&payload);
        Self { ts: Local::now(), source, priority, payload }
    }

    pub fn with_priority(source: &'static str, priority: u8, payload: Payload) -> Self {
        Self { ts: Local::now(), source, priority, payload }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            Payload::Tick(_) => EventKind::Tick,
            Payload::Signal(_) => EventKind::Signal,
            Payload::OrderUpdate(_) => EventKind::OrderUpdate,
            Payload::Fill(_) => EventKind::Fill,
            Payload::Position(_) => EventKind::Position,
            Payload::RiskAlert(_) => EventKind::RiskAlert,
            Payload::Session(_) => EventKind::Session,
            Payload::Reconcile { .. } => EventKind::Reconcile,
            Payload::Heartbeat => EventKind::Heartbeat,
            Payload::Error(_) => EventKind::Error,
        }
    }
}

fn default_priority(payload: &Payload) -> u8 {
    match payload {
        Payload::OrderUpdate(_) | Payload::Fill(_) | Payload::RiskAlert(_) | Payload::Error(_) => 1,
        Payload::Tick(_) | Payload::Session(_) => 2,
        Payload::Signal(_) | Payload::Position(_) => 3,
        Payload::Reconcile { .. } => 5,
        Payload::Heartbeat => 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priorities() {
        let fill = Event::new("t", Payload::Heartbeat);
        assert_eq!(fill.priority, 10);
        let sig = Event::new("t", Payload::Signal(Signal::entry("005930", Strength::Normal, "x", "")));
        assert_eq!(sig.priority, 3);
        let alert = Event::new(
            "t",
            Payload::RiskAlert(RiskAlert { code: "c".into(), message: "m".into() }),
        );
        assert_eq!(alert.priority, 1);
    }
}
