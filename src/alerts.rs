// ===============================
// src/alerts.rs
// ===============================
//
// Outbound alert relay. Risk alerts and errors flow off the engine into a
// bounded queue consumed by a sink task; the transport behind the sink is
// whatever notifier is wired up downstream. A per-key cooldown keeps one
// breaker trip from becoming a stream of duplicates, and recoverable errors
// only alert once a component has failed several times in a row.

use ahash::AHashMap;
use chrono::{DateTime, Duration, Local};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{Event, EventKind, Payload};
use crate::engine::{EngineCtx, Handler, HandlerError};
use crate::metrics;

#[derive(Debug, Clone)]
pub struct AlertCfg {
    pub cooldown_secs: i64,
    pub escalate_after: u32,
}

impl Default for AlertCfg {
    fn default() -> Self {
        Self { cooldown_secs: 300, escalate_after: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundAlert {
    pub severity: &'static str,
    pub message: String,
}

/// Decides whether an alert key may fire right now.
pub struct AlertGate {
    cfg: AlertCfg,
    last_sent: AHashMap<String, DateTime<Local>>,
    failures: AHashMap<String, u32>,
}

impl AlertGate {
    pub fn new(cfg: AlertCfg) -> Self {
        Self { cfg, last_sent: AHashMap::new(), failures: AHashMap::new() }
    }

    pub fn should_send(&mut self, key: &str, now: DateTime<Local>) -> bool {
        if let Some(prev) = self.last_sent.get(key) {
            if now.signed_duration_since(*prev) < Duration::seconds(self.cfg.cooldown_secs) {
                return false;
            }
        }
        self.last_sent.insert(key.to_string(), now);
        true
    }

    /// Consecutive-failure count for the key after this failure.
    pub fn note_failure(&mut self, key: &str) -> u32 {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_failures(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn escalate_after(&self) -> u32 {
        self.cfg.escalate_after
    }
}

/// Engine handler that forwards risk alerts and errors to the sink queue.
pub struct AlertRelay {
    gate: AlertGate,
    tx: mpsc::Sender<OutboundAlert>,
}

impl AlertRelay {
    pub fn new(cfg: AlertCfg, tx: mpsc::Sender<OutboundAlert>) -> Self {
        Self { gate: AlertGate::new(cfg), tx }
    }

    fn push(&self, severity: &'static str, message: String) {
        // full queue means the sink is wedged; trading must not notice
        if self.tx.try_send(OutboundAlert { severity, message }).is_err() {
            debug!("alert queue full, alert dropped");
        }
    }
}

impl Handler for AlertRelay {
    fn name(&self) -> &'static str {
        "alerts"
    }

    fn wants(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::RiskAlert | EventKind::Error)
    }

    fn on_event(&mut self, ev: &Event, ctx: &mut EngineCtx) -> Result<Vec<Event>, HandlerError> {
        match &ev.payload {
            Payload::RiskAlert(alert) => {
                let key = format!("risk:{}", alert.code);
                if self.gate.should_send(&key, ctx.now) {
                    let severity =
                        if alert.code == "daily_loss_hard" { "critical" } else { "warning" };
                    self.push(severity, format!("[{}] {}", alert.code, alert.message));
                }
            }
            Payload::Error(note) => {
                let key = format!("error:{}", note.component);
                if note.recoverable {
                    let count = self.gate.note_failure(&key);
                    if count >= self.gate.escalate_after()
                        && self.gate.should_send(&key, ctx.now)
                    {
                        self.push(
                            "critical",
                            format!(
                                "{} failed {} times in a row: {}",
                                note.component, count, note.message
                            ),
                        );
                        self.gate.reset_failures(&key);
                    }
                } else if self.gate.should_send(&key, ctx.now) {
                    self.push("critical", format!("{}: {}", note.component, note.message));
                }
            }
            _ => {}
        }
        Ok(Vec::new())
    }
}

/// Drains the alert queue. This is the seam where a chat or pager transport
/// would plug in; on its own it writes the alert to the log.
pub async fn run_sink(mut rx: mpsc::Receiver<OutboundAlert>) {
    while let Some(alert) = rx.recv().await {
        metrics::ALERTS.inc();
        match alert.severity {
            "critical" => error!(message = %alert.message, "alert"),
            _ => warn!(message = %alert.message, "alert"),
        }
    }
    info!("alert sink stopped");
}
