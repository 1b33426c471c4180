// ===============================
// src/store.rs
// ===============================
//
// SQLite mirror of the trade journal. rusqlite is synchronous, so the
// connection lives on a dedicated OS thread fed by a bounded channel; the
// dispatch loop never waits on storage. A failed write is retried a few
// times and then dropped with a log line. The JSON day files remain the
// fallback of record, so a dropped row costs audit detail, not money.

use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Local};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::ExitKind;
use crate::ledger::TradeRecord;
use crate::metrics;

const QUEUE_CAP: usize = 256;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_SLEEP_MS: u64 = 50;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    id              TEXT PRIMARY KEY,
    symbol          TEXT NOT NULL,
    name            TEXT NOT NULL DEFAULT '',
    strategy        TEXT NOT NULL DEFAULT '',
    entry_ts        TEXT NOT NULL,
    entry_price     REAL NOT NULL,
    entry_qty       INTEGER NOT NULL,
    entry_reason    TEXT NOT NULL DEFAULT '',
    score           REAL NOT NULL DEFAULT 0,
    order_no        TEXT NOT NULL DEFAULT '',
    exit_ts         TEXT,
    exit_price      REAL NOT NULL DEFAULT 0,
    exit_qty        INTEGER NOT NULL DEFAULT 0,
    exit_kind       TEXT,
    exit_reason     TEXT NOT NULL DEFAULT '',
    exits           TEXT NOT NULL DEFAULT '[]',
    pnl             REAL NOT NULL DEFAULT 0,
    pnl_pct         REAL NOT NULL DEFAULT 0,
    holding_minutes INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
CREATE INDEX IF NOT EXISTS idx_trades_entry_ts ON trades(entry_ts);

CREATE TABLE IF NOT EXISTS trade_events (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id   TEXT NOT NULL,
    symbol     TEXT NOT NULL,
    event_type TEXT NOT NULL,
    ts         TEXT NOT NULL,
    price      REAL NOT NULL,
    qty        INTEGER NOT NULL,
    exit_kind  TEXT,
    reason     TEXT NOT NULL DEFAULT '',
    pnl        REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_trade_events_trade ON trade_events(trade_id);
CREATE INDEX IF NOT EXISTS idx_trade_events_ts ON trade_events(ts);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only audit row, one per entry/exit/recovery fill.
#[derive(Debug, Clone)]
pub struct TradeEventRow {
    pub trade_id: String,
    pub symbol: String,
    pub event_type: &'static str,
    pub ts: DateTime<Local>,
    pub price: f64,
    pub qty: i64,
    pub kind: Option<ExitKind>,
    pub reason: String,
    pub pnl: f64,
}

enum Job {
    UpsertTrade(Box<TradeRecord>),
    InsertEvent(Box<TradeEventRow>),
    Shutdown,
}

#[derive(Clone)]
pub struct StoreHandle {
    tx: SyncSender<Job>,
}

impl StoreHandle {
    pub fn upsert_trade(&self, rec: &TradeRecord) {
        self.push(Job::UpsertTrade(Box::new(rec.clone())));
    }

    pub fn insert_event(&self, row: TradeEventRow) {
        self.push(Job::InsertEvent(Box::new(row)));
    }

    fn push(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::STORE_DROPS.inc();
                warn!("trade store queue full, row dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("trade store gone, row dropped");
            }
        }
    }
}

pub struct TradeStore {
    tx: SyncSender<Job>,
    join: JoinHandle<()>,
}

impl TradeStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        let (tx, rx) = std::sync::mpsc::sync_channel(QUEUE_CAP);
        let join = std::thread::Builder::new()
            .name("trade-store".into())
            .spawn(move || writer_loop(conn, rx))?;
        info!(path = %path.display(), "trade store opened");
        Ok(Self { tx, join })
    }

    pub fn handle(&self) -> StoreHandle {
        StoreHandle { tx: self.tx.clone() }
    }

    /// Drains queued writes, then stops the writer thread.
    pub fn close(self) {
        let _ = self.tx.send(Job::Shutdown);
        if self.join.join().is_err() {
            error!("trade store writer panicked");
        }
    }
}

fn writer_loop(conn: Connection, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if matches!(job, Job::Shutdown) {
            break;
        }
        for attempt in 1..=MAX_ATTEMPTS {
            match apply(&conn, &job) {
                Ok(()) => break,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    metrics::STORE_RETRIES.inc();
                    warn!(attempt, err = %e, "trade store write failed, retrying");
                    std::thread::sleep(Duration::from_millis(RETRY_SLEEP_MS * attempt as u64));
                }
                Err(e) => {
                    metrics::STORE_DROPS.inc();
                    error!(err = %e, "trade store write failed, row dropped");
                }
            }
        }
    }
    debug!("trade store writer stopped");
}

fn apply(conn: &Connection, job: &Job) -> Result<(), rusqlite::Error> {
    match job {
        Job::UpsertTrade(rec) => {
            let exits =
                serde_json::to_string(&rec.exits).unwrap_or_else(|_| "[]".to_string());
            conn.execute(
                r#"INSERT INTO trades
                   (id, symbol, name, strategy, entry_ts, entry_price, entry_qty,
                    entry_reason, score, order_no, exit_ts, exit_price, exit_qty,
                    exit_kind, exit_reason, exits, pnl, pnl_pct, holding_minutes,
                    updated_at)
                   VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,
                           ?17,?18,?19,?20)
                   ON CONFLICT(id) DO UPDATE SET
                     symbol=excluded.symbol, name=excluded.name,
                     strategy=excluded.strategy, entry_ts=excluded.entry_ts,
                     entry_price=excluded.entry_price, entry_qty=excluded.entry_qty,
                     entry_reason=excluded.entry_reason, score=excluded.score,
                     order_no=excluded.order_no, exit_ts=excluded.exit_ts,
                     exit_price=excluded.exit_price, exit_qty=excluded.exit_qty,
                     exit_kind=excluded.exit_kind, exit_reason=excluded.exit_reason,
                     exits=excluded.exits, pnl=excluded.pnl,
                     pnl_pct=excluded.pnl_pct,
                     holding_minutes=excluded.holding_minutes,
                     updated_at=excluded.updated_at"#,
                params![
                    rec.id,
                    rec.symbol,
                    rec.name,
                    rec.strategy,
                    rec.entry_ts.to_rfc3339(),
                    rec.entry_price,
                    rec.entry_qty,
                    rec.entry_reason,
                    rec.score,
                    rec.order_no,
                    rec.exit_ts.map(|t| t.to_rfc3339()),
                    rec.exit_price,
                    rec.exit_qty,
                    rec.exit_kind.map(|k| k.as_str()),
                    rec.exit_reason,
                    exits,
                    rec.pnl,
                    rec.pnl_pct,
                    rec.holding_minutes,
                    rec.updated_at.to_rfc3339(),
                ],
            )?;
        }
        Job::InsertEvent(row) => {
            conn.execute(
                r#"INSERT INTO trade_events
                   (trade_id, symbol, event_type, ts, price, qty, exit_kind, reason, pnl)
                   VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"#,
                params![
                    row.trade_id,
                    row.symbol,
                    row.event_type,
                    row.ts.to_rfc3339(),
                    row.price,
                    row.qty,
                    row.kind.map(|k| k.as_str()),
                    row.reason,
                    row.pnl,
                ],
            )?;
        }
        Job::Shutdown => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp_db(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("krx_store_{}_{}.db", name, std::process::id()))
    }

    fn sample_trade(id: &str) -> TradeRecord {
        TradeRecord {
            id: id.to_string(),
            symbol: "005930".to_string(),
            name: "samsung".to_string(),
            strategy: "momentum".to_string(),
            entry_ts: Local::now(),
            entry_price: 70_000.0,
            entry_qty: 10,
            entry_reason: "test".to_string(),
            score: 80.0,
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
        }
    }

    #[test]
    fn test_upsert_overwrites_by_id() {
        let path = tmp_db("upsert");
        let _ = std::fs::remove_file(&path);

        let store = TradeStore::open(&path).unwrap();
        let handle = store.handle();

        let mut rec = sample_trade("ord-1");
        handle.upsert_trade(&rec);

        rec.exit_qty = 10;
        rec.exit_price = 72_000.0;
        rec.exit_kind = Some(ExitKind::FirstTarget);
        rec.pnl = 19_000.0;
        handle.upsert_trade(&rec);
        store.close();

        let conn = Connection::open(&path).unwrap();
        let (count, exit_qty, exit_kind): (i64, i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(exit_qty), MAX(exit_kind) FROM trades",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(exit_qty, 10);
        assert_eq!(exit_kind, "first_target");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_events_append() {
        let path = tmp_db("events");
        let _ = std::fs::remove_file(&path);

        let store = TradeStore::open(&path).unwrap();
        let handle = store.handle();
        for i in 0..3 {
            handle.insert_event(TradeEventRow {
                trade_id: "ord-1".to_string(),
                symbol: "005930".to_string(),
                event_type: if i == 0 { "BUY" } else { "SELL" },
                ts: Local::now(),
                price: 70_000.0 + i as f64,
                qty: 5,
                kind: None,
                reason: String::new(),
                pnl: 0.0,
            });
        }
        store.close();

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trade_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);

        let _ = std::fs::remove_file(&path);
    }
}
