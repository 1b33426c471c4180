// ===============================
// src/feed.rs
// ===============================
//
// Realtime quote feed over the broker websocket. The subscription count is
// hard-capped, so the window is built in two layers: held symbols always
// stay subscribed, and the remaining slots rotate through the scored
// candidate list half a window at a time. Window changes send the minimal
// subscribe/unsubscribe diff instead of resubscribing everything.
//
// Frames come in two shapes: JSON control messages (pingpong, subscribe
// acks, gateway errors) and pipe-delimited data frames carrying one or more
// '^'-separated execution records.

use std::sync::Arc;

use ahash::AHashSet;
use chrono::{Local, NaiveTime};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{Event, Payload, Tick};
use crate::engine::EngineHandle;
use crate::kis::{KisClient, KisError};
use crate::metrics;
use crate::session::SessionClock;

const TICK_TR_ID: &str = "H0STCNT0";
const TICK_FIELDS_MIN: usize = 15;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Kis(#[from] KisError),
    #[error("gateway control: {0}")]
    Control(String),
}

#[derive(Debug, Clone)]
pub struct ScoredSymbol {
    pub symbol: String,
    pub score: f64,
}

#[derive(Debug)]
pub enum FeedCmd {
    SetCandidates(Vec<ScoredSymbol>),
    SetNxt(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct FeedCfg {
    pub ws_url: String,
    pub max_subs: usize,
    pub rotate_secs: u64,
}

impl Default for FeedCfg {
    fn default() -> Self {
        Self { ws_url: String::new(), max_subs: 40, rotate_secs: 30 }
    }
}

/// Which symbols deserve the capped subscription slots right now.
#[derive(Debug)]
pub struct SubscriptionPlan {
    max_subs: usize,
    candidates: Vec<ScoredSymbol>,
    priority: Vec<String>,
    nxt: AHashSet<String>,
    cursor: usize,
}

impl SubscriptionPlan {
    pub fn new(max_subs: usize) -> Self {
        Self {
            max_subs: max_subs.max(1),
            candidates: Vec::new(),
            priority: Vec::new(),
            nxt: AHashSet::new(),
            cursor: 0,
        }
    }

    pub fn set_candidates(&mut self, mut list: Vec<ScoredSymbol>) {
        list.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.candidates = list;
    }

    pub fn set_priority(&mut self, symbols: Vec<String>) {
        self.priority = symbols;
    }

    pub fn set_nxt(&mut self, symbols: Vec<String>) {
        self.nxt = symbols.into_iter().collect();
    }

    fn eligible(&self, extended: bool) -> Vec<&str> {
        self.candidates
            .iter()
            .filter(|c| !extended || self.nxt.contains(&c.symbol))
            .map(|c| c.symbol.as_str())
            .collect()
    }

    /// Priority first, then a wrapping slice of the rotation pool.
    pub fn window(&self, extended: bool) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.max_subs);
        let mut seen: AHashSet<&str> = AHashSet::new();
        for s in &self.priority {
            if out.len() >= self.max_subs {
                return out;
            }
            if seen.insert(s.as_str()) {
                out.push(s.clone());
            }
        }
        let pool = self.eligible(extended);
        if pool.is_empty() {
            return out;
        }
        let start = self.cursor % pool.len();
        for i in 0..pool.len() {
            if out.len() >= self.max_subs {
                break;
            }
            let sym = pool[(start + i) % pool.len()];
            if seen.insert(sym) {
                out.push(sym.to_string());
            }
        }
        out
    }

    /// Shift the rotation by half a window so consecutive windows overlap.
    pub fn advance(&mut self, extended: bool) {
        let pool_len = self.eligible(extended).len();
        if pool_len == 0 {
            return;
        }
        let slots = self.max_subs.saturating_sub(self.priority.len()).max(1);
        self.cursor = (self.cursor + (slots / 2).max(1)) % pool_len;
    }
}

/// Subscribe/unsubscribe sets that turn `current` into `want`.
fn window_diff(current: &AHashSet<String>, want: &[String]) -> (Vec<String>, Vec<String>) {
    let want_set: AHashSet<&str> = want.iter().map(|s| s.as_str()).collect();
    let drop: Vec<String> =
        current.iter().filter(|s| !want_set.contains(s.as_str())).cloned().collect();
    let add: Vec<String> =
        want.iter().filter(|s| !current.contains(*s)).cloned().collect();
    (add, drop)
}

fn sub_frame(approval: &str, symbol: &str, subscribe: bool) -> Message {
    let v = json!({
        "header": {
            "approval_key": approval,
            "custtype": "P",
            "tr_type": if subscribe { "1" } else { "2" },
            "content-type": "utf-8",
        },
        "body": { "input": { "tr_id": TICK_TR_ID, "tr_key": symbol } }
    });
    Message::Text(v.to_string())
}

/// Pipe-framed data: `encrypted|tr_id|count|rec0^..^recN`. Records are
/// fixed-width runs of '^' fields laid end to end.
fn parse_ticks(raw: &str) -> Vec<Tick> {
    let parts: Vec<&str> = raw.splitn(4, '|').collect();
    if parts.len() < 4 || parts[0] != "0" {
        metrics::FRAMES_DROPPED.inc();
        return Vec::new();
    }
    if parts[1] != TICK_TR_ID {
        return Vec::new();
    }
    let count: usize = parts[2].parse().unwrap_or(0);
    let fields: Vec<&str> = parts[3].split('^').collect();
    if count == 0 || fields.len() < TICK_FIELDS_MIN {
        metrics::FRAMES_DROPPED.inc();
        return Vec::new();
    }
    let per = fields.len() / count;
    if per < TICK_FIELDS_MIN {
        metrics::FRAMES_DROPPED.inc();
        return Vec::new();
    }

    let today = Local::now().date_naive();
    let mut ticks = Vec::with_capacity(count);
    for i in 0..count {
        let f = &fields[i * per..(i + 1) * per];
        let price: f64 = f[2].parse().unwrap_or(0.0);
        if f[0].is_empty() || price <= 0.0 {
            continue;
        }
        let time = NaiveTime::parse_from_str(f[1], "%H%M%S").unwrap_or(NaiveTime::MIN);
        let ts = today
            .and_time(time)
            .and_local_timezone(Local)
            .single()
            .unwrap_or_else(Local::now);
        ticks.push(Tick {
            symbol: f[0].to_string(),
            ts,
            price,
            change_pct: f[5].parse().unwrap_or(0.0),
            open: f[7].parse().unwrap_or(0.0),
            high: f[8].parse().unwrap_or(0.0),
            low: f[9].parse().unwrap_or(0.0),
            cum_volume: f[13].parse().unwrap_or(0),
            cum_value: f[14].parse().unwrap_or(0.0),
        });
    }
    ticks
}

fn reconnect_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(6);
    let secs = (5u64 << shift).min(120);
    let jitter = rand::thread_rng().gen_range(0..=1000);
    Duration::from_secs(secs) + Duration::from_millis(jitter)
}

pub struct MarketFeed {
    cfg: FeedCfg,
    kis: Arc<KisClient>,
    engine: EngineHandle,
    clock: SessionClock,
    plan: SubscriptionPlan,
    subscribed: AHashSet<String>,
    shutdown: watch::Receiver<bool>,
}

impl MarketFeed {
    pub fn new(
        cfg: FeedCfg,
        kis: Arc<KisClient>,
        engine: EngineHandle,
        clock: SessionClock,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let plan = SubscriptionPlan::new(cfg.max_subs);
        Self { cfg, kis, engine, clock, plan, subscribed: AHashSet::new(), shutdown }
    }

    pub fn plan_mut(&mut self) -> &mut SubscriptionPlan {
        &mut self.plan
    }

    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<FeedCmd>,
        mut priority_rx: watch::Receiver<Vec<String>>,
    ) {
        let url = match Url::parse(&self.cfg.ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(url = %self.cfg.ws_url, err = %e, "bad feed url");
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            info!(url = %url, "connecting quote feed");
            match connect_async(url.as_str()).await {
                Ok((ws, _resp)) => {
                    info!("quote feed connected");
                    attempt = 0;
                    metrics::WS_CONNECTED.set(1);
                    match self.session_loop(ws, &mut cmd_rx, &mut priority_rx).await {
                        Ok(()) => {}
                        Err(e) => warn!(err = %e, "quote feed session ended"),
                    }
                    metrics::WS_CONNECTED.set(0);
                }
                Err(e) => error!(err = %e, "quote feed connect failed"),
            }
            if *self.shutdown.borrow() {
                break;
            }
            metrics::WS_RECONNECTS.inc();
            attempt = attempt.saturating_add(1);
            let delay = reconnect_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "quote feed reconnecting");
            sleep(delay).await;
        }
        info!("quote feed stopped");
    }

    async fn session_loop(
        &mut self,
        ws: WsStream,
        cmd_rx: &mut mpsc::Receiver<FeedCmd>,
        priority_rx: &mut watch::Receiver<Vec<String>>,
    ) -> Result<(), FeedError> {
        let (mut sink, mut stream) = ws.split();
        // a fresh approval key each session; the old one dies with the socket
        let approval = self.kis.approval_key().await?;

        self.subscribed.clear();
        self.plan.set_priority(priority_rx.borrow().clone());
        let want = self.plan.window(self.clock.now().is_extended());
        self.apply_diff(&mut sink, &approval, &want).await?;

        let mut rotate = interval(Duration::from_secs(self.cfg.rotate_secs.max(1)));
        rotate.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rotate.tick().await; // the immediate first tick

        let mut shutdown = self.shutdown.clone();
        let mut cmd_open = true;
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => self.on_text(&mut sink, &text).await?,
                    Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                    Some(Ok(_)) => {}
                },
                _ = rotate.tick() => {
                    let extended = self.clock.now().is_extended();
                    self.plan.advance(extended);
                    metrics::ROTATIONS.inc();
                    let want = self.plan.window(extended);
                    self.apply_diff(&mut sink, &approval, &want).await?;
                }
                changed = priority_rx.changed() => {
                    if changed.is_ok() {
                        self.plan.set_priority(priority_rx.borrow().clone());
                        let want = self.plan.window(self.clock.now().is_extended());
                        self.apply_diff(&mut sink, &approval, &want).await?;
                    }
                }
                cmd = cmd_rx.recv(), if cmd_open => match cmd {
                    Some(FeedCmd::SetCandidates(list)) => {
                        info!(count = list.len(), "candidate list updated");
                        self.plan.set_candidates(list);
                        let want = self.plan.window(self.clock.now().is_extended());
                        self.apply_diff(&mut sink, &approval, &want).await?;
                    }
                    Some(FeedCmd::SetNxt(list)) => self.plan.set_nxt(list),
                    None => cmd_open = false,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn on_text(&mut self, sink: &mut WsSink, text: &str) -> Result<(), FeedError> {
        if text.starts_with('{') {
            let v: Value = serde_json::from_str(text).unwrap_or(Value::Null);
            if v["header"]["tr_id"].as_str() == Some("PINGPONG") {
                // echo keeps the gateway from dropping us
                sink.send(Message::Text(text.to_string())).await?;
                return Ok(());
            }
            let msg_cd = v["body"]["msg_cd"].as_str().unwrap_or("");
            // gateway errors (expired approval etc) need a clean reconnect
            if msg_cd.starts_with("EGW") {
                let msg = v["body"]["msg1"].as_str().unwrap_or("gateway error");
                return Err(FeedError::Control(format!("{msg_cd}: {msg}")));
            }
            debug!(%msg_cd, "feed control frame");
            return Ok(());
        }
        for tick in parse_ticks(text) {
            metrics::TICKS.inc();
            self.engine.emit(Event::new("feed", Payload::Tick(tick)));
        }
        Ok(())
    }

    async fn apply_diff(
        &mut self,
        sink: &mut WsSink,
        approval: &str,
        want: &[String],
    ) -> Result<(), FeedError> {
        let (add, drop) = window_diff(&self.subscribed, want);
        for sym in &drop {
            sink.send(sub_frame(approval, sym, false)).await?;
            self.subscribed.remove(sym);
        }
        for sym in &add {
            sink.send(sub_frame(approval, sym, true)).await?;
            self.subscribed.insert(sym.clone());
        }
        if !add.is_empty() || !drop.is_empty() {
            debug!(
                added = add.len(),
                removed = drop.len(),
                total = self.subscribed.len(),
                "subscription window updated"
            );
        }
        metrics::SUBSCRIPTIONS.set(self.subscribed.len() as i64);
        Ok(())
    }
}
