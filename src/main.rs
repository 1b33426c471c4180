// ===============================
// src/main.rs
// ===============================
//
// Wires the pieces together: config -> metrics -> broker client -> account
// bootstrap -> feed + gateway tasks -> engine loop. The engine owns the
// portfolio; everything else talks to it through channels.

mod alerts;
mod config;
mod domain;
mod engine;
mod exits;
mod feed;
mod fees;
mod gateway;
mod kis;
mod ledger;
mod metrics;
mod portfolio;
mod risk;
mod router;
mod session;
mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::alerts::{AlertCfg, AlertRelay, OutboundAlert};
use crate::domain::{Event, Payload};
use crate::engine::{Engine, EngineHandle, Handler};
use crate::exits::{ExitCfg, ExitWatcher};
use crate::feed::{FeedCfg, FeedCmd, MarketFeed, ScoredSymbol};
use crate::fees::FeeSchedule;
use crate::gateway::{GatewayCmd, LiveGateway};
use crate::kis::{KisCfg, KisClient, KisError};
use crate::ledger::{LedgerWriter, TradeLedger};
use crate::portfolio::{Portfolio, TickCache};
use crate::risk::{RiskCfg, RiskGate};
use crate::router::OrderRouter;
use crate::session::SessionClock;
use crate::store::TradeStore;

const ENGINE_INLET: usize = 2048;
const GATEWAY_QUEUE: usize = 256;
const FEED_QUEUE: usize = 16;
const ALERT_QUEUE: usize = 64;
const TICK_CACHE_SYMBOLS: usize = 100;
const TICK_CACHE_DEPTH: usize = 16;
const RECONCILE_SECS: u64 = 600;
const PAPER_FILL_MS: u64 = 500;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = config::Cli::parse();
    let settings = match config::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "configuration invalid");
            std::process::exit(1);
        }
    };

    metrics::init();
    tokio::spawn(metrics::serve(settings.metrics_port));

    info!(
        mode = ?settings.mode,
        watch = settings.watch.len(),
        nxt = settings.nxt_symbols.len(),
        holidays = settings.holidays.len(),
        metrics_port = settings.metrics_port,
        "startup config"
    );

    let fees = FeeSchedule::default();
    let clock =
        SessionClock::new(settings.holidays.clone(), settings.pre_market, settings.nxt_market);

    // ---- Persistence ----
    let store = settings.store_path.as_ref().and_then(|path| match TradeStore::open(path) {
        Ok(s) => Some(s),
        Err(e) => {
            error!(path = %path.display(), err = %e, "trade store unavailable");
            None
        }
    });
    let ledger = TradeLedger::new(&settings.ledger_dir, fees, store.as_ref().map(|s| s.handle()));

    // ---- Risk + exits ----
    let mut gate = RiskGate::new(RiskCfg {
        stats_path: settings.stats_file.clone(),
        ..RiskCfg::default()
    });
    gate.load_stats(Local::now().date_naive());
    let mut exit_watcher = ExitWatcher::new(ExitCfg::default(), fees);

    // ---- Channels ----
    let (engine_tx, engine_rx) = mpsc::channel::<Event>(ENGINE_INLET);
    let handle = EngineHandle::new(engine_tx);
    let (gw_tx, gw_rx) = mpsc::channel::<GatewayCmd>(GATEWAY_QUEUE);
    // runtime inlet for watch-list updates; the initial lists are seeded
    // directly into the plan before the feed task starts
    let (feed_tx, feed_rx) = mpsc::channel::<FeedCmd>(FEED_QUEUE);
    let (alert_tx, alert_rx) = mpsc::channel::<OutboundAlert>(ALERT_QUEUE);
    let (priority_tx, priority_rx) = watch::channel::<Vec<String>>(Vec::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- Broker client (any mode with credentials gets the real feed) ----
    let kis: Option<Arc<KisClient>> = if settings.app_key.is_empty() {
        None
    } else {
        let cfg = KisCfg {
            base_url: settings.base_url.clone(),
            ws_url: settings.ws_url.clone(),
            app_key: settings.app_key.clone(),
            app_secret: settings.app_secret.clone(),
            account_no: settings.account_no.clone(),
            account_product: settings.account_product.clone(),
            token_cache: settings.token_cache.clone(),
            http_timeout: Duration::from_secs(settings.http_timeout_secs),
            max_rps: settings.max_rps,
        };
        match KisClient::new(cfg) {
            Ok(c) => Some(Arc::new(c)),
            Err(e) => {
                error!(err = %e, "broker client init failed");
                std::process::exit(1);
            }
        }
    };

    // ---- Portfolio: broker truth in live mode, configured cash in paper ----
    let portfolio = if settings.mode.is_live() {
        let client = match kis.as_deref() {
            Some(c) => c,
            None => {
                error!("live mode without a broker client");
                std::process::exit(1);
            }
        };
        match bootstrap_live(client, fees, &mut exit_watcher, &handle).await {
            Ok(pf) => pf,
            Err(e) => {
                error!(err = %e, "account bootstrap failed");
                std::process::exit(1);
            }
        }
    } else {
        info!(cash = settings.initial_capital, "paper portfolio");
        Portfolio::new(settings.initial_capital, fees)
    };

    // ---- Handlers, dispatch order: exits, router, ledger, alerts ----
    let handlers: Vec<Box<dyn Handler>> = vec![
        Box::new(exit_watcher),
        Box::new(OrderRouter::new(gate, ExitCfg::default(), fees, gw_tx.clone())),
        Box::new(LedgerWriter::new(ledger)),
        Box::new(AlertRelay::new(AlertCfg::default(), alert_tx)),
    ];

    // ---- Gateway ----
    if gw_tx.try_send(GatewayCmd::SetNxt(settings.nxt_symbols.clone())).is_err() {
        warn!("gateway queue full at startup");
    }
    match (settings.mode.is_live(), kis.clone()) {
        (true, Some(client)) => {
            let gw = LiveGateway::new(client, handle.clone(), clock.clone());
            tokio::spawn(gw.run(gw_rx));
        }
        _ => {
            tokio::spawn(gateway::run_paper(handle.clone(), gw_rx, PAPER_FILL_MS));
        }
    }

    // ---- Market data feed ----
    if let Some(client) = kis.clone() {
        let mut feed = MarketFeed::new(
            FeedCfg { ws_url: settings.ws_url.clone(), ..FeedCfg::default() },
            client,
            handle.clone(),
            clock.clone(),
            shutdown_rx.clone(),
        );
        feed.plan_mut().set_candidates(
            settings
                .watch
                .iter()
                .map(|(symbol, score)| ScoredSymbol { symbol: symbol.clone(), score: *score })
                .collect(),
        );
        feed.plan_mut().set_nxt(settings.nxt_symbols.clone());
        tokio::spawn(feed.run(feed_rx, priority_rx));
    } else {
        info!("no broker credentials, feed disabled");
        drop(feed_tx);
        drop(priority_rx);
    }

    // ---- Periodic broker-fill reconcile ----
    if let Some(client) = kis.clone() {
        let reconcile_handle = handle.clone();
        let mut reconcile_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(RECONCILE_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = reconcile_shutdown.changed() => break,
                }
                let today = Local::now().date_naive();
                match client.daily_fills(today).await {
                    Ok(fills) if !fills.is_empty() => {
                        reconcile_handle
                            .send(Event::new("reconcile", Payload::Reconcile {
                                date: today,
                                fills,
                            }))
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "fill inquiry failed"),
                }
            }
        });
    }

    // ---- Alert sink ----
    tokio::spawn(alerts::run_sink(alert_rx));

    // ---- Shutdown on ctrl-c ----
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("ctrl-c watcher failed");
            return;
        }
        info!("shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    // ---- Engine loop (owns portfolio and all handlers) ----
    let engine = Engine::new(
        engine_rx,
        portfolio,
        TickCache::new(TICK_CACHE_SYMBOLS, TICK_CACHE_DEPTH),
        handlers,
        clock,
        priority_tx,
        shutdown_rx,
    );
    engine.run().await;

    if let Some(s) = store {
        s.close();
    }
    info!("stopped");
}

/// Seed the portfolio from the broker, adopt resting holdings into the exit
/// machine, sweep leftover orders, and queue a reconcile of today's fills.
async fn bootstrap_live(
    kis: &KisClient,
    fees: FeeSchedule,
    exit_watcher: &mut ExitWatcher,
    handle: &EngineHandle,
) -> Result<Portfolio, KisError> {
    let snap = kis.balance().await?;
    let mut pf = Portfolio::new(snap.cash, fees);
    for h in &snap.holdings {
        pf.seed_position(&h.symbol, &h.name, h.qty, h.avg_price, h.current_price);
        exit_watcher.adopt(&h.symbol, h.qty);
        info!(symbol = %h.symbol, qty = h.qty, avg = h.avg_price, "holding adopted");
    }
    info!(cash = snap.cash, holdings = snap.holdings.len(), "account bootstrapped");

    // orders resting from a previous run would fill outside our tracking
    match kis.open_orders().await {
        Ok(rows) => {
            for row in &rows {
                match kis.cancel_order(&row.branch_no, &row.order_no).await {
                    Ok(()) => info!(
                        order_no = %row.order_no,
                        symbol = %row.symbol,
                        qty = row.remaining_qty,
                        "stale order canceled"
                    ),
                    Err(e) => warn!(order_no = %row.order_no, err = %e, "startup cancel failed"),
                }
            }
        }
        Err(e) => warn!(err = %e, "open order inquiry failed"),
    }

    let today = Local::now().date_naive();
    match kis.daily_fills(today).await {
        Ok(fills) if !fills.is_empty() => {
            handle.emit(Event::new("bootstrap", Payload::Reconcile { date: today, fills }));
        }
        Ok(_) => {}
        Err(e) => warn!(err = %e, "startup fill inquiry failed"),
    }

    Ok(pf)
}
