// ===============================
// src/metrics.rs
// ===============================
//
// One custom registry, every series registered in init(). The exporter is a
// plain hyper server on a background task answering / and /metrics.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- engine --------
pub static EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("events_total", "events dispatched"), &["kind"]).unwrap()
});

pub static EVENTS_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("events_dropped_total", "events shed by the queue").unwrap());

pub static QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("event_queue_depth", "events waiting for dispatch").unwrap());

pub static HANDLER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("handler_errors_total", "handler failures, skipped and logged"),
        &["handler"],
    )
    .unwrap()
});

// -------- trading flow --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("signals_total", "signals routed"), &["side"]).unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_total", "order lifecycle"), &["status"]).unwrap()
});

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_total", "fills applied"), &["side"]).unwrap()
});

pub static RISK_BLOCKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("risk_blocks_total", "orders refused by admission control"),
        &["reason"],
    )
    .unwrap()
});

// -------- portfolio --------
pub static EQUITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("equity", "cash plus positions at market").unwrap());

pub static CASH: Lazy<Gauge> = Lazy::new(|| Gauge::new("cash", "free cash").unwrap());

pub static DAILY_PNL: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("daily_pnl", "effective daily P&L").unwrap());

pub static POSITIONS_OPEN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("positions_open", "open positions").unwrap());

// -------- broker client --------
pub static API_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("broker_api_retries_total", "broker call retries"),
        &["reason"],
    )
    .unwrap()
});

// -------- market data feed --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

pub static FRAMES_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("frames_dropped_total", "unreadable feed frames").unwrap());

pub static WS_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_connected", "1 while the feed socket is up").unwrap());

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_reconnects_total", "feed reconnect attempts").unwrap());

pub static SUBSCRIPTIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("subscriptions_active", "live tick subscriptions").unwrap());

pub static ROTATIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("subscription_rotations_total", "watch-list rotations").unwrap());

// -------- persistence --------
pub static LEDGER_WRITES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ledger_writes_total", "journal day-file writes").unwrap());

pub static STORE_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("store_retries_total", "sqlite write retries").unwrap());

pub static STORE_DROPS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("store_drops_total", "sqlite rows given up on").unwrap());

pub static RECOVERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("recovered_trades_total", "journal records patched from broker fills")
        .unwrap()
});

// -------- alerts --------
pub static ALERTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("alerts_sent_total", "outbound alerts").unwrap());

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(EVENTS.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(HANDLER_ERRORS.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(RISK_BLOCKS.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(CASH.clone())),
        REGISTRY.register(Box::new(DAILY_PNL.clone())),
        REGISTRY.register(Box::new(POSITIONS_OPEN.clone())),
        REGISTRY.register(Box::new(API_RETRIES.clone())),
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(FRAMES_DROPPED.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(SUBSCRIPTIONS.clone())),
        REGISTRY.register(Box::new(ROTATIONS.clone())),
        REGISTRY.register(Box::new(LEDGER_WRITES.clone())),
        REGISTRY.register(Box::new(STORE_RETRIES.clone())),
        REGISTRY.register(Box::new(STORE_DROPS.clone())),
        REGISTRY.register(Box::new(RECOVERED.clone())),
        REGISTRY.register(Box::new(ALERTS.clone())),
    ] {
        let _ = m;
    }
}

fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn respond(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        "/healthz" => Response::builder().body(Body::from("ok")),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

pub async fn serve(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(respond)) });
    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(%addr, err = %e, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening");
    if let Err(e) = server.await {
        error!(err = %e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_after_init() {
        init();
        EVENTS.with_label_values(&["tick"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("events_total"));
        // plain counters show up at zero, vecs only once labelled
        assert!(text.contains("ticks_total"));
    }
}
