// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Scheduler --------
pub static POLL_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("poll_ticks_total", "completed scheduling cycles").unwrap());

pub static TRACKED_ADDRESSES: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("tracked_addresses", "distinct addresses under watch").unwrap());

// -------- Fetch client --------
pub static FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("upstream_fetches_total", "upstream calls by result"),
        &["result"],
    )
    .unwrap()
});

pub static CACHE_HITS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fetch_cache_hits_total", "responses served from cache").unwrap());

pub static FETCH_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fetch_retries_total", "retry attempts after failures").unwrap());

// -------- Reconciliation --------
pub static CHANGE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("change_events_total", "classified position changes"),
        &["kind"],
    )
    .unwrap()
});

pub static TRADE_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trade_records_total", "ledger trade records"),
        &["kind"],
    )
    .unwrap()
});

// -------- Notifications --------
pub static NOTIFICATIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("notifications_sent_total", "deliveries handed to the sink").unwrap());

pub static NOTIFY_RATE_LIMITED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "notifications_rate_limited_total",
        "deliveries dropped by the rate gate",
    )
    .unwrap()
});

// -------- P&L --------
pub static PNL_REALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("pnl_realized", "realized PnL (USD)"),
        &["address"],
    )
    .unwrap()
});

pub static PNL_UNREALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("pnl_unrealized", "unrealized PnL (USD)"),
        &["address"],
    )
    .unwrap()
});

// -------- Persistence --------
pub static PERSIST_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("persist_errors_total", "failed state writes").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(POLL_TICKS.clone())),
        REGISTRY.register(Box::new(TRACKED_ADDRESSES.clone())),
        REGISTRY.register(Box::new(FETCHES.clone())),
        REGISTRY.register(Box::new(CACHE_HITS.clone())),
        REGISTRY.register(Box::new(FETCH_RETRIES.clone())),
        REGISTRY.register(Box::new(CHANGE_EVENTS.clone())),
        REGISTRY.register(Box::new(TRADE_RECORDS.clone())),
        REGISTRY.register(Box::new(NOTIFICATIONS.clone())),
        REGISTRY.register(Box::new(NOTIFY_RATE_LIMITED.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(PERSIST_ERRORS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
