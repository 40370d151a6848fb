// ===============================
// src/main.rs
// ===============================
/*
 # watch the engine from another terminal
curl -s localhost:9898/metrics | egrep '^poll_ticks_total|^tracked_addresses'

# change-event activity per kind
curl -s localhost:9898/metrics | grep '^change_events_total'
curl -s localhost:9898/metrics | grep '^pnl_realized'

*/
/*
=============================================================================
Project : perp_watch_rust — on-chain perp position tracker & P&L engine
Version : 0.4.0
License : MIT (see LICENSE)

Summary : Polls position snapshots for a watchlist of addresses (mock or
          Hyperliquid info API), diffs consecutive snapshots into discrete
          change events, folds them into realized/unrealized P&L with
          win-rate/drawdown/profit-factor analytics, rate-gates and emits
          change notifications, exposes Prometheus metrics, and records
          JSONL events.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod fetch;
mod source;          // mock + Hyperliquid info adapters
mod diff;
mod pnl;
mod ledger;
mod rate_gate;
mod store;
mod notify;
mod poller;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::info;

use crate::domain::Event;
use crate::fetch::ResilientClient;
use crate::notify::ChangeNotification;
use crate::poller::Poller;
use crate::rate_gate::RateGate;
use crate::source::{InfoClient, MockSource, Source};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config ----
    let (args, tuning, limits) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    let source_mode_str = match args.source_mode {
        config::SourceMode::Mock => "mock",
        config::SourceMode::Hyperliquid => "hyperliquid",
    };
    info!(
        source_mode = %source_mode_str,
        info_url = %args.info_url,
        poll_interval_secs = args.poll_interval_secs,
        watchlist = %args.watchlist_file,
        state_file = %args.state_file,
        cache_ttl_ms = tuning.cache_ttl_ms,
        fetch_concurrency = tuning.max_inflight,
        "startup config"
    );

    if let Err(e) = url::Url::parse(&args.info_url) {
        tracing::error!(?e, url = %args.info_url, "bad info url");
        return;
    }

    // ---- Fetch client + snapshot source ----
    let fetcher = Arc::new(ResilientClient::new(tuning));
    let source = match args.source_mode {
        config::SourceMode::Mock => Source::Mock(MockSource::new()),
        config::SourceMode::Hyperliquid => {
            Source::Hyperliquid(InfoClient::new(fetcher.clone(), args.info_url.clone()))
        }
    };

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let rec_tx = if let Some(path) = args.record_file.clone() {
        tokio::spawn(recorder::run(rec_rx, path));
        let _ = rec_tx.try_send(Event::Note(format!("started, source={source_mode_str}")));
        Some(rec_tx)
    } else {
        None
    };

    // ---- Notification sink ----
    let (notify_tx, notify_rx) = mpsc::channel::<ChangeNotification>(4096);
    tokio::spawn(notify::run(notify_rx));

    // ---- Poller ----
    let gate = RateGate::new(limits);
    let mut poller = Poller::new(args, source, fetcher, gate, notify_tx, rec_tx);
    poller.restore().await;
    tokio::spawn(poller.run());

    // ---- Heartbeat ----
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        info!(ticks = metrics::POLL_TICKS.get(), "heartbeat");
    }
}
