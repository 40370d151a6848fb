// ===============================
// src/config.rs
// ===============================
use std::env;

use dotenvy::dotenv;

/// Where position snapshots come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceMode {
    Mock,
    Hyperliquid,
}

impl SourceMode {
    pub fn from_env(key: &str, default_mode: SourceMode) -> SourceMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock"        => SourceMode::Mock,
            "hyperliquid" => SourceMode::Hyperliquid,
            _ => default_mode,
        }
    }

    pub fn default_info_url(&self) -> &'static str {
        match self {
            SourceMode::Mock        => "https://api.hyperliquid.xyz/info", // unused in mock
            SourceMode::Hyperliquid => "https://api.hyperliquid.xyz/info",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub source_mode: SourceMode,
    pub info_url: String,

    // scheduling
    pub poll_interval_secs: u64,
    pub prune_every_ticks: u64,

    // files/metrics
    pub watchlist_file: String,
    pub state_file: String,
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

/// Fetch client tuning: cache TTL, concurrency bound, timeout, retry budget.
#[derive(Clone, Debug)]
pub struct FetchTuning {
    pub cache_ttl_ms: i64,
    pub max_inflight: usize,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

/// Notification admission limits (per owner, trailing 60s).
#[derive(Clone, Debug)]
pub struct RateLimits {
    pub per_minute: usize,
    pub privileged: Vec<String>,
}

pub fn load() -> (Args, FetchTuning, RateLimits) {
    // .env first so WATCHLIST_FILE etc. are visible
    let _ = dotenv();

    let source_mode = SourceMode::from_env("SOURCE_MODE", SourceMode::Mock);
    let info_url = env::var("INFO_URL")
        .unwrap_or_else(|_| source_mode.default_info_url().to_string());

    let poll_interval_secs = env::var("POLL_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let prune_every_ticks = env::var("PRUNE_EVERY_TICKS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(120);

    let watchlist_file = env::var("WATCHLIST_FILE").unwrap_or_else(|_| "watchlist.json".to_string());
    let state_file = env::var("STATE_FILE").unwrap_or_else(|_| "state.json".to_string());
    let record_file = env::var("RECORD_FILE").ok();
    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);

    let args = Args {
        source_mode,
        info_url,
        poll_interval_secs,
        prune_every_ticks,
        watchlist_file,
        state_file,
        record_file,
        metrics_port,
    };

    let fetch = FetchTuning {
        cache_ttl_ms: env::var("CACHE_TTL_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(30_000),
        max_inflight: env::var("FETCH_CONCURRENCY").ok().and_then(|s| s.parse().ok()).unwrap_or(10),
        timeout_ms: env::var("FETCH_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(10_000),
        retries: env::var("FETCH_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(3),
        retry_delay_ms: env::var("FETCH_RETRY_DELAY_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(500),
    };

    // PRIVILEGED_CALLERS=ops,admin — these skip the sliding window entirely
    let privileged: Vec<String> = env::var("PRIVILEGED_CALLERS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let limits = RateLimits {
        per_minute: env::var("RATE_LIMIT_PER_MIN").ok().and_then(|s| s.parse().ok()).unwrap_or(20),
        privileged,
    };

    (args, fetch, limits)
}
