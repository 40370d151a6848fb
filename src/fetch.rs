// ===============================
// src/fetch.rs (cached + gated + retrying HTTP accessor)
// ===============================
//
// One upstream call per TTL window no matter how many watchers ask:
// - Cache check first (fingerprint = url + body), no network on a hit.
// - Global semaphore bounds in-flight upstream calls; waiters released FIFO.
// - Bounded retry loop with a fixed delay (no recursion, no backoff curve);
//   every attempt takes a fresh permit so a retrying call cannot hog a slot.
// - Failures are never cached.
//
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::warn;

use crate::config::FetchTuning;
use crate::domain::now_ms;
use crate::metrics::{CACHE_HITS, FETCHES, FETCH_RETRIES};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("retry budget exhausted after {0} attempts")]
    Exhausted(u32),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    fetched_ms: i64,
}

pub struct ResilientClient {
    http: reqwest::Client,
    cache: DashMap<String, CacheEntry>,
    gate: Arc<Semaphore>,
    tuning: FetchTuning,
}

impl ResilientClient {
    pub fn new(tuning: FetchTuning) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(tuning.timeout_ms))
            .build()
            .unwrap_or_else(|e| panic!("http client build failed: {e}"));
        Self {
            http,
            cache: DashMap::new(),
            gate: Arc::new(Semaphore::new(tuning.max_inflight)),
            tuning,
        }
    }

    /// POST a JSON body and return the JSON response, via cache when fresh.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value, FetchError> {
        let key = format!("{url}|{body}");

        if let Some(entry) = self.cache.get(&key) {
            if now_ms() - entry.fetched_ms < self.tuning.cache_ttl_ms {
                CACHE_HITS.inc();
                return Ok(entry.payload.clone());
            }
        }

        let attempts = self.tuning.retries.max(1);
        for attempt in 1..=attempts {
            match self.attempt(url, body).await {
                Ok(payload) => {
                    FETCHES.with_label_values(&["ok"]).inc();
                    self.cache.insert(
                        key,
                        CacheEntry {
                            payload: payload.clone(),
                            fetched_ms: now_ms(),
                        },
                    );
                    return Ok(payload);
                }
                Err(e) => {
                    FETCHES.with_label_values(&["error"]).inc();
                    warn!(%url, attempt, ?e, "upstream call failed");
                    if attempt < attempts {
                        FETCH_RETRIES.inc();
                        sleep(Duration::from_millis(self.tuning.retry_delay_ms)).await;
                    }
                }
            }
        }
        Err(FetchError::Exhausted(attempts))
    }

    /// Drop expired entries; called on the poller's slow prune cadence.
    pub fn prune_cache(&self) {
        let ttl = self.tuning.cache_ttl_ms;
        let now = now_ms();
        self.cache.retain(|_, e| now - e.fetched_ms < ttl);
    }

    async fn attempt(&self, url: &str, body: &Value) -> Result<Value, FetchError> {
        // Fresh permit per attempt; dropped before the retry sleep.
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| FetchError::Network("concurrency gate closed".into()))?;

        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        resp.json::<Value>().await.map_err(classify)
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = e.status() {
        FetchError::Status(status.as_u16())
    } else {
        FetchError::Network(e.to_string())
    }
}
