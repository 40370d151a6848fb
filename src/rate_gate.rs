// ===============================
// src/rate_gate.rs (sliding-window admission per caller)
// ===============================
use std::collections::VecDeque;

use dashmap::DashMap;

use crate::config::RateLimits;
use crate::domain::now_ms;
use crate::metrics::NOTIFY_RATE_LIMITED;

const WINDOW_MS: i64 = 60_000;

/// Per-caller sliding 60s window. Admission only counts timestamps still
/// inside the window; rejection mutates nothing beyond the prune, so it
/// clears by natural expiry.
pub struct RateGate {
    windows: DashMap<String, VecDeque<i64>>,
    limits: RateLimits,
}

impl RateGate {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            windows: DashMap::new(),
            limits,
        }
    }

    pub fn admit(&self, caller: &str) -> bool {
        self.admit_at(caller, now_ms())
    }

    pub fn admit_at(&self, caller: &str, now_ms: i64) -> bool {
        // Privileged callers skip the bookkeeping entirely.
        if self.limits.privileged.iter().any(|p| p == caller) {
            return true;
        }

        let mut window = self.windows.entry(caller.to_string()).or_default();
        let cutoff = now_ms - WINDOW_MS;
        while window.front().is_some_and(|&t| t < cutoff) {
            window.pop_front();
        }

        if window.len() < self.limits.per_minute {
            window.push_back(now_ms);
            true
        } else {
            NOTIFY_RATE_LIMITED.inc();
            false
        }
    }

    /// Drop windows that have gone fully idle; slow cadence.
    pub fn prune(&self, now_ms: i64) {
        let cutoff = now_ms - WINDOW_MS;
        self.windows
            .retain(|_, window| window.back().is_some_and(|&t| t >= cutoff));
    }
}
