// ===============================
// src/store.rs (watchlist reader + state persistence)
// ===============================
//
// Two file-backed collaborators behind explicit load()/save() calls:
// - Watchlist : owner -> {address -> label}, owned elsewhere; the core only
//   reads the distinct address set and, at dispatch time, the watchers of
//   one address. Reloaded every tick so external edits are picked up.
// - PersistedState : snapshots + P&L books, written at the end of a tick.
//   A failed write is logged and retried next tick; memory stays
//   authoritative.
//
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::{Address, PositionSnapshot};
use crate::pnl::PnlState;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode/decode: {0}")]
    Serde(#[from] serde_json::Error),
}

// -----------------------------------------------------------------------------
// Watchlist
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct Watchlist {
    owners: HashMap<String, HashMap<Address, String>>,
}

impl Watchlist {
    /// Missing file means nobody watches anything yet; malformed addresses
    /// are rejected at this boundary and never enter the model.
    pub async fn load(path: &str) -> Self {
        let raw = match fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%path, ?e, "watchlist not readable, treating as empty");
                return Self::default();
            }
        };
        let parsed: HashMap<String, HashMap<String, String>> = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(%path, ?e, "watchlist unparseable, treating as empty");
                return Self::default();
            }
        };

        let mut owners: HashMap<String, HashMap<Address, String>> = HashMap::new();
        for (owner, entries) in parsed {
            let mut validated = HashMap::new();
            for (addr_str, label) in entries {
                match Address::parse(&addr_str) {
                    Ok(addr) => {
                        validated.insert(addr, label);
                    }
                    Err(e) => warn!(%owner, %addr_str, %e, "dropping invalid watchlist address"),
                }
            }
            if !validated.is_empty() {
                owners.insert(owner, validated);
            }
        }
        Self { owners }
    }

    /// Deduped across all owners: upstream is queried once per address per
    /// tick regardless of watcher count.
    pub fn distinct_addresses(&self) -> BTreeSet<Address> {
        self.owners.values().flat_map(|m| m.keys().copied()).collect()
    }

    /// (owner, label) pairs watching one address, for dispatch.
    pub fn watchers_of(&self, addr: &Address) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .owners
            .iter()
            .filter_map(|(owner, m)| m.get(addr).map(|label| (owner.clone(), label.clone())))
            .collect();
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Persisted engine state
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub snapshots: HashMap<Address, PositionSnapshot>,
    pub pnl: HashMap<Address, PnlState>,
}

pub async fn load_state(path: &str) -> PersistedState {
    let raw = match fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) => {
            debug!(%path, ?e, "no persisted state, starting fresh");
            return PersistedState::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(e) => {
            warn!(%path, ?e, "persisted state unparseable, starting fresh");
            PersistedState::default()
        }
    }
}

/// Batch write at the end of a tick. Parent directories are created the way
/// the recorder does it; the temp-then-rename keeps a crashed write from
/// truncating the previous state.
pub async fn save_state(path: &str, state: &PersistedState) -> Result<(), PersistError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let tmp = format!("{path}.tmp");
    let encoded = serde_json::to_vec_pretty(state)?;
    fs::write(&tmp, encoded).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnl::PnlStore;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[tokio::test]
    async fn watchlist_dedups_addresses_across_owners() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchlist.json");
        let body = serde_json::json!({
            "alice": {
                "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed": "whale-1",
                "0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359": "fund"
            },
            "bob": {
                "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed": "same-whale"
            }
        });
        tokio::fs::write(&path, body.to_string()).await.unwrap();

        let wl = Watchlist::load(path.to_str().unwrap()).await;
        assert_eq!(wl.distinct_addresses().len(), 2);

        let watchers = wl.watchers_of(&addr("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"));
        assert_eq!(watchers.len(), 2);
        assert_eq!(watchers[0], ("alice".to_string(), "whale-1".to_string()));
        assert_eq!(watchers[1], ("bob".to_string(), "same-whale".to_string()));
    }

    #[tokio::test]
    async fn watchlist_drops_invalid_addresses_at_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchlist.json");
        let body = serde_json::json!({
            "alice": {
                "not-an-address": "junk",
                "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed": "whale"
            }
        });
        tokio::fs::write(&path, body.to_string()).await.unwrap();

        let wl = Watchlist::load(path.to_str().unwrap()).await;
        assert_eq!(wl.distinct_addresses().len(), 1);
    }

    #[tokio::test]
    async fn missing_watchlist_is_empty_not_fatal() {
        let wl = Watchlist::load("/definitely/not/here.json").await;
        assert!(wl.is_empty());
    }

    #[tokio::test]
    async fn state_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let path = path.to_str().unwrap().to_string();

        let a = addr("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed");
        let snap = PositionSnapshot {
            balance: 1234.5,
            positions: Default::default(),
            ts_ms: 42,
        };
        let mut pnl = PnlStore::new();
        pnl.seed(a, &snap);

        let mut state = PersistedState::default();
        state.snapshots.insert(a, snap.clone());
        state
            .pnl
            .extend(pnl.export().iter().map(|(k, v)| (*k, v.clone())));

        save_state(&path, &state).await.unwrap();
        let loaded = load_state(&path).await;
        assert_eq!(loaded.snapshots.get(&a), Some(&snap));
        assert_eq!(loaded.pnl.get(&a).unwrap().initial_balance, 1234.5);
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{ nope").await.unwrap();
        let loaded = load_state(path.to_str().unwrap()).await;
        assert!(loaded.snapshots.is_empty());
    }
}
