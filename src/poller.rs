// ===============================
// src/poller.rs (fixed-interval reconciliation driver)
// ===============================
//
// One tick = one pass over the distinct tracked address set:
//   reload watchlist -> drop state for untracked addresses -> concurrent
//   fetch fan-out (bounded by the fetch client's gate, failures isolated
//   per address) -> sequential per-address apply: diff, ledger + P&L,
//   gated notifications, snapshot replace -> slow-cadence pruning ->
//   batch persist.
//
// First observation of an address stores the snapshot and suppresses all
// notifications — "first time we looked" is not "everything just opened".
// The driver is single-flight: no two ticks overlap, so the stores need no
// locking.
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::diff;
use crate::domain::{now_ms, Address, Event, PnlSummary, PositionSnapshot, TradeMarker};
use crate::fetch::ResilientClient;
use crate::ledger::TradeLedger;
use crate::metrics::{
    CHANGE_EVENTS, NOTIFICATIONS, PERSIST_ERRORS, PNL_REALIZED, PNL_UNREALIZED, POLL_TICKS,
    TRACKED_ADDRESSES, TRADE_RECORDS,
};
use crate::notify::{self, ChangeNotification};
use crate::pnl::PnlStore;
use crate::rate_gate::RateGate;
use crate::source::Source;
use crate::store::{self, PersistedState, Watchlist};

pub struct Poller {
    args: Args,
    source: Source,
    fetcher: Arc<ResilientClient>,
    gate: RateGate,
    snapshots: HashMap<Address, PositionSnapshot>,
    pnl: PnlStore,
    ledger: TradeLedger,
    notify_tx: mpsc::Sender<ChangeNotification>,
    rec_tx: Option<mpsc::Sender<Event>>,
    ticks: u64,
}

impl Poller {
    pub fn new(
        args: Args,
        source: Source,
        fetcher: Arc<ResilientClient>,
        gate: RateGate,
        notify_tx: mpsc::Sender<ChangeNotification>,
        rec_tx: Option<mpsc::Sender<Event>>,
    ) -> Self {
        Self {
            args,
            source,
            fetcher,
            gate,
            snapshots: HashMap::new(),
            pnl: PnlStore::new(),
            ledger: TradeLedger::new(),
            notify_tx,
            rec_tx,
            ticks: 0,
        }
    }

    /// Pick up state from a previous run, if any.
    pub async fn restore(&mut self) {
        let state = store::load_state(&self.args.state_file).await;
        if !state.snapshots.is_empty() {
            info!(addresses = state.snapshots.len(), "restored persisted state");
        }
        self.snapshots = state.snapshots.into_iter().collect();
        self.pnl.import(state.pnl.into_iter().collect());
    }

    /// One full scheduling cycle. Public so tests drive it without a timer.
    pub async fn tick(&mut self) {
        self.ticks += 1;
        POLL_TICKS.inc();

        let watchlist = Watchlist::load(&self.args.watchlist_file).await;
        let tracked = watchlist.distinct_addresses();
        TRACKED_ADDRESSES.set(tracked.len() as i64);

        // last watcher gone -> address state goes with it
        let stale: Vec<Address> = self
            .snapshots
            .keys()
            .filter(|a| !tracked.contains(*a))
            .copied()
            .collect();
        for addr in stale {
            debug!(%addr, "dropping state for untracked address");
            self.snapshots.remove(&addr);
            self.pnl.remove(&addr);
            self.ledger.remove_address(&addr);
        }

        // Concurrent fan-out; the fetch client's semaphore is the bound.
        // One stuck or failing address never blocks the others.
        let source = &self.source;
        let results = join_all(
            tracked
                .iter()
                .map(|addr| async move { (*addr, source.snapshot(addr).await) }),
        )
        .await;

        for (addr, result) in results {
            match result {
                Ok(snap) => self.apply_address(addr, snap, &watchlist).await,
                // prior snapshot and P&L stay untouched; never diff against
                // a synthetic empty state
                Err(e) => warn!(%addr, %e, "fetch failed this tick, keeping prior snapshot"),
            }
        }

        if self.ticks % self.args.prune_every_ticks.max(1) == 0 {
            let now = now_ms();
            self.pnl.prune(now);
            self.ledger.prune(now);
            self.gate.prune(now);
            self.fetcher.prune_cache();
        }

        self.persist().await;
    }

    pub async fn run(mut self) {
        let mut tick = interval(Duration::from_secs(self.args.poll_interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.tick().await;
        }
    }

    async fn apply_address(&mut self, addr: Address, snap: PositionSnapshot, watchlist: &Watchlist) {
        let Some(old) = self.snapshots.get(&addr) else {
            info!(
                %addr,
                positions = snap.positions.len(),
                "first observation, notifications suppressed"
            );
            self.pnl.seed(addr, &snap);
            self.snapshots.insert(addr, snap);
            return;
        };

        let events = diff::compute(old, &snap);
        if !events.is_empty() {
            let records = self.pnl.apply(addr, &snap, &events);
            for record in &records {
                TRADE_RECORDS.with_label_values(&[record.kind.as_str()]).inc();
                self.record(Event::Trade {
                    address: addr,
                    record: record.clone(),
                });
            }

            let watchers = watchlist.watchers_of(&addr);
            for event in &events {
                CHANGE_EVENTS.with_label_values(&[event.kind_label()]).inc();
                self.ledger.record(addr, event, snap.ts_ms);
                self.record(Event::Change {
                    address: addr,
                    event: event.clone(),
                });

                let markers = self.ledger.recent(&addr, event.symbol(), snap.ts_ms);
                for (owner, label) in &watchers {
                    if !self.gate.admit(owner) {
                        debug!(%owner, %addr, "notification rate-limited");
                        continue;
                    }
                    NOTIFICATIONS.inc();
                    let _ = self
                        .notify_tx
                        .send(ChangeNotification {
                            address: addr,
                            owner: owner.clone(),
                            label: label.clone(),
                            description: notify::describe(label, event),
                            event: event.clone(),
                            markers: markers.clone(),
                        })
                        .await;
                }
            }
        }

        if let Some(point) = self.pnl.record_balance(addr, &snap) {
            self.record(Event::Balance {
                address: addr,
                point,
            });
        }
        if let Some(summary) = self.pnl.summary(&addr) {
            let label = addr.to_string();
            PNL_REALIZED.with_label_values(&[&label]).set(summary.realized_pnl);
            PNL_UNREALIZED.with_label_values(&[&label]).set(summary.unrealized_pnl);
        }
        self.snapshots.insert(addr, snap);
    }

    async fn persist(&self) {
        let state = PersistedState {
            snapshots: self.snapshots.iter().map(|(k, v)| (*k, v.clone())).collect(),
            pnl: self.pnl.export().iter().map(|(k, v)| (*k, v.clone())).collect(),
        };
        if let Err(e) = store::save_state(&self.args.state_file, &state).await {
            PERSIST_ERRORS.inc();
            error!(?e, "state write failed, in-memory state stays authoritative");
        }
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.rec_tx {
            let _ = tx.try_send(ev);
        }
    }

    // read-only surfaces for reporting/export collaborators

    pub fn summary(&self, addr: &Address) -> Option<PnlSummary> {
        self.pnl.summary(addr)
    }

    pub fn recent_markers(&self, addr: &Address, symbol: &str) -> Vec<TradeMarker> {
        self.ledger.recent(addr, symbol, now_ms())
    }

    pub fn snapshot(&self, addr: &Address) -> Option<&PositionSnapshot> {
        self.snapshots.get(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FetchTuning, RateLimits, SourceMode};
    use crate::source::InfoClient;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ADDR: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";

    fn ch_payload(positions: Value) -> Value {
        json!({
            "withdrawable": "1000.0",
            "marginSummary": {"accountValue": "1200.0"},
            "assetPositions": positions
        })
    }

    fn btc_long(upnl: &str) -> Value {
        json!({"type": "oneWay", "position": {
            "coin": "BTC", "szi": "1.0", "entryPx": "50000.0",
            "positionValue": "51000.0", "unrealizedPnl": upnl
        }})
    }

    async fn mount_aux(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "openOrders"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "candleSnapshot"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(server)
            .await;
    }

    async fn build(
        server: &MockServer,
        dir: &tempfile::TempDir,
        watchlist: Value,
        per_minute: usize,
    ) -> (Poller, mpsc::Receiver<ChangeNotification>) {
        let watchlist_file = dir.path().join("watchlist.json");
        tokio::fs::write(&watchlist_file, watchlist.to_string())
            .await
            .unwrap();

        let info_url = format!("{}/info", server.uri());
        let args = Args {
            source_mode: SourceMode::Hyperliquid,
            info_url: info_url.clone(),
            poll_interval_secs: 1,
            prune_every_ticks: 1_000,
            watchlist_file: watchlist_file.to_str().unwrap().to_string(),
            state_file: dir.path().join("state.json").to_str().unwrap().to_string(),
            record_file: None,
            metrics_port: 0,
        };
        // TTL 0: every tick goes upstream, so payload sequencing works
        let fetcher = Arc::new(ResilientClient::new(FetchTuning {
            cache_ttl_ms: 0,
            max_inflight: 4,
            timeout_ms: 2_000,
            retries: 1,
            retry_delay_ms: 1,
        }));
        let source = Source::Hyperliquid(InfoClient::new(fetcher.clone(), info_url));
        let gate = RateGate::new(RateLimits {
            per_minute,
            privileged: vec![],
        });
        let (tx, rx) = mpsc::channel(64);
        (Poller::new(args, source, fetcher, gate, tx, None), rx)
    }

    #[tokio::test]
    async fn first_observation_is_silent_then_close_notifies_and_realizes() {
        let server = MockServer::start().await;
        mount_aux(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(ch_payload(json!([btc_long("200.0")]))),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ch_payload(json!([]))))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let watchlist = json!({"alice": {ADDR: "whale"}});
        let (mut poller, mut rx) = build(&server, &dir, watchlist, 100).await;
        let addr = Address::parse(ADDR).unwrap();

        // tick 1: open position seen for the first time -> zero notifications
        poller.tick().await;
        assert!(rx.try_recv().is_err());
        assert!(poller.snapshot(&addr).unwrap().positions.contains_key("BTC"));

        // tick 2: position gone -> one Closed notification, P&L realized
        poller.tick().await;
        let n = rx.try_recv().unwrap();
        assert_eq!(n.event.kind_label(), "closed");
        assert_eq!(n.owner, "alice");
        assert!(n.description.contains("whale closed BTC"));
        assert_eq!(n.markers.len(), 1);
        assert!(rx.try_recv().is_err());

        let summary = poller.summary(&addr).unwrap();
        assert_eq!(summary.realized_pnl, 200.0);
        assert_eq!(summary.trade_count, 1);
        assert!(poller.snapshot(&addr).unwrap().positions.is_empty());

        // batch persist ran at end of tick
        assert!(dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn fetch_failure_leaves_prior_snapshot_untouched() {
        let server = MockServer::start().await;
        mount_aux(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(ch_payload(json!([btc_long("50.0")]))),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState"})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let watchlist = json!({"alice": {ADDR: "whale"}});
        let (mut poller, mut rx) = build(&server, &dir, watchlist, 100).await;
        let addr = Address::parse(ADDR).unwrap();

        poller.tick().await;
        poller.tick().await; // upstream down: no diff against an empty state

        assert!(rx.try_recv().is_err());
        assert!(poller.snapshot(&addr).unwrap().positions.contains_key("BTC"));
        assert_eq!(poller.summary(&addr).unwrap().realized_pnl, 0.0);
    }

    #[tokio::test]
    async fn rate_gate_caps_deliveries_per_owner() {
        let server = MockServer::start().await;
        mount_aux(&server).await;
        let two_positions = json!([
            btc_long("10.0"),
            {"type": "oneWay", "position": {
                "coin": "ETH", "szi": "-5.0", "entryPx": "2000.0",
                "positionValue": "9900.0", "unrealizedPnl": "20.0"
            }}
        ]);
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ch_payload(two_positions)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ch_payload(json!([]))))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let watchlist = json!({"alice": {ADDR: "whale"}});
        // both positions close on tick 2, but alice only gets one message
        let (mut poller, mut rx) = build(&server, &dir, watchlist, 1).await;

        poller.tick().await;
        poller.tick().await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn untracked_addresses_are_dropped_with_their_state() {
        let server = MockServer::start().await;
        mount_aux(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"type": "clearinghouseState"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(ch_payload(json!([btc_long("0.0")]))),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let watchlist = json!({"alice": {ADDR: "whale"}});
        let (mut poller, _rx) = build(&server, &dir, watchlist, 100).await;
        let addr = Address::parse(ADDR).unwrap();

        poller.tick().await;
        assert!(poller.snapshot(&addr).is_some());

        // the last watcher walks away
        tokio::fs::write(
            dir.path().join("watchlist.json"),
            json!({}).to_string(),
        )
        .await
        .unwrap();

        poller.tick().await;
        assert!(poller.snapshot(&addr).is_none());
        assert!(poller.summary(&addr).is_none());
    }
}
