// ===============================
// src/ledger.rs (trade markers for chart rendering)
// ===============================
use std::collections::VecDeque;

use ahash::AHashMap as HashMap;

use crate::domain::{Address, ChangeEvent, TradeMarker};

/// Markers older than this never reach a chart.
pub const MARKER_MAX_AGE_MS: i64 = 24 * 3600 * 1000;
const RING_CAP: usize = 256;

/// Per (address, symbol) ring of recent raw trade markers. Independent of
/// the P&L books; pruning is the only mutation besides append.
#[derive(Debug, Default)]
pub struct TradeLedger {
    rings: HashMap<(Address, String), VecDeque<TradeMarker>>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one marker per trade-representing event; `Updated` carries no
    /// transaction and is skipped.
    pub fn record(&mut self, addr: Address, event: &ChangeEvent, ts_ms: i64) {
        let Some(side) = event.trade_side() else { return };

        let (size, price) = match event {
            ChangeEvent::Opened { new } => (new.size, new.entry_price),
            ChangeEvent::Closed { old } => (old.size, old.mark_price.unwrap_or(old.entry_price)),
            ChangeEvent::Increased { old, new } => (new.size - old.size, new.entry_price),
            ChangeEvent::Reduced { old, new } => {
                (old.size - new.size, old.mark_price.unwrap_or(old.entry_price))
            }
            ChangeEvent::Updated { .. } => return,
        };

        let ring = self
            .rings
            .entry((addr, event.symbol().to_string()))
            .or_default();
        if ring.len() >= RING_CAP {
            ring.pop_front();
        }
        ring.push_back(TradeMarker {
            symbol: event.symbol().to_string(),
            side,
            size,
            price,
            ts_ms,
        });
    }

    /// Markers for one address+symbol no older than 24h, oldest first.
    pub fn recent(&self, addr: &Address, symbol: &str, now_ms: i64) -> Vec<TradeMarker> {
        let cutoff = now_ms - MARKER_MAX_AGE_MS;
        self.rings
            .get(&(*addr, symbol.to_string()))
            .map(|ring| ring.iter().filter(|m| m.ts_ms >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Drop aged markers and empty rings; slow cadence.
    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - MARKER_MAX_AGE_MS;
        for ring in self.rings.values_mut() {
            while ring.front().is_some_and(|m| m.ts_ms < cutoff) {
                ring.pop_front();
            }
        }
        self.rings.retain(|_, ring| !ring.is_empty());
    }

    /// Forget an address entirely (last watcher removed it).
    pub fn remove_address(&mut self, addr: &Address) {
        self.rings.retain(|(a, _), _| a != addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Position, PositionSide, TradeSide};

    fn addr() -> Address {
        Address::parse("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap()
    }

    fn pos(sym: &str, size: f64, side: PositionSide) -> Position {
        Position {
            symbol: sym.to_string(),
            size,
            side,
            entry_price: 100.0,
            mark_price: Some(110.0),
            notional: None,
            unrealized_pnl: 0.0,
            open_orders: 0,
        }
    }

    #[test]
    fn records_one_marker_per_trade_event() {
        let mut ledger = TradeLedger::new();
        ledger.record(
            addr(),
            &ChangeEvent::Opened { new: pos("BTC", 2.0, PositionSide::Long) },
            1_000,
        );
        ledger.record(
            addr(),
            &ChangeEvent::Closed { old: pos("BTC", 2.0, PositionSide::Long) },
            2_000,
        );

        let markers = ledger.recent(&addr(), "BTC", 10_000);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].side, TradeSide::Buy);
        assert_eq!(markers[0].price, 100.0);
        assert_eq!(markers[1].side, TradeSide::Sell);
        // close priced at the old mark, not the entry
        assert_eq!(markers[1].price, 110.0);
    }

    #[test]
    fn updated_events_leave_no_marker() {
        let mut ledger = TradeLedger::new();
        let p = pos("BTC", 2.0, PositionSide::Long);
        ledger.record(
            addr(),
            &ChangeEvent::Updated { old: p.clone(), new: p },
            1_000,
        );
        assert!(ledger.recent(&addr(), "BTC", 10_000).is_empty());
    }

    #[test]
    fn recent_filters_markers_older_than_a_day() {
        let mut ledger = TradeLedger::new();
        ledger.record(
            addr(),
            &ChangeEvent::Opened { new: pos("ETH", 1.0, PositionSide::Short) },
            0,
        );
        ledger.record(
            addr(),
            &ChangeEvent::Opened { new: pos("ETH", 1.0, PositionSide::Short) },
            MARKER_MAX_AGE_MS,
        );

        let now = MARKER_MAX_AGE_MS + 1_000;
        let markers = ledger.recent(&addr(), "ETH", now);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].ts_ms, MARKER_MAX_AGE_MS);
    }

    #[test]
    fn prune_drops_empty_rings() {
        let mut ledger = TradeLedger::new();
        ledger.record(
            addr(),
            &ChangeEvent::Opened { new: pos("SOL", 1.0, PositionSide::Long) },
            0,
        );
        ledger.prune(MARKER_MAX_AGE_MS + 1_000);
        assert!(ledger.rings.is_empty());
    }
}
