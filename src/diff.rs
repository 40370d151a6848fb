// ===============================
// src/diff.rs (snapshot reconciliation)
// ===============================
use std::collections::BTreeSet;

use crate::domain::{ChangeEvent, PositionSnapshot, SIZE_EPSILON};

/// Classify the differences between two consecutive snapshots, one event per
/// changed symbol, in ascending symbol order. Pure; the poller owns all
/// side effects.
pub fn compute(old: &PositionSnapshot, new: &PositionSnapshot) -> Vec<ChangeEvent> {
    let symbols: BTreeSet<&str> = old
        .positions
        .keys()
        .chain(new.positions.keys())
        .map(String::as_str)
        .collect();

    let mut events = Vec::new();
    for sym in symbols {
        match (old.positions.get(sym), new.positions.get(sym)) {
            (None, Some(n)) => events.push(ChangeEvent::Opened { new: n.clone() }),
            // Old entry/mark is the closing reference
            (Some(o), None) => events.push(ChangeEvent::Closed { old: o.clone() }),
            (Some(o), Some(n)) => {
                let size_delta = n.size - o.size;
                if size_delta > SIZE_EPSILON {
                    events.push(ChangeEvent::Increased {
                        old: o.clone(),
                        new: n.clone(),
                    });
                } else if size_delta < -SIZE_EPSILON {
                    events.push(ChangeEvent::Reduced {
                        old: o.clone(),
                        new: n.clone(),
                    });
                } else if (n.entry_price - o.entry_price).abs() > SIZE_EPSILON {
                    events.push(ChangeEvent::Updated {
                        old: o.clone(),
                        new: n.clone(),
                    });
                }
                // equal size and entry price -> no event
            }
            (None, None) => unreachable!("symbol came from one of the maps"),
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Position, PositionSide};

    fn pos(sym: &str, size: f64, side: PositionSide, entry: f64, upnl: f64) -> Position {
        Position {
            symbol: sym.to_string(),
            size,
            side,
            entry_price: entry,
            mark_price: None,
            notional: None,
            unrealized_pnl: upnl,
            open_orders: 0,
        }
    }

    fn snap(positions: Vec<Position>) -> PositionSnapshot {
        PositionSnapshot {
            balance: 1_000.0,
            positions: positions.into_iter().map(|p| (p.symbol.clone(), p)).collect(),
            ts_ms: 0,
        }
    }

    #[test]
    fn identical_snapshots_diff_to_nothing() {
        let s = snap(vec![
            pos("BTC", 1.0, PositionSide::Long, 50_000.0, 200.0),
            pos("ETH", 3.0, PositionSide::Short, 2_000.0, -10.0),
        ]);
        assert!(compute(&s, &s).is_empty());
        assert!(compute(&snap(vec![]), &snap(vec![])).is_empty());
    }

    #[test]
    fn one_event_per_changed_symbol_in_ascending_order() {
        let old = snap(vec![
            pos("ETH", 3.0, PositionSide::Short, 2_000.0, 0.0),
            pos("SOL", 10.0, PositionSide::Long, 150.0, 0.0),
        ]);
        let new = snap(vec![
            pos("BTC", 1.0, PositionSide::Long, 60_000.0, 0.0),
            pos("ETH", 5.0, PositionSide::Short, 1_950.0, 0.0),
        ]);
        let events = compute(&old, &new);
        let labels: Vec<(&str, &str)> = events.iter().map(|e| (e.symbol(), e.kind_label())).collect();
        assert_eq!(
            labels,
            vec![("BTC", "opened"), ("ETH", "increased"), ("SOL", "closed")]
        );
    }

    #[test]
    fn size_decrease_is_reduced() {
        let old = snap(vec![pos("ETH", 10.0, PositionSide::Long, 2_000.0, 100.0)]);
        let new = snap(vec![pos("ETH", 6.0, PositionSide::Long, 2_000.0, 60.0)]);
        let events = compute(&old, &new);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ChangeEvent::Reduced { old, new }
            if old.size == 10.0 && new.size == 6.0));
    }

    #[test]
    fn entry_price_change_at_equal_size_is_updated() {
        let old = snap(vec![pos("BTC", 1.0, PositionSide::Long, 50_000.0, 0.0)]);
        let new = snap(vec![pos("BTC", 1.0, PositionSide::Long, 50_500.0, 0.0)]);
        let events = compute(&old, &new);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind_label(), "updated");
        assert_eq!(events[0].trade_side(), None);
    }

    #[test]
    fn unrealized_pnl_drift_alone_is_not_a_change() {
        let old = snap(vec![pos("BTC", 1.0, PositionSide::Long, 50_000.0, 10.0)]);
        let new = snap(vec![pos("BTC", 1.0, PositionSide::Long, 50_000.0, 250.0)]);
        assert!(compute(&old, &new).is_empty());
    }
}
