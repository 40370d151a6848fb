// ===============================
// src/pnl.rs (P&L aggregator & derived statistics)
// ===============================
//
// Folds the diff output into per-address running state:
// - realized P&L moves only on close / partial close
// - unrealized P&L is recomputed from the new snapshot every cycle, never
//   carried forward incrementally (no compounding rounding drift)
// - partial closes realize the old unrealized P&L scaled by sizeDelta/oldSize
// - trade and balance histories are bounded (cap 1000) and time-pruned (30d)
//
// stats() derives everything from the stored histories; nothing derived is
// kept as separate state.
//
use std::collections::VecDeque;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Address, BalancePoint, ChangeEvent, PnlSummary, PositionSide, PositionSnapshot, ProfitFactor,
    TradeKind, TradeRecord,
};

pub const HISTORY_CAP: usize = 1000;
pub const HISTORY_MAX_AGE_MS: i64 = 30 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlState {
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trade_count: u64,
    pub start_ms: i64,
    pub initial_balance: f64,
    pub last_balance: f64,
    pub trades: VecDeque<TradeRecord>,
    pub balances: VecDeque<BalancePoint>,
}

#[derive(Debug, Default)]
pub struct PnlStore {
    states: HashMap<Address, PnlState>,
}

impl PnlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// First observation of an address: state is seeded from a real snapshot,
    /// never from a zero default.
    pub fn seed(&mut self, addr: Address, snap: &PositionSnapshot) {
        let mut state = PnlState {
            realized_pnl: 0.0,
            unrealized_pnl: snap.unrealized_total(),
            trade_count: 0,
            start_ms: snap.ts_ms,
            initial_balance: snap.balance,
            last_balance: snap.balance,
            trades: VecDeque::new(),
            balances: VecDeque::new(),
        };
        push_capped(
            &mut state.balances,
            BalancePoint {
                balance: snap.balance,
                unrealized_pnl: state.unrealized_pnl,
                ts_ms: snap.ts_ms,
            },
        );
        self.states.insert(addr, state);
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.states.contains_key(addr)
    }

    pub fn remove(&mut self, addr: &Address) {
        self.states.remove(addr);
    }

    /// Apply one cycle's change events. Returns the trade records produced,
    /// in event order, for the ledger/recorder/notifier.
    pub fn apply(
        &mut self,
        addr: Address,
        new: &PositionSnapshot,
        events: &[ChangeEvent],
    ) -> Vec<TradeRecord> {
        let Some(state) = self.states.get_mut(&addr) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for event in events {
            let record = match event {
                ChangeEvent::Opened { new: p } => Some(TradeRecord {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    size: p.size,
                    entry_price: p.entry_price,
                    exit_price: None,
                    pnl: 0.0,
                    ts_ms: new.ts_ms,
                    kind: TradeKind::Open,
                }),
                ChangeEvent::Increased { old, new: p } => Some(TradeRecord {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    size: p.size - old.size,
                    entry_price: p.entry_price,
                    exit_price: None,
                    pnl: 0.0,
                    ts_ms: new.ts_ms,
                    kind: TradeKind::Increase,
                }),
                ChangeEvent::Reduced { old, new: p } => {
                    // Proportional attribution: the closed fraction of the
                    // old position realizes the same fraction of its
                    // unrealized P&L.
                    let size_delta = old.size - p.size;
                    let pnl = old.unrealized_pnl * (size_delta / old.size);
                    state.realized_pnl += pnl;
                    state.trade_count += 1;
                    Some(TradeRecord {
                        symbol: old.symbol.clone(),
                        side: old.side,
                        size: size_delta,
                        entry_price: old.entry_price,
                        exit_price: old.mark_price,
                        pnl,
                        ts_ms: new.ts_ms,
                        kind: TradeKind::PartialClose,
                    })
                }
                ChangeEvent::Closed { old } => {
                    let pnl = old.unrealized_pnl;
                    state.realized_pnl += pnl;
                    state.trade_count += 1;
                    Some(TradeRecord {
                        symbol: old.symbol.clone(),
                        side: old.side,
                        size: old.size,
                        entry_price: old.entry_price,
                        exit_price: old.mark_price,
                        pnl,
                        ts_ms: new.ts_ms,
                        kind: TradeKind::Close,
                    })
                }
                // entry-price-only change: notified, not a trade
                ChangeEvent::Updated { .. } => None,
            };
            if let Some(r) = record {
                push_capped(&mut state.trades, r.clone());
                records.push(r);
            }
        }

        state.unrealized_pnl = new.unrealized_total();
        state.last_balance = new.balance;
        records
    }

    /// One balance point per update cycle, unconditionally; feeds the
    /// drawdown curve even when nothing traded.
    pub fn record_balance(&mut self, addr: Address, snap: &PositionSnapshot) -> Option<BalancePoint> {
        let state = self.states.get_mut(&addr)?;
        state.unrealized_pnl = snap.unrealized_total();
        state.last_balance = snap.balance;
        let point = BalancePoint {
            balance: snap.balance,
            unrealized_pnl: state.unrealized_pnl,
            ts_ms: snap.ts_ms,
        };
        push_capped(&mut state.balances, point);
        Some(point)
    }

    pub fn summary(&self, addr: &Address) -> Option<PnlSummary> {
        let state = self.states.get(addr)?;

        let closed: Vec<&TradeRecord> =
            state.trades.iter().filter(|t| t.kind.is_closing()).collect();
        let wins: Vec<f64> = closed.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).collect();
        let losses: Vec<f64> = closed.iter().filter(|t| t.pnl < 0.0).map(|t| t.pnl).collect();

        let win_rate = if closed.is_empty() {
            0.0
        } else {
            wins.len() as f64 / closed.len() as f64
        };
        let avg_win = mean(&wins).unwrap_or(0.0);
        let avg_loss = mean(&losses).unwrap_or(0.0);
        let expectancy = if closed.is_empty() {
            0.0
        } else {
            closed.iter().map(|t| t.pnl).sum::<f64>() / closed.len() as f64
        };

        let gross_win: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().sum::<f64>().abs();
        let profit_factor = if closed.is_empty() {
            ProfitFactor::NotApplicable
        } else if gross_loss > 0.0 {
            ProfitFactor::Ratio(gross_win / gross_loss)
        } else if gross_win > 0.0 {
            ProfitFactor::Infinite
        } else {
            ProfitFactor::Ratio(0.0)
        };

        Some(PnlSummary {
            realized_pnl: state.realized_pnl,
            unrealized_pnl: state.unrealized_pnl,
            // recomputed, never stored — the two components cannot drift
            total_pnl: state.realized_pnl + state.unrealized_pnl,
            trade_count: state.trade_count,
            win_rate,
            avg_win,
            avg_loss,
            max_drawdown_pct: max_drawdown_pct(&state.balances),
            profit_factor,
            expectancy,
            avg_hold_ms: avg_hold_ms(&state.trades),
            initial_balance: state.initial_balance,
            last_balance: state.last_balance,
            start_ms: state.start_ms,
        })
    }

    /// Time-based pruning, run on a slow cadence (caps handle the fast path).
    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - HISTORY_MAX_AGE_MS;
        for state in self.states.values_mut() {
            while state.trades.front().is_some_and(|t| t.ts_ms < cutoff) {
                state.trades.pop_front();
            }
            while state.balances.front().is_some_and(|b| b.ts_ms < cutoff) {
                state.balances.pop_front();
            }
        }
    }

    pub fn export(&self) -> &HashMap<Address, PnlState> {
        &self.states
    }

    pub fn import(&mut self, states: HashMap<Address, PnlState>) {
        self.states = states;
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T) {
    if buf.len() >= HISTORY_CAP {
        buf.pop_front();
    }
    buf.push_back(item);
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}

/// Largest peak-to-trough percentage decline of effective equity
/// (balance + unrealized mark recorded at the same instant). One pass.
fn max_drawdown_pct(balances: &VecDeque<BalancePoint>) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for point in balances {
        let equity = point.equity();
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

/// Mean holding time with FIFO matching: each close or partial close
/// consumes the oldest unconsumed open/increase of the same symbol+side, so
/// rapid open/close/open sequences never double-match one open. Closes with
/// no surviving match are ignored.
fn avg_hold_ms(trades: &VecDeque<TradeRecord>) -> Option<i64> {
    let mut open_queues: HashMap<(String, PositionSide), VecDeque<i64>> = HashMap::new();
    let mut holds: Vec<i64> = Vec::new();

    for t in trades {
        let key = (t.symbol.clone(), t.side);
        match t.kind {
            TradeKind::Open | TradeKind::Increase => {
                open_queues.entry(key).or_default().push_back(t.ts_ms);
            }
            TradeKind::PartialClose | TradeKind::Close => {
                if let Some(open_ts) = open_queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    holds.push(t.ts_ms - open_ts);
                }
            }
        }
    }

    if holds.is_empty() {
        None
    } else {
        Some(holds.iter().sum::<i64>() / holds.len() as i64)
    }
}
