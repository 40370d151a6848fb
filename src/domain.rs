// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Sizes below this are treated as flat (f64 dust from the upstream API).
pub const SIZE_EPSILON: f64 = 1e-9;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---- Address (EIP-55) ----

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address must be 40 hex characters")]
    BadLength,
    #[error("address contains non-hex characters")]
    BadHex,
    #[error("mixed-case address failed EIP-55 checksum")]
    BadChecksum,
}

/// Checksummed on-chain identity. Invalid input is rejected here and never
/// enters the rest of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let hex_part = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        if hex_part.len() != 40 {
            return Err(AddressError::BadLength);
        }
        let mut raw = [0u8; 20];
        hex::decode_to_slice(hex_part, &mut raw).map_err(|_| AddressError::BadHex)?;

        // Mixed case carries checksum information, all-lower/all-upper does not.
        let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper && checksum_hex(&raw) != hex_part {
            return Err(AddressError::BadChecksum);
        }
        Ok(Address(raw))
    }
}

/// EIP-55: uppercase every hex digit whose keccak(lowercase_hex) nibble >= 8.
fn checksum_hex(raw: &[u8; 20]) -> String {
    let lower = hex::encode(raw);
    let hash = Keccak256::digest(lower.as_bytes());
    lower
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if nibble >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", checksum_hex(&self.0))
    }
}

impl FromStr for Address {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}

// ---- Positions ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

/// Direction of the transaction that produced a change (visualization only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Absolute size, always > 0 while the position exists.
    pub size: f64,
    pub side: PositionSide,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub notional: Option<f64>,
    pub unrealized_pnl: f64,
    pub open_orders: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub balance: f64,
    /// Symbol present only while abs size is nonzero; BTreeMap keeps the
    /// diff output in ascending symbol order.
    pub positions: BTreeMap<String, Position>,
    pub ts_ms: i64,
}

impl PositionSnapshot {
    pub fn unrealized_total(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }
}

// ---- Change events ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    Opened { new: Position },
    Closed { old: Position },
    Increased { old: Position, new: Position },
    Reduced { old: Position, new: Position },
    /// Entry price moved at equal size. Notified, never a trade.
    Updated { old: Position, new: Position },
}

impl ChangeEvent {
    pub fn symbol(&self) -> &str {
        match self {
            ChangeEvent::Opened { new } => &new.symbol,
            ChangeEvent::Closed { old } => &old.symbol,
            ChangeEvent::Increased { new, .. } => &new.symbol,
            ChangeEvent::Reduced { new, .. } => &new.symbol,
            ChangeEvent::Updated { new, .. } => &new.symbol,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            ChangeEvent::Opened { .. } => "opened",
            ChangeEvent::Closed { .. } => "closed",
            ChangeEvent::Increased { .. } => "increased",
            ChangeEvent::Reduced { .. } => "reduced",
            ChangeEvent::Updated { .. } => "updated",
        }
    }

    /// Closing or reducing requires the opposite-side transaction.
    pub fn trade_side(&self) -> Option<TradeSide> {
        match self {
            ChangeEvent::Opened { new } | ChangeEvent::Increased { new, .. } => match new.side {
                PositionSide::Long => Some(TradeSide::Buy),
                PositionSide::Short => Some(TradeSide::Sell),
            },
            ChangeEvent::Closed { old } | ChangeEvent::Reduced { old, .. } => match old.side {
                PositionSide::Long => Some(TradeSide::Sell),
                PositionSide::Short => Some(TradeSide::Buy),
            },
            ChangeEvent::Updated { .. } => None,
        }
    }
}

// ---- Trade ledger entries ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeKind {
    Open,
    Increase,
    PartialClose,
    Close,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Open => "open",
            TradeKind::Increase => "increase",
            TradeKind::PartialClose => "partial_close",
            TradeKind::Close => "close",
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, TradeKind::PartialClose | TradeKind::Close)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub pnl: f64,
    pub ts_ms: i64,
    pub kind: TradeKind,
}

/// Raw marker for chart rendering, independent of P&L.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMarker {
    pub symbol: String,
    pub side: TradeSide,
    pub size: f64,
    pub price: f64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalancePoint {
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub ts_ms: i64,
}

impl BalancePoint {
    /// Effective equity used by the drawdown curve.
    pub fn equity(&self) -> f64 {
        self.balance + self.unrealized_pnl
    }
}

// ---- Derived analytics ----

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ProfitFactor {
    Ratio(f64),
    /// Wins exist, losses do not.
    Infinite,
    /// No closed trades yet.
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSummary {
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub trade_count: u64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub max_drawdown_pct: f64,
    pub profit_factor: ProfitFactor,
    pub expectancy: f64,
    pub avg_hold_ms: Option<i64>,
    pub initial_balance: f64,
    pub last_balance: f64,
    pub start_ms: i64,
}

// ---- Recorder events ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Change { address: Address, event: ChangeEvent },
    Trade { address: Address, record: TradeRecord },
    Balance { address: Address, point: BalancePoint },
    Note(String),
}
