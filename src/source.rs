// ===============================
// src/source.rs
// ===============================
//
// Position snapshot adapters:
// - MockSource  : random-walk positions per address (demo & tests)
// - InfoClient  : Hyperliquid info API (clearinghouseState / openOrders /
//                 candleSnapshot) through the resilient fetch client
//
// The upstream is untrusted: numbers arrive as strings, fields go missing,
// zero-size entries appear. Entries that cannot be parsed are skipped; a
// payload with no usable shape at all is a DataError, which the poller
// treats like a failed fetch (prior snapshot stays authoritative).
//
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ahash::AHashMap as HashMap;
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::domain::{now_ms, Address, Position, PositionSide, PositionSnapshot, SIZE_EPSILON};
use crate::fetch::{FetchError, ResilientClient};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unusable positions payload: {0}")]
    Shape(&'static str),
}

pub enum Source {
    Mock(MockSource),
    Hyperliquid(InfoClient),
}

impl Source {
    pub async fn snapshot(&self, addr: &Address) -> Result<PositionSnapshot, SourceError> {
        match self {
            Source::Mock(m) => Ok(m.snapshot(addr)),
            Source::Hyperliquid(c) => c.snapshot(addr).await,
        }
    }
}

// -----------------------------------------------------------------------------
// Hyperliquid info API
// -----------------------------------------------------------------------------

pub struct InfoClient {
    client: Arc<ResilientClient>,
    info_url: String,
}

impl InfoClient {
    pub fn new(client: Arc<ResilientClient>, info_url: String) -> Self {
        Self { client, info_url }
    }

    pub async fn snapshot(&self, addr: &Address) -> Result<PositionSnapshot, SourceError> {
        let body = json!({"type": "clearinghouseState", "user": addr.to_string()});
        let payload = self.client.post_json(&self.info_url, &body).await?;

        // Open-order counts are best effort; absence degrades to zero.
        let order_counts = self.open_order_counts(addr).await.unwrap_or_default();

        let mut snap = parse_clearinghouse(&payload, &order_counts)?;

        // Fill mark prices from the candle source; one call per distinct
        // symbol, deduped across watchers by the fetch cache.
        for pos in snap.positions.values_mut() {
            if pos.mark_price.is_none() {
                pos.mark_price = self.mark_price(&pos.symbol).await;
            }
        }
        snap.ts_ms = now_ms();
        Ok(snap)
    }

    /// Most recent 1m candle close, or None when the market has no recent
    /// candle. Unknown stays unknown, never zero.
    pub async fn mark_price(&self, coin: &str) -> Option<f64> {
        // Minute-aligned window keeps the cache fingerprint stable.
        let end = (now_ms() / 60_000) * 60_000;
        let start = end - 5 * 60_000;
        let body = json!({
            "type": "candleSnapshot",
            "req": {"coin": coin, "interval": "1m", "startTime": start, "endTime": end}
        });
        match self.client.post_json(&self.info_url, &body).await {
            Ok(v) => v
                .as_array()
                .and_then(|candles| candles.last())
                .and_then(|c| parse_f64(c.get("c")?)),
            Err(e) => {
                debug!(%coin, ?e, "mark price unavailable");
                None
            }
        }
    }

    async fn open_order_counts(&self, addr: &Address) -> Option<HashMap<String, u32>> {
        let body = json!({"type": "openOrders", "user": addr.to_string()});
        let v = self.client.post_json(&self.info_url, &body).await.ok()?;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for order in v.as_array()? {
            if let Some(coin) = order.get("coin").and_then(|c| c.as_str()) {
                *counts.entry(coin.to_string()).or_insert(0) += 1;
            }
        }
        Some(counts)
    }
}

/// clearinghouseState -> PositionSnapshot. Unparseable entries are skipped,
/// zero-size entries are dropped at this boundary.
pub fn parse_clearinghouse(
    payload: &Value,
    order_counts: &HashMap<String, u32>,
) -> Result<PositionSnapshot, SourceError> {
    let obj = payload.as_object().ok_or(SourceError::Shape("not an object"))?;

    let balance = obj
        .get("withdrawable")
        .and_then(parse_f64)
        .or_else(|| {
            obj.get("marginSummary")
                .and_then(|m| m.get("accountValue"))
                .and_then(parse_f64)
        })
        .unwrap_or(0.0);

    let mut positions = BTreeMap::new();
    if let Some(entries) = obj.get("assetPositions").and_then(|v| v.as_array()) {
        for entry in entries {
            let Some(p) = entry.get("position") else { continue };
            let Some(coin) = p.get("coin").and_then(|c| c.as_str()) else { continue };
            let Some(szi) = p.get("szi").and_then(parse_f64) else { continue };
            if szi.abs() < SIZE_EPSILON {
                continue;
            }
            let Some(entry_price) = p.get("entryPx").and_then(parse_f64) else { continue };

            let notional = p.get("positionValue").and_then(parse_f64);
            let unrealized_pnl = p.get("unrealizedPnl").and_then(parse_f64).unwrap_or(0.0);
            let side = if szi > 0.0 { PositionSide::Long } else { PositionSide::Short };
            let size = szi.abs();

            positions.insert(
                coin.to_string(),
                Position {
                    symbol: coin.to_string(),
                    size,
                    side,
                    entry_price,
                    // Implied mark from notional; the candle source refines it.
                    mark_price: notional.map(|n| n / size),
                    notional,
                    unrealized_pnl,
                    open_orders: order_counts.get(coin).copied().unwrap_or(0),
                },
            );
        }
    }

    Ok(PositionSnapshot {
        balance,
        positions,
        ts_ms: 0,
    })
}

fn parse_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Mock source (random walk — drives demos and the poller without network)
// -----------------------------------------------------------------------------

const MOCK_SYMBOLS: [&str; 4] = ["BTC", "ETH", "SOL", "DOGE"];

pub struct MockSource {
    states: Mutex<HashMap<Address, PositionSnapshot>>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self, addr: &Address) -> PositionSnapshot {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let snap = states.entry(*addr).or_insert_with(|| PositionSnapshot {
            balance: 10_000.0,
            positions: BTreeMap::new(),
            ts_ms: 0,
        });
        // do not hold ThreadRng across an .await — this fn is fully sync
        let mut rng = rand::thread_rng();

        snap.balance = (snap.balance + rng.gen_range(-20.0..20.0)).max(100.0);

        for sym in MOCK_SYMBOLS {
            let roll: f64 = rng.gen();
            match snap.positions.get_mut(sym) {
                None => {
                    if roll < 0.10 {
                        let side = if rng.gen_bool(0.5) { PositionSide::Long } else { PositionSide::Short };
                        let entry = mock_px(sym, &mut rng);
                        let size = rng.gen_range(0.1..5.0);
                        snap.positions.insert(
                            sym.to_string(),
                            Position {
                                symbol: sym.to_string(),
                                size,
                                side,
                                entry_price: entry,
                                mark_price: Some(entry),
                                notional: Some(entry * size),
                                unrealized_pnl: 0.0,
                                open_orders: rng.gen_range(0..3),
                            },
                        );
                    }
                }
                Some(pos) => {
                    if roll < 0.08 {
                        snap.positions.remove(sym);
                    } else if roll < 0.20 {
                        let factor = rng.gen_range(0.5..1.8);
                        pos.size = (pos.size * factor).max(0.05);
                        pos.unrealized_pnl += rng.gen_range(-50.0..50.0);
                    } else {
                        pos.unrealized_pnl += rng.gen_range(-25.0..25.0);
                        if let Some(mark) = pos.mark_price.as_mut() {
                            *mark *= rng.gen_range(0.99..1.01);
                        }
                    }
                }
            }
        }

        snap.ts_ms = now_ms();
        snap.clone()
    }
}

fn mock_px(sym: &str, rng: &mut impl Rng) -> f64 {
    let base = match sym {
        "BTC" => 60_000.0,
        "ETH" => 3_000.0,
        "SOL" => 150.0,
        _ => 0.2,
    };
    base * rng.gen_range(0.95..1.05)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        json!({
            "marginSummary": {"accountValue": "12345.6", "totalNtlPos": "25000.0"},
            "withdrawable": "9876.5",
            "assetPositions": [
                {"type": "oneWay", "position": {
                    "coin": "BTC", "szi": "0.5", "entryPx": "50000.0",
                    "positionValue": "26000.0", "unrealizedPnl": "1000.0"
                }},
                {"type": "oneWay", "position": {
                    "coin": "ETH", "szi": "-10", "entryPx": "2000.0",
                    "positionValue": "19000.0", "unrealizedPnl": "-500.0"
                }},
                // zero size: must be dropped, not zeroed
                {"type": "oneWay", "position": {
                    "coin": "SOL", "szi": "0", "entryPx": "150.0"
                }},
                // missing entryPx: skipped
                {"type": "oneWay", "position": {"coin": "DOGE", "szi": "100"}}
            ]
        })
    }

    #[test]
    fn parses_balance_and_signed_positions() {
        let mut counts = HashMap::new();
        counts.insert("BTC".to_string(), 2u32);
        let snap = parse_clearinghouse(&payload(), &counts).unwrap();

        assert_eq!(snap.balance, 9876.5);
        assert_eq!(snap.positions.len(), 2);

        let btc = &snap.positions["BTC"];
        assert_eq!(btc.side, PositionSide::Long);
        assert_eq!(btc.size, 0.5);
        assert_eq!(btc.open_orders, 2);
        assert_eq!(btc.mark_price, Some(26_000.0 / 0.5));

        let eth = &snap.positions["ETH"];
        assert_eq!(eth.side, PositionSide::Short);
        assert_eq!(eth.size, 10.0);
        assert_eq!(eth.unrealized_pnl, -500.0);
        assert_eq!(eth.open_orders, 0);
    }

    #[test]
    fn falls_back_to_account_value_when_withdrawable_missing() {
        let mut v = payload();
        v.as_object_mut().unwrap().remove("withdrawable");
        let snap = parse_clearinghouse(&v, &HashMap::new()).unwrap();
        assert_eq!(snap.balance, 12345.6);
    }

    #[test]
    fn non_object_payload_is_a_shape_error() {
        assert!(parse_clearinghouse(&json!([1, 2, 3]), &HashMap::new()).is_err());
    }

    #[test]
    fn missing_asset_positions_yields_empty_map() {
        let snap = parse_clearinghouse(&json!({"withdrawable": "5.0"}), &HashMap::new()).unwrap();
        assert!(snap.positions.is_empty());
        assert_eq!(snap.balance, 5.0);
    }

    #[test]
    fn mock_source_respects_nonzero_size_invariant() {
        let src = MockSource::new();
        let addr = Address::parse("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap();
        for _ in 0..50 {
            let snap = src.snapshot(&addr);
            for p in snap.positions.values() {
                assert!(p.size > 0.0);
            }
        }
    }
}
