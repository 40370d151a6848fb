// ===============================
// src/notify.rs (change-notification dispatch)
// ===============================
//
// The core does not render or deliver messages. One ChangeNotification per
// (event, watcher) goes over the channel; whatever sits on the other end —
// here a tracing sink, in production a chat-platform adapter — gets the
// formatted one-liner plus the recent ledger markers for chart rendering.
//
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::{Address, ChangeEvent, TradeMarker};

#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub address: Address,
    pub owner: String,
    pub label: String,
    pub description: String,
    pub event: ChangeEvent,
    pub markers: Vec<TradeMarker>,
}

/// One line per event, chat-ready.
pub fn describe(label: &str, event: &ChangeEvent) -> String {
    match event {
        ChangeEvent::Opened { new } => format!(
            "{label} opened {} {} {:.4} @ {:.2}",
            new.symbol,
            new.side.as_str(),
            new.size,
            new.entry_price
        ),
        ChangeEvent::Closed { old } => format!(
            "{label} closed {} {} {:.4} (pnl {:+.2})",
            old.symbol,
            old.side.as_str(),
            old.size,
            old.unrealized_pnl
        ),
        ChangeEvent::Increased { old, new } => format!(
            "{label} increased {} {} {:.4} -> {:.4}",
            new.symbol,
            new.side.as_str(),
            old.size,
            new.size
        ),
        ChangeEvent::Reduced { old, new } => format!(
            "{label} reduced {} {} {:.4} -> {:.4}",
            new.symbol,
            new.side.as_str(),
            old.size,
            new.size
        ),
        ChangeEvent::Updated { old, new } => format!(
            "{label} updated {} entry {:.2} -> {:.2}",
            new.symbol, old.entry_price, new.entry_price
        ),
    }
}

pub async fn run(mut rx: mpsc::Receiver<ChangeNotification>) {
    while let Some(n) = rx.recv().await {
        info!(
            owner = %n.owner,
            address = %n.address,
            kind = %n.event.kind_label(),
            markers = n.markers.len(),
            "{}",
            n.description
        );
    }
}
