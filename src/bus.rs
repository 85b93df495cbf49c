//! Event bus for broadcasting router/source state changes to UI bridge
//! clients and internal subscribers.
//!
//! Uses `tokio::sync::broadcast` for pub/sub, exactly as the event bus
//! this crate is built on does. Events are typed and internally tagged
//! so they serialize to the same `{"type": ..., "payload": ...}` shape
//! the UI bridge's webhook fan-out expects.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Events published on the router's internal bus. The UI-facing ones
/// (`MenuItem`, `Navigate`, `SourceChange`, `VolumeUpdate`) mirror what
/// the registry and router broadcast; `ShuttingDown` is internal-only
/// and never leaves the process. Per-source UI fan-out (`cd_update`,
/// free-form broadcasts) is posted directly to the UI bridge by
/// `SourceBase::broadcast`/`PlayerBase`, not routed through this bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    MenuItem {
        action: MenuItemAction,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },
    Navigate {
        page: String,
    },
    SourceChange {
        active_source: Option<String>,
        source_name: Option<String>,
        player: Option<String>,
    },
    VolumeUpdate {
        volume: u8,
        balance: i8,
    },
    /// Published just before the process begins tearing down adapters,
    /// so long-running tasks can react before being cancelled.
    ShuttingDown {
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuItemAction {
    Add,
    Remove,
    Show,
    Hide,
}

/// Thin wrapper around a broadcast sender. Cloning an `Arc<EventBus>` is
/// the normal way to hand out publish/subscribe access.
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

pub type SharedBus = Arc<EventBus>;

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event. Returns the number of active subscribers that
    /// received it; a publish with zero subscribers is not an error.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pubsub() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::Navigate {
            page: "menu/cd".into(),
        });
        let event = rx.recv().await;
        assert!(event.is_ok());
        let is_navigate_to_cd = matches!(
            event,
            Ok(BusEvent::Navigate { ref page }) if page == "menu/cd"
        );
        assert!(is_navigate_to_cd);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = create_bus();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let delivered = bus.publish(BusEvent::ShuttingDown { reason: None });
        assert_eq!(delivered, 2);
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
