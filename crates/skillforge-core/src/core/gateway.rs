//! Notification/broadcast gateway
//!
//! The core reports finished work through this trait and never learns who is
//! listening. The daemon plugs in [`ChannelGateway`], whose receivers are
//! handed to IPC subscribers.

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::types::GatewayEvent;

/// Outbound side of the core
pub trait BroadcastGateway: Send + Sync {
    /// Deliver an event to every observer
    fn broadcast(&self, event: &GatewayEvent);

    /// Surface a short message to the human operator
    fn notify_user(&self, title: &str, body: &str) {
        self.broadcast(&GatewayEvent::UserNotification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }
}

/// Gateway that drops every event. Used when nothing observes the core.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGateway;

impl BroadcastGateway for NullGateway {
    fn broadcast(&self, event: &GatewayEvent) {
        debug!(?event, "Event dropped (no gateway)");
    }
}

/// Tokio broadcast channel fan-out
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    event_tx: broadcast::Sender<GatewayEvent>,
}

impl ChannelGateway {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for ChannelGateway {
    fn default() -> Self {
        Self::new(100)
    }
}

impl BroadcastGateway for ChannelGateway {
    fn broadcast(&self, event: &GatewayEvent) {
        // No receivers is not an error
        let delivered = self.event_tx.send(event.clone()).unwrap_or(0);
        debug!(?event, delivered, "Event broadcast");
    }

    fn notify_user(&self, title: &str, body: &str) {
        info!(%title, %body, "User notification");
        self.broadcast(&GatewayEvent::UserNotification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }
}
