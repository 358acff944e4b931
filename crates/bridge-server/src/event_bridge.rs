use std::sync::Arc;

use bridge_core::events::now_epoch_seconds;
use bridge_core::rpc::notifications::{BUTTON_EVENT, BUTTON_STATE, CONNECTION_LOST};
use bridge_core::rpc::RpcNotification;
use bridge_core::{ButtonEvent, EdgeKind};
use serde_json::json;
use tokio::sync::mpsc;

use crate::connections::ConnectionRegistry;
use crate::subscriptions::{Audience, Capability, SubscriptionRegistry};

/// Formats notifications and queues them on every addressed connection.
pub struct Notifier {
    subscriptions: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionRegistry>,
}

impl Notifier {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            subscriptions,
            connections,
        }
    }

    /// Edges go to `subscribe_button_edges` subscribers, state snapshots to
    /// `get_button_state` subscribers. Returns how many connections were reached.
    pub fn publish(&self, event: &ButtonEvent) -> usize {
        let (capability, notification) = match event.kind {
            EdgeKind::Rising | EdgeKind::Falling => (
                Capability::ButtonEdges,
                RpcNotification::new(
                    BUTTON_EVENT,
                    json!({ "event": event.kind.as_str(), "timestamp": event.timestamp() }),
                ),
            ),
            EdgeKind::StateSnapshot => (
                Capability::ButtonState,
                RpcNotification::new(
                    BUTTON_STATE,
                    json!({ "state": event.state, "timestamp": event.timestamp() }),
                ),
            ),
        };
        let reached = self.deliver(&[Audience::Capability(capability)], &notification);
        tracing::debug!(event = %event.kind, reached, "Button event fanned out");
        reached
    }

    pub fn publish_connection_lost(&self, message: &str) -> usize {
        let notification = RpcNotification::new(
            CONNECTION_LOST,
            json!({ "message": message, "timestamp": now_epoch_seconds() }),
        );
        self.deliver(
            &[Audience::Everyone, Audience::Capability(Capability::ButtonEdges)],
            &notification,
        )
    }

    fn deliver(&self, audiences: &[Audience], notification: &RpcNotification) -> usize {
        let json = match serde_json::to_string(notification) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, method = %notification.method, "Failed to encode notification");
                return 0;
            }
        };
        let mut reached = 0;
        self.subscriptions.fan_out(audiences, |id| {
            if self.connections.send_to(id, json.clone()) {
                reached += 1;
            }
        });
        reached
    }
}

/// Consume produced events in order and fan each out. Ends when every
/// sender is gone.
pub fn start_bridge(notifier: Arc<Notifier>, mut rx: mpsc::Receiver<ButtonEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            notifier.publish(&event);
        }
        tracing::info!("Event bridge channel closed");
    })
}
