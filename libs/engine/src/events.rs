//! In-process event broadcaster
//!
//! Fans run/step lifecycle events out to subscribed client connections,
//! keyed by the owning principal. One bounded broadcast channel per
//! principal; a slow subscriber lags and drops frames instead of blocking
//! publishers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use foreman_domain::UserId;

/// Capacity for broadcast channels
const CHANNEL_CAPACITY: usize = 256;

/// Well-known event names
pub mod names {
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const STEP_CLAIMED: &str = "step.claimed";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_AWAITING_APPROVAL: &str = "step.awaiting_approval";
    pub const STORY_COMPLETED: &str = "story.completed";
}

/// Top-level frame discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventChannel {
    WorkflowEvent,
    TaskEvent,
}

/// The frame pushed to WebSocket subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub channel: EventChannel,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a workflow-channel event
    #[must_use]
    pub fn workflow(event: &str, payload: serde_json::Value) -> Self {
        Self {
            channel: EventChannel::WorkflowEvent,
            event: event.to_string(),
            payload,
        }
    }

    /// Build a task-channel event
    #[must_use]
    pub fn task(event: &str, payload: serde_json::Value) -> Self {
        Self {
            channel: EventChannel::TaskEvent,
            event: event.to_string(),
            payload,
        }
    }
}

/// Hub for broadcasting events to connected WebSocket clients
pub struct EventHub {
    /// Per-principal broadcast channels
    channels: RwLock<HashMap<UserId, broadcast::Sender<EventEnvelope>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to events for a principal.
    ///
    /// Creates the channel on first use. Returns a receiver that sees every
    /// event published to this principal from now on.
    pub async fn subscribe(&self, principal_id: UserId) -> broadcast::Receiver<EventEnvelope> {
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(&principal_id) {
            sender.subscribe()
        } else {
            let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
            channels.insert(principal_id, tx);
            rx
        }
    }

    /// Publish an event to a principal's subscribers.
    ///
    /// Best-effort, single-attempt: if the principal has no subscribers the
    /// event is dropped silently.
    pub async fn publish(&self, principal_id: UserId, event: EventEnvelope) {
        let channels = self.channels.read().await;

        if let Some(sender) = channels.get(&principal_id) {
            // Ignore send errors (no receivers)
            let _ = sender.send(event);
        }
    }

    /// Clean up a principal's channel when a connection closes.
    ///
    /// Only removes the channel if there are no remaining receivers.
    pub async fn cleanup(&self, principal_id: UserId) {
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(&principal_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&principal_id);
            }
        }
    }

    /// Count of principals with live channels
    pub async fn subscription_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let hub = EventHub::new();
        let principal = UserId::new();

        let mut rx = hub.subscribe(principal).await;

        hub.publish(
            principal,
            EventEnvelope::workflow(names::STEP_CLAIMED, serde_json::json!({"step": "plan"})),
        )
        .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, names::STEP_CLAIMED);
        assert_eq!(received.channel, EventChannel::WorkflowEvent);
    }

    #[tokio::test]
    async fn test_publish_is_scoped_to_principal() {
        let hub = EventHub::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let mut alice_rx = hub.subscribe(alice).await;
        let mut bob_rx = hub.subscribe(bob).await;

        hub.publish(
            alice,
            EventEnvelope::workflow(names::RUN_CREATED, serde_json::json!({})),
        )
        .await;

        assert!(alice_rx.recv().await.is_ok());
        assert!(matches!(
            bob_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let hub = EventHub::new();
        // no panic, no error
        hub.publish(
            UserId::new(),
            EventEnvelope::workflow(names::RUN_FAILED, serde_json::json!({})),
        )
        .await;
    }

    #[tokio::test]
    async fn test_cleanup_removes_empty_channel() {
        let hub = EventHub::new();
        let principal = UserId::new();

        let rx = hub.subscribe(principal).await;
        drop(rx);

        hub.cleanup(principal).await;
        assert_eq!(hub.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let hub = EventHub::new();
        let principal = UserId::new();
        let mut rx = hub.subscribe(principal).await;

        // overflow the bounded channel
        for i in 0..300 {
            hub.publish(
                principal,
                EventEnvelope::workflow(names::STEP_COMPLETED, serde_json::json!({"n": i})),
            )
            .await;
        }

        // the receiver observes a lag error, then catches up
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope =
            EventEnvelope::workflow(names::RUN_COMPLETED, serde_json::json!({"run_id": "r1"}));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "workflow_event");
        assert_eq!(json["event"], "run.completed");
        assert_eq!(json["payload"]["run_id"], "r1");
    }
}
