//! Event types for the cap engine event system
//!
//! Provides the shared `EngineEvent` enum and the `EventBus` broadcast channel.
//! Events are serialized for SSE transmission with a `type` tag.

use crate::CapLevel;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Engine event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// A user's cap level was raised by an evaluation
    TierUpgraded {
        user_id: Uuid,
        from: CapLevel,
        to: CapLevel,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A scheduler tick enqueued evaluation batches
    EvaluationCycleScheduled {
        cycle_id: Uuid,
        user_count: usize,
        batch_count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A worker finished one evaluation batch
    BatchEvaluated {
        batch_id: Uuid,
        evaluated: usize,
        upgraded: usize,
        skipped: usize,
        failed: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A listing's budget was distributed to post authors
    RevenueDistributed {
        listing_id: Uuid,
        post_count: usize,
        total: Decimal,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::TierUpgraded { .. } => "TierUpgraded",
            EngineEvent::EvaluationCycleScheduled { .. } => "EvaluationCycleScheduled",
            EngineEvent::BatchEvaluated { .. } => "BatchEvaluated",
            EngineEvent::RevenueDistributed { .. } => "RevenueDistributed",
        }
    }
}

/// Broadcast bus for engine events
///
/// Cloning shares the underlying channel. Slow subscribers lose the oldest
/// events once the capacity is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; having no subscribers is not an error
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let user_id = Uuid::new_v4();

        bus.emit_lossy(EngineEvent::TierUpgraded {
            user_id,
            from: CapLevel::Green,
            to: CapLevel::Yellow,
            timestamp: chrono::Utc::now(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::TierUpgraded { user_id: got, to, .. } => {
                assert_eq!(got, user_id);
                assert_eq!(to, CapLevel::Yellow);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        let event = EngineEvent::BatchEvaluated {
            batch_id: Uuid::new_v4(),
            evaluated: 1,
            upgraded: 0,
            skipped: 0,
            failed: 0,
            timestamp: chrono::Utc::now(),
        };
        bus.emit_lossy(event);
    }

    #[test]
    fn test_serialization_is_type_tagged() {
        let event = EngineEvent::RevenueDistributed {
            listing_id: Uuid::nil(),
            post_count: 5,
            total: Decimal::new(26, 0),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RevenueDistributed");
        assert_eq!(json["total"], "26");
        assert_eq!(event.event_type(), "RevenueDistributed");
    }
}
