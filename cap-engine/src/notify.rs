//! Notification sink for tier upgrades

use async_trait::async_trait;
use cap_common::events::{EngineEvent, EventBus};
use cap_common::{CapLevel, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Kind of user notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    TierUpgrade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierUpgrade {
    pub from: CapLevel,
    pub to: CapLevel,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub payload: TierUpgrade,
}

impl Notification {
    pub fn tier_upgrade(user_id: Uuid, from: CapLevel, to: CapLevel) -> Self {
        Self {
            user_id,
            kind: NotificationKind::TierUpgrade,
            payload: TierUpgrade {
                from,
                to,
                evaluated_at: cap_common::time::now(),
            },
        }
    }
}

/// Best-effort delivery of user notifications
///
/// Callers bound each call with a timeout and only log failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Publishes tier upgrades on the engine event bus
#[derive(Clone)]
pub struct EventBusNotifier {
    event_bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

#[async_trait]
impl Notifier for EventBusNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification.kind {
            NotificationKind::TierUpgrade => {
                self.event_bus.emit_lossy(EngineEvent::TierUpgraded {
                    user_id: notification.user_id,
                    from: notification.payload.from,
                    to: notification.payload.to,
                    timestamp: notification.payload.evaluated_at,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upgrade_published_on_bus() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let notifier = EventBusNotifier::new(bus);
        let user = Uuid::new_v4();

        notifier
            .notify(&Notification::tier_upgrade(user, CapLevel::Green, CapLevel::Yellow))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::TierUpgraded { user_id, from, to, .. } => {
                assert_eq!(user_id, user);
                assert_eq!(from, CapLevel::Green);
                assert_eq!(to, CapLevel::Yellow);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_kind_wire_name() {
        assert_eq!(
            serde_json::to_value(NotificationKind::TierUpgrade).unwrap(),
            serde_json::json!("TIER_UPGRADE")
        );
    }
}
