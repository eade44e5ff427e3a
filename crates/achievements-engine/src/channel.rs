use std::sync::Arc;

use achievements_core::{
    AchievementCatalog, NotificationItem, NotificationQueue, PendingNotification, ProgressKey,
    UserId,
};
use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    Notifications,
}

/// Value of the `achievements` heartbeat request key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AchievementsPoll {
    #[serde(rename = "type")]
    pub kind: PollKind,
}

impl AchievementsPoll {
    #[must_use]
    pub fn notifications() -> Self {
        Self {
            kind: PollKind::Notifications,
        }
    }
}

/// Heartbeat payload from a client. Keys owned by other host features pass
/// through untouched in `other`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achievements: Option<AchievementsPoll>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl HeartbeatRequest {
    #[must_use]
    pub fn polling() -> Self {
        Self {
            achievements: Some(AchievementsPoll::notifications()),
            other: Map::new(),
        }
    }
}

/// The `achievements` key is omitted when there is nothing new.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achievements: Option<Vec<NotificationItem>>,
}

/// Server side of the heartbeat exchange.
pub struct NotificationChannel {
    queue: Arc<dyn NotificationQueue>,
    catalog: Arc<dyn AchievementCatalog>,
}

impl NotificationChannel {
    #[must_use]
    pub fn new(queue: Arc<dyn NotificationQueue>, catalog: Arc<dyn AchievementCatalog>) -> Self {
        Self { queue, catalog }
    }

    /// Drains the user's queue when the request carries the `achievements`
    /// key. Drained items are gone once the response is built, even if it
    /// never reaches the client.
    ///
    /// # Errors
    /// Returns the queue or catalog error. On a catalog error the drained
    /// items are put back for the next poll.
    pub fn handle_heartbeat(
        &self,
        user_id: UserId,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        if request.achievements.is_none() {
            return Ok(HeartbeatResponse::default());
        }

        let drained = self.queue.drain(user_id)?;
        let items = match self.notification_items(user_id, &drained) {
            Ok(items) => items,
            Err(err) => {
                self.restore(&drained);
                return Err(err);
            }
        };

        debug!(user_id = %user_id, delivered = items.len(), "heartbeat served");
        if items.is_empty() {
            return Ok(HeartbeatResponse::default());
        }
        Ok(HeartbeatResponse {
            achievements: Some(items),
        })
    }

    fn notification_items(
        &self,
        user_id: UserId,
        drained: &[PendingNotification],
    ) -> Result<Vec<NotificationItem>> {
        let mut items = Vec::with_capacity(drained.len());
        for pending in drained {
            match self.catalog.get_achievement(pending.achievement_id)? {
                Some(achievement) => items.push(achievement.notification_item()),
                None => warn!(
                    user_id = %user_id,
                    achievement_id = %pending.achievement_id,
                    "dropping notification for unknown achievement"
                ),
            }
        }
        Ok(items)
    }

    fn restore(&self, drained: &[PendingNotification]) {
        for pending in drained {
            if let Err(err) = self.queue.enqueue(pending) {
                error!(
                    key = %pending.key(),
                    error = %err,
                    "failed to requeue undelivered notification"
                );
            }
        }
    }
}

/// Process-local queue; contents do not survive a restart.
#[derive(Default)]
pub struct MemoryNotificationQueue {
    queues: DashMap<UserId, Vec<PendingNotification>>,
}

impl MemoryNotificationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationQueue for MemoryNotificationQueue {
    fn enqueue(&self, notification: &PendingNotification) -> Result<()> {
        let mut queue = self.queues.entry(notification.user_id).or_default();
        if queue
            .iter()
            .any(|queued| queued.achievement_id == notification.achievement_id)
        {
            debug!(key = %notification.key(), "notification already queued");
            return Ok(());
        }
        queue.push(notification.clone());
        Ok(())
    }

    fn pending(&self, user_id: UserId) -> Result<Vec<PendingNotification>> {
        Ok(self
            .queues
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    fn drain(&self, user_id: UserId) -> Result<Vec<PendingNotification>> {
        Ok(self
            .queues
            .remove(&user_id)
            .map(|(_, queued)| queued)
            .unwrap_or_default())
    }

    fn cancel(&self, key: ProgressKey) -> Result<usize> {
        let Some(mut queue) = self.queues.get_mut(&key.user_id) else {
            return Ok(0);
        };
        let before = queue.len();
        queue.retain(|queued| queued.achievement_id != key.achievement_id);
        Ok(before - queue.len())
    }
}
