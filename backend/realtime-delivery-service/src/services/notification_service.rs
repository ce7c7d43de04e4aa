use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::publish_after_commit;
use crate::error::{AppError, AppResult};
use crate::fanout::{FanoutBridge, FanoutPayload};
use crate::models::{NewNotification, Notification};
use crate::store::ChatStore;
use crate::topic::Topic;
use error_types::error_codes;

pub const MAX_BULK_NOTIFICATIONS: usize = 100;
const MAX_LIST_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    /// Position of the entry in the request
    pub index: usize,
    pub code: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCreateOutcome {
    pub created: usize,
    pub notifications: Vec<Notification>,
    pub failures: Vec<BulkFailure>,
}

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn ChatStore>,
    bridge: Arc<FanoutBridge>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn ChatStore>, bridge: Arc<FanoutBridge>) -> Self {
        Self { store, bridge }
    }

    #[tracing::instrument(skip(self, new), fields(user_id = %new.user_id, kind = new.notification_type.as_str()))]
    pub async fn create(&self, new: NewNotification) -> AppResult<Notification> {
        new.validate().map_err(AppError::BadRequest)?;
        let notification = self.store.insert_notification(&new).await?;

        publish_after_commit(
            &self.bridge,
            Topic::Notifications(notification.user_id),
            FanoutPayload::NotificationCreated(notification.clone()),
        )
        .await;
        Ok(notification)
    }

    /// Each entry is parsed, validated and persisted on its own; one bad
    /// entry never fails the batch.
    pub async fn create_bulk(&self, entries: Vec<serde_json::Value>) -> AppResult<BulkCreateOutcome> {
        if entries.is_empty() || entries.len() > MAX_BULK_NOTIFICATIONS {
            return Err(AppError::BadRequest(format!(
                "bulk create accepts 1 to {MAX_BULK_NOTIFICATIONS} notifications"
            )));
        }

        let mut outcome = BulkCreateOutcome {
            created: 0,
            notifications: Vec::with_capacity(entries.len()),
            failures: Vec::new(),
        };

        for (index, entry) in entries.into_iter().enumerate() {
            let new = match serde_json::from_value::<NewNotification>(entry) {
                Ok(new) => new,
                Err(e) => {
                    outcome.failures.push(BulkFailure {
                        index,
                        code: error_codes::INVALID_REQUEST,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match self.create(new).await {
                Ok(notification) => outcome.notifications.push(notification),
                Err(e) => outcome.failures.push(BulkFailure {
                    index,
                    code: e.code(),
                    error: e.to_string(),
                }),
            }
        }

        outcome.created = outcome.notifications.len();
        if !outcome.failures.is_empty() {
            tracing::warn!(
                created = outcome.created,
                failed = outcome.failures.len(),
                "bulk notification create partially failed"
            );
        }
        Ok(outcome)
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: Option<i64>,
    ) -> AppResult<Vec<Notification>> {
        let limit = limit.unwrap_or(50).clamp(1, MAX_LIST_SIZE);
        Ok(self
            .store
            .list_notifications(user_id, unread_only, limit)
            .await?)
    }

    pub async fn unread_count(&self, user_id: Uuid) -> AppResult<i64> {
        Ok(self.store.count_unread_notifications(user_id).await?)
    }

    pub async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> AppResult<()> {
        if !self
            .store
            .mark_notification_read(user_id, notification_id)
            .await?
        {
            return Err(AppError::NotFound("notification"));
        }

        publish_after_commit(
            &self.bridge,
            Topic::Notifications(user_id),
            FanoutPayload::NotificationRead {
                notification_ids: vec![notification_id],
                all: false,
            },
        )
        .await;
        Ok(())
    }

    /// Returns how many notifications flipped to read.
    pub async fn mark_all_read(&self, user_id: Uuid) -> AppResult<usize> {
        let flipped = self.store.mark_all_notifications_read(user_id).await?;
        let count = flipped.len();
        if count > 0 {
            publish_after_commit(
                &self.bridge,
                Topic::Notifications(user_id),
                FanoutPayload::NotificationRead {
                    notification_ids: flipped,
                    all: true,
                },
            )
            .await;
        }
        Ok(count)
    }

    pub async fn delete(&self, user_id: Uuid, notification_id: Uuid) -> AppResult<()> {
        if !self
            .store
            .delete_notification(user_id, notification_id)
            .await?
        {
            return Err(AppError::NotFound("notification"));
        }

        publish_after_commit(
            &self.bridge,
            Topic::Notifications(user_id),
            FanoutPayload::NotificationDeleted { notification_id },
        )
        .await;
        Ok(())
    }
}
