use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::{publish_after_commit, UnreadCache};
use crate::error::{AppError, AppResult};
use crate::fanout::{FanoutBridge, FanoutPayload};
use crate::models::{ChatParticipant, Message, ReadReceipt, MAX_MESSAGE_LENGTH};
use crate::store::ChatStore;
use crate::topic::Topic;

pub const MAX_PAGE_SIZE: i64 = 100;
const MAX_READ_BATCH: usize = 500;

#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn ChatStore>,
    bridge: Arc<FanoutBridge>,
    unread: UnreadCache,
}

impl MessageService {
    pub fn new(store: Arc<dyn ChatStore>, bridge: Arc<FanoutBridge>, unread: UnreadCache) -> Self {
        Self {
            store,
            bridge,
            unread,
        }
    }

    /// Unknown chat is `NotFound`; known chat without active membership is
    /// `Forbidden`.
    pub async fn require_participant(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<ChatParticipant> {
        match self.store.get_participant(chat_id, user_id).await? {
            Some(p) if p.is_active => Ok(p),
            Some(_) => Err(AppError::Forbidden("not an active participant".into())),
            None => match self.store.get_chat(chat_id).await? {
                Some(_) => Err(AppError::Forbidden("not a chat participant".into())),
                None => Err(AppError::NotFound("chat")),
            },
        }
    }

    #[tracing::instrument(skip(self, content), fields(chat_id = %chat_id, user_id = %sender_id))]
    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::BadRequest("message content is empty".into()));
        }
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(AppError::BadRequest(format!(
                "message content exceeds {MAX_MESSAGE_LENGTH} characters"
            )));
        }

        self.require_participant(chat_id, sender_id).await?;
        let message = self.store.insert_message(chat_id, sender_id, content).await?;
        tracing::debug!(message_id = %message.id, "message persisted");

        publish_after_commit(
            &self.bridge,
            Topic::Chat(chat_id),
            FanoutPayload::MessageCreated(message.clone()),
        )
        .await;
        Ok(message)
    }

    pub async fn list_messages(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Message>> {
        self.require_participant(chat_id, user_id).await?;
        let limit = limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
        let messages = self.store.list_messages(chat_id, before, limit).await?;
        Ok(messages.into_iter().map(Message::redacted).collect())
    }

    pub async fn get_message(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<Message> {
        self.require_participant(chat_id, user_id).await?;
        self.store
            .get_message(message_id)
            .await?
            .filter(|m| m.chat_id == chat_id)
            .map(Message::redacted)
            .ok_or(AppError::NotFound("message"))
    }

    /// Soft delete; only the author may delete.
    #[tracing::instrument(skip(self), fields(chat_id = %chat_id, user_id = %user_id))]
    pub async fn delete_message(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<Message> {
        self.require_participant(chat_id, user_id).await?;
        let existing = self
            .store
            .get_message(message_id)
            .await?
            .filter(|m| m.chat_id == chat_id)
            .ok_or(AppError::NotFound("message"))?;
        if existing.author_id != user_id {
            return Err(AppError::Forbidden("only the author may delete a message".into()));
        }
        if existing.is_deleted() {
            return Ok(existing.redacted());
        }

        let Some(deleted) = self.store.soft_delete_message(message_id, Utc::now()).await? else {
            // Lost a race with another delete.
            return self.get_message(chat_id, user_id, message_id).await;
        };
        let deleted_at = deleted.deleted_at.unwrap_or_else(Utc::now);
        self.unread.invalidate_chat(chat_id);

        publish_after_commit(
            &self.bridge,
            Topic::Chat(chat_id),
            FanoutPayload::MessageDeleted {
                chat_id,
                message_id,
                deleted_at,
            },
        )
        .await;
        Ok(deleted.redacted())
    }

    /// Record reads and publish a receipt. Repeated ids are absorbed.
    #[tracing::instrument(skip(self, message_ids), fields(chat_id = %chat_id, user_id = %user_id, count = message_ids.len()))]
    pub async fn mark_read(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_ids: &[Uuid],
    ) -> AppResult<ReadReceipt> {
        if message_ids.is_empty() {
            return Err(AppError::BadRequest("messageIds must not be empty".into()));
        }
        if message_ids.len() > MAX_READ_BATCH {
            return Err(AppError::BadRequest(format!(
                "at most {MAX_READ_BATCH} messageIds per call"
            )));
        }

        self.require_participant(chat_id, user_id).await?;
        let read_at = Utc::now();
        let outcome = self
            .store
            .mark_read(chat_id, user_id, message_ids, read_at)
            .await?;
        if outcome.message_ids.is_empty() {
            return Err(AppError::NotFound("message"));
        }
        self.unread.invalidate(chat_id, user_id).await;

        let receipt = ReadReceipt {
            chat_id,
            user_id,
            message_ids: outcome.message_ids,
            last_read_at: outcome.last_read_at,
            read_at,
        };
        tracing::debug!(inserted = outcome.inserted, "reads recorded");

        publish_after_commit(
            &self.bridge,
            Topic::Chat(chat_id),
            FanoutPayload::ReadReceipt(receipt.clone()),
        )
        .await;
        Ok(receipt)
    }

    pub async fn unread_count(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        self.require_participant(chat_id, user_id).await?;
        Ok(self
            .unread
            .get_or_count(self.store.as_ref(), chat_id, user_id)
            .await?)
    }

    /// Relay a typing indicator. Nothing is persisted.
    pub async fn typing(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<()> {
        self.bridge
            .publish(Topic::Chat(chat_id), FanoutPayload::Typing { chat_id, user_id })
            .await
            .map(|_| ())
            .or_else(|e| {
                tracing::debug!(chat_id = %chat_id, error = %e, "typing indicator not broadcast");
                Ok(())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use crate::fanout::MemoryBackbone;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn service() -> (MessageService, Arc<MemoryStore>, MemoryBackbone) {
        let store = Arc::new(MemoryStore::new());
        let backbone = MemoryBackbone::default();
        let bridge = FanoutBridge::new(
            Arc::new(backbone.clone()),
            Uuid::new_v4(),
            FanoutConfig::default(),
        );
        let svc = MessageService::new(
            store.clone(),
            bridge,
            UnreadCache::new(Duration::from_secs(60)),
        );
        (svc, store, backbone)
    }

    #[tokio::test]
    async fn outsiders_and_unknown_chats_are_rejected() {
        let (svc, store, _) = service();
        let (alice, bob, eve) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let chat = store.create_chat(alice, None, &[alice, bob]).await.unwrap();

        let err = svc.send_message(chat.id, eve, "hi").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = svc.send_message(Uuid::new_v4(), alice, "hi").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound("chat")));

        store.deactivate_participant(chat.id, bob).await;
        let err = svc.send_message(chat.id, bob, "hi").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn content_is_trimmed_and_bounded() {
        let (svc, store, _) = service();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = store.create_chat(alice, None, &[alice, bob]).await.unwrap();

        let sent = svc.send_message(chat.id, alice, "  hello  ").await.unwrap();
        assert_eq!(sent.content, "hello");

        assert!(matches!(
            svc.send_message(chat.id, alice, "   ").await,
            Err(AppError::BadRequest(_))
        ));
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(matches!(
            svc.send_message(chat.id, alice, &long).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn persist_succeeds_when_backbone_is_down() {
        let (svc, store, backbone) = service();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = store.create_chat(alice, None, &[alice, bob]).await.unwrap();

        backbone.set_available(false);
        let sent = svc.send_message(chat.id, alice, "still saved").await.unwrap();
        assert_eq!(
            svc.get_message(chat.id, bob, sent.id).await.unwrap().content,
            "still saved"
        );
    }

    #[tokio::test]
    async fn only_the_author_deletes_and_content_is_redacted() {
        let (svc, store, _) = service();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = store.create_chat(alice, None, &[alice, bob]).await.unwrap();
        let sent = svc.send_message(chat.id, alice, "secret").await.unwrap();

        assert!(matches!(
            svc.delete_message(chat.id, bob, sent.id).await,
            Err(AppError::Forbidden(_))
        ));
        let deleted = svc.delete_message(chat.id, alice, sent.id).await.unwrap();
        assert!(deleted.is_deleted());
        assert!(deleted.content.is_empty());

        let listed = svc.list_messages(chat.id, bob, None, None).await.unwrap();
        assert!(listed[0].content.is_empty());
        assert_eq!(svc.unread_count(chat.id, bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_read_clears_unread_and_is_idempotent() {
        let (svc, store, _) = service();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = store.create_chat(alice, None, &[alice, bob]).await.unwrap();
        let m1 = svc.send_message(chat.id, alice, "one").await.unwrap();
        let m2 = svc.send_message(chat.id, alice, "two").await.unwrap();

        assert_eq!(svc.unread_count(chat.id, bob).await.unwrap(), 2);

        let receipt = svc.mark_read(chat.id, bob, &[m1.id]).await.unwrap();
        assert_eq!(receipt.last_read_at, Some(m1.created_at));
        assert_eq!(svc.unread_count(chat.id, bob).await.unwrap(), 1);

        svc.mark_read(chat.id, bob, &[m2.id]).await.unwrap();
        svc.mark_read(chat.id, bob, &[m2.id]).await.unwrap();
        assert_eq!(svc.unread_count(chat.id, bob).await.unwrap(), 0);
        assert_eq!(store.message_reads(m2.id).await.unwrap().len(), 1);

        assert!(matches!(
            svc.mark_read(chat.id, bob, &[]).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            svc.mark_read(chat.id, bob, &[Uuid::new_v4()]).await,
            Err(AppError::NotFound("message"))
        ));
    }
}
