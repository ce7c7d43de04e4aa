//! Relational store access.
//!
//! The store is the source of truth for chats, messages, reads and
//! notifications. [`PgStore`] backs production; [`MemoryStore`] has the
//! same semantics for single-node development and tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Chat, ChatParticipant, Message, MessageRead, NewNotification, Notification};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("pool setup error: {0}")]
    Setup(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Result of recording reads for one user in one chat.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkReadOutcome {
    /// Ids that belong to the chat, whether newly recorded or not
    pub message_ids: Vec<Uuid>,
    /// Rows actually inserted; repeats insert nothing
    pub inserted: u64,
    /// Participant's read marker after the update
    pub last_read_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Create a chat with `participants` (creator included) as active members.
    async fn create_chat(
        &self,
        created_by: Uuid,
        title: Option<String>,
        participants: &[Uuid],
    ) -> Result<Chat, StoreError>;

    async fn get_chat(&self, chat_id: Uuid) -> Result<Option<Chat>, StoreError>;

    /// Chats where the user is an active participant, newest first.
    async fn chats_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Chat, ChatParticipant)>, StoreError>;

    async fn get_participant(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChatParticipant>, StoreError>;

    async fn active_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    async fn insert_message(
        &self,
        chat_id: Uuid,
        author_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError>;

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Newest first, optionally strictly before `before`.
    async fn list_messages(
        &self,
        chat_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    /// Returns the message if it was deleted by this call.
    async fn soft_delete_message(
        &self,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError>;

    /// Record reads idempotently and advance `last_read_at` monotonically,
    /// atomically. Ids outside the chat are ignored.
    async fn mark_read(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_ids: &[Uuid],
        read_at: DateTime<Utc>,
    ) -> Result<MarkReadOutcome, StoreError>;

    async fn message_reads(&self, message_id: Uuid) -> Result<Vec<MessageRead>, StoreError>;

    /// Messages after the user's read marker, authored by someone else and
    /// not deleted.
    async fn count_unread(&self, chat_id: Uuid, user_id: Uuid) -> Result<i64, StoreError>;

    async fn insert_notification(&self, new: &NewNotification) -> Result<Notification, StoreError>;

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError>;

    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, StoreError>;

    /// False when the notification does not exist or is not the user's.
    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Returns the ids that flipped to read.
    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    async fn delete_notification(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, StoreError>;
}
