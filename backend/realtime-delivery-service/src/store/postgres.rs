use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::{ChatStore, MarkReadOutcome, StoreError};
use crate::models::{
    Chat, ChatParticipant, Message, MessageRead, NewNotification, Notification, NotificationType,
};

const MIGRATION: &str = include_str!("../../migrations/0001_realtime_delivery.sql");

const MESSAGE_COLUMNS: &str = "id, chat_id, author_id, content, created_at, deleted_at";
const NOTIFICATION_COLUMNS: &str =
    "id, user_id, notification_type, payload, is_read, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = database_url.parse()?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| StoreError::Setup(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(max_connections, "postgres store ready");
        Ok(store)
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(MIGRATION).await?;
        Ok(())
    }
}

fn chat_from_row(row: &Row) -> Chat {
    Chat {
        id: row.get("id"),
        title: row.get("title"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    }
}

fn participant_from_row(row: &Row) -> ChatParticipant {
    ChatParticipant {
        chat_id: row.get("chat_id"),
        user_id: row.get("user_id"),
        is_active: row.get("is_active"),
        last_read_at: row.get("last_read_at"),
    }
}

fn message_from_row(row: &Row) -> Message {
    Message {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        author_id: row.get("author_id"),
        content: row.get("content"),
        created_at: row.get("created_at"),
        deleted_at: row.get("deleted_at"),
    }
}

fn notification_from_row(row: &Row) -> Result<Notification, StoreError> {
    let kind: String = row.get("notification_type");
    Ok(Notification {
        id: row.get("id"),
        user_id: row.get("user_id"),
        notification_type: kind
            .parse::<NotificationType>()
            .map_err(StoreError::InvalidRow)?,
        payload: row.get("payload"),
        is_read: row.get("is_read"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl ChatStore for PgStore {
    async fn create_chat(
        &self,
        created_by: Uuid,
        title: Option<String>,
        participants: &[Uuid],
    ) -> Result<Chat, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_one(
                r#"
                INSERT INTO chats (id, title, created_by)
                VALUES ($1, $2, $3)
                RETURNING id, title, created_by, created_at
                "#,
                &[&Uuid::new_v4(), &title, &created_by],
            )
            .await?;
        let chat = chat_from_row(&row);

        tx.execute(
            r#"
            INSERT INTO chat_participants (chat_id, user_id)
            SELECT $1, unnest($2::uuid[])
            ON CONFLICT (chat_id, user_id) DO NOTHING
            "#,
            &[&chat.id, &participants],
        )
        .await?;

        tx.commit().await?;
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: Uuid) -> Result<Option<Chat>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, title, created_by, created_at FROM chats WHERE id = $1",
                &[&chat_id],
            )
            .await?;
        Ok(row.as_ref().map(chat_from_row))
    }

    async fn chats_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Chat, ChatParticipant)>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT c.id, c.title, c.created_by, c.created_at,
                       p.chat_id, p.user_id, p.is_active, p.last_read_at
                FROM chat_participants p
                JOIN chats c ON c.id = p.chat_id
                WHERE p.user_id = $1 AND p.is_active
                ORDER BY c.created_at DESC
                "#,
                &[&user_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| (chat_from_row(row), participant_from_row(row)))
            .collect())
    }

    async fn get_participant(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChatParticipant>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT chat_id, user_id, is_active, last_read_at
                FROM chat_participants
                WHERE chat_id = $1 AND user_id = $2
                "#,
                &[&chat_id, &user_id],
            )
            .await?;
        Ok(row.as_ref().map(participant_from_row))
    }

    async fn active_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT user_id FROM chat_participants WHERE chat_id = $1 AND is_active ORDER BY joined_at",
                &[&chat_id],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get("user_id")).collect())
    }

    async fn insert_message(
        &self,
        chat_id: Uuid,
        author_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO messages (id, chat_id, author_id, content) \
                     VALUES ($1, $2, $3, $4) RETURNING {MESSAGE_COLUMNS}"
                ),
                &[&Uuid::new_v4(), &chat_id, &author_id, &content],
            )
            .await?;
        Ok(message_from_row(&row))
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"),
                &[&message_id],
            )
            .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    async fn list_messages(
        &self,
        chat_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE chat_id = $1 AND ($2::timestamptz IS NULL OR created_at < $2) \
                     ORDER BY created_at DESC, id DESC LIMIT $3"
                ),
                &[&chat_id, &before, &limit],
            )
            .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn soft_delete_message(
        &self,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE messages SET deleted_at = $2 \
                     WHERE id = $1 AND deleted_at IS NULL RETURNING {MESSAGE_COLUMNS}"
                ),
                &[&message_id, &deleted_at],
            )
            .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    async fn mark_read(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_ids: &[Uuid],
        read_at: DateTime<Utc>,
    ) -> Result<MarkReadOutcome, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let rows = tx
            .query(
                "SELECT id, created_at FROM messages WHERE chat_id = $1 AND id = ANY($2)",
                &[&chat_id, &message_ids],
            )
            .await?;
        let valid: Vec<Uuid> = rows.iter().map(|row| row.get("id")).collect();
        let latest: Option<DateTime<Utc>> =
            rows.iter().map(|row| row.get::<_, DateTime<Utc>>("created_at")).max();

        let inserted = tx
            .execute(
                r#"
                INSERT INTO message_reads (message_id, user_id, read_at)
                SELECT unnest($1::uuid[]), $2, $3
                ON CONFLICT (message_id, user_id) DO NOTHING
                "#,
                &[&valid, &user_id, &read_at],
            )
            .await?;

        // GREATEST ignores NULL, so the marker only ever moves forward.
        let row = tx
            .query_opt(
                r#"
                UPDATE chat_participants
                SET last_read_at = GREATEST(last_read_at, $3)
                WHERE chat_id = $1 AND user_id = $2
                RETURNING last_read_at
                "#,
                &[&chat_id, &user_id, &latest],
            )
            .await?;

        tx.commit().await?;
        Ok(MarkReadOutcome {
            message_ids: valid,
            inserted,
            last_read_at: row.and_then(|r| r.get("last_read_at")),
        })
    }

    async fn message_reads(&self, message_id: Uuid) -> Result<Vec<MessageRead>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT message_id, user_id, read_at FROM message_reads WHERE message_id = $1 ORDER BY read_at",
                &[&message_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| MessageRead {
                message_id: row.get("message_id"),
                user_id: row.get("user_id"),
                read_at: row.get("read_at"),
            })
            .collect())
    }

    async fn count_unread(&self, chat_id: Uuid, user_id: Uuid) -> Result<i64, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS unread
                FROM messages m
                LEFT JOIN chat_participants p
                  ON p.chat_id = m.chat_id AND p.user_id = $2
                WHERE m.chat_id = $1
                  AND m.author_id <> $2
                  AND m.deleted_at IS NULL
                  AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)
                "#,
                &[&chat_id, &user_id],
            )
            .await?;
        Ok(row.get("unread"))
    }

    async fn insert_notification(&self, new: &NewNotification) -> Result<Notification, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO notifications (id, user_id, notification_type, payload) \
                     VALUES ($1, $2, $3, $4) RETURNING {NOTIFICATION_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &new.user_id,
                    &new.notification_type.as_str(),
                    &new.payload,
                ],
            )
            .await?;
        notification_from_row(&row)
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
                     WHERE user_id = $1 AND (NOT $2 OR NOT is_read) \
                     ORDER BY created_at DESC LIMIT $3"
                ),
                &[&user_id, &unread_only, &limit],
            )
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS unread FROM notifications WHERE user_id = $1 AND NOT is_read",
                &[&user_id],
            )
            .await?;
        Ok(row.get("unread"))
    }

    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2 RETURNING id",
                &[&notification_id, &user_id],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND NOT is_read RETURNING id",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn delete_notification(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM notifications WHERE id = $1 AND user_id = $2",
                &[&notification_id, &user_id],
            )
            .await?;
        Ok(deleted > 0)
    }
}
