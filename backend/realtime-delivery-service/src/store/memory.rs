use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChatStore, MarkReadOutcome, StoreError};
use crate::models::{
    Chat, ChatParticipant, Message, MessageRead, NewNotification, Notification,
};

#[derive(Default)]
struct State {
    chats: HashMap<Uuid, Chat>,
    /// Insertion order is join order
    participants: HashMap<Uuid, Vec<ChatParticipant>>,
    messages: HashMap<Uuid, Message>,
    reads: HashMap<Uuid, Vec<MessageRead>>,
    read_keys: HashSet<(Uuid, Uuid)>,
    notifications: HashMap<Uuid, Notification>,
    last_message_at: Option<DateTime<Utc>>,
}

impl State {
    fn participant_mut(&mut self, chat_id: Uuid, user_id: Uuid) -> Option<&mut ChatParticipant> {
        self.participants
            .get_mut(&chat_id)?
            .iter_mut()
            .find(|p| p.user_id == user_id)
    }

    /// Message timestamps are strictly increasing, like `clock_timestamp()`.
    fn next_message_time(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_message_at {
            if now <= last {
                now = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_message_at = Some(now);
        now
    }
}

/// In-process store with the same semantics as [`super::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message with an explicit timestamp. Used for fixtures.
    pub async fn seed_message(
        &self,
        chat_id: Uuid,
        author_id: Uuid,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            chat_id,
            author_id,
            content: content.to_string(),
            created_at,
            deleted_at: None,
        };
        let mut state = self.state.lock().await;
        state.messages.insert(message.id, message.clone());
        message
    }

    /// Mark a participant inactive without removing history.
    pub async fn deactivate_participant(&self, chat_id: Uuid, user_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.participant_mut(chat_id, user_id) {
            Some(p) => {
                p.is_active = false;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_chat(
        &self,
        created_by: Uuid,
        title: Option<String>,
        participants: &[Uuid],
    ) -> Result<Chat, StoreError> {
        let chat = Chat {
            id: Uuid::new_v4(),
            title,
            created_by,
            created_at: Utc::now(),
        };

        let mut seen = HashSet::new();
        let members = participants
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|user_id| ChatParticipant {
                chat_id: chat.id,
                user_id: *user_id,
                is_active: true,
                last_read_at: None,
            })
            .collect();

        let mut state = self.state.lock().await;
        state.chats.insert(chat.id, chat.clone());
        state.participants.insert(chat.id, members);
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: Uuid) -> Result<Option<Chat>, StoreError> {
        Ok(self.state.lock().await.chats.get(&chat_id).cloned())
    }

    async fn chats_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Chat, ChatParticipant)>, StoreError> {
        let state = self.state.lock().await;
        let mut chats: Vec<(Chat, ChatParticipant)> = state
            .participants
            .values()
            .flatten()
            .filter(|p| p.user_id == user_id && p.is_active)
            .filter_map(|p| state.chats.get(&p.chat_id).map(|c| (c.clone(), p.clone())))
            .collect();
        chats.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        Ok(chats)
    }

    async fn get_participant(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChatParticipant>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .participants
            .get(&chat_id)
            .and_then(|ps| ps.iter().find(|p| p.user_id == user_id))
            .cloned())
    }

    async fn active_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .participants
            .get(&chat_id)
            .map(|ps| ps.iter().filter(|p| p.is_active).map(|p| p.user_id).collect())
            .unwrap_or_default())
    }

    async fn insert_message(
        &self,
        chat_id: Uuid,
        author_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut state = self.state.lock().await;
        let message = Message {
            id: Uuid::new_v4(),
            chat_id,
            author_id,
            content: content.to_string(),
            created_at: state.next_message_time(),
            deleted_at: None,
        };
        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.state.lock().await.messages.get(&message_id).cloned())
    }

    async fn list_messages(
        &self,
        chat_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        messages.truncate(limit.max(0) as usize);
        Ok(messages)
    }

    async fn soft_delete_message(
        &self,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let mut state = self.state.lock().await;
        match state.messages.get_mut(&message_id) {
            Some(m) if m.deleted_at.is_none() => {
                m.deleted_at = Some(deleted_at);
                Ok(Some(m.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_read(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_ids: &[Uuid],
        read_at: DateTime<Utc>,
    ) -> Result<MarkReadOutcome, StoreError> {
        let mut state = self.state.lock().await;

        let mut valid = Vec::new();
        let mut latest: Option<DateTime<Utc>> = None;
        for id in message_ids {
            if let Some(m) = state.messages.get(id).filter(|m| m.chat_id == chat_id) {
                if !valid.contains(id) {
                    valid.push(*id);
                    latest = latest.max(Some(m.created_at));
                }
            }
        }

        let mut inserted = 0;
        for id in &valid {
            if state.read_keys.insert((*id, user_id)) {
                state.reads.entry(*id).or_default().push(MessageRead {
                    message_id: *id,
                    user_id,
                    read_at,
                });
                inserted += 1;
            }
        }

        let last_read_at = match state.participant_mut(chat_id, user_id) {
            Some(p) => {
                p.last_read_at = p.last_read_at.max(latest);
                p.last_read_at
            }
            None => None,
        };

        Ok(MarkReadOutcome {
            message_ids: valid,
            inserted,
            last_read_at,
        })
    }

    async fn message_reads(&self, message_id: Uuid) -> Result<Vec<MessageRead>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.reads.get(&message_id).cloned().unwrap_or_default())
    }

    async fn count_unread(&self, chat_id: Uuid, user_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let marker = state
            .participants
            .get(&chat_id)
            .and_then(|ps| ps.iter().find(|p| p.user_id == user_id))
            .and_then(|p| p.last_read_at);
        let count = state
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id && m.author_id != user_id && !m.is_deleted())
            .filter(|m| marker.map_or(true, |at| m.created_at > at))
            .count();
        Ok(count as i64)
    }

    async fn insert_notification(&self, new: &NewNotification) -> Result<Notification, StoreError> {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            notification_type: new.notification_type,
            payload: new.payload.clone(),
            is_read: false,
            created_at: Utc::now(),
        };
        let mut state = self.state.lock().await;
        state
            .notifications
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock().await;
        let mut list: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && (!unread_only || !n.is_read))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as i64)
    }

    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.notifications.get_mut(&notification_id) {
            Some(n) if n.user_id == user_id => {
                n.is_read = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        let mut flipped = Vec::new();
        for n in state.notifications.values_mut() {
            if n.user_id == user_id && !n.is_read {
                n.is_read = true;
                flipped.push(n.id);
            }
        }
        Ok(flipped)
    }

    async fn delete_notification(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let owned = state
            .notifications
            .get(&notification_id)
            .is_some_and(|n| n.user_id == user_id);
        if owned {
            state.notifications.remove(&notification_id);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;
    use serde_json::json;

    async fn chat_with(store: &MemoryStore, users: &[Uuid]) -> Chat {
        store.create_chat(users[0], None, users).await.unwrap()
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_ignores_foreign_ids() {
        let store = MemoryStore::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = chat_with(&store, &[alice, bob]).await;
        let other = chat_with(&store, &[alice, bob]).await;

        let m1 = store.insert_message(chat.id, alice, "one").await.unwrap();
        let foreign = store.insert_message(other.id, alice, "elsewhere").await.unwrap();

        let first = store
            .mark_read(chat.id, bob, &[m1.id, foreign.id, m1.id], Utc::now())
            .await
            .unwrap();
        assert_eq!(first.message_ids, vec![m1.id]);
        assert_eq!(first.inserted, 1);
        assert_eq!(first.last_read_at, Some(m1.created_at));

        let again = store.mark_read(chat.id, bob, &[m1.id], Utc::now()).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(store.message_reads(m1.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_marker_never_moves_backwards() {
        let store = MemoryStore::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = chat_with(&store, &[alice, bob]).await;
        let m1 = store.insert_message(chat.id, alice, "one").await.unwrap();
        let m2 = store.insert_message(chat.id, alice, "two").await.unwrap();

        store.mark_read(chat.id, bob, &[m2.id], Utc::now()).await.unwrap();
        let outcome = store.mark_read(chat.id, bob, &[m1.id], Utc::now()).await.unwrap();
        assert_eq!(outcome.last_read_at, Some(m2.created_at));
        assert_eq!(store.count_unread(chat.id, bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unread_excludes_own_and_deleted_messages() {
        let store = MemoryStore::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = chat_with(&store, &[alice, bob]).await;

        store.insert_message(chat.id, alice, "hi").await.unwrap();
        let gone = store.insert_message(chat.id, alice, "oops").await.unwrap();
        store.insert_message(chat.id, bob, "hey").await.unwrap();
        store.soft_delete_message(gone.id, Utc::now()).await.unwrap();

        assert_eq!(store.count_unread(chat.id, bob).await.unwrap(), 1);
        assert_eq!(store.count_unread(chat.id, alice).await.unwrap(), 1);
        assert!(store
            .soft_delete_message(gone.id, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn messages_page_newest_first() {
        let store = MemoryStore::new();
        let alice = Uuid::new_v4();
        let chat = chat_with(&store, &[alice, Uuid::new_v4()]).await;
        let mut sent = Vec::new();
        for i in 0..5 {
            sent.push(store.insert_message(chat.id, alice, &format!("m{i}")).await.unwrap());
        }

        let page = store.list_messages(chat.id, None, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![sent[4].id, sent[3].id]);

        let older = store
            .list_messages(chat.id, Some(page[1].created_at), 10)
            .await
            .unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older[0].id, sent[2].id);
    }

    #[tokio::test]
    async fn notifications_are_scoped_to_their_owner() {
        let store = MemoryStore::new();
        let (owner, stranger) = (Uuid::new_v4(), Uuid::new_v4());
        let n = store
            .insert_notification(&NewNotification {
                user_id: owner,
                notification_type: NotificationType::Mention,
                payload: json!({}),
            })
            .await
            .unwrap();

        assert!(!store.mark_notification_read(stranger, n.id).await.unwrap());
        assert!(!store.delete_notification(stranger, n.id).await.unwrap());
        assert_eq!(store.count_unread_notifications(owner).await.unwrap(), 1);

        assert_eq!(store.mark_all_notifications_read(owner).await.unwrap(), vec![n.id]);
        assert!(store.mark_all_notifications_read(owner).await.unwrap().is_empty());
        assert!(store.delete_notification(owner, n.id).await.unwrap());
    }
}
