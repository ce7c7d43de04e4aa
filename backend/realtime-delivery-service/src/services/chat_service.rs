use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::UnreadCache;
use crate::error::{AppError, AppResult};
use crate::models::ChatSummary;
use crate::store::ChatStore;

pub const MAX_CHAT_PARTICIPANTS: usize = 256;
const MAX_TITLE_LENGTH: usize = 200;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    #[serde(default)]
    pub title: Option<String>,
    /// Other members; the creator is always added
    pub participant_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    unread: UnreadCache,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, unread: UnreadCache) -> Self {
        Self { store, unread }
    }

    #[tracing::instrument(skip(self, request), fields(user_id = %creator))]
    pub async fn create_chat(
        &self,
        creator: Uuid,
        request: CreateChatRequest,
    ) -> AppResult<ChatSummary> {
        let title = request
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if title
            .as_ref()
            .is_some_and(|t| t.chars().count() > MAX_TITLE_LENGTH)
        {
            return Err(AppError::BadRequest(format!(
                "title exceeds {MAX_TITLE_LENGTH} characters"
            )));
        }

        let mut seen = HashSet::from([creator]);
        let mut participants = vec![creator];
        for id in request.participant_ids {
            if id.is_nil() {
                return Err(AppError::BadRequest("participant id must not be nil".into()));
            }
            if seen.insert(id) {
                participants.push(id);
            }
        }
        if participants.len() < 2 {
            return Err(AppError::BadRequest(
                "a chat needs at least one other participant".into(),
            ));
        }
        if participants.len() > MAX_CHAT_PARTICIPANTS {
            return Err(AppError::BadRequest(format!(
                "a chat has at most {MAX_CHAT_PARTICIPANTS} participants"
            )));
        }

        let chat = self.store.create_chat(creator, title, &participants).await?;
        tracing::info!(chat_id = %chat.id, participants = participants.len(), "chat created");

        Ok(ChatSummary {
            chat,
            participants,
            last_read_at: None,
            unread_count: 0,
        })
    }

    pub async fn list_chats(&self, user_id: Uuid) -> AppResult<Vec<ChatSummary>> {
        let memberships = self.store.chats_for_user(user_id).await?;
        let mut summaries = Vec::with_capacity(memberships.len());
        for (chat, participant) in memberships {
            let participants = self.store.active_participants(chat.id).await?;
            let unread_count = self
                .unread
                .get_or_count(self.store.as_ref(), chat.id, user_id)
                .await?;
            summaries.push(ChatSummary {
                chat,
                participants,
                last_read_at: participant.last_read_at,
                unread_count,
            });
        }
        Ok(summaries)
    }
}
