use actix_web::{delete, get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::AppResult;
use crate::middleware::AuthenticatedUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// Exclusive upper bound on `createdAt`, for paging backwards
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub message_ids: Vec<Uuid>,
}

#[get("/api/v1/chats/{chat_id}/messages")]
pub async fn list_messages(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
    query: web::Query<ListMessagesQuery>,
) -> AppResult<HttpResponse> {
    let query = query.into_inner();
    let messages = state
        .messages
        .list_messages(path.into_inner(), user.id, query.before, query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

#[post("/api/v1/chats/{chat_id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
    body: web::Json<SendMessageRequest>,
) -> AppResult<HttpResponse> {
    let message = state
        .messages
        .send_message(path.into_inner(), user.id, &body.content)
        .await?;
    Ok(HttpResponse::Created().json(message))
}

#[get("/api/v1/chats/{chat_id}/messages/{message_id}")]
pub async fn get_message(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<(Uuid, Uuid)>,
) -> AppResult<HttpResponse> {
    let (chat_id, message_id) = path.into_inner();
    let message = state.messages.get_message(chat_id, user.id, message_id).await?;
    Ok(HttpResponse::Ok().json(message))
}

#[delete("/api/v1/chats/{chat_id}/messages/{message_id}")]
pub async fn delete_message(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<(Uuid, Uuid)>,
) -> AppResult<HttpResponse> {
    let (chat_id, message_id) = path.into_inner();
    let message = state
        .messages
        .delete_message(chat_id, user.id, message_id)
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

#[post("/api/v1/chats/{chat_id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
    body: web::Json<MarkReadRequest>,
) -> AppResult<HttpResponse> {
    let receipt = state
        .messages
        .mark_read(path.into_inner(), user.id, &body.message_ids)
        .await?;
    Ok(HttpResponse::Ok().json(receipt))
}

#[get("/api/v1/chats/{chat_id}/unread-count")]
pub async fn unread_count(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let chat_id = path.into_inner();
    let count = state.messages.unread_count(chat_id, user.id).await?;
    Ok(HttpResponse::Ok().json(json!({ "chatId": chat_id, "unreadCount": count })))
}
