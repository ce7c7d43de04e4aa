use actix_web::{get, post, web, HttpResponse};

use crate::error::AppResult;
use crate::middleware::AuthenticatedUser;
use crate::services::CreateChatRequest;
use crate::state::AppState;

#[post("/api/v1/chats")]
pub async fn create_chat(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    body: web::Json<CreateChatRequest>,
) -> AppResult<HttpResponse> {
    let summary = state.chats.create_chat(user.id, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(summary))
}

/// Chats the caller belongs to, each with its unread count.
#[get("/api/v1/chats")]
pub async fn list_chats(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> AppResult<HttpResponse> {
    let chats = state.chats.list_chats(user.id).await?;
    Ok(HttpResponse::Ok().json(chats))
}
