use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::AuthenticatedUser;
use crate::state::AppState;
use crate::websocket::ChatSession;

/// Upgrade to a chat socket once the caller is an active participant.
#[get("/ws/chats/{chat_id}")]
pub async fn chat_socket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let chat_id = path.into_inner();
    state.messages.require_participant(chat_id, user.id).await?;
    let participants = state
        .store
        .active_participants(chat_id)
        .await
        .map_err(AppError::from)?;

    tracing::info!(chat_id = %chat_id, user_id = %user.id, "chat socket upgrade");
    ws::start(
        ChatSession::new(chat_id, user.id, participants, state.get_ref().clone()),
        &req,
        stream,
    )
}
