use actix_web::http::header;
use actix_web::{delete, get, post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::AuthenticatedUser;
use crate::models::NotificationView;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

#[get("/api/v1/notifications")]
pub async fn list(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    query: web::Query<ListNotificationsQuery>,
) -> AppResult<HttpResponse> {
    let notifications = state
        .notifications
        .list(user.id, query.unread_only, query.limit)
        .await?;
    let views: Vec<NotificationView> = notifications.iter().map(|n| n.view()).collect();
    Ok(HttpResponse::Ok().json(views))
}

#[get("/api/v1/notifications/unread-count")]
pub async fn unread_count(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> AppResult<HttpResponse> {
    let count = state.notifications.unread_count(user.id).await?;
    Ok(HttpResponse::Ok().json(json!({ "unreadCount": count })))
}

#[post("/api/v1/notifications/read-all")]
pub async fn mark_all_read(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> AppResult<HttpResponse> {
    let updated = state.notifications.mark_all_read(user.id).await?;
    Ok(HttpResponse::Ok().json(json!({ "updated": updated })))
}

#[post("/api/v1/notifications/{notification_id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    state
        .notifications
        .mark_read(user.id, path.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[delete("/api/v1/notifications/{notification_id}")]
pub async fn delete(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    state.notifications.delete(user.id, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Server-sent event stream of the caller's notifications.
///
/// `EventSource` cannot set headers, so the token travels in the query.
#[get("/api/v1/notifications/stream")]
pub async fn stream(
    state: web::Data<AppState>,
    query: web::Query<StreamQuery>,
) -> AppResult<HttpResponse> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("token missing".into()))?;
    let user_id = state.auth.validate(token)?;
    state.rate_limiter.check(user_id, "http").await?;

    let stream = state.streams.add_client(user_id)?;

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(stream.into_body()))
}
