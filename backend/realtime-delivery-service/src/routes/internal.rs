//! Service-to-service notification intake.

use actix_web::{post, web, HttpResponse};
use serde::Deserialize;

use crate::error::AppResult;
use crate::middleware::InternalService;
use crate::models::NewNotification;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BulkCreateRequest {
    /// Kept as raw JSON so one malformed entry fails alone
    pub notifications: Vec<serde_json::Value>,
}

#[post("/internal/v1/notifications")]
pub async fn create_notification(
    state: web::Data<AppState>,
    _caller: InternalService,
    body: web::Json<NewNotification>,
) -> AppResult<HttpResponse> {
    let notification = state.notifications.create(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(notification.view()))
}

#[post("/internal/v1/notifications/bulk")]
pub async fn create_notifications_bulk(
    state: web::Data<AppState>,
    _caller: InternalService,
    body: web::Json<BulkCreateRequest>,
) -> AppResult<HttpResponse> {
    let outcome = state
        .notifications
        .create_bulk(body.into_inner().notifications)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}
