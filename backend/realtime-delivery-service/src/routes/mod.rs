pub mod chats;
pub mod internal;
pub mod messages;
pub mod notifications;
pub mod presence;
pub mod wsroute;

use actix_web::{get, web, HttpResponse};
use serde_json::json;

use crate::error::AppError;
use crate::metrics;
use crate::state::AppState;

/// Malformed JSON bodies get the same error envelope as every other failure.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(1024 * 1024)
        .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into())
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into())
}

pub fn path_config() -> web::PathConfig {
    web::PathConfig::default()
        .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into())
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "instanceId": state.config.instance_id,
        "connections": state.registry.connection_count(),
        "backboneConnected": state.bridge.is_connected(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .app_data(path_config())
        .service(health)
        .route("/metrics", web::get().to(metrics::serve_metrics))
        .service(chats::create_chat)
        .service(chats::list_chats)
        .service(messages::list_messages)
        .service(messages::send_message)
        .service(messages::get_message)
        .service(messages::delete_message)
        .service(messages::mark_read)
        .service(messages::unread_count)
        .service(presence::online_users)
        .service(presence::user_status)
        .service(notifications::stream)
        .service(notifications::unread_count)
        .service(notifications::mark_all_read)
        .service(notifications::list)
        .service(notifications::mark_read)
        .service(notifications::delete)
        .service(internal::create_notification)
        .service(internal::create_notifications_bulk)
        .service(wsroute::chat_socket);
}
