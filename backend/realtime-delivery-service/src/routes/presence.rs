use actix_web::{get, web, HttpResponse};
use uuid::Uuid;

use crate::middleware::AuthenticatedUser;
use crate::state::AppState;

/// Users online, away or in a call according to this instance's directory.
#[get("/api/v1/presence/online")]
pub async fn online_users(state: web::Data<AppState>, _user: AuthenticatedUser) -> HttpResponse {
    HttpResponse::Ok().json(state.directory.online_users())
}

#[get("/api/v1/presence/users/{user_id}")]
pub async fn user_status(
    state: web::Data<AppState>,
    _user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> HttpResponse {
    HttpResponse::Ok().json(state.directory.view(path.into_inner()))
}
