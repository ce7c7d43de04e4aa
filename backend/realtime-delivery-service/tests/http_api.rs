mod common;

use actix_web::{http::StatusCode, test, web, App};
use common::{Cluster, INTERNAL_TOKEN};
use realtime_delivery_service::routes;
use realtime_delivery_service::state::AppState;
use serde_json::{json, Value};
use uuid::Uuid;

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(routes::configure),
        )
        .await
    };
}

fn bearer(state: &AppState, user_id: Uuid) -> (&'static str, String) {
    let token = state.auth.issue(user_id, 3600).unwrap();
    ("Authorization", format!("Bearer {token}"))
}

#[actix_web::test]
async fn requests_without_valid_token_are_rejected() {
    let cluster = Cluster::start(1).await;
    let app = app!(cluster.node(0));

    let req = test::TestRequest::get().uri("/api/v1/chats").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TOKEN_MISSING");

    let req = test::TestRequest::get()
        .uri("/api/v1/chats")
        .insert_header(("Authorization", "Bearer not-a-jwt"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TOKEN_INVALID");

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications/stream")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn chat_message_and_unread_flow() {
    let cluster = Cluster::start(1).await;
    let state = cluster.node(0);
    let app = app!(state);
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let req = test::TestRequest::post()
        .uri("/api/v1/chats")
        .insert_header(bearer(state, alice))
        .set_json(json!({"title": "pair", "participantIds": [bob]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let chat: Value = test::read_body_json(resp).await;
    let chat_id = chat["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/chats/{chat_id}/messages"))
        .insert_header(bearer(state, alice))
        .set_json(json!({"content": "  hello  "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let message: Value = test::read_body_json(resp).await;
    assert_eq!(message["content"], "hello");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/chats/{chat_id}/unread-count"))
        .insert_header(bearer(state, bob))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["unreadCount"], 1);

    let req = test::TestRequest::get()
        .uri("/api/v1/chats")
        .insert_header(bearer(state, bob))
        .to_request();
    let chats: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(chats.as_array().unwrap().len(), 1);
    assert_eq!(chats[0]["unreadCount"], 1);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/chats/{chat_id}/read"))
        .insert_header(bearer(state, bob))
        .set_json(json!({"messageIds": [message["id"]]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/chats/{chat_id}/unread-count"))
        .insert_header(bearer(state, bob))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["unreadCount"], 0);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/chats/{chat_id}/messages?limit=10"))
        .insert_header(bearer(state, bob))
        .to_request();
    let messages: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(messages[0]["content"], "hello");
}

#[actix_web::test]
async fn membership_and_validation_errors() {
    let cluster = Cluster::start(1).await;
    let state = cluster.node(0);
    let app = app!(state);
    let (alice, bob, eve) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let chat = state.store.create_chat(alice, None, &[alice, bob]).await.unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/chats/{}/messages", chat.id))
        .insert_header(bearer(state, eve))
        .set_json(json!({"content": "hi"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/chats/{}/messages", Uuid::new_v4()))
        .insert_header(bearer(state, alice))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "CHAT_NOT_FOUND");

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/chats/{}/messages", chat.id))
        .insert_header(bearer(state, alice))
        .set_json(json!({"content": "   "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/chats/{}/messages", chat.id))
        .insert_header(bearer(state, alice))
        .insert_header(("Content-Type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[actix_web::test]
async fn rate_limited_requests_get_429_with_retry_after() {
    let cluster = Cluster::start_with(1, || {
        let mut config = common::config();
        config.rate_limit.max_requests = 3;
        config
    })
    .await;
    let state = cluster.node(0);
    let app = app!(state);
    let user = Uuid::new_v4();

    for _ in 0..3 {
        let req = test::TestRequest::get()
            .uri("/api/v1/notifications/unread-count")
            .insert_header(bearer(state, user))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications/unread-count")
        .insert_header(bearer(state, user))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("Retry-After"));
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");

    // Other users are unaffected.
    let req = test::TestRequest::get()
        .uri("/api/v1/notifications/unread-count")
        .insert_header(bearer(state, Uuid::new_v4()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
}

#[actix_web::test]
async fn internal_endpoints_require_service_credential() {
    let cluster = Cluster::start(1).await;
    let app = app!(cluster.node(0));
    let body = json!({"userId": Uuid::new_v4(), "notificationType": "SYSTEM", "payload": {"subject": "Maintenance"}});

    let req = test::TestRequest::post()
        .uri("/internal/v1/notifications")
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri("/internal/v1/notifications")
        .insert_header(("X-Internal-Token", "guess"))
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let json: Value = test::read_body_json(resp).await;
    assert_eq!(json["code"], "SERVICE_CREDENTIAL_INVALID");

    let req = test::TestRequest::post()
        .uri("/internal/v1/notifications")
        .insert_header(("X-Internal-Token", INTERNAL_TOKEN))
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = test::read_body_json(resp).await;
    assert_eq!(created["message"], "Maintenance");
    assert_eq!(created["icon"], "bell");
}

fn entry(user_id: Uuid) -> Value {
    json!({"userId": user_id, "notificationType": "TASK_ASSIGNED", "payload": {"actorName": "Kim", "subject": "Ship it"}})
}

#[actix_web::test]
async fn bulk_create_reports_partial_failures() {
    let cluster = Cluster::start(1).await;
    let state = cluster.node(0);
    let app = app!(state);
    let user = Uuid::new_v4();

    let full: Vec<Value> = (0..100).map(|_| entry(user)).collect();
    let req = test::TestRequest::post()
        .uri("/internal/v1/notifications/bulk")
        .insert_header(("X-Internal-Token", INTERNAL_TOKEN))
        .set_json(json!({ "notifications": full }))
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["created"], 100);
    assert_eq!(outcome["failures"].as_array().unwrap().len(), 0);

    let mut mixed: Vec<Value> = (0..10).map(|_| entry(user)).collect();
    mixed[4] = json!({"userId": user, "notificationType": "POKE"});
    let req = test::TestRequest::post()
        .uri("/internal/v1/notifications/bulk")
        .insert_header(("X-Internal-Token", INTERNAL_TOKEN))
        .set_json(json!({ "notifications": mixed }))
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["created"], 9);
    assert_eq!(outcome["notifications"].as_array().unwrap().len(), 9);
    assert_eq!(outcome["failures"][0]["index"], 4);
    assert_eq!(outcome["failures"][0]["code"], "INVALID_REQUEST");

    let too_many: Vec<Value> = (0..101).map(|_| entry(user)).collect();
    let req = test::TestRequest::post()
        .uri("/internal/v1/notifications/bulk")
        .insert_header(("X-Internal-Token", INTERNAL_TOKEN))
        .set_json(json!({ "notifications": too_many }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications/unread-count")
        .insert_header(bearer(state, user))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["unreadCount"], 109);
}

#[actix_web::test]
async fn notification_read_and_delete_are_owner_scoped() {
    let cluster = Cluster::start(1).await;
    let state = cluster.node(0);
    let app = app!(state);
    let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());

    let created = state
        .notifications
        .create(serde_json::from_value(entry(owner)).unwrap())
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/{}/read", created.id))
        .insert_header(bearer(state, other))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/{}/read", created.id))
        .insert_header(bearer(state, owner))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications?unreadOnly=true")
        .insert_header(bearer(state, owner))
        .to_request();
    let unread: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(unread.as_array().unwrap().len(), 0);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/notifications/{}", created.id))
        .insert_header(bearer(state, owner))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications")
        .insert_header(bearer(state, owner))
        .to_request();
    let all: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(all.as_array().unwrap().len(), 0);
}

#[actix_web::test]
async fn presence_and_health_endpoints() {
    let cluster = Cluster::start(1).await;
    let state = cluster.node(0);
    let app = app!(state);
    let (alice, viewer) = (Uuid::new_v4(), Uuid::new_v4());
    let _lease = state.presence.connect(alice);
    // The directory is fed through the fanout bridge.
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while state.directory.online_users().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("presence never reached the directory");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/presence/users/{alice}"))
        .insert_header(bearer(state, viewer))
        .to_request();
    let view: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(view["status"], "online");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/presence/users/{}", Uuid::new_v4()))
        .insert_header(bearer(state, viewer))
        .to_request();
    let view: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(view["status"], "offline");

    let req = test::TestRequest::get().uri("/health").to_request();
    let health: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["backboneConnected"], true);
}
