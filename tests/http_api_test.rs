use actix_web::{http::StatusCode, test, web, App};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chat_fanout_service::routes;
use chat_fanout_service::websocket::CloseReason;
use serde_json::{json, Value};
use uuid::Uuid;

mod test_harness;
use test_harness::{eventually, TestEnvironment};

macro_rules! app {
    ($env:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($env.state.clone()))
                .configure(routes::configure),
        )
        .await
    };
}

fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

#[actix_web::test]
async fn health_is_public() {
    let env = TestEnvironment::new();
    let app = app!(env);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn send_requires_a_token() {
    let env = TestEnvironment::new();
    let app = app!(env);
    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .set_json(json!({
            "receiver_kind": "direct",
            "receiver_id": Uuid::new_v4(),
            "content_kind": "text",
            "payload": STANDARD.encode("hi"),
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], 401);
}

#[actix_web::test]
async fn send_then_fetch_offline_backlog() {
    let env = TestEnvironment::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(alice, bob);
    let app = app!(env);

    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .insert_header(bearer(&env.token(alice, "web")))
        .set_json(json!({
            "receiver_kind": "direct",
            "receiver_id": bob,
            "content_kind": "text",
            "payload": STANDARD.encode("hello bob"),
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let receipt: Value = test::read_body_json(resp).await;
    let msg_id = receipt["msg_id"].as_str().unwrap().to_string();

    let env_ref = &env;
    assert!(eventually(|| async move { env_ref.unread(bob).await == 1 }).await);

    let bob_token = env.token(bob, "web");
    let req = test::TestRequest::get()
        .uri("/api/v1/messages/unread/count")
        .insert_header(bearer(&bob_token))
        .to_request();
    let count: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(count["count"], 1);

    let req = test::TestRequest::get()
        .uri("/api/v1/messages/offline")
        .insert_header(bearer(&bob_token))
        .to_request();
    let backlog: Value = test::call_and_read_body_json(&app, req).await;
    let messages = backlog["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], msg_id);
    assert_eq!(messages[0]["payload"], STANDARD.encode("hello bob"));

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/messages/{msg_id}/read"))
        .insert_header(bearer(&bob_token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[actix_web::test]
async fn recall_by_non_owner_is_forbidden() {
    let env = TestEnvironment::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(alice, bob);
    let app = app!(env);

    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .insert_header(bearer(&env.token(alice, "web")))
        .set_json(json!({
            "receiver_kind": "direct",
            "receiver_id": bob,
            "content_kind": "text",
            "payload": STANDARD.encode("take it back"),
        }))
        .to_request();
    let receipt: Value = test::call_and_read_body_json(&app, req).await;
    let msg_id = receipt["msg_id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/messages/{msg_id}/recall"))
        .insert_header(bearer(&env.token(bob, "web")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "NOT_OWNER");

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/messages/{msg_id}/recall"))
        .insert_header(bearer(&env.token(alice, "web")))
        .to_request();
    let recalled: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(recalled["recalled"], true);
}

#[actix_web::test]
async fn call_lifecycle_over_http() {
    let env = TestEnvironment::new();
    let (caller, callee) = (Uuid::new_v4(), Uuid::new_v4());
    env.social.add_friends(caller, callee);
    let app = app!(env);

    let req = test::TestRequest::post()
        .uri("/api/v1/calls")
        .insert_header(bearer(&env.token(caller, "web")))
        .set_json(json!({ "receiver_kind": "direct", "receiver_id": callee }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let call: Value = test::read_body_json(resp).await;
    assert_eq!(call["status"], "ringing");
    assert_eq!(call["kind"], "voice");
    let call_id = call["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/calls/{call_id}/accept"))
        .insert_header(bearer(&env.token(caller, "web")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/calls/{call_id}/reject"))
        .insert_header(bearer(&env.token(callee, "web")))
        .to_request();
    let rejected: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(rejected["status"], "rejected");
    assert_eq!(rejected["duration_secs"], 0);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/calls/{call_id}/end"))
        .insert_header(bearer(&env.token(caller, "web")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[actix_web::test]
async fn devices_are_listed_and_kicked() {
    let env = TestEnvironment::new();
    let user = Uuid::new_v4();
    let (_phone, _phone_rx) = env.connect(user, "phone").await;
    let (_tablet, mut tablet_rx) = env.connect(user, "tablet").await;
    let app = app!(env);
    let token = env.token(user, "web");

    let req = test::TestRequest::get()
        .uri("/api/v1/devices")
        .insert_header(bearer(&token))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["devices"], json!(["phone", "tablet"]));

    let req = test::TestRequest::post()
        .uri("/api/v1/devices/tablet/kick")
        .insert_header(bearer(&token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(tablet_rx.control.recv().await, Some(CloseReason::Evicted));
    let devices = env.state.presence.is_online(user).await;
    assert_eq!(devices.len(), 1);
    assert!(devices.contains("phone"));

    let req = test::TestRequest::post()
        .uri("/api/v1/devices/tablet/kick")
        .insert_header(bearer(&token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn devices_of_another_account_are_not_visible() {
    let env = TestEnvironment::new();
    let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());
    let (_session, _rx) = env.connect(owner, "phone").await;
    let app = app!(env);

    let req = test::TestRequest::post()
        .uri("/api/v1/devices/phone/kick")
        .insert_header(bearer(&env.token(other, "web")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(env.state.presence.is_online(owner).await.contains("phone"));
}
