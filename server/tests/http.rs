// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP surface tests against the in-memory gateway.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use courierbackend::settings::{
    ApplicationSettings, ConnectorsSettings, EventLogSettings, IngressSettings, RouterSettings,
    Settings,
};
use courierserver::build_gateway;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

fn memory_settings() -> Settings {
    Settings {
        application: ApplicationSettings {
            port: 0,
            host: "127.0.0.1".into(),
        },
        database: None,
        event_log: EventLogSettings::default(),
        ingress: IngressSettings::default(),
        router: RouterSettings::default(),
        connectors: ConnectorsSettings::default(),
        storage: None,
    }
}

async fn app() -> Router {
    build_gateway(memory_settings()).await.unwrap().router()
}

async fn request_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create_user(app: &Router, name: &str, role: &str) -> String {
    let (status, body) = request_json(
        app,
        "POST",
        "/users",
        Some(json!({ "displayName": name, "role": role })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["userId"].as_str().unwrap().to_owned()
}

async fn create_one_to_one(app: &Router, a: &str, b: &str) -> String {
    let (status, body) = request_json(
        app,
        "POST",
        "/conversations",
        Some(json!({ "type": "ONE_TO_ONE", "participants": [a, b] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["conversationId"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn healthz_responds() {
    let app = app().await;
    let (status, _) = request_json(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn send_message_is_accepted_with_a_status_url() {
    let app = app().await;
    let agent = create_user(&app, "Agent", "AGENT").await;
    let customer = create_user(&app, "Customer", "CUSTOMER").await;
    let conversation = create_one_to_one(&app, &agent, &customer).await;

    let (status, body) = request_json(
        &app,
        "POST",
        "/messages",
        Some(json!({
            "conversationId": conversation,
            "senderId": agent,
            "content": "Hello",
            "channel": "internal",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "PENDING");
    let message_id = body["messageId"].as_str().unwrap();
    assert_eq!(
        body["statusUrl"].as_str().unwrap(),
        format!("/messages/{message_id}/status")
    );

    let (status, body) =
        request_json(&app, "GET", &format!("/messages/{message_id}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["history"][0]["status"], "PENDING");
}

#[tokio::test]
async fn validation_errors_are_bad_requests() {
    let app = app().await;
    let agent = create_user(&app, "Agent", "AGENT").await;
    let customer = create_user(&app, "Customer", "CUSTOMER").await;
    let conversation = create_one_to_one(&app, &agent, &customer).await;

    // Unknown channel.
    let (status, _) = request_json(
        &app,
        "POST",
        "/messages",
        Some(json!({
            "conversationId": conversation,
            "senderId": agent,
            "content": "Hello",
            "channel": "carrier-pigeon",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Text one unit over the cap.
    let (status, _) = request_json(
        &app,
        "POST",
        "/messages",
        Some(json!({
            "conversationId": conversation,
            "senderId": agent,
            "content": "x".repeat(10_001),
            "channel": "internal",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown conversation.
    let (status, _) = request_json(
        &app,
        "POST",
        "/messages",
        Some(json!({
            "conversationId": "missing",
            "senderId": agent,
            "content": "Hello",
            "channel": "internal",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn group_bounds_are_enforced() {
    let app = app().await;
    let mut users = Vec::new();
    for i in 0..101 {
        users.push(create_user(&app, &format!("U{i}"), "CUSTOMER").await);
    }

    let (status, _) = request_json(
        &app,
        "POST",
        "/conversations",
        Some(json!({ "type": "GROUP", "participants": &users[..2] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request_json(
        &app,
        "POST",
        "/conversations",
        Some(json!({ "type": "GROUP", "participants": &users[..100] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request_json(
        &app,
        "POST",
        "/conversations",
        Some(json!({ "type": "GROUP", "participants": &users[..101] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Removing a participant from a 2-person group is rejected.
    let (_, body) = request_json(
        &app,
        "POST",
        "/conversations",
        Some(json!({ "type": "GROUP", "participants": &users[..2] })),
    )
    .await;
    let conversation = body["conversationId"].as_str().unwrap();
    let (status, _) = request_json(
        &app,
        "DELETE",
        &format!("/conversations/{conversation}/participants/{}", users[0]),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn participant_changes_emit_system_messages_and_filter_history() {
    let app = app().await;
    let admin = create_user(&app, "Admin", "AGENT").await;
    let u1 = create_user(&app, "U1", "CUSTOMER").await;
    let u2 = create_user(&app, "U2", "CUSTOMER").await;

    let (_, body) = request_json(
        &app,
        "POST",
        "/conversations",
        Some(json!({ "type": "GROUP", "participants": [admin, u1] })),
    )
    .await;
    let conversation = body["conversationId"].as_str().unwrap().to_owned();

    let (status, pre) = request_json(
        &app,
        "POST",
        "/messages",
        Some(json!({
            "conversationId": conversation,
            "senderId": admin,
            "content": "before u2",
            "channel": "internal",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (status, _) = request_json(
        &app,
        "POST",
        &format!("/conversations/{conversation}/participants"),
        Some(json!({ "userIds": [u2] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let (status, post) = request_json(
        &app,
        "POST",
        "/messages",
        Some(json!({
            "conversationId": conversation,
            "senderId": admin,
            "content": "after u2",
            "channel": "internal",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, admin_page) = request_json(
        &app,
        "GET",
        &format!("/conversations/{conversation}/messages?userId={admin}&limit=50"),
        None,
    )
    .await;
    let admin_ids: Vec<&str> = admin_page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["messageId"].as_str().unwrap())
        .collect();
    assert!(admin_ids.contains(&pre["messageId"].as_str().unwrap()));
    assert!(admin_ids.contains(&post["messageId"].as_str().unwrap()));

    let (_, u2_page) = request_json(
        &app,
        "GET",
        &format!("/conversations/{conversation}/messages?userId={u2}&limit=50"),
        None,
    )
    .await;
    let u2_messages = u2_page["messages"].as_array().unwrap();
    let u2_ids: Vec<&str> = u2_messages
        .iter()
        .map(|m| m["messageId"].as_str().unwrap())
        .collect();
    assert!(!u2_ids.contains(&pre["messageId"].as_str().unwrap()));
    assert!(u2_ids.contains(&post["messageId"].as_str().unwrap()));
    // The join is visible to the newcomer as a system message.
    assert!(u2_messages.iter().any(|m| m["kind"] == "system"));
}

#[tokio::test]
async fn identity_link_conflicts_are_409() {
    let app = app().await;
    let a = create_user(&app, "A", "CUSTOMER").await;
    let b = create_user(&app, "B", "CUSTOMER").await;

    let link = json!({ "platform": "whatsapp", "platformUserId": "+5562999999999" });
    let (status, _) = request_json(
        &app,
        "POST",
        &format!("/users/{a}/identities"),
        Some(link.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request_json(
        &app,
        "POST",
        &format!("/users/{b}/identities"),
        Some(link.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate");

    // Resolve finds the first owner.
    let (status, body) = request_json(
        &app,
        "GET",
        "/identities/resolve?platform=whatsapp&id=%2B5562999999999",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userId"].as_str().unwrap(), a);

    // Unlink, then the other user can take the handle.
    let (status, _) = request_json(
        &app,
        "DELETE",
        &format!("/users/{a}/identities/whatsapp/%2B5562999999999"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = request_json(
        &app,
        "POST",
        &format!("/users/{b}/identities"),
        Some(link),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn files_initiate_is_unavailable_without_storage() {
    let app = app().await;
    let (status, _) = request_json(
        &app,
        "POST",
        "/files/initiate",
        Some(json!({
            "filename": "a.pdf",
            "fileSize": 1024,
            "mimeType": "application/pdf",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Over the 2 GiB cap it is a validation error even before storage.
    let (status, _) = request_json(
        &app,
        "POST",
        "/files/initiate",
        Some(json!({
            "filename": "big.bin",
            "fileSize": 2u64 * 1024 * 1024 * 1024 + 1,
            "mimeType": "video/mp4",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhooks_for_unserved_platforms_are_404() {
    let app = app().await;
    let (status, _) = request_json(
        &app,
        "POST",
        "/webhooks/whatsapp",
        Some(json!({ "entry": [] })),
    )
    .await;
    // No connector is configured in the memory gateway.
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request_json(&app, "POST", "/webhooks/smoke-signals", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
