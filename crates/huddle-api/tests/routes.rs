use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use huddle_api::auth::AppStateInner;
use huddle_api::routes;
use huddle_db::Database;
use huddle_gateway::blob::LocalBlobStore;
use huddle_gateway::notify::LogSink;
use huddle_gateway::{ChatService, ServiceConfig};
use huddle_types::api::Claims;

const SECRET: &str = "test-secret-for-routes";

async fn app() -> Router {
    let scratch = std::env::temp_dir().join(format!("huddle-api-test-{}", Uuid::new_v4()));
    let db = Database::open(&scratch.with_extension("db")).unwrap();
    let blobs = LocalBlobStore::new(scratch.join("blobs")).await.unwrap();
    let service = ChatService::new(Arc::new(db), Arc::new(blobs), Arc::new(LogSink), ServiceConfig::default());
    routes(AppStateInner::new(service, Arc::from(SECRET)))
}

fn token(user: Uuid) -> String {
    let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
    encode(
        &Header::default(),
        &Claims { sub: user, exp },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn call(app: &Router, method: Method, uri: &str, user: Uuid, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
    let body = match body {
        Some(json) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn requests_without_a_valid_token_are_rejected() {
    let app = app().await;

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/friends").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/friends")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn friend_requests_and_errors_map_to_status_codes() {
    let app = app().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let (status, request) = call(&app, Method::POST, "/friends/requests", alice, Some(json!({ "receiver_id": bob }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(request["status"], "pending");

    let (status, err) = call(&app, Method::POST, "/friends/requests", bob, Some(json!({ "receiver_id": alice }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"], "conflict");

    let id = request["id"].as_str().unwrap();
    let (status, err) = call(
        &app,
        Method::POST,
        &format!("/friends/requests/{id}/respond"),
        alice,
        Some(json!({ "decision": "accept" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "not_authorized");

    let (status, accepted) = call(
        &app,
        Method::POST,
        &format!("/friends/requests/{id}/respond"),
        bob,
        Some(json!({ "decision": "accept" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["status"], "accepted");

    let (_, friends) = call(&app, Method::GET, "/friends", bob, None).await;
    assert_eq!(friends.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, &format!("/friends/{alice}"), bob, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, err) = call(&app, Method::DELETE, &format!("/friends/{alice}"), bob, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "not_found");
}

#[tokio::test]
async fn direct_messages_history_and_unread() {
    let app = app().await;
    let (alice, bob, eve) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let (status, message) = call(&app, Method::POST, &format!("/users/{bob}/messages"), alice, Some(json!({ "body": "ping" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let room_id = message["room_id"].as_str().unwrap().to_string();

    let (status, _) = call(&app, Method::POST, &format!("/users/{bob}/messages"), alice, Some(json!({ "body": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, unread) = call(&app, Method::GET, &format!("/rooms/{room_id}/unread"), bob, None).await;
    assert_eq!(unread["unread"], 1);

    let (_, page) = call(&app, Method::GET, &format!("/rooms/{room_id}/messages?limit=10"), bob, None).await;
    assert_eq!(page["messages"][0]["body"], "ping");
    assert_eq!(page["has_more"], false);

    let (status, _) = call(&app, Method::GET, &format!("/rooms/{room_id}/messages?cursor=garbage"), bob, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, err) = call(&app, Method::GET, &format!("/rooms/{room_id}/messages"), eve, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "forbidden");

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/rooms/{room_id}/read"),
        bob,
        Some(json!({ "upto_message_id": message["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, unread) = call(&app, Method::GET, &format!("/rooms/{room_id}/unread"), bob, None).await;
    assert_eq!(unread["unread"], 0);

    let (_, rooms) = call(&app, Method::GET, "/rooms", alice, None).await;
    assert_eq!(rooms[0]["type"], "private");
}

#[tokio::test]
async fn attachments_are_served_back_from_blob_storage() {
    let app = app().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (status, room) = call(&app, Method::POST, "/rooms/private", alice, Some(json!({ "user_id": bob }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let room_id = room["id"].as_str().unwrap().to_string();

    let (status, again) = call(&app, Method::POST, "/rooms/private", bob, Some(json!({ "user_id": alice }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], room["id"]);

    let upload = Request::builder()
        .method(Method::POST)
        .uri(format!("/rooms/{room_id}/attachments?file_name=dot.png&caption=tiny"))
        .header(header::AUTHORIZATION, format!("Bearer {}", token(alice)))
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(&b"\x89PNG not really"[..]))
        .unwrap();
    let resp = app.clone().oneshot(upload).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["message"]["type"], "image");
    assert_eq!(body["caption"]["body"], "tiny");
    assert!(body["attachment_error"].is_null());

    let url = body["message"]["attachment"]["url"].as_str().unwrap().to_string();
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&url)
                .header(header::AUTHORIZATION, format!("Bearer {}", token(bob)))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()[..], b"\x89PNG not really");

    let (status, _) = call(&app, Method::GET, "/blobs/images/nope.png", bob, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Only participants who can see the message get the bytes.
    let eve = Uuid::new_v4();
    let (status, _) = call(&app, Method::GET, &url, eve, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let message_id = body["message"]["id"].as_str().unwrap().to_string();
    let (status, _) = call(&app, Method::DELETE, &format!("/messages/{message_id}"), alice, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::GET, &url, bob, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
