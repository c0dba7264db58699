pub mod auth;
pub mod blobs;
pub mod error;
pub mod friends;
pub mod messages;
pub mod middleware;
pub mod rooms;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
};

use huddle_gateway::blob::MAX_BLOB_SIZE;

use crate::auth::AppState;
use crate::middleware::require_auth;

/// Every REST route. All of them require a bearer token.
pub fn routes(state: AppState) -> Router {
    Router::new()
        // Social graph
        .route("/friends/requests", post(friends::send_request).get(friends::list_requests))
        .route("/friends/requests/{id}/respond", post(friends::respond))
        .route("/friends/requests/{id}/cancel", post(friends::cancel))
        .route("/friends", get(friends::list_friends))
        .route("/friends/{friend_id}", delete(friends::remove_friend))
        .route("/blocks/{user_id}", put(friends::block).delete(friends::unblock))
        // Rooms
        .route("/rooms", get(rooms::list_rooms))
        .route("/rooms/private", post(rooms::open_private))
        .route("/rooms/group", post(rooms::create_group))
        .route("/rooms/{id}", get(rooms::get_room).delete(rooms::delete_room))
        .route(
            "/rooms/{id}/participants",
            get(rooms::list_participants).post(rooms::add_participant),
        )
        .route("/rooms/{id}/participants/{user_id}", delete(rooms::remove_participant))
        .route("/rooms/{id}/participants/{user_id}/role", put(rooms::set_role))
        // Messages
        .route("/rooms/{id}/messages", get(messages::list_messages).post(messages::post_message))
        .route(
            "/rooms/{id}/attachments",
            post(messages::post_attachment).layer(DefaultBodyLimit::max(MAX_BLOB_SIZE)),
        )
        .route("/rooms/{id}/read", post(messages::mark_read))
        .route("/rooms/{id}/unread", get(messages::unread))
        .route("/messages/{id}", get(messages::get_message).delete(messages::delete_message))
        .route("/messages/{id}/reads", get(messages::list_reads))
        .route("/users/{id}/messages", post(messages::send_direct))
        .route("/users/{id}/presence", get(messages::presence))
        .route("/blobs/{category}/{name}", get(blobs::get_blob))
        .layer(from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
