use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use huddle_types::api::{Claims, RespondFriendRequest, SendFriendRequest};

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn send_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendFriendRequest>,
) -> ApiResult<impl IntoResponse> {
    let request = state.service.send_friend_request(claims.sub, req.receiver_id).await?;
    info!("{} sent a friend request to {}", claims.sub, req.receiver_id);
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn list_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_pending_requests(claims.sub).await?))
}

pub async fn respond(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RespondFriendRequest>,
) -> ApiResult<impl IntoResponse> {
    let request = state
        .service
        .respond_to_request(request_id, claims.sub, req.decision)
        .await?;
    Ok(Json(request))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.cancel_request(request_id, claims.sub).await?))
}

pub async fn list_friends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_friends(claims.sub).await?))
}

pub async fn remove_friend(
    State(state): State<AppState>,
    Path(friend_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    state.service.remove_friend(claims.sub, friend_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Returns the block row. Friendship and pending requests between the pair
/// are gone once this succeeds.
pub async fn block(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.service.block_user(claims.sub, user_id).await?;
    info!(
        "{} blocked {} (unfriended: {}, cancelled requests: {})",
        claims.sub,
        user_id,
        outcome.unfriended,
        outcome.cancelled_requests.len()
    );
    Ok(Json(outcome.block))
}

pub async fn unblock(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    state.service.unblock_user(claims.sub, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
