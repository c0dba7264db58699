use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use huddle_db::rooms::OpenedRoom;
use huddle_types::api::{
    AddParticipantRequest, Claims, CreateGroupRoomRequest, DeleteRoomRequest, OpenPrivateRoomRequest,
    RoomResponse, SetRoleRequest,
};

use crate::auth::AppState;
use crate::error::ApiResult;

fn room_response(opened: OpenedRoom) -> (StatusCode, Json<RoomResponse>) {
    let status = if opened.created { StatusCode::CREATED } else { StatusCode::OK };
    (
        status,
        Json(RoomResponse {
            room: opened.room,
            participants: opened.participants,
        }),
    )
}

pub async fn list_rooms(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_rooms(claims.sub).await?))
}

/// 201 when the room was created, 200 when the pair already had one.
pub async fn open_private(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenPrivateRoomRequest>,
) -> ApiResult<impl IntoResponse> {
    let opened = state.service.open_private_room(claims.sub, req.user_id).await?;
    Ok(room_response(opened))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRoomRequest>,
) -> ApiResult<impl IntoResponse> {
    let opened = state
        .service
        .create_group_room(claims.sub, req.name, req.member_ids)
        .await?;
    Ok(room_response(opened))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let (room, participants) = state.service.get_room(room_id, claims.sub).await?;
    Ok(Json(RoomResponse { room, participants }))
}

pub async fn delete_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(req): Query<DeleteRoomRequest>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let reason = req.reason.unwrap_or_default();
    let deleted = state.service.delete_room(room_id, claims.sub, reason).await?;
    Ok(Json(deleted.deletion))
}

pub async fn list_participants(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_participants(room_id, claims.sub).await?))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> ApiResult<impl IntoResponse> {
    let participant = state
        .service
        .add_participant(room_id, claims.sub, req.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(participant)))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    state.service.remove_participant(room_id, claims.sub, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_role(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetRoleRequest>,
) -> ApiResult<impl IntoResponse> {
    let participant = state
        .service
        .set_participant_role(room_id, claims.sub, user_id, req.role)
        .await?;
    Ok(Json(participant))
}
