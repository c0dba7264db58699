use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::TypedHeader;
use axum_extra::headers::ContentType;
use bytes::Bytes;
use uuid::Uuid;

use huddle_types::api::{
    AttachmentQuery, AttachmentResponse, Claims, MarkReadRequest, MessageQuery, PresenceResponse,
    SendMessageRequest, UnreadResponse,
};
use huddle_types::models::NewMessage;

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn list_messages(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let page = state
        .service
        .list_messages(room_id, claims.sub, query.cursor, query.limit.map(|l| l as usize))
        .await?;
    Ok(Json(page))
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .service
        .post_message(room_id, claims.sub, NewMessage::text(req.body))
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Raw upload: the body is the file, `Content-Type` its MIME type,
/// `?file_name=` its display name and `?caption=` an optional text message.
pub async fn post_attachment(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<AttachmentQuery>,
    Extension(claims): Extension<Claims>,
    content_type: Option<TypedHeader<ContentType>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mime = content_type
        .map(|TypedHeader(ct)| ct.to_string())
        .unwrap_or_else(|| "application/octet-stream".into());

    let outcome = state
        .service
        .post_attachment(room_id, claims.sub, body, mime, query.file_name, query.caption)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AttachmentResponse {
            message: outcome.message,
            caption: outcome.caption,
            attachment_error: outcome.attachment_error,
        }),
    ))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let mark = state
        .service
        .mark_read(room_id, claims.sub, req.upto_message_id)
        .await?;
    Ok(Json(mark))
}

pub async fn unread(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let unread = state.service.unread_count(room_id, claims.sub).await?;
    Ok(Json(UnreadResponse { room_id, unread }))
}

pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_message(message_id, claims.sub).await?))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.delete_message(message_id, claims.sub).await?))
}

pub async fn list_reads(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_message_reads(message_id, claims.sub).await?))
}

/// Send to a user directly, opening the private room on first contact.
pub async fn send_direct(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .service
        .send_direct_message(claims.sub, recipient_id, req.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> impl IntoResponse {
    Json(PresenceResponse {
        user_id,
        online: state.service.is_online(user_id),
    })
}
