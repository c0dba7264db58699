use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatRoom, Decision, Message, ParticipantRole, RoomParticipant};

// -- JWT Claims --

/// Claims issued by the external auth service. Shared by the REST middleware
/// and the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Errors --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Forbidden,
    NotAuthorized,
    InvalidState,
    Conflict,
    NotFound,
    AttachmentUnavailable,
    StoreUnavailable,
    Invalid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
}

// -- Friends --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendFriendRequest {
    pub receiver_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RespondFriendRequest {
    pub decision: Decision,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenPrivateRoomRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRoomRequest {
    pub name: String,
    pub member_ids: Vec<Uuid>,
}

/// A room with its current participants.
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomResponse {
    #[serde(flatten)]
    pub room: ChatRoom,
    pub participants: Vec<RoomParticipant>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetRoleRequest {
    pub role: ParticipantRole,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteRoomRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub upto_message_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Opaque cursor from a previous page's `next_cursor`.
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentQuery {
    pub file_name: String,
    pub caption: Option<String>,
}

/// Result of an attachment upload. When the blob store fails the caption
/// may still have been posted on its own.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttachmentResponse {
    pub message: Option<Message>,
    pub caption: Option<Message>,
    pub attachment_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadResponse {
    pub room_id: Uuid,
    pub unread: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: Uuid,
    pub online: bool,
}
