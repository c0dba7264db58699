use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ErrorKind;
use crate::models::{ChatRoom, Decision, FriendRequest, Message, ParticipantRole};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    #[serde(rename = "ready")]
    Ready { user_id: Uuid, room_ids: Vec<Uuid> },

    #[serde(rename = "message.created")]
    MessageCreated { message: Message },

    #[serde(rename = "message.deleted")]
    MessageDeleted {
        message_id: Uuid,
        room_id: Uuid,
        deleted_by: Uuid,
        deleted_at: DateTime<Utc>,
    },

    #[serde(rename = "message.read")]
    MessageRead {
        room_id: Uuid,
        user_id: Uuid,
        upto_message_id: Uuid,
        last_read_at: Option<DateTime<Utc>>,
    },

    #[serde(rename = "room.created")]
    RoomCreated {
        room: ChatRoom,
        participant_ids: Vec<Uuid>,
    },

    #[serde(rename = "room.deleted")]
    RoomDeleted {
        room_id: Uuid,
        deleted_by: Uuid,
        reason: String,
        deleted_at: DateTime<Utc>,
    },

    #[serde(rename = "participant.joined")]
    ParticipantJoined {
        room_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        added_by: Uuid,
    },

    #[serde(rename = "participant.left")]
    ParticipantLeft {
        room_id: Uuid,
        user_id: Uuid,
        removed_by: Uuid,
    },

    #[serde(rename = "friendRequest.created")]
    FriendRequestCreated { request: FriendRequest },

    /// Accepted, rejected or cancelled
    #[serde(rename = "friendRequest.resolved")]
    FriendRequestResolved { request: FriendRequest },

    #[serde(rename = "friendship.removed")]
    FriendshipRemoved { user_id: Uuid, friend_id: Uuid },

    #[serde(rename = "presence.changed")]
    PresenceChanged { user_id: Uuid, online: bool },

    /// Advisory; receivers drop it after `expires_at` unless refreshed.
    #[serde(rename = "typing.started")]
    TypingStarted {
        room_id: Uuid,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[serde(rename = "typing.stopped")]
    TypingStopped { room_id: Uuid, user_id: Uuid },

    /// A command from this connection failed. Never broadcast.
    #[serde(rename = "error")]
    Error {
        command: String,
        kind: ErrorKind,
        message: String,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Keep presence alive; send at a fixed interval per connection.
    Heartbeat,

    /// Add rooms to this connection's live fan-out set.
    /// Rooms the user does not participate in are refused.
    Subscribe { room_ids: Vec<Uuid> },

    Unsubscribe { room_ids: Vec<Uuid> },

    StartTyping { room_id: Uuid },

    StopTyping { room_id: Uuid },

    SendMessage { room_id: Uuid, body: String },

    MarkRead { room_id: Uuid, upto_message_id: Uuid },

    SendFriendRequest { receiver_id: Uuid },

    RespondFriendRequest { request_id: Uuid, decision: Decision },
}

impl GatewayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "Identify",
            Self::Heartbeat => "Heartbeat",
            Self::Subscribe { .. } => "Subscribe",
            Self::Unsubscribe { .. } => "Unsubscribe",
            Self::StartTyping { .. } => "StartTyping",
            Self::StopTyping { .. } => "StopTyping",
            Self::SendMessage { .. } => "SendMessage",
            Self::MarkRead { .. } => "MarkRead",
            Self::SendFriendRequest { .. } => "SendFriendRequest",
            Self::RespondFriendRequest { .. } => "RespondFriendRequest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_on_the_wire() {
        let event = GatewayEvent::TypingStopped {
            room_id: Uuid::nil(),
            user_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "typing.stopped");
        assert_eq!(json["data"]["room_id"], Uuid::nil().to_string());

        let event = GatewayEvent::PresenceChanged {
            user_id: Uuid::nil(),
            online: true,
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "presence.changed");
    }

    #[test]
    fn commands_parse_from_client_json() {
        let cmd: GatewayCommand = serde_json::from_str(r#"{"type":"Heartbeat"}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::Heartbeat));

        let raw = format!(
            r#"{{"type":"RespondFriendRequest","data":{{"request_id":"{}","decision":"accept"}}}}"#,
            Uuid::nil()
        );
        let cmd: GatewayCommand = serde_json::from_str(&raw).unwrap();
        assert!(matches!(
            cmd,
            GatewayCommand::RespondFriendRequest { decision: Decision::Accept, .. }
        ));
    }
}
