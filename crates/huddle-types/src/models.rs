use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// String-backed enums stored as TEXT columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(FriendRequestStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
    Cancelled => "cancelled",
});

text_enum!(FriendshipStatus {
    Pending => "pending",
    Accepted => "accepted",
    Blocked => "blocked",
});

text_enum!(RoomKind {
    Private => "private",
    Group => "group",
});

text_enum!(ParticipantRole {
    Member => "member",
    Admin => "admin",
});

text_enum!(MessageKind {
    Text => "text",
    Image => "image",
    File => "file",
    Audio => "audio",
});

text_enum!(Decision {
    Accept => "accept",
    Reject => "reject",
});

impl FriendRequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Canonical timestamp encoding: fixed-width RFC 3339 with microseconds, so
/// lexical order of the text equals chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// -- Social graph --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub status: FriendRequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Friendship {
    pub id: Uuid,
    pub user_id: Uuid,
    pub friend_id: Uuid,
    pub status: FriendshipStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pending requests split by direction, as seen by one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingRequests {
    pub incoming: Vec<FriendRequest>,
    pub outgoing: Vec<FriendRequest>,
}

// -- Rooms --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: Uuid,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomParticipant {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

/// A room as listed on a user's dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: ChatRoom,
    pub participant_ids: Vec<Uuid>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDeletion {
    pub id: Uuid,
    pub room_id: Uuid,
    pub deleted_by: Uuid,
    pub reason: String,
    pub deleted_at: DateTime<Utc>,
}

// -- Messages --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
}

/// Lifecycle of a message. Deleted messages keep their place in the history
/// but never carry body or attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Active,
    Deleted {
        deleted_by: Uuid,
        deleted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    #[serde(flatten)]
    pub state: MessageState,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        matches!(self.state, MessageState::Deleted { .. })
    }
}

/// Content of a message about to be posted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
}

impl NewMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            body: Some(body.into()),
            attachment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRead {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

/// Outcome of advancing a participant's read position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMark {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub upto_message_id: Uuid,
    pub last_read_at: Option<DateTime<Utc>>,
    /// Number of receipts written by this call.
    pub marked: usize,
    /// Whether the room cursor moved.
    pub advanced: bool,
}

/// A stable point in a room's (created_at, id) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl MessageCursor {
    pub fn of(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            id: message.id,
        }
    }

    /// Opaque, URL-safe token.
    pub fn encode(&self) -> String {
        B64.encode(format!("{}|{}", format_timestamp(self.created_at), self.id))
    }

    pub fn decode(token: &str) -> Option<Self> {
        let raw = B64.decode(token).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (ts, id) = raw.split_once('|')?;
        Some(Self {
            created_at: parse_timestamp(ts)?,
            id: id.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    /// Newest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexically() {
        let early = "2024-03-01T09:00:00.000001Z";
        let late = format_timestamp(parse_timestamp("2024-03-01T09:00:00.1Z").unwrap());
        assert_eq!(late, "2024-03-01T09:00:00.100000Z");
        assert!(early < late.as_str());
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!(MessageCursor::decode("not-a-cursor").is_none());
        assert!(MessageCursor::decode(&B64.encode("2024-01-01T00:00:00Z|nope")).is_none());

        let cursor = MessageCursor {
            created_at: Utc::now(),
            id: Uuid::new_v4(),
        };
        let decoded = MessageCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.id, cursor.id);
        assert_eq!(
            format_timestamp(decoded.created_at),
            format_timestamp(cursor.created_at)
        );
    }

    #[test]
    fn deleted_message_serializes_state_tag() {
        let message = Message {
            id: Uuid::nil(),
            room_id: Uuid::nil(),
            user_id: Uuid::nil(),
            kind: MessageKind::Text,
            body: None,
            attachment: None,
            state: MessageState::Deleted {
                deleted_by: Uuid::nil(),
                deleted_at: Utc::now(),
            },
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["state"], "deleted");
        assert_eq!(json["type"], "text");
        assert!(json["body"].is_null());
    }
}
