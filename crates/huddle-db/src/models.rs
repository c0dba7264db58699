//! Row mapping between SQLite and the shared domain types.
//!
//! Ids and timestamps are stored as TEXT; enums as their snake_case names.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use huddle_types::models::{
    Attachment, ChatRoom, FriendRequest, FriendRequestStatus, Friendship, FriendshipStatus,
    Message, MessageKind, MessageRead, MessageState, ParticipantRole, RoomDeletion, RoomKind,
    RoomParticipant, parse_timestamp,
};

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| conversion_error(idx, format!("corrupt uuid '{raw}': {e}")))
}

pub(crate) fn opt_uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => uuid_at(row, idx).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn ts_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("corrupt timestamp '{raw}'")))
}

pub(crate) fn opt_ts_at(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => ts_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn enum_at<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unexpected value '{raw}'")))
}

// -- Friend requests --

pub(crate) const FRIEND_REQUEST_COLUMNS: &str =
    "id, sender_id, receiver_id, status, created_at, updated_at";

pub(crate) fn friend_request(row: &Row) -> rusqlite::Result<FriendRequest> {
    Ok(FriendRequest {
        id: uuid_at(row, 0)?,
        sender_id: uuid_at(row, 1)?,
        receiver_id: uuid_at(row, 2)?,
        status: enum_at(row, 3, FriendRequestStatus::parse)?,
        created_at: ts_at(row, 4)?,
        updated_at: ts_at(row, 5)?,
    })
}

// -- Friendships --

pub(crate) const FRIENDSHIP_COLUMNS: &str =
    "id, user_id, friend_id, status, created_at, updated_at";

pub(crate) fn friendship(row: &Row) -> rusqlite::Result<Friendship> {
    Ok(Friendship {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        friend_id: uuid_at(row, 2)?,
        status: enum_at(row, 3, FriendshipStatus::parse)?,
        created_at: ts_at(row, 4)?,
        updated_at: ts_at(row, 5)?,
    })
}

// -- Rooms --

pub(crate) const ROOM_COLUMNS: &str = "id, name, type, created_by, created_at, updated_at";

pub(crate) fn room(row: &Row) -> rusqlite::Result<ChatRoom> {
    Ok(ChatRoom {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        kind: enum_at(row, 2, RoomKind::parse)?,
        created_by: uuid_at(row, 3)?,
        created_at: ts_at(row, 4)?,
        updated_at: ts_at(row, 5)?,
    })
}

pub(crate) const PARTICIPANT_COLUMNS: &str =
    "id, room_id, user_id, role, joined_at, last_read_at";

pub(crate) fn participant(row: &Row) -> rusqlite::Result<RoomParticipant> {
    Ok(RoomParticipant {
        id: uuid_at(row, 0)?,
        room_id: uuid_at(row, 1)?,
        user_id: uuid_at(row, 2)?,
        role: enum_at(row, 3, ParticipantRole::parse)?,
        joined_at: ts_at(row, 4)?,
        last_read_at: opt_ts_at(row, 5)?,
    })
}

pub(crate) const DELETION_COLUMNS: &str = "id, room_id, deleted_by, reason, deleted_at";

pub(crate) fn deletion(row: &Row) -> rusqlite::Result<RoomDeletion> {
    Ok(RoomDeletion {
        id: uuid_at(row, 0)?,
        room_id: uuid_at(row, 1)?,
        deleted_by: uuid_at(row, 2)?,
        reason: row.get(3)?,
        deleted_at: ts_at(row, 4)?,
    })
}

// -- Messages --

pub(crate) const MESSAGE_COLUMNS: &str = "id, room_id, user_id, type, body, attachment_url, \
     attachment_name, attachment_size, attachment_mime, state, deleted_by, deleted_at, created_at";

/// Raw message row. Carries body and attachment even for deleted messages;
/// only `into_message` output ever leaves the store.
pub(crate) struct MessageRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    pub state: MessageState,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let attachment = match row.get::<_, Option<String>>(5)? {
            Some(url) => Some(Attachment {
                url,
                name: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                size: row.get::<_, Option<i64>>(7)?.unwrap_or(0).max(0) as u64,
                mime: row
                    .get::<_, Option<String>>(8)?
                    .unwrap_or_else(|| "application/octet-stream".into()),
            }),
            None => None,
        };

        let state = match row.get::<_, String>(9)?.as_str() {
            "active" => MessageState::Active,
            "deleted" => MessageState::Deleted {
                deleted_by: opt_uuid_at(row, 10)?
                    .ok_or_else(|| conversion_error(10, "deleted message without deleted_by".into()))?,
                deleted_at: opt_ts_at(row, 11)?
                    .ok_or_else(|| conversion_error(11, "deleted message without deleted_at".into()))?,
            },
            other => return Err(conversion_error(9, format!("unexpected message state '{other}'"))),
        };

        Ok(Self {
            id: uuid_at(row, 0)?,
            room_id: uuid_at(row, 1)?,
            user_id: uuid_at(row, 2)?,
            kind: enum_at(row, 3, MessageKind::parse)?,
            body: row.get(4)?,
            attachment,
            state,
            created_at: ts_at(row, 12)?,
        })
    }

    /// Client-facing view; deleted messages are redacted here.
    pub fn into_message(self) -> Message {
        let (body, attachment) = match self.state {
            MessageState::Active => (self.body, self.attachment),
            MessageState::Deleted { .. } => (None, None),
        };
        Message {
            id: self.id,
            room_id: self.room_id,
            user_id: self.user_id,
            kind: self.kind,
            body,
            attachment,
            state: self.state,
            created_at: self.created_at,
        }
    }
}

pub(crate) fn message_read(row: &Row) -> rusqlite::Result<MessageRead> {
    Ok(MessageRead {
        id: uuid_at(row, 0)?,
        message_id: uuid_at(row, 1)?,
        user_id: uuid_at(row, 2)?,
        read_at: ts_at(row, 3)?,
    })
}
