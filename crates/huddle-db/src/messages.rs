use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info};
use uuid::Uuid;

use huddle_types::models::{
    Attachment, Message, MessageCursor, MessageKind, MessagePage, MessageRead, MessageState,
    NewMessage, ParticipantRole, ReadMark, RoomKind, format_timestamp,
};

use crate::error::OptionalExt;
use crate::models::{MESSAGE_COLUMNS, MessageRow, message_read, ts_at};
use crate::rooms::{find_participant, load_active_room, load_participants, require_participant, touch_room};
use crate::social::blocked_between;
use crate::{ChatError, Database, Result, now};

pub const MAX_BODY_LEN: usize = 4000;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// A soft-deleted message. `message` is already redacted; `attachment` is
/// what the message pointed at before deletion so its blob can be released.
#[derive(Debug, Clone)]
pub struct DeletedMessage {
    pub message: Message,
    pub attachment: Option<Attachment>,
}

impl Database {
    pub fn post_message(&self, room_id: Uuid, sender_id: Uuid, content: NewMessage) -> Result<Message> {
        validate_content(&content)?;

        self.with_tx(|conn| {
            let room = load_active_room(conn, room_id)?;
            require_participant(conn, room_id, sender_id)?;
            if room.kind == RoomKind::Private {
                for peer in load_participants(conn, room_id)? {
                    if peer.user_id != sender_id && blocked_between(conn, sender_id, peer.user_id)? {
                        return Err(ChatError::Forbidden("one of the users has blocked the other".into()));
                    }
                }
            }

            let created_at = next_timestamp(conn, room_id)?;
            let message = Message {
                id: Uuid::new_v4(),
                room_id,
                user_id: sender_id,
                kind: content.kind,
                body: content.body,
                attachment: content.attachment,
                state: MessageState::Active,
                created_at,
            };
            let attachment = message.attachment.as_ref();
            conn.execute(
                "INSERT INTO messages (id, room_id, user_id, type, body, attachment_url, attachment_name,
                                       attachment_size, attachment_mime, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', ?10)",
                params![
                    message.id.to_string(),
                    room_id.to_string(),
                    sender_id.to_string(),
                    message.kind.as_str(),
                    message.body,
                    attachment.map(|a| a.url.as_str()),
                    attachment.map(|a| a.name.as_str()),
                    attachment.map(|a| a.size as i64),
                    attachment.map(|a| a.mime.as_str()),
                    format_timestamp(created_at),
                ],
            )?;
            touch_room(conn, room_id)?;

            debug!("Message {} posted to room {} by {}", message.id, room_id, sender_id);
            Ok(message)
        })
    }

    /// One page of a room's history, newest first. The cursor is exclusive:
    /// the page holds messages strictly older than it in (created_at, id)
    /// order, so messages inserted meanwhile never shift later pages.
    pub fn list_messages(
        &self,
        room_id: Uuid,
        requester_id: Uuid,
        cursor: Option<MessageCursor>,
        page_size: Option<usize>,
    ) -> Result<MessagePage> {
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        self.with_conn(|conn| {
            load_active_room(conn, room_id)?;
            require_participant(conn, room_id, requester_id)?;

            let (before_ts, before_id) = match cursor {
                Some(c) => (Some(format_timestamp(c.created_at)), Some(c.id.to_string())),
                None => (None, None),
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1
                   AND (?2 IS NULL OR created_at < ?2 OR (created_at = ?2 AND id < ?3))
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?4"
            ))?;
            let mut messages = stmt
                .query_map(
                    params![room_id.to_string(), before_ts, before_id, (page_size + 1) as i64],
                    MessageRow::from_row,
                )?
                .map(|row| row.map(MessageRow::into_message))
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let has_more = messages.len() > page_size;
            messages.truncate(page_size);
            let next_cursor = if has_more {
                messages.last().map(|m| MessageCursor::of(m).encode())
            } else {
                None
            };

            Ok(MessagePage {
                messages,
                has_more,
                next_cursor,
            })
        })
    }

    pub fn get_message(&self, message_id: Uuid, requester_id: Uuid) -> Result<Message> {
        self.with_conn(|conn| {
            let row = load_message(conn, message_id)?;
            require_participant(conn, row.room_id, requester_id)?;
            Ok(row.into_message())
        })
    }

    /// Soft delete. Allowed for the author, the room creator and admins.
    pub fn delete_message(&self, message_id: Uuid, actor_id: Uuid) -> Result<DeletedMessage> {
        self.with_tx(|conn| {
            let row = load_message(conn, message_id)?;
            let room = load_active_room(conn, row.room_id)?;
            let actor = require_participant(conn, room.id, actor_id)?;

            let allowed = row.user_id == actor_id
                || room.created_by == actor_id
                || actor.role == ParticipantRole::Admin;
            if !allowed {
                return Err(ChatError::NotAuthorized(
                    "only the author or a room admin may delete a message".into(),
                ));
            }
            if matches!(row.state, MessageState::Deleted { .. }) {
                return Err(ChatError::InvalidState(format!("message {message_id} is already deleted")));
            }

            let ts = now();
            conn.execute(
                "UPDATE messages SET state = 'deleted', deleted_by = ?2, deleted_at = ?3
                 WHERE id = ?1 AND state = 'active'",
                params![message_id.to_string(), actor_id.to_string(), format_timestamp(ts)],
            )?;

            let attachment = row.attachment.clone();
            let message = MessageRow {
                state: MessageState::Deleted {
                    deleted_by: actor_id,
                    deleted_at: ts,
                },
                ..row
            }
            .into_message();

            info!("Message {} in room {} deleted by {}", message_id, room.id, actor_id);
            Ok(DeletedMessage { message, attachment })
        })
    }

    /// Record receipts for every unread message from others up to and
    /// including `upto_message_id`, and move the participant's read position
    /// forward. Marking an older message never moves it back.
    pub fn mark_read(&self, room_id: Uuid, user_id: Uuid, upto_message_id: Uuid) -> Result<ReadMark> {
        self.with_tx(|conn| {
            load_active_room(conn, room_id)?;
            require_participant(conn, room_id, user_id)?;
            let target = load_message(conn, upto_message_id)?;
            if target.room_id != room_id {
                return Err(ChatError::NotFound(format!(
                    "message {upto_message_id} in room {room_id}"
                )));
            }

            let target_ts = format_timestamp(target.created_at);
            let unread: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT m.id FROM messages m
                     WHERE m.room_id = ?1 AND m.user_id <> ?2
                       AND (m.created_at < ?3 OR (m.created_at = ?3 AND m.id <= ?4))
                       AND NOT EXISTS (SELECT 1 FROM message_reads r
                                       WHERE r.message_id = m.id AND r.user_id = ?2)",
                )?;
                stmt.query_map(
                    params![room_id.to_string(), user_id.to_string(), target_ts, upto_message_id.to_string()],
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?
            };

            let read_at = format_timestamp(now());
            for message_id in &unread {
                conn.execute(
                    "INSERT INTO message_reads (id, message_id, user_id, read_at) VALUES (?1, ?2, ?3, ?4)",
                    params![Uuid::new_v4().to_string(), message_id, user_id.to_string(), read_at],
                )?;
            }

            let advanced = conn.execute(
                "UPDATE room_participants SET last_read_at = ?3
                 WHERE room_id = ?1 AND user_id = ?2 AND (last_read_at IS NULL OR last_read_at < ?3)",
                params![room_id.to_string(), user_id.to_string(), target_ts],
            )? == 1;

            let last_read_at = find_participant(conn, room_id, user_id)?.and_then(|p| p.last_read_at);

            if advanced || !unread.is_empty() {
                debug!("{} read room {} up to {} ({} receipts)", user_id, room_id, upto_message_id, unread.len());
            }
            Ok(ReadMark {
                room_id,
                user_id,
                upto_message_id,
                last_read_at,
                marked: unread.len(),
                advanced,
            })
        })
    }

    /// Messages from others newer than the participant's read position.
    /// Soft-deleted messages still count.
    pub fn unread_count(&self, room_id: Uuid, user_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            load_active_room(conn, room_id)?;
            let me = require_participant(conn, room_id, user_id)?;
            let since = me.last_read_at.map(format_timestamp).unwrap_or_default();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE room_id = ?1 AND user_id <> ?2 AND created_at > ?3",
                params![room_id.to_string(), user_id.to_string(), since],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }

    /// Whether any live message still points at this attachment url.
    pub fn attachment_in_use(&self, url: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let in_use = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM messages WHERE attachment_url = ?1 AND state = 'active')",
                [url],
                |row| row.get(0),
            )?;
            Ok(in_use)
        })
    }

    /// Whether `user_id` can see a live message in an active room that
    /// carries this attachment.
    pub fn attachment_visible_to(&self, url: &str, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let visible = conn.query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM messages m
                     JOIN chat_rooms r ON r.id = m.room_id AND r.state = 'active'
                     JOIN room_participants p ON p.room_id = m.room_id AND p.user_id = ?2
                     WHERE m.attachment_url = ?1 AND m.state = 'active'
                 )",
                params![url, user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(visible)
        })
    }

    /// Receipts of one message, oldest first. Participants only.
    pub fn list_message_reads(&self, message_id: Uuid, requester_id: Uuid) -> Result<Vec<MessageRead>> {
        self.with_conn(|conn| {
            let row = load_message(conn, message_id)?;
            require_participant(conn, row.room_id, requester_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, message_id, user_id, read_at FROM message_reads
                 WHERE message_id = ?1 ORDER BY read_at, id",
            )?;
            let reads = stmt
                .query_map([message_id.to_string()], message_read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(reads)
        })
    }
}

fn validate_content(content: &NewMessage) -> Result<()> {
    if let Some(body) = &content.body {
        if body.chars().count() > MAX_BODY_LEN {
            return Err(ChatError::Invalid(format!(
                "message body exceeds {MAX_BODY_LEN} characters"
            )));
        }
    }
    match content.kind {
        MessageKind::Text => {
            if content.attachment.is_some() {
                return Err(ChatError::Invalid("text messages carry no attachment".into()));
            }
            if content.body.as_deref().is_none_or(|b| b.trim().is_empty()) {
                return Err(ChatError::Invalid("message body is empty".into()));
            }
        }
        MessageKind::Image | MessageKind::File | MessageKind::Audio => {
            if content.attachment.is_none() {
                return Err(ChatError::Invalid(format!(
                    "{} messages need an attachment",
                    content.kind
                )));
            }
        }
    }
    Ok(())
}

/// Per-room timestamps are strictly increasing even when the clock stalls
/// or steps back.
fn next_timestamp(conn: &Connection, room_id: Uuid) -> Result<DateTime<Utc>> {
    let last = conn
        .query_row(
            "SELECT created_at FROM messages WHERE room_id = ?1 ORDER BY created_at DESC LIMIT 1",
            [room_id.to_string()],
            |row| ts_at(row, 0),
        )
        .optional()?;
    let ts = now();
    Ok(match last {
        Some(last) if ts <= last => last + Duration::microseconds(1),
        _ => ts,
    })
}

fn load_message(conn: &Connection, message_id: Uuid) -> Result<MessageRow> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [message_id.to_string()],
        MessageRow::from_row,
    )
    .optional()?
    .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::testing::open_temp;

    fn pair_room(db: &Database) -> (Uuid, Uuid, Uuid) {
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let room = db.get_or_create_private_room(alice, bob).unwrap().room;
        (room.id, alice, bob)
    }

    fn image(url: &str) -> NewMessage {
        NewMessage {
            kind: MessageKind::Image,
            body: None,
            attachment: Some(Attachment {
                url: url.into(),
                name: "cat.png".into(),
                size: 1024,
                mime: "image/png".into(),
            }),
        }
    }

    #[test]
    fn rejects_empty_and_oversized_bodies() {
        let db = open_temp();
        let (room, alice, _) = pair_room(&db);

        assert!(matches!(db.post_message(room, alice, NewMessage::text("   ")), Err(ChatError::Invalid(_))));
        let long = "x".repeat(MAX_BODY_LEN + 1);
        assert!(matches!(db.post_message(room, alice, NewMessage::text(long)), Err(ChatError::Invalid(_))));
        let attachmentless = NewMessage {
            kind: MessageKind::File,
            body: None,
            attachment: None,
        };
        assert!(matches!(db.post_message(room, alice, attachmentless), Err(ChatError::Invalid(_))));
    }

    #[test]
    fn only_participants_post_and_read() {
        let db = open_temp();
        let (room, alice, _) = pair_room(&db);
        let stranger = Uuid::new_v4();

        assert!(matches!(
            db.post_message(room, stranger, NewMessage::text("hi")),
            Err(ChatError::Forbidden(_))
        ));
        let message = db.post_message(room, alice, NewMessage::text("hi")).unwrap();
        assert!(matches!(db.list_messages(room, stranger, None, None), Err(ChatError::Forbidden(_))));
        assert!(matches!(db.get_message(message.id, stranger), Err(ChatError::Forbidden(_))));
        assert!(matches!(
            db.list_messages(Uuid::new_v4(), alice, None, None),
            Err(ChatError::NotFound(_))
        ));
    }

    #[test]
    fn blocked_peer_cannot_post_in_private_room() {
        let db = open_temp();
        let (room, alice, bob) = pair_room(&db);
        db.block_user(bob, alice).unwrap();

        assert!(matches!(
            db.post_message(room, alice, NewMessage::text("hello?")),
            Err(ChatError::Forbidden(_))
        ));
        assert!(matches!(
            db.post_message(room, bob, NewMessage::text("bye")),
            Err(ChatError::Forbidden(_))
        ));
    }

    #[test]
    fn timestamps_strictly_increase_within_a_room() {
        let db = open_temp();
        let (room, alice, bob) = pair_room(&db);

        let mut last = None;
        for i in 0..50 {
            let sender = if i % 2 == 0 { alice } else { bob };
            let message = db.post_message(room, sender, NewMessage::text(format!("m{i}"))).unwrap();
            if let Some(prev) = last {
                assert!(message.created_at > prev);
            }
            last = Some(message.created_at);
        }
    }

    #[test]
    fn pagination_is_stable_while_messages_arrive() {
        let db = Arc::new(open_temp());
        let (room, alice, bob) = pair_room(&db);
        let originals: Vec<Uuid> = (0..25)
            .map(|i| db.post_message(room, alice, NewMessage::text(format!("m{i}"))).unwrap().id)
            .collect();

        let first = db.list_messages(room, bob, None, Some(10)).unwrap();
        assert_eq!(first.messages.len(), 10);
        assert!(first.has_more);

        let writer = {
            let db = db.clone();
            std::thread::spawn(move || {
                for i in 0..20 {
                    db.post_message(room, bob, NewMessage::text(format!("late{i}"))).unwrap();
                }
            })
        };

        let mut seen: Vec<Uuid> = first.messages.iter().map(|m| m.id).collect();
        let mut cursor = first.next_cursor;
        while let Some(token) = cursor {
            let page = db
                .list_messages(room, bob, MessageCursor::decode(&token), Some(10))
                .unwrap();
            seen.extend(page.messages.iter().map(|m| m.id));
            cursor = page.next_cursor;
        }
        writer.join().unwrap();

        let unique: HashSet<Uuid> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "no message appears twice");
        let expected: Vec<Uuid> = originals.into_iter().rev().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn page_size_is_clamped() {
        let db = open_temp();
        let (room, alice, _) = pair_room(&db);
        for i in 0..3 {
            db.post_message(room, alice, NewMessage::text(format!("m{i}"))).unwrap();
        }

        let page = db.list_messages(room, alice, None, Some(0)).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.has_more);

        let page = db.list_messages(room, alice, None, Some(10_000)).unwrap();
        assert_eq!(page.messages.len(), 3);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn deleted_messages_are_redacted_everywhere() {
        let db = open_temp();
        let (room, alice, bob) = pair_room(&db);
        let posted = db.post_message(room, alice, image("/blobs/images/abc.png")).unwrap();
        assert!(db.attachment_in_use("/blobs/images/abc.png").unwrap());

        assert!(matches!(db.delete_message(posted.id, bob), Err(ChatError::NotAuthorized(_))));
        let deleted = db.delete_message(posted.id, alice).unwrap();
        assert!(deleted.message.is_deleted());
        assert!(deleted.message.attachment.is_none());
        assert_eq!(deleted.attachment.unwrap().url, "/blobs/images/abc.png");
        assert!(!db.attachment_in_use("/blobs/images/abc.png").unwrap());

        let fetched = db.get_message(posted.id, bob).unwrap();
        assert!(fetched.body.is_none() && fetched.attachment.is_none());
        let page = db.list_messages(room, bob, None, None).unwrap();
        assert!(page.messages[0].is_deleted());
        assert!(page.messages[0].attachment.is_none());

        assert!(matches!(db.delete_message(posted.id, alice), Err(ChatError::InvalidState(_))));
    }

    #[test]
    fn room_admin_may_delete_any_message() {
        let db = open_temp();
        let (creator, member) = (Uuid::new_v4(), Uuid::new_v4());
        let room = db.create_group_room(creator, "mods", &[member]).unwrap().room;
        let message = db.post_message(room.id, member, NewMessage::text("rule breaking")).unwrap();

        let deleted = db.delete_message(message.id, creator).unwrap();
        assert!(matches!(deleted.message.state, MessageState::Deleted { deleted_by, .. } if deleted_by == creator));
    }

    #[test]
    fn mark_read_never_moves_backwards() {
        let db = open_temp();
        let (room, alice, bob) = pair_room(&db);
        let ids: Vec<Uuid> = (0..5)
            .map(|i| db.post_message(room, alice, NewMessage::text(format!("m{i}"))).unwrap().id)
            .collect();
        db.post_message(room, bob, NewMessage::text("mine")).unwrap();
        assert_eq!(db.unread_count(room, bob).unwrap(), 5);

        let mark = db.mark_read(room, bob, ids[3]).unwrap();
        assert_eq!(mark.marked, 4);
        assert!(mark.advanced);
        assert_eq!(db.unread_count(room, bob).unwrap(), 1);

        let again = db.mark_read(room, bob, ids[1]).unwrap();
        assert_eq!(again.marked, 0);
        assert!(!again.advanced);
        assert_eq!(again.last_read_at, mark.last_read_at);
        assert_eq!(db.unread_count(room, bob).unwrap(), 1);

        let last = db.mark_read(room, bob, ids[4]).unwrap();
        assert_eq!(last.marked, 1);
        assert_eq!(db.unread_count(room, bob).unwrap(), 0);
        assert_eq!(db.list_message_reads(ids[0], alice).unwrap().len(), 1);
    }

    #[test]
    fn own_messages_get_no_receipts() {
        let db = open_temp();
        let (room, alice, _) = pair_room(&db);
        let mine = db.post_message(room, alice, NewMessage::text("note to self")).unwrap();

        let mark = db.mark_read(room, alice, mine.id).unwrap();
        assert_eq!(mark.marked, 0);
        assert!(mark.advanced);
        assert!(db.list_message_reads(mine.id, alice).unwrap().is_empty());
    }

    #[test]
    fn room_deletion_removes_history() {
        let db = open_temp();
        let (room, alice, bob) = pair_room(&db);
        let message = db.post_message(room, alice, NewMessage::text("soon gone")).unwrap();
        db.mark_read(room, bob, message.id).unwrap();

        db.delete_room(room, alice, "cleanup").unwrap();
        assert!(matches!(db.get_message(message.id, alice), Err(ChatError::NotFound(_))));
        assert!(matches!(db.list_messages(room, alice, None, None), Err(ChatError::NotFound(_))));
        assert!(matches!(db.post_message(room, alice, NewMessage::text("x")), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn attachments_follow_message_visibility() {
        let db = open_temp();
        let (room, alice, bob) = pair_room(&db);
        let url = "/blobs/images/shared.png";
        let posted = db.post_message(room, alice, image(url)).unwrap();

        assert!(db.attachment_visible_to(url, bob).unwrap());
        assert!(!db.attachment_visible_to(url, Uuid::new_v4()).unwrap());

        db.delete_message(posted.id, alice).unwrap();
        assert!(!db.attachment_visible_to(url, bob).unwrap());
    }

    #[test]
    fn room_deletion_reports_its_attachments() {
        let db = open_temp();
        let (room, alice, bob) = pair_room(&db);
        db.post_message(room, alice, image("/blobs/images/a.png")).unwrap();
        db.post_message(room, bob, image("/blobs/images/a.png")).unwrap();
        db.post_message(room, bob, image("/blobs/images/b.png")).unwrap();
        db.post_message(room, alice, NewMessage::text("plain")).unwrap();

        let deleted = db.delete_room(room, alice, "cleanup").unwrap();
        let mut urls = deleted.attachment_urls;
        urls.sort();
        assert_eq!(urls, vec!["/blobs/images/a.png".to_string(), "/blobs/images/b.png".to_string()]);
        assert!(!db.attachment_visible_to("/blobs/images/a.png", alice).unwrap());
    }
}
