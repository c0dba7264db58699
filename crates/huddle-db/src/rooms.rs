use std::collections::BTreeSet;

use rusqlite::{Connection, params};
use tracing::info;
use uuid::Uuid;

use huddle_types::models::{
    ChatRoom, ParticipantRole, RoomDeletion, RoomKind, RoomParticipant, RoomSummary,
    format_timestamp,
};

use crate::error::OptionalExt;
use crate::models::{DELETION_COLUMNS, PARTICIPANT_COLUMNS, ROOM_COLUMNS, deletion, participant, room};
use crate::social::{blocked_between, prefixed};
use crate::{ChatError, Database, Result, now};

/// Result of a committed room deletion.
#[derive(Debug, Clone)]
pub struct DeletedRoom {
    pub deletion: RoomDeletion,
    /// Participants at the moment of deletion
    pub former_participants: Vec<Uuid>,
    /// Distinct attachment urls of the removed messages
    pub attachment_urls: Vec<String>,
}

/// Result of creating a room, or finding the existing one.
#[derive(Debug, Clone)]
pub struct OpenedRoom {
    pub room: ChatRoom,
    pub participants: Vec<RoomParticipant>,
    pub created: bool,
}

impl Database {
    /// Returns the one active private room holding exactly {a, b}, creating
    /// it if needed. Lookup is by the sorted participant pair, which is also
    /// a unique column.
    pub fn get_or_create_private_room(&self, a: Uuid, b: Uuid) -> Result<OpenedRoom> {
        if a == b {
            return Err(ChatError::Invalid("a private room needs two distinct users".into()));
        }

        self.with_tx(|conn| {
            if blocked_between(conn, a, b)? {
                return Err(ChatError::Forbidden("one of the users has blocked the other".into()));
            }

            let key = pair_key(a, b);
            let existing = conn
                .query_row(
                    &format!("SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE pair_key = ?1 AND state = 'active'"),
                    [&key],
                    room,
                )
                .optional()?;
            if let Some(room) = existing {
                let participants = load_participants(conn, room.id)?;
                return Ok(OpenedRoom {
                    room,
                    participants,
                    created: false,
                });
            }

            let ts = now();
            let room = ChatRoom {
                id: Uuid::new_v4(),
                name: None,
                kind: RoomKind::Private,
                created_by: a,
                created_at: ts,
                updated_at: ts,
            };
            conn.execute(
                "INSERT INTO chat_rooms (id, name, type, created_by, pair_key, created_at, updated_at)
                 VALUES (?1, NULL, 'private', ?2, ?3, ?4, ?4)",
                params![room.id.to_string(), a.to_string(), key, format_timestamp(ts)],
            )?;
            let participants = vec![
                insert_participant(conn, room.id, a, ParticipantRole::Member)?,
                insert_participant(conn, room.id, b, ParticipantRole::Member)?,
            ];

            info!("Private room {} created for {} and {}", room.id, a, b);
            Ok(OpenedRoom {
                room,
                participants,
                created: true,
            })
        })
    }

    pub fn create_group_room(
        &self,
        creator_id: Uuid,
        name: &str,
        member_ids: &[Uuid],
    ) -> Result<OpenedRoom> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Invalid("a group room needs a name".into()));
        }
        let members: BTreeSet<Uuid> = member_ids
            .iter()
            .copied()
            .filter(|id| *id != creator_id)
            .collect();
        if members.is_empty() {
            return Err(ChatError::Invalid(
                "a group room needs at least one member besides the creator".into(),
            ));
        }

        self.with_tx(|conn| {
            for member in &members {
                if blocked_between(conn, creator_id, *member)? {
                    return Err(ChatError::Forbidden(format!(
                        "{member} and the creator have blocked each other"
                    )));
                }
            }

            let ts = now();
            let room = ChatRoom {
                id: Uuid::new_v4(),
                name: Some(name.to_string()),
                kind: RoomKind::Group,
                created_by: creator_id,
                created_at: ts,
                updated_at: ts,
            };
            conn.execute(
                "INSERT INTO chat_rooms (id, name, type, created_by, created_at, updated_at)
                 VALUES (?1, ?2, 'group', ?3, ?4, ?4)",
                params![room.id.to_string(), name, creator_id.to_string(), format_timestamp(ts)],
            )?;

            let mut participants = Vec::with_capacity(members.len() + 1);
            participants.push(insert_participant(conn, room.id, creator_id, ParticipantRole::Admin)?);
            for member in &members {
                participants.push(insert_participant(conn, room.id, *member, ParticipantRole::Member)?);
            }

            info!("Group room {} '{}' created by {} with {} participants", room.id, name, creator_id, participants.len());
            Ok(OpenedRoom {
                room,
                participants,
                created: true,
            })
        })
    }

    /// Any current participant may add someone to a group room.
    pub fn add_participant(&self, room_id: Uuid, actor_id: Uuid, new_user_id: Uuid) -> Result<RoomParticipant> {
        self.with_tx(|conn| {
            let room = load_active_room(conn, room_id)?;
            require_participant(conn, room_id, actor_id)?;
            if room.kind == RoomKind::Private {
                return Err(ChatError::InvalidState("private rooms have exactly two participants".into()));
            }
            if blocked_between(conn, actor_id, new_user_id)? {
                return Err(ChatError::Forbidden("one of the users has blocked the other".into()));
            }
            if find_participant(conn, room_id, new_user_id)?.is_some() {
                return Err(ChatError::Conflict(format!("{new_user_id} is already in the room")));
            }

            let added = insert_participant(conn, room_id, new_user_id, ParticipantRole::Member)?;
            touch_room(conn, room_id)?;
            info!("{} added {} to room {}", actor_id, new_user_id, room_id);
            Ok(added)
        })
    }

    /// Participants may leave; admins may remove others. The room survives
    /// losing its last participant.
    pub fn remove_participant(&self, room_id: Uuid, actor_id: Uuid, user_id: Uuid) -> Result<()> {
        self.with_tx(|conn| {
            let room = load_active_room(conn, room_id)?;
            let actor = require_participant(conn, room_id, actor_id)?;
            if room.kind == RoomKind::Private {
                return Err(ChatError::InvalidState("cannot leave a private room".into()));
            }
            if actor_id != user_id && actor.role != ParticipantRole::Admin {
                return Err(ChatError::NotAuthorized("only room admins may remove other participants".into()));
            }

            let removed = conn.execute(
                "DELETE FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
            )?;
            if removed == 0 {
                return Err(ChatError::NotFound(format!("{user_id} is not in room {room_id}")));
            }
            touch_room(conn, room_id)?;
            info!("{} removed {} from room {}", actor_id, user_id, room_id);
            Ok(())
        })
    }

    /// Only the room creator designates admins.
    pub fn set_participant_role(
        &self,
        room_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> Result<RoomParticipant> {
        self.with_tx(|conn| {
            let room = load_active_room(conn, room_id)?;
            if room.created_by != actor_id {
                return Err(ChatError::NotAuthorized("only the room creator may change roles".into()));
            }
            if room.kind == RoomKind::Private {
                return Err(ChatError::InvalidState("private rooms have no roles".into()));
            }
            let current = find_participant(conn, room_id, user_id)?
                .ok_or_else(|| ChatError::NotFound(format!("{user_id} is not in room {room_id}")))?;

            conn.execute(
                "UPDATE room_participants SET role = ?3 WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string(), role.as_str()],
            )?;
            Ok(RoomParticipant { role, ..current })
        })
    }

    /// Delete a room in one transaction: audit row first, then read
    /// receipts, messages and participants, then the room is tombstoned.
    pub fn delete_room(&self, room_id: Uuid, actor_id: Uuid, reason: &str) -> Result<DeletedRoom> {
        self.with_tx(|conn| {
            let room = load_active_room(conn, room_id)?;
            let is_admin = find_participant(conn, room_id, actor_id)?
                .is_some_and(|p| p.role == ParticipantRole::Admin);
            if room.created_by != actor_id && !is_admin {
                return Err(ChatError::NotAuthorized(
                    "only the room creator or an admin may delete the room".into(),
                ));
            }

            let ts = now();
            let deletion = RoomDeletion {
                id: Uuid::new_v4(),
                room_id,
                deleted_by: actor_id,
                reason: reason.to_string(),
                deleted_at: ts,
            };
            let ts_text = format_timestamp(ts);
            conn.execute(
                "INSERT INTO room_deletions (id, room_id, deleted_by, reason, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    deletion.id.to_string(),
                    room_id.to_string(),
                    actor_id.to_string(),
                    reason,
                    ts_text,
                ],
            )?;

            let former_participants = load_participants(conn, room_id)?
                .into_iter()
                .map(|p| p.user_id)
                .collect();

            let rid = room_id.to_string();
            let attachment_urls = {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT attachment_url FROM messages
                     WHERE room_id = ?1 AND attachment_url IS NOT NULL",
                )?;
                stmt.query_map([&rid], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?
            };
            conn.execute(
                "DELETE FROM message_reads WHERE message_id IN (SELECT id FROM messages WHERE room_id = ?1)",
                [&rid],
            )?;
            let messages = conn.execute("DELETE FROM messages WHERE room_id = ?1", [&rid])?;
            conn.execute("DELETE FROM room_participants WHERE room_id = ?1", [&rid])?;
            conn.execute(
                "UPDATE chat_rooms SET state = 'deleted', pair_key = NULL, deleted_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![rid, ts_text],
            )?;

            info!("Room {} deleted by {} ({} messages removed): {}", room_id, actor_id, messages, reason);
            Ok(DeletedRoom {
                deletion,
                former_participants,
                attachment_urls,
            })
        })
    }

    pub fn get_room(&self, room_id: Uuid) -> Result<ChatRoom> {
        self.with_conn(|conn| load_active_room(conn, room_id))
    }

    pub fn room_deletions(&self, room_id: Uuid) -> Result<Vec<RoomDeletion>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELETION_COLUMNS} FROM room_deletions WHERE room_id = ?1 ORDER BY deleted_at"
            ))?;
            let rows = stmt
                .query_map([room_id.to_string()], deletion)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Participants of an active room, visible to participants only.
    pub fn list_participants(&self, room_id: Uuid, requester_id: Uuid) -> Result<Vec<RoomParticipant>> {
        self.with_conn(|conn| {
            load_active_room(conn, room_id)?;
            require_participant(conn, room_id, requester_id)?;
            Ok(load_participants(conn, room_id)?)
        })
    }

    pub fn is_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| Ok(find_participant(conn, room_id, user_id)?.is_some()))
    }

    /// Ids of the active rooms `user_id` participates in.
    pub fn participant_room_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.room_id FROM room_participants p
                 JOIN chat_rooms r ON r.id = p.room_id AND r.state = 'active'
                 WHERE p.user_id = ?1
                 ORDER BY p.joined_at",
            )?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| crate::models::uuid_at(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// Dashboard listing: every active room of the user with its
    /// participants and the user's unread count, most recently updated first.
    pub fn list_rooms(&self, user_id: Uuid) -> Result<Vec<RoomSummary>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {cols},
                        (SELECT COUNT(*) FROM messages m
                         WHERE m.room_id = r.id AND m.user_id <> ?1
                           AND m.created_at > COALESCE(p.last_read_at, ''))
                 FROM chat_rooms r
                 JOIN room_participants p ON p.room_id = r.id AND p.user_id = ?1
                 WHERE r.state = 'active'
                 ORDER BY r.updated_at DESC, r.id",
                cols = prefixed(ROOM_COLUMNS, "r")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rooms = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok((room(row)?, row.get::<_, i64>(6)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rooms
                .into_iter()
                .map(|(room, unread)| -> Result<RoomSummary> {
                    let participant_ids = load_participants(conn, room.id)?
                        .into_iter()
                        .map(|p| p.user_id)
                        .collect();
                    Ok(RoomSummary {
                        room,
                        participant_ids,
                        unread_count: unread.max(0) as u64,
                    })
                })
                .collect()
        })
    }

    /// Users who should see `user_id`'s presence: accepted friends and
    /// everyone sharing an active room.
    pub fn contacts_of(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT friend_id FROM friendships WHERE user_id = ?1 AND status = 'accepted'
                 UNION
                 SELECT other.user_id FROM room_participants me
                 JOIN room_participants other ON other.room_id = me.room_id AND other.user_id <> me.user_id
                 JOIN chat_rooms r ON r.id = me.room_id AND r.state = 'active'
                 WHERE me.user_id = ?1",
            )?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| crate::models::uuid_at(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }
}

fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

pub(crate) fn load_active_room(conn: &Connection, room_id: Uuid) -> Result<ChatRoom> {
    conn.query_row(
        &format!("SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE id = ?1 AND state = 'active'"),
        [room_id.to_string()],
        room,
    )
    .optional()?
    .ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))
}

pub(crate) fn find_participant(
    conn: &Connection,
    room_id: Uuid,
    user_id: Uuid,
) -> rusqlite::Result<Option<RoomParticipant>> {
    conn.query_row(
        &format!("SELECT {PARTICIPANT_COLUMNS} FROM room_participants WHERE room_id = ?1 AND user_id = ?2"),
        params![room_id.to_string(), user_id.to_string()],
        participant,
    )
    .optional()
}

pub(crate) fn require_participant(conn: &Connection, room_id: Uuid, user_id: Uuid) -> Result<RoomParticipant> {
    find_participant(conn, room_id, user_id)?
        .ok_or_else(|| ChatError::Forbidden(format!("{user_id} is not a participant of room {room_id}")))
}

pub(crate) fn load_participants(conn: &Connection, room_id: Uuid) -> rusqlite::Result<Vec<RoomParticipant>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM room_participants WHERE room_id = ?1 ORDER BY joined_at, id"
    ))?;
    let rows = stmt
        .query_map([room_id.to_string()], participant)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn insert_participant(
    conn: &Connection,
    room_id: Uuid,
    user_id: Uuid,
    role: ParticipantRole,
) -> Result<RoomParticipant> {
    let joined = RoomParticipant {
        id: Uuid::new_v4(),
        room_id,
        user_id,
        role,
        joined_at: now(),
        last_read_at: None,
    };
    conn.execute(
        "INSERT INTO room_participants (id, room_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            joined.id.to_string(),
            room_id.to_string(),
            user_id.to_string(),
            role.as_str(),
            format_timestamp(joined.joined_at),
        ],
    )?;
    Ok(joined)
}

pub(crate) fn touch_room(conn: &Connection, room_id: Uuid) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE chat_rooms SET updated_at = ?2 WHERE id = ?1",
        params![room_id.to_string(), format_timestamp(now())],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::open_temp;

    #[test]
    fn private_room_is_reused_for_the_same_pair() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let first = db.get_or_create_private_room(alice, bob).unwrap();
        assert!(first.created);
        assert_eq!(first.participants.len(), 2);

        let second = db.get_or_create_private_room(bob, alice).unwrap();
        assert!(!second.created);
        assert_eq!(second.room.id, first.room.id);
        assert!(second.room.name.is_none());
    }

    #[test]
    fn concurrent_private_room_creation_converges() {
        let db = Arc::new(open_temp());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let db = db.clone();
                let (a, b) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
                std::thread::spawn(move || db.get_or_create_private_room(a, b).unwrap().room.id)
            })
            .collect();

        let ids: BTreeSet<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn blocked_pair_cannot_open_a_room() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        db.block_user(alice, bob).unwrap();

        assert!(matches!(db.get_or_create_private_room(bob, alice), Err(ChatError::Forbidden(_))));
        assert!(matches!(db.create_group_room(bob, "team", &[alice]), Err(ChatError::Forbidden(_))));
    }

    #[test]
    fn group_room_requires_another_member() {
        let db = open_temp();
        let creator = Uuid::new_v4();

        assert!(matches!(db.create_group_room(creator, "solo", &[]), Err(ChatError::Invalid(_))));
        assert!(matches!(
            db.create_group_room(creator, "solo", &[creator]),
            Err(ChatError::Invalid(_))
        ));
        assert!(matches!(
            db.create_group_room(creator, "  ", &[Uuid::new_v4()]),
            Err(ChatError::Invalid(_))
        ));

        let member = Uuid::new_v4();
        let opened = db.create_group_room(creator, "planning", &[member, member, creator]).unwrap();
        assert_eq!(opened.participants.len(), 2);
        let admin = opened.participants.iter().find(|p| p.user_id == creator).unwrap();
        assert_eq!(admin.role, ParticipantRole::Admin);
    }

    #[test]
    fn only_participants_add_and_admins_remove() {
        let db = open_temp();
        let (creator, member, outsider, newcomer) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let room = db.create_group_room(creator, "ops", &[member]).unwrap().room;

        assert!(matches!(db.add_participant(room.id, outsider, newcomer), Err(ChatError::Forbidden(_))));
        db.add_participant(room.id, member, newcomer).unwrap();
        assert!(matches!(db.add_participant(room.id, member, newcomer), Err(ChatError::Conflict(_))));
        assert_eq!(db.participant_room_ids(newcomer).unwrap(), vec![room.id]);

        assert!(matches!(
            db.remove_participant(room.id, member, newcomer),
            Err(ChatError::NotAuthorized(_))
        ));
        db.remove_participant(room.id, creator, newcomer).unwrap();
        db.remove_participant(room.id, member, member).unwrap();
        db.remove_participant(room.id, creator, creator).unwrap();

        // Last participant gone, room still exists.
        assert!(db.get_room(room.id).is_ok());
    }

    #[test]
    fn private_rooms_keep_two_participants() {
        let db = open_temp();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let room = db.get_or_create_private_room(alice, bob).unwrap().room;

        assert!(matches!(db.add_participant(room.id, alice, carol), Err(ChatError::InvalidState(_))));
        assert!(matches!(db.remove_participant(room.id, bob, bob), Err(ChatError::InvalidState(_))));
    }

    #[test]
    fn creator_designates_admins_who_may_delete() {
        let db = open_temp();
        let (creator, member, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let room = db.create_group_room(creator, "ops", &[member, other]).unwrap().room;

        assert!(matches!(db.delete_room(room.id, member, "spam"), Err(ChatError::NotAuthorized(_))));
        assert!(matches!(
            db.set_participant_role(room.id, member, member, ParticipantRole::Admin),
            Err(ChatError::NotAuthorized(_))
        ));

        db.set_participant_role(room.id, creator, member, ParticipantRole::Admin).unwrap();
        let deleted = db.delete_room(room.id, member, "wrapped up").unwrap();
        assert_eq!(deleted.former_participants.len(), 3);
        assert!(matches!(db.get_room(room.id), Err(ChatError::NotFound(_))));
        assert_eq!(db.room_deletions(room.id).unwrap().len(), 1);
        assert!(db.participant_room_ids(other).unwrap().is_empty());
    }

    #[test]
    fn deleted_private_room_frees_the_pair() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let first = db.get_or_create_private_room(alice, bob).unwrap().room;
        db.delete_room(first.id, alice, "fresh start").unwrap();

        let second = db.get_or_create_private_room(alice, bob).unwrap();
        assert!(second.created);
        assert_ne!(second.room.id, first.id);
    }

    #[test]
    fn audit_rows_are_append_only() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let room = db.get_or_create_private_room(alice, bob).unwrap().room;
        db.delete_room(room.id, alice, "cleanup").unwrap();

        let err = db
            .with_tx(|conn| {
                conn.execute("DELETE FROM room_deletions", [])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_) | ChatError::StoreUnavailable(_)));
        assert_eq!(db.room_deletions(room.id).unwrap().len(), 1);
    }

    #[test]
    fn contacts_cover_friends_and_roommates() {
        let db = open_temp();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let request = db.send_friend_request(alice, bob).unwrap();
        db.respond_to_request(request.id, bob, huddle_types::models::Decision::Accept)
            .unwrap();
        db.create_group_room(alice, "trio", &[carol]).unwrap();

        let contacts: BTreeSet<Uuid> = db.contacts_of(alice).unwrap().into_iter().collect();
        assert_eq!(contacts, BTreeSet::from([bob, carol]));
    }
}
