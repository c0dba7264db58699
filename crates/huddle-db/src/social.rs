use rusqlite::{Connection, params};
use tracing::info;
use uuid::Uuid;

use huddle_types::models::{
    Decision, FriendRequest, FriendRequestStatus, Friendship, PendingRequests, format_timestamp,
};

use crate::error::OptionalExt;
use crate::models::{FRIEND_REQUEST_COLUMNS, FRIENDSHIP_COLUMNS, friend_request, friendship};
use crate::{ChatError, Database, Result, now};

/// What a block did besides writing the block row.
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub block: Friendship,
    /// Pending requests between the pair, now cancelled
    pub cancelled_requests: Vec<FriendRequest>,
    /// The pair were friends before the block
    pub unfriended: bool,
}

impl Database {
    // -- Friend requests --

    pub fn send_friend_request(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<FriendRequest> {
        if sender_id == receiver_id {
            return Err(ChatError::Invalid("cannot send a friend request to yourself".into()));
        }

        self.with_tx(|conn| {
            if blocked_between(conn, sender_id, receiver_id)? {
                return Err(ChatError::Forbidden("one of the users has blocked the other".into()));
            }
            if are_friends(conn, sender_id, receiver_id)? {
                return Err(ChatError::Conflict("users are already friends".into()));
            }
            if pending_request_between(conn, sender_id, receiver_id)?.is_some() {
                return Err(ChatError::Conflict(
                    "a pending friend request already exists between these users".into(),
                ));
            }

            let ts = now();
            let request = FriendRequest {
                id: Uuid::new_v4(),
                sender_id,
                receiver_id,
                status: FriendRequestStatus::Pending,
                created_at: ts,
                updated_at: ts,
            };
            // The partial unique index on the pair backstops the check above.
            conn.execute(
                "INSERT INTO friend_requests (id, sender_id, receiver_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
                params![
                    request.id.to_string(),
                    sender_id.to_string(),
                    receiver_id.to_string(),
                    format_timestamp(ts),
                ],
            )?;

            info!("Friend request {} sent {} -> {}", request.id, sender_id, receiver_id);
            Ok(request)
        })
    }

    /// Accept or reject a pending request. Accepting writes both friendship
    /// rows in the same transaction as the status change.
    pub fn respond_to_request(
        &self,
        request_id: Uuid,
        responder_id: Uuid,
        decision: Decision,
    ) -> Result<FriendRequest> {
        self.with_tx(|conn| {
            let request = load_request(conn, request_id)?;
            if request.receiver_id != responder_id {
                return Err(ChatError::NotAuthorized(
                    "only the receiver may respond to a friend request".into(),
                ));
            }

            let status = match decision {
                Decision::Accept => FriendRequestStatus::Accepted,
                Decision::Reject => FriendRequestStatus::Rejected,
            };
            let request = transition_request(conn, request, status)?;

            if status == FriendRequestStatus::Accepted {
                let ts = format_timestamp(request.updated_at);
                insert_accepted(conn, request.sender_id, request.receiver_id, &ts)?;
                insert_accepted(conn, request.receiver_id, request.sender_id, &ts)?;
            }

            info!("Friend request {} {}", request.id, request.status);
            Ok(request)
        })
    }

    pub fn cancel_request(&self, request_id: Uuid, sender_id: Uuid) -> Result<FriendRequest> {
        self.with_tx(|conn| {
            let request = load_request(conn, request_id)?;
            if request.sender_id != sender_id {
                return Err(ChatError::NotAuthorized(
                    "only the sender may cancel a friend request".into(),
                ));
            }
            transition_request(conn, request, FriendRequestStatus::Cancelled)
        })
    }

    pub fn get_friend_request(&self, request_id: Uuid) -> Result<FriendRequest> {
        self.with_conn(|conn| load_request(conn, request_id))
    }

    // -- Friendships --

    /// Block `target_id`. Any non-block edge from the target back to the
    /// blocker is removed so no one-sided accepted friendship remains, and
    /// pending requests between the pair are cancelled.
    pub fn block_user(&self, user_id: Uuid, target_id: Uuid) -> Result<BlockOutcome> {
        if user_id == target_id {
            return Err(ChatError::Invalid("cannot block yourself".into()));
        }

        self.with_tx(|conn| {
            let unfriended = are_friends(conn, user_id, target_id)?;
            let ts = format_timestamp(now());

            conn.execute(
                "INSERT INTO friendships (id, user_id, friend_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'blocked', ?4, ?4)
                 ON CONFLICT (user_id, friend_id)
                 DO UPDATE SET status = 'blocked', updated_at = excluded.updated_at",
                params![Uuid::new_v4().to_string(), user_id.to_string(), target_id.to_string(), ts],
            )?;
            conn.execute(
                "DELETE FROM friendships WHERE user_id = ?1 AND friend_id = ?2 AND status <> 'blocked'",
                params![target_id.to_string(), user_id.to_string()],
            )?;

            let mut cancelled_requests = Vec::new();
            if let Some(pending) = pending_request_between(conn, user_id, target_id)? {
                cancelled_requests.push(transition_request(
                    conn,
                    pending,
                    FriendRequestStatus::Cancelled,
                )?);
            }

            let block = load_friendship(conn, user_id, target_id)?
                .ok_or_else(|| ChatError::StoreUnavailable("block row vanished".into()))?;

            info!("{} blocked {}", user_id, target_id);
            Ok(BlockOutcome {
                block,
                cancelled_requests,
                unfriended,
            })
        })
    }

    pub fn unblock_user(&self, user_id: Uuid, target_id: Uuid) -> Result<()> {
        self.with_tx(|conn| {
            let removed = conn.execute(
                "DELETE FROM friendships WHERE user_id = ?1 AND friend_id = ?2 AND status = 'blocked'",
                params![user_id.to_string(), target_id.to_string()],
            )?;
            if removed == 0 {
                return Err(ChatError::NotFound(format!("{user_id} has not blocked {target_id}")));
            }
            Ok(())
        })
    }

    /// Remove an accepted friendship; both rows go together.
    pub fn remove_friend(&self, user_id: Uuid, friend_id: Uuid) -> Result<()> {
        self.with_tx(|conn| {
            if !are_friends(conn, user_id, friend_id)? {
                return Err(ChatError::NotFound(format!("{friend_id} is not a friend")));
            }
            conn.execute(
                "DELETE FROM friendships
                 WHERE status = 'accepted'
                   AND ((user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1))",
                params![user_id.to_string(), friend_id.to_string()],
            )?;
            info!("{} and {} are no longer friends", user_id, friend_id);
            Ok(())
        })
    }

    /// Accepted friendships of `user_id`. Only edges present in both
    /// directions are reported.
    pub fn list_friends(&self, user_id: Uuid) -> Result<Vec<Friendship>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {cols} FROM friendships f
                 WHERE f.user_id = ?1 AND f.status = 'accepted'
                   AND EXISTS (SELECT 1 FROM friendships r
                               WHERE r.user_id = f.friend_id AND r.friend_id = f.user_id
                                 AND r.status = 'accepted')
                 ORDER BY f.created_at, f.id",
                cols = prefixed(FRIENDSHIP_COLUMNS, "f")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], friendship)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn list_pending_requests(&self, user_id: Uuid) -> Result<PendingRequests> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {FRIEND_REQUEST_COLUMNS} FROM friend_requests
                 WHERE status = 'pending' AND (receiver_id = ?1 OR sender_id = ?1)
                 ORDER BY created_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], friend_request)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let (incoming, outgoing): (Vec<_>, Vec<_>) =
                rows.into_iter().partition(|r| r.receiver_id == user_id);
            Ok(PendingRequests { incoming, outgoing })
        })
    }

    pub fn is_blocked_between(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.with_conn(|conn| Ok(blocked_between(conn, a, b)?))
    }
}

/// Qualify a column list with a table alias.
pub(crate) fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn blocked_between(conn: &Connection, a: Uuid, b: Uuid) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM friendships
                        WHERE status = 'blocked'
                          AND ((user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)))",
        params![a.to_string(), b.to_string()],
        |row| row.get(0),
    )
}

pub(crate) fn are_friends(conn: &Connection, a: Uuid, b: Uuid) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM friendships
         WHERE status = 'accepted'
           AND ((user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1))",
        params![a.to_string(), b.to_string()],
        |row| row.get(0),
    )?;
    Ok(count == 2)
}

fn pending_request_between(
    conn: &Connection,
    a: Uuid,
    b: Uuid,
) -> rusqlite::Result<Option<FriendRequest>> {
    conn.query_row(
        &format!(
            "SELECT {FRIEND_REQUEST_COLUMNS} FROM friend_requests
             WHERE status = 'pending'
               AND ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))"
        ),
        params![a.to_string(), b.to_string()],
        friend_request,
    )
    .optional()
}

fn load_request(conn: &Connection, request_id: Uuid) -> Result<FriendRequest> {
    conn.query_row(
        &format!("SELECT {FRIEND_REQUEST_COLUMNS} FROM friend_requests WHERE id = ?1"),
        [request_id.to_string()],
        friend_request,
    )
    .optional()?
    .ok_or_else(|| ChatError::NotFound(format!("friend request {request_id}")))
}

fn load_friendship(conn: &Connection, user_id: Uuid, friend_id: Uuid) -> rusqlite::Result<Option<Friendship>> {
    conn.query_row(
        &format!("SELECT {FRIENDSHIP_COLUMNS} FROM friendships WHERE user_id = ?1 AND friend_id = ?2"),
        params![user_id.to_string(), friend_id.to_string()],
        friendship,
    )
    .optional()
}

/// Move a pending request to a terminal state exactly once.
fn transition_request(
    conn: &Connection,
    request: FriendRequest,
    status: FriendRequestStatus,
) -> Result<FriendRequest> {
    if request.status.is_terminal() {
        return Err(ChatError::InvalidState(format!(
            "friend request {} is already {}",
            request.id, request.status
        )));
    }

    let ts = now();
    let updated = conn.execute(
        "UPDATE friend_requests SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'pending'",
        params![request.id.to_string(), status.as_str(), format_timestamp(ts)],
    )?;
    if updated != 1 {
        return Err(ChatError::InvalidState(format!("friend request {} is no longer pending", request.id)));
    }

    Ok(FriendRequest {
        status,
        updated_at: ts,
        ..request
    })
}

fn insert_accepted(conn: &Connection, user_id: Uuid, friend_id: Uuid, ts: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO friendships (id, user_id, friend_id, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'accepted', ?4, ?4)
         ON CONFLICT (user_id, friend_id)
         DO UPDATE SET status = 'accepted', updated_at = excluded.updated_at
         WHERE friendships.status <> 'blocked'",
        params![Uuid::new_v4().to_string(), user_id.to_string(), friend_id.to_string(), ts],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::open_temp;

    #[test]
    fn accept_creates_symmetric_friendship() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let request = db.send_friend_request(alice, bob).unwrap();
        assert_eq!(db.list_pending_requests(bob).unwrap().incoming.len(), 1);
        assert_eq!(db.list_pending_requests(alice).unwrap().outgoing.len(), 1);

        let accepted = db.respond_to_request(request.id, bob, Decision::Accept).unwrap();
        assert_eq!(accepted.status, FriendRequestStatus::Accepted);

        let alice_friends = db.list_friends(alice).unwrap();
        let bob_friends = db.list_friends(bob).unwrap();
        assert_eq!(alice_friends.len(), 1);
        assert_eq!(alice_friends[0].friend_id, bob);
        assert_eq!(bob_friends.len(), 1);
        assert_eq!(bob_friends[0].friend_id, alice);
        assert!(db.list_pending_requests(bob).unwrap().incoming.is_empty());
    }

    #[test]
    fn duplicate_pending_request_conflicts_in_either_direction() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        db.send_friend_request(alice, bob).unwrap();
        assert!(matches!(db.send_friend_request(alice, bob), Err(ChatError::Conflict(_))));
        assert!(matches!(db.send_friend_request(bob, alice), Err(ChatError::Conflict(_))));
    }

    #[test]
    fn concurrent_requests_yield_one_success() {
        let db = Arc::new(open_temp());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let handles: Vec<_> = [(alice, bob), (bob, alice), (alice, bob), (bob, alice)]
            .into_iter()
            .map(|(from, to)| {
                let db = db.clone();
                std::thread::spawn(move || db.send_friend_request(from, to))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ChatError::Conflict(_))));
    }

    #[test]
    fn unique_index_backstops_pending_pair() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        db.send_friend_request(alice, bob).unwrap();

        // Bypass the application check entirely.
        let err = db
            .with_tx(|conn| {
                conn.execute(
                    "INSERT INTO friend_requests (id, sender_id, receiver_id, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'pending', 'x', 'x')",
                    params![Uuid::new_v4().to_string(), bob.to_string(), alice.to_string()],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
    }

    #[test]
    fn only_receiver_responds_and_only_once() {
        let db = open_temp();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let request = db.send_friend_request(alice, bob).unwrap();

        assert!(matches!(
            db.respond_to_request(request.id, carol, Decision::Accept),
            Err(ChatError::NotAuthorized(_))
        ));
        assert!(matches!(
            db.respond_to_request(request.id, alice, Decision::Accept),
            Err(ChatError::NotAuthorized(_))
        ));

        db.respond_to_request(request.id, bob, Decision::Reject).unwrap();
        assert!(matches!(
            db.respond_to_request(request.id, bob, Decision::Accept),
            Err(ChatError::InvalidState(_))
        ));
        assert!(db.list_friends(alice).unwrap().is_empty());

        // Terminal requests free the pair for a new one.
        db.send_friend_request(bob, alice).unwrap();
    }

    #[test]
    fn already_friends_conflicts() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let request = db.send_friend_request(alice, bob).unwrap();
        db.respond_to_request(request.id, bob, Decision::Accept).unwrap();

        assert!(matches!(db.send_friend_request(bob, alice), Err(ChatError::Conflict(_))));
    }

    #[test]
    fn cancel_is_sender_only() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let request = db.send_friend_request(alice, bob).unwrap();

        assert!(matches!(db.cancel_request(request.id, bob), Err(ChatError::NotAuthorized(_))));
        let cancelled = db.cancel_request(request.id, alice).unwrap();
        assert_eq!(cancelled.status, FriendRequestStatus::Cancelled);
        assert!(matches!(db.cancel_request(request.id, alice), Err(ChatError::InvalidState(_))));
        assert!(matches!(
            db.cancel_request(Uuid::new_v4(), alice),
            Err(ChatError::NotFound(_))
        ));
    }

    #[test]
    fn block_breaks_friendship_and_prevents_requests() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let request = db.send_friend_request(alice, bob).unwrap();
        db.respond_to_request(request.id, bob, Decision::Accept).unwrap();

        let outcome = db.block_user(bob, alice).unwrap();
        assert!(outcome.unfriended);
        assert_eq!(outcome.block.status, huddle_types::models::FriendshipStatus::Blocked);

        // Neither side sees a friend any more.
        assert!(db.list_friends(alice).unwrap().is_empty());
        assert!(db.list_friends(bob).unwrap().is_empty());
        assert!(db.is_blocked_between(alice, bob).unwrap());

        assert!(matches!(db.send_friend_request(alice, bob), Err(ChatError::Forbidden(_))));
        assert!(matches!(db.send_friend_request(bob, alice), Err(ChatError::Forbidden(_))));

        db.unblock_user(bob, alice).unwrap();
        assert!(!db.is_blocked_between(alice, bob).unwrap());
        assert!(matches!(db.unblock_user(bob, alice), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn block_cancels_pending_request() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let request = db.send_friend_request(alice, bob).unwrap();

        let outcome = db.block_user(bob, alice).unwrap();
        assert!(!outcome.unfriended);
        assert_eq!(outcome.cancelled_requests.len(), 1);
        assert_eq!(
            db.get_friend_request(request.id).unwrap().status,
            FriendRequestStatus::Cancelled
        );
    }

    #[test]
    fn remove_friend_deletes_both_rows() {
        let db = open_temp();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let request = db.send_friend_request(alice, bob).unwrap();
        db.respond_to_request(request.id, bob, Decision::Accept).unwrap();

        db.remove_friend(bob, alice).unwrap();
        assert!(db.list_friends(alice).unwrap().is_empty());
        assert!(db.list_friends(bob).unwrap().is_empty());
        assert!(matches!(db.remove_friend(bob, alice), Err(ChatError::NotFound(_))));
    }
}
