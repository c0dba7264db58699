use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (social graph, rooms, messages)");
        conn.execute_batch(V1)?;
    }

    info!("Database migrations complete");
    Ok(())
}

const V1: &str = "
BEGIN;

CREATE TABLE friend_requests (
    id          TEXT PRIMARY KEY,
    sender_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'accepted', 'rejected', 'cancelled')),
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    CHECK (sender_id <> receiver_id)
);

-- At most one pending request per unordered pair
CREATE UNIQUE INDEX idx_friend_requests_pending_pair
    ON friend_requests(min(sender_id, receiver_id), max(sender_id, receiver_id))
    WHERE status = 'pending';

CREATE INDEX idx_friend_requests_receiver ON friend_requests(receiver_id, status);
CREATE INDEX idx_friend_requests_sender ON friend_requests(sender_id, status);

-- Accepted friendships are stored as a symmetric pair of rows.
-- A block is a single directed row.
CREATE TABLE friendships (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    friend_id   TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'blocked')),
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE (user_id, friend_id),
    CHECK (user_id <> friend_id)
);

CREATE INDEX idx_friendships_friend ON friendships(friend_id);

CREATE TABLE chat_rooms (
    id          TEXT PRIMARY KEY,
    name        TEXT,
    type        TEXT NOT NULL CHECK (type IN ('private', 'group')),
    created_by  TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT 'active' CHECK (state IN ('active', 'deleted')),
    -- sorted participant pair of an active private room
    pair_key    TEXT UNIQUE,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    deleted_at  TEXT,
    CHECK ((state = 'deleted') = (deleted_at IS NOT NULL)),
    CHECK (pair_key IS NULL OR (type = 'private' AND state = 'active'))
);

CREATE TABLE room_participants (
    id           TEXT PRIMARY KEY,
    room_id      TEXT NOT NULL REFERENCES chat_rooms(id) ON DELETE CASCADE,
    user_id      TEXT NOT NULL,
    role         TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('member', 'admin')),
    joined_at    TEXT NOT NULL,
    last_read_at TEXT,
    UNIQUE (room_id, user_id)
);

CREATE INDEX idx_room_participants_user ON room_participants(user_id);

CREATE TABLE messages (
    id              TEXT PRIMARY KEY,
    room_id         TEXT NOT NULL REFERENCES chat_rooms(id) ON DELETE CASCADE,
    user_id         TEXT NOT NULL,
    type            TEXT NOT NULL CHECK (type IN ('text', 'image', 'file', 'audio')),
    body            TEXT,
    attachment_url  TEXT,
    attachment_name TEXT,
    attachment_size INTEGER,
    attachment_mime TEXT,
    state           TEXT NOT NULL DEFAULT 'active' CHECK (state IN ('active', 'deleted')),
    deleted_by      TEXT,
    deleted_at      TEXT,
    created_at      TEXT NOT NULL,
    CHECK ((state = 'deleted') = (deleted_by IS NOT NULL AND deleted_at IS NOT NULL))
);

CREATE INDEX idx_messages_room_order ON messages(room_id, created_at, id);

CREATE TABLE message_reads (
    id          TEXT PRIMARY KEY,
    message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    user_id     TEXT NOT NULL,
    read_at     TEXT NOT NULL,
    UNIQUE (message_id, user_id)
);

CREATE INDEX idx_message_reads_user ON message_reads(user_id);

CREATE TABLE room_deletions (
    id          TEXT PRIMARY KEY,
    room_id     TEXT NOT NULL REFERENCES chat_rooms(id),
    deleted_by  TEXT NOT NULL,
    reason      TEXT NOT NULL,
    deleted_at  TEXT NOT NULL
);

CREATE TRIGGER room_deletions_no_update BEFORE UPDATE ON room_deletions
BEGIN
    SELECT RAISE(ABORT, 'room_deletions is append-only');
END;

CREATE TRIGGER room_deletions_no_delete BEFORE DELETE ON room_deletions
BEGIN
    SELECT RAISE(ABORT, 'room_deletions is append-only');
END;

INSERT INTO schema_version (version) VALUES (1);

COMMIT;
";
