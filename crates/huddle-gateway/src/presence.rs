//! Process-local presence and typing state.
//!
//! A user is online while they hold at least one connection and their last
//! heartbeat is inside the liveness window. Every mutating call returns the
//! transitions it caused so the caller can fan them out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: Uuid,
    pub online: bool,
}

/// Result of one sweep pass.
#[derive(Debug, Default)]
pub struct Sweep {
    pub went_offline: Vec<Uuid>,
    /// (room_id, user_id) pairs whose typing indicator lapsed
    pub typing_expired: Vec<(Uuid, Uuid)>,
}

#[derive(Debug)]
struct UserPresence {
    connections: usize,
    last_heartbeat_at: Instant,
    online: bool,
}

#[derive(Default)]
struct State {
    users: HashMap<Uuid, UserPresence>,
    /// (room_id, user_id) -> started_at
    typing: HashMap<(Uuid, Uuid), Instant>,
}

pub struct PresenceTracker {
    state: Mutex<State>,
    window: Duration,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(window: Duration, typing_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            window,
            typing_timeout,
        }
    }

    pub fn typing_timeout(&self) -> Duration {
        self.typing_timeout
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self, user_id: Uuid, now: Instant) -> Option<PresenceChange> {
        let mut state = self.lock();
        let entry = state.users.entry(user_id).or_insert(UserPresence {
            connections: 0,
            last_heartbeat_at: now,
            online: false,
        });
        entry.connections += 1;
        entry.last_heartbeat_at = now;
        mark_online(user_id, entry)
    }

    pub fn disconnect(&self, user_id: Uuid) -> Option<PresenceChange> {
        let mut state = self.lock();
        let entry = state.users.get_mut(&user_id)?;
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections > 0 {
            return None;
        }

        let was_online = entry.online;
        state.users.remove(&user_id);
        state.typing.retain(|(_, uid), _| *uid != user_id);
        was_online.then_some(PresenceChange {
            user_id,
            online: false,
        })
    }

    /// Refresh liveness. A connected user flipped offline by a sweep comes
    /// back online here.
    pub fn heartbeat(&self, user_id: Uuid, now: Instant) -> Option<PresenceChange> {
        let mut state = self.lock();
        let entry = state.users.get_mut(&user_id)?;
        entry.last_heartbeat_at = now;
        if entry.connections == 0 {
            return None;
        }
        mark_online(user_id, entry)
    }

    pub fn is_online(&self, user_id: Uuid, now: Instant) -> bool {
        self.lock().users.get(&user_id).is_some_and(|p| {
            p.online && p.connections > 0 && now.saturating_duration_since(p.last_heartbeat_at) <= self.window
        })
    }

    /// Record or refresh a typing indicator. Returns when it lapses.
    pub fn start_typing(&self, room_id: Uuid, user_id: Uuid, now: Instant) -> Instant {
        self.lock().typing.insert((room_id, user_id), now);
        now + self.typing_timeout
    }

    /// Returns whether the user was typing.
    pub fn stop_typing(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.lock().typing.remove(&(room_id, user_id)).is_some()
    }

    /// Drop typing entries for a room that no longer exists.
    pub fn clear_room(&self, room_id: Uuid) {
        self.lock().typing.retain(|(rid, _), _| *rid != room_id);
    }

    /// Flip users with a stale heartbeat offline and expire old typing
    /// indicators.
    pub fn sweep(&self, now: Instant) -> Sweep {
        let mut state = self.lock();
        let mut sweep = Sweep::default();

        for (user_id, presence) in state.users.iter_mut() {
            if presence.online && now.saturating_duration_since(presence.last_heartbeat_at) > self.window {
                presence.online = false;
                sweep.went_offline.push(*user_id);
            }
        }

        let timeout = self.typing_timeout;
        state.typing.retain(|key, started| {
            let alive = now.saturating_duration_since(*started) < timeout;
            if !alive {
                sweep.typing_expired.push(*key);
            }
            alive
        });

        sweep
    }
}

fn mark_online(user_id: Uuid, entry: &mut UserPresence) -> Option<PresenceChange> {
    if entry.online {
        return None;
    }
    entry.online = true;
    Some(PresenceChange {
        user_id,
        online: true,
    })
}
