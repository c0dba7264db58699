use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use huddle_types::events::GatewayEvent;

/// Routes gateway events to live connections.
///
/// Each connection owns an unbounded channel drained by its send task, so
/// events pushed here in some order reach every socket in that order.
/// Publishing never awaits.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
    /// conn_id -> connection
    connections: HashMap<Uuid, Connection>,
    /// user_id -> conn_ids
    users: HashMap<Uuid, HashSet<Uuid>>,
    /// room_id -> subscribed conn_ids
    rooms: HashMap<Uuid, HashSet<Uuid>>,
}

struct Connection {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    rooms: HashSet<Uuid>,
}

impl Registry {
    fn join(&mut self, conn_id: Uuid, room_id: Uuid) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.rooms.insert(room_id);
        self.rooms.entry(room_id).or_default().insert(conn_id)
    }

    fn leave(&mut self, conn_id: Uuid, room_id: Uuid) -> bool {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.rooms.remove(&room_id);
        }
        let Some(members) = self.rooms.get_mut(&room_id) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.rooms.remove(&room_id);
        }
        removed
    }

    fn user_conns(&self, user_id: Uuid) -> Vec<Uuid> {
        self.users
            .get(&user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    fn send(&self, conn_id: Uuid, event: GatewayEvent) {
        if let Some(conn) = self.connections.get(&conn_id) {
            // Receiver gone means the connection is closing; unregister follows.
            let _ = conn.tx.send(event);
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection for `user_id`. Returns (conn_id, receiver).
    pub fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reg = self.write();
        reg.connections.insert(
            conn_id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        reg.users.entry(user_id).or_default().insert(conn_id);
        (conn_id, rx)
    }

    /// Drop a connection and all of its room subscriptions.
    pub fn unregister(&self, conn_id: Uuid) {
        let mut reg = self.write();
        let Some(conn) = reg.connections.remove(&conn_id) else {
            return;
        };
        for room_id in &conn.rooms {
            if let Some(members) = reg.rooms.get_mut(room_id) {
                members.remove(&conn_id);
                if members.is_empty() {
                    reg.rooms.remove(room_id);
                }
            }
        }
        if let Some(conns) = reg.users.get_mut(&conn.user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                reg.users.remove(&conn.user_id);
            }
        }
    }

    pub fn join_room(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        self.write().join(conn_id, room_id)
    }

    pub fn leave_room(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        self.write().leave(conn_id, room_id)
    }

    /// Subscribe every live connection of `user_id` to `room_id`.
    pub fn join_user(&self, user_id: Uuid, room_id: Uuid) {
        let mut reg = self.write();
        for conn_id in reg.user_conns(user_id) {
            reg.join(conn_id, room_id);
        }
    }

    pub fn leave_user(&self, user_id: Uuid, room_id: Uuid) {
        let mut reg = self.write();
        for conn_id in reg.user_conns(user_id) {
            reg.leave(conn_id, room_id);
        }
    }

    /// Forget a room's fan-out set entirely.
    pub fn drop_room(&self, room_id: Uuid) {
        let mut reg = self.write();
        if let Some(members) = reg.rooms.remove(&room_id) {
            for conn_id in members {
                if let Some(conn) = reg.connections.get_mut(&conn_id) {
                    conn.rooms.remove(&room_id);
                }
            }
        }
    }

    pub fn send_to_connection(&self, conn_id: Uuid, event: GatewayEvent) {
        self.read().send(conn_id, event);
    }

    /// Send to every live connection of a user.
    pub fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let reg = self.read();
        for conn_id in reg.user_conns(user_id) {
            reg.send(conn_id, event.clone());
        }
    }

    pub fn send_to_users(&self, user_ids: &[Uuid], event: GatewayEvent) {
        let reg = self.read();
        let unique: HashSet<&Uuid> = user_ids.iter().collect();
        for user_id in unique {
            for conn_id in reg.user_conns(*user_id) {
                reg.send(conn_id, event.clone());
            }
        }
    }

    /// Send to every connection subscribed to the room.
    pub fn publish_room(&self, room_id: Uuid, event: GatewayEvent) {
        self.publish_filtered(room_id, event, None);
    }

    /// Like `publish_room`, skipping the connections of `user_id`.
    pub fn publish_room_except(&self, room_id: Uuid, user_id: Uuid, event: GatewayEvent) {
        self.publish_filtered(room_id, event, Some(user_id));
    }

    fn publish_filtered(&self, room_id: Uuid, event: GatewayEvent, skip_user: Option<Uuid>) {
        let reg = self.read();
        let Some(members) = reg.rooms.get(&room_id) else {
            trace!("No live subscribers for room {}", room_id);
            return;
        };
        for conn_id in members {
            let Some(conn) = reg.connections.get(conn_id) else {
                continue;
            };
            if Some(conn.user_id) == skip_user {
                continue;
            }
            let _ = conn.tx.send(event.clone());
        }
    }

    pub fn is_subscribed(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        self.read()
            .connections
            .get(&conn_id)
            .is_some_and(|c| c.rooms.contains(&room_id))
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing_stopped(room_id: Uuid, user_id: Uuid) -> GatewayEvent {
        GatewayEvent::TypingStopped { room_id, user_id }
    }

    #[test]
    fn room_events_reach_only_subscribers() {
        let dispatcher = Dispatcher::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let room = Uuid::new_v4();

        let (a_conn, mut a_rx) = dispatcher.register(alice);
        let (_b_conn, mut b_rx) = dispatcher.register(bob);
        dispatcher.join_room(a_conn, room);

        dispatcher.publish_room(room, typing_stopped(room, bob));
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn publish_except_skips_all_of_the_users_connections() {
        let dispatcher = Dispatcher::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let room = Uuid::new_v4();

        let (_, mut a1) = dispatcher.register(alice);
        let (_, mut a2) = dispatcher.register(alice);
        let (_, mut b) = dispatcher.register(bob);
        dispatcher.join_user(alice, room);
        dispatcher.join_user(bob, room);

        dispatcher.publish_room_except(room, alice, typing_stopped(room, alice));
        assert!(a1.try_recv().is_err());
        assert!(a2.try_recv().is_err());
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn unregister_cleans_up_every_index() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let room = Uuid::new_v4();

        let (conn, _rx) = dispatcher.register(alice);
        dispatcher.join_room(conn, room);
        assert_eq!(dispatcher.connection_count(), 1);

        dispatcher.unregister(conn);
        assert!(!dispatcher.is_subscribed(conn, room));
        assert_eq!(dispatcher.connection_count(), 0);
        // Publishing to an empty room is a no-op.
        dispatcher.publish_room(room, typing_stopped(room, alice));
    }

    #[test]
    fn drop_room_unsubscribes_everyone() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();
        let (conn, mut rx) = dispatcher.register(Uuid::new_v4());
        dispatcher.join_room(conn, room);

        dispatcher.drop_room(room);
        assert!(!dispatcher.is_subscribed(conn, room));
        dispatcher.publish_room(room, typing_stopped(room, Uuid::new_v4()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_arrive_in_publish_order() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();
        let (conn, mut rx) = dispatcher.register(Uuid::new_v4());
        dispatcher.join_room(conn, room);

        let senders: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
        for user in &senders {
            dispatcher.publish_room(room, typing_stopped(room, *user));
        }
        for user in &senders {
            match rx.try_recv().unwrap() {
                GatewayEvent::TypingStopped { user_id, .. } => assert_eq!(user_id, *user),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
