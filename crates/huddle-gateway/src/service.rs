//! Chat operations shared by the REST surface and the WebSocket gateway.
//!
//! Every mutation runs its SQLite transaction on the blocking pool and then
//! fans the committed change out through the dispatcher. Mutations touching
//! the same room (or the same pair of users) are serialized on a keyed lock
//! held across commit and fan-out, so subscribers observe events in commit
//! order. Each mutation runs in its own task: a caller that goes away does
//! not cancel a write that has already started.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use huddle_db::messages::DeletedMessage;
use huddle_db::rooms::{DeletedRoom, OpenedRoom};
use huddle_db::social::BlockOutcome;
use huddle_db::{ChatError, Database, Result};
use huddle_types::events::GatewayEvent;
use huddle_types::models::{
    Attachment, ChatRoom, Decision, FriendRequest, FriendRequestStatus, Friendship, Message, MessageCursor,
    MessageRead, MessagePage, MessageState, NewMessage, ParticipantRole, PendingRequests, ReadMark, RoomParticipant,
    RoomSummary,
};

use crate::blob::{BlobDeletion, BlobError, BlobStore, classify};
use crate::dispatcher::Dispatcher;
use crate::notify::NotificationSink;
use crate::presence::{PresenceChange, PresenceTracker};

const NOTIFICATION_PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub presence_window: Duration,
    pub typing_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            presence_window: Duration::from_secs(30),
            typing_timeout: Duration::from_secs(5),
        }
    }
}

/// A registered live connection.
pub struct Session {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub room_ids: Vec<Uuid>,
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
}

/// Outcome of an attachment upload.
#[derive(Debug)]
pub struct AttachmentOutcome {
    pub message: Option<Message>,
    pub caption: Option<Message>,
    /// Set when the blob store failed but a caption was still posted
    pub attachment_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Room(Uuid),
    /// Unordered user pair, smaller id first
    Pair(Uuid, Uuid),
    /// Blob url. Taken before a room lock, never while holding one.
    Blob(String),
}

impl LockKey {
    fn pair(a: Uuid, b: Uuid) -> Self {
        if a < b { Self::Pair(a, b) } else { Self::Pair(b, a) }
    }
}

#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: LockKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only the map still references are idle.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Clone)]
pub struct ChatService {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    presence: PresenceTracker,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn NotificationSink>,
    locks: KeyedLocks,
}

fn join_error(e: tokio::task::JoinError) -> ChatError {
    error!("Task join error: {}", e);
    ChatError::StoreUnavailable(format!("task failed: {e}"))
}

impl ChatService {
    pub fn new(
        db: Arc<Database>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn NotificationSink>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                dispatcher: Dispatcher::new(),
                presence: PresenceTracker::new(config.presence_window, config.typing_timeout),
                blobs,
                notifier,
                locks: KeyedLocks::default(),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Run blocking database work off the async runtime.
    async fn db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await.map_err(join_error)?
    }

    /// Run a mutation to completion in its own task.
    async fn detached<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ChatService) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(self.clone())).await.map_err(join_error)?
    }

    async fn lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
        self.inner.locks.acquire(key).await
    }

    // -- Social graph --

    pub async fn send_friend_request(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<FriendRequest> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::pair(sender_id, receiver_id)).await;
            let request = svc.db(move |db| db.send_friend_request(sender_id, receiver_id)).await?;
            svc.inner.dispatcher.send_to_users(
                &[sender_id, receiver_id],
                GatewayEvent::FriendRequestCreated {
                    request: request.clone(),
                },
            );
            Ok(request)
        })
        .await
    }

    pub async fn respond_to_request(
        &self,
        request_id: Uuid,
        responder_id: Uuid,
        decision: Decision,
    ) -> Result<FriendRequest> {
        self.resolve_request(request_id, move |db| db.respond_to_request(request_id, responder_id, decision))
            .await
    }

    pub async fn cancel_request(&self, request_id: Uuid, sender_id: Uuid) -> Result<FriendRequest> {
        self.resolve_request(request_id, move |db| db.cancel_request(request_id, sender_id))
            .await
    }

    async fn resolve_request<F>(&self, request_id: Uuid, apply: F) -> Result<FriendRequest>
    where
        F: FnOnce(&Database) -> Result<FriendRequest> + Send + 'static,
    {
        self.detached(move |svc| async move {
            let pending = svc.db(move |db| db.get_friend_request(request_id)).await?;
            let _guard = svc.lock(LockKey::pair(pending.sender_id, pending.receiver_id)).await;
            let request = svc.db(apply).await?;

            let parties = [request.sender_id, request.receiver_id];
            svc.inner.dispatcher.send_to_users(
                &parties,
                GatewayEvent::FriendRequestResolved {
                    request: request.clone(),
                },
            );
            if request.status == FriendRequestStatus::Accepted {
                svc.share_presence(request.sender_id, request.receiver_id);
            }
            Ok(request)
        })
        .await
    }

    pub async fn block_user(&self, user_id: Uuid, target_id: Uuid) -> Result<BlockOutcome> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::pair(user_id, target_id)).await;
            let outcome = svc.db(move |db| db.block_user(user_id, target_id)).await?;

            let parties = [user_id, target_id];
            for request in &outcome.cancelled_requests {
                svc.inner.dispatcher.send_to_users(
                    &parties,
                    GatewayEvent::FriendRequestResolved {
                        request: request.clone(),
                    },
                );
            }
            if outcome.unfriended {
                svc.inner.dispatcher.send_to_users(
                    &parties,
                    GatewayEvent::FriendshipRemoved {
                        user_id,
                        friend_id: target_id,
                    },
                );
            }
            Ok(outcome)
        })
        .await
    }

    pub async fn unblock_user(&self, user_id: Uuid, target_id: Uuid) -> Result<()> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::pair(user_id, target_id)).await;
            svc.db(move |db| db.unblock_user(user_id, target_id)).await
        })
        .await
    }

    pub async fn remove_friend(&self, user_id: Uuid, friend_id: Uuid) -> Result<()> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::pair(user_id, friend_id)).await;
            svc.db(move |db| db.remove_friend(user_id, friend_id)).await?;
            svc.inner.dispatcher.send_to_users(
                &[user_id, friend_id],
                GatewayEvent::FriendshipRemoved { user_id, friend_id },
            );
            Ok(())
        })
        .await
    }

    pub async fn list_friends(&self, user_id: Uuid) -> Result<Vec<Friendship>> {
        self.db(move |db| db.list_friends(user_id)).await
    }

    pub async fn list_pending_requests(&self, user_id: Uuid) -> Result<PendingRequests> {
        self.db(move |db| db.list_pending_requests(user_id)).await
    }

    // -- Rooms --

    pub async fn open_private_room(&self, user_id: Uuid, other_id: Uuid) -> Result<OpenedRoom> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::pair(user_id, other_id)).await;
            let opened = svc.db(move |db| db.get_or_create_private_room(user_id, other_id)).await?;
            if opened.created {
                svc.announce_room(&opened);
            }
            Ok(opened)
        })
        .await
    }

    pub async fn create_group_room(&self, creator_id: Uuid, name: String, member_ids: Vec<Uuid>) -> Result<OpenedRoom> {
        self.detached(move |svc| async move {
            let opened = svc
                .db(move |db| db.create_group_room(creator_id, &name, &member_ids))
                .await?;
            svc.announce_room(&opened);
            Ok(opened)
        })
        .await
    }

    /// Subscribe the participants' live connections and tell them.
    fn announce_room(&self, opened: &OpenedRoom) {
        let participant_ids: Vec<Uuid> = opened.participants.iter().map(|p| p.user_id).collect();
        for user_id in &participant_ids {
            self.inner.dispatcher.join_user(*user_id, opened.room.id);
        }
        self.inner.dispatcher.send_to_users(
            &participant_ids,
            GatewayEvent::RoomCreated {
                room: opened.room.clone(),
                participant_ids: participant_ids.clone(),
            },
        );
    }

    pub async fn add_participant(&self, room_id: Uuid, actor_id: Uuid, user_id: Uuid) -> Result<RoomParticipant> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::Room(room_id)).await;
            let added = svc.db(move |db| db.add_participant(room_id, actor_id, user_id)).await?;

            svc.inner.dispatcher.join_user(user_id, room_id);
            svc.inner.dispatcher.publish_room(
                room_id,
                GatewayEvent::ParticipantJoined {
                    room_id,
                    user_id,
                    role: added.role,
                    added_by: actor_id,
                },
            );
            Ok(added)
        })
        .await
    }

    pub async fn remove_participant(&self, room_id: Uuid, actor_id: Uuid, user_id: Uuid) -> Result<()> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::Room(room_id)).await;
            svc.db(move |db| db.remove_participant(room_id, actor_id, user_id)).await?;

            svc.inner.dispatcher.publish_room(
                room_id,
                GatewayEvent::ParticipantLeft {
                    room_id,
                    user_id,
                    removed_by: actor_id,
                },
            );
            svc.inner.dispatcher.leave_user(user_id, room_id);
            if svc.inner.presence.stop_typing(room_id, user_id) {
                svc.inner
                    .dispatcher
                    .publish_room(room_id, GatewayEvent::TypingStopped { room_id, user_id });
            }
            Ok(())
        })
        .await
    }

    pub async fn set_participant_role(
        &self,
        room_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> Result<RoomParticipant> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::Room(room_id)).await;
            svc.db(move |db| db.set_participant_role(room_id, actor_id, user_id, role)).await
        })
        .await
    }

    pub async fn delete_room(&self, room_id: Uuid, actor_id: Uuid, reason: String) -> Result<DeletedRoom> {
        self.detached(move |svc| async move {
            let guard = svc.lock(LockKey::Room(room_id)).await;
            let deleted = svc.db(move |db| db.delete_room(room_id, actor_id, &reason)).await?;

            let deletion = &deleted.deletion;
            svc.inner.dispatcher.send_to_users(
                &deleted.former_participants,
                GatewayEvent::RoomDeleted {
                    room_id,
                    deleted_by: deletion.deleted_by,
                    reason: deletion.reason.clone(),
                    deleted_at: deletion.deleted_at,
                },
            );
            svc.inner.dispatcher.drop_room(room_id);
            svc.inner.presence.clear_room(room_id);
            drop(guard);

            for url in &deleted.attachment_urls {
                svc.release_blob(url.clone()).await;
            }
            Ok(deleted)
        })
        .await
    }

    pub async fn list_rooms(&self, user_id: Uuid) -> Result<Vec<RoomSummary>> {
        self.db(move |db| db.list_rooms(user_id)).await
    }

    /// A room and its participants, for participants only.
    pub async fn get_room(&self, room_id: Uuid, requester_id: Uuid) -> Result<(ChatRoom, Vec<RoomParticipant>)> {
        self.db(move |db| {
            let participants = db.list_participants(room_id, requester_id)?;
            Ok((db.get_room(room_id)?, participants))
        })
        .await
    }

    pub async fn list_participants(&self, room_id: Uuid, requester_id: Uuid) -> Result<Vec<RoomParticipant>> {
        self.db(move |db| db.list_participants(room_id, requester_id)).await
    }

    // -- Messages --

    pub async fn post_message(&self, room_id: Uuid, sender_id: Uuid, content: NewMessage) -> Result<Message> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::Room(room_id)).await;
            let (message, participants) = svc
                .db(move |db| {
                    let message = db.post_message(room_id, sender_id, content)?;
                    let participants = db.list_participants(room_id, sender_id)?;
                    Ok((message, participants))
                })
                .await?;

            if svc.inner.presence.stop_typing(room_id, sender_id) {
                svc.inner.dispatcher.publish_room_except(
                    room_id,
                    sender_id,
                    GatewayEvent::TypingStopped {
                        room_id,
                        user_id: sender_id,
                    },
                );
            }
            svc.inner.dispatcher.publish_room(
                room_id,
                GatewayEvent::MessageCreated {
                    message: message.clone(),
                },
            );
            svc.notify_offline(&message, &participants);
            Ok(message)
        })
        .await
    }

    fn notify_offline(&self, message: &Message, participants: &[RoomParticipant]) {
        let now = Instant::now();
        let preview = match (&message.body, &message.attachment) {
            (Some(body), _) => body.chars().take(NOTIFICATION_PREVIEW_CHARS).collect(),
            (None, Some(attachment)) => format!("sent {}", attachment.name),
            (None, None) => String::new(),
        };
        for participant in participants {
            if participant.user_id == message.user_id || self.inner.presence.is_online(participant.user_id, now) {
                continue;
            }
            self.inner
                .notifier
                .notify(participant.user_id, &format!("New message from {}: {}", message.user_id, preview));
        }
    }

    pub async fn send_direct_message(&self, sender_id: Uuid, recipient_id: Uuid, body: String) -> Result<Message> {
        let opened = self.open_private_room(sender_id, recipient_id).await?;
        self.post_message(opened.room.id, sender_id, NewMessage::text(body)).await
    }

    /// Store the bytes, then post an image/file/audio message pointing at
    /// them. A caption is posted as its own text message afterwards. When
    /// the blob store fails the caption still goes out and the failure is
    /// reported in the outcome; without a caption the failure is the result.
    pub async fn post_attachment(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        bytes: Bytes,
        mime: String,
        file_name: String,
        caption: Option<String>,
    ) -> Result<AttachmentOutcome> {
        self.detached(move |svc| async move {
            let allowed = svc.db(move |db| db.is_participant(room_id, sender_id)).await?;
            if !allowed {
                return Err(ChatError::Forbidden(format!(
                    "{sender_id} is not a participant of room {room_id}"
                )));
            }

            let caption = caption.filter(|c| !c.trim().is_empty());
            let mut outcome = AttachmentOutcome {
                message: None,
                caption: None,
                attachment_error: None,
            };
            match svc.post_blob(room_id, sender_id, bytes, mime, file_name).await {
                Ok(message) => outcome.message = Some(message),
                Err(ChatError::AttachmentUnavailable(reason)) if caption.is_some() => {
                    outcome.attachment_error = Some(reason);
                }
                Err(e) => return Err(e),
            }

            if let Some(text) = caption {
                outcome.caption = Some(svc.post_message(room_id, sender_id, NewMessage::text(text)).await?);
            }
            Ok(outcome)
        })
        .await
    }

    /// Store one blob and post the message that references it. The blob
    /// lock is held from the store until the message commits, so a release
    /// of the same content cannot remove the file in between.
    async fn post_blob(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        bytes: Bytes,
        mime: String,
        file_name: String,
    ) -> Result<Message> {
        let unavailable = |e: BlobError| {
            warn!("Attachment upload for room {} by {} failed: {}", room_id, sender_id, e);
            ChatError::AttachmentUnavailable(e.to_string())
        };

        let url = self
            .inner
            .blobs
            .store(bytes.clone(), &mime, sender_id)
            .await
            .map_err(unavailable)?
            .url;
        let _guard = self.lock(LockKey::Blob(url)).await;
        // Stored again under the lock: a release may have won the race for it.
        let stored = self
            .inner
            .blobs
            .store(bytes, &mime, sender_id)
            .await
            .map_err(unavailable)?;

        let content = NewMessage {
            kind: classify(&mime).kind,
            body: None,
            attachment: Some(Attachment {
                url: stored.url.clone(),
                name: file_name,
                size: stored.size,
                mime,
            }),
        };
        match self.post_message(room_id, sender_id, content).await {
            Ok(message) => Ok(message),
            Err(e) => {
                self.release_blob_locked(stored.url).await;
                Err(e)
            }
        }
    }

    /// Bytes and MIME type of an attachment on a message the requester can
    /// currently see. `None` for anything else.
    pub async fn open_blob(
        &self,
        category: String,
        name: String,
        requester_id: Uuid,
    ) -> Result<Option<(Bytes, &'static str)>> {
        let url = format!("/blobs/{category}/{name}");
        if !self.db(move |db| db.attachment_visible_to(&url, requester_id)).await? {
            return Ok(None);
        }
        self.inner
            .blobs
            .open(&category, &name)
            .await
            .map_err(|e| ChatError::AttachmentUnavailable(e.to_string()))
    }

    pub async fn list_messages(
        &self,
        room_id: Uuid,
        requester_id: Uuid,
        cursor: Option<String>,
        page_size: Option<usize>,
    ) -> Result<MessagePage> {
        let cursor = match cursor.as_deref() {
            Some(token) => Some(
                MessageCursor::decode(token)
                    .ok_or_else(|| ChatError::Invalid("malformed pagination cursor".into()))?,
            ),
            None => None,
        };
        self.db(move |db| db.list_messages(room_id, requester_id, cursor, page_size))
            .await
    }

    pub async fn get_message(&self, message_id: Uuid, requester_id: Uuid) -> Result<Message> {
        self.db(move |db| db.get_message(message_id, requester_id)).await
    }

    pub async fn delete_message(&self, message_id: Uuid, actor_id: Uuid) -> Result<Message> {
        self.detached(move |svc| async move {
            let current = svc.db(move |db| db.get_message(message_id, actor_id)).await?;
            let room_id = current.room_id;
            let guard = svc.lock(LockKey::Room(room_id)).await;
            let DeletedMessage { message, attachment } =
                svc.db(move |db| db.delete_message(message_id, actor_id)).await?;

            if let MessageState::Deleted { deleted_by, deleted_at } = message.state {
                svc.inner.dispatcher.publish_room(
                    room_id,
                    GatewayEvent::MessageDeleted {
                        message_id,
                        room_id,
                        deleted_by,
                        deleted_at,
                    },
                );
            }
            drop(guard);
            if let Some(attachment) = attachment {
                svc.release_blob(attachment.url).await;
            }
            Ok(message)
        })
        .await
    }

    /// Blobs are content-addressed; only drop one nothing else points at.
    async fn release_blob(&self, url: String) {
        let _guard = self.lock(LockKey::Blob(url.clone())).await;
        self.release_blob_locked(url).await;
    }

    async fn release_blob_locked(&self, url: String) {
        let lookup = url.clone();
        match self.db(move |db| db.attachment_in_use(&lookup)).await {
            Ok(false) => match self.inner.blobs.delete(&url).await {
                Ok(BlobDeletion::Deleted) => debug!("Released blob {}", url),
                Ok(BlobDeletion::NotFound) => debug!("Blob {} was already gone", url),
                Err(e) => warn!("Failed to release blob {}: {}", url, e),
            },
            Ok(true) => debug!("Blob {} still referenced, keeping it", url),
            Err(e) => warn!("Could not check references for blob {}: {}", url, e),
        }
    }

    pub async fn mark_read(&self, room_id: Uuid, user_id: Uuid, upto_message_id: Uuid) -> Result<ReadMark> {
        self.detached(move |svc| async move {
            let _guard = svc.lock(LockKey::Room(room_id)).await;
            let mark = svc.db(move |db| db.mark_read(room_id, user_id, upto_message_id)).await?;
            if mark.marked > 0 || mark.advanced {
                svc.inner.dispatcher.publish_room(
                    room_id,
                    GatewayEvent::MessageRead {
                        room_id,
                        user_id,
                        upto_message_id,
                        last_read_at: mark.last_read_at,
                    },
                );
            }
            Ok(mark)
        })
        .await
    }

    pub async fn unread_count(&self, room_id: Uuid, user_id: Uuid) -> Result<u64> {
        self.db(move |db| db.unread_count(room_id, user_id)).await
    }

    pub async fn list_message_reads(&self, message_id: Uuid, requester_id: Uuid) -> Result<Vec<MessageRead>> {
        self.db(move |db| db.list_message_reads(message_id, requester_id)).await
    }

    // -- Presence & typing --

    /// Register a live connection: subscribe it to the user's rooms, count
    /// it towards presence and queue the current presence of the user's
    /// online contacts.
    pub async fn connect(&self, user_id: Uuid) -> Result<Session> {
        let dispatcher = &self.inner.dispatcher;
        let (conn_id, events) = dispatcher.register(user_id);

        let lookup = self
            .db(move |db| Ok((db.participant_room_ids(user_id)?, db.contacts_of(user_id)?)))
            .await;
        let (room_ids, contacts) = match lookup {
            Ok(found) => found,
            Err(e) => {
                dispatcher.unregister(conn_id);
                return Err(e);
            }
        };

        for room_id in &room_ids {
            dispatcher.join_room(conn_id, *room_id);
        }
        // A removal that committed before the joins above already ran its
        // leave, so re-check membership now that the joins are in place.
        let room_ids = match self.db(move |db| db.participant_room_ids(user_id)).await {
            Ok(current) => {
                for stale in room_ids.iter().filter(|r| !current.contains(*r)) {
                    dispatcher.leave_room(conn_id, *stale);
                }
                room_ids.into_iter().filter(|r| current.contains(r)).collect::<Vec<_>>()
            }
            Err(e) => {
                dispatcher.unregister(conn_id);
                return Err(e);
            }
        };

        let now = Instant::now();
        for contact in contacts.iter().filter(|c| self.inner.presence.is_online(**c, now)) {
            dispatcher.send_to_connection(
                conn_id,
                GatewayEvent::PresenceChanged {
                    user_id: *contact,
                    online: true,
                },
            );
        }

        if let Some(change) = self.inner.presence.connect(user_id, now) {
            self.broadcast_presence(change, contacts);
        }

        info!(
            "{} connected ({} rooms, {} live connections)",
            user_id,
            room_ids.len(),
            dispatcher.connection_count()
        );
        Ok(Session {
            conn_id,
            user_id,
            room_ids,
            events,
        })
    }

    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) {
        self.inner.dispatcher.unregister(conn_id);
        if let Some(change) = self.inner.presence.disconnect(user_id) {
            self.announce_presence(change).await;
        }
        info!(
            "{} disconnected ({} live connections)",
            user_id,
            self.inner.dispatcher.connection_count()
        );
    }

    pub async fn heartbeat(&self, user_id: Uuid) {
        if let Some(change) = self.inner.presence.heartbeat(user_id, Instant::now()) {
            self.announce_presence(change).await;
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.presence.is_online(user_id, Instant::now())
    }

    /// Join one connection to a room the user participates in. Checked and
    /// joined under the room lock so a concurrent removal cannot slip in
    /// between.
    pub async fn subscribe(&self, conn_id: Uuid, user_id: Uuid, room_id: Uuid) -> Result<()> {
        let _guard = self.lock(LockKey::Room(room_id)).await;
        if !self.db(move |db| db.is_participant(room_id, user_id)).await? {
            return Err(ChatError::Forbidden(format!("{user_id} is not a participant of room {room_id}")));
        }
        self.inner.dispatcher.join_room(conn_id, room_id);
        Ok(())
    }

    pub fn unsubscribe(&self, conn_id: Uuid, room_id: Uuid) {
        self.inner.dispatcher.leave_room(conn_id, room_id);
    }

    pub async fn start_typing(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        if !self.db(move |db| db.is_participant(room_id, user_id)).await? {
            return Err(ChatError::Forbidden(format!("{user_id} is not a participant of room {room_id}")));
        }
        self.inner.presence.start_typing(room_id, user_id, Instant::now());
        let timeout = chrono::Duration::from_std(self.inner.presence.typing_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        self.inner.dispatcher.publish_room_except(
            room_id,
            user_id,
            GatewayEvent::TypingStarted {
                room_id,
                user_id,
                expires_at: Utc::now() + timeout,
            },
        );
        Ok(())
    }

    pub fn stop_typing(&self, room_id: Uuid, user_id: Uuid) {
        if self.inner.presence.stop_typing(room_id, user_id) {
            self.inner
                .dispatcher
                .publish_room_except(room_id, user_id, GatewayEvent::TypingStopped { room_id, user_id });
        }
    }

    /// Periodic pass: stale heartbeats go offline, lapsed typing stops.
    pub async fn sweep_presence(&self) {
        let sweep = self.inner.presence.sweep(Instant::now());
        for (room_id, user_id) in sweep.typing_expired {
            self.inner
                .dispatcher
                .publish_room_except(room_id, user_id, GatewayEvent::TypingStopped { room_id, user_id });
        }
        for user_id in sweep.went_offline {
            debug!("{} missed heartbeats, now offline", user_id);
            self.announce_presence(PresenceChange { user_id, online: false }).await;
        }
    }

    async fn announce_presence(&self, change: PresenceChange) {
        let user_id = change.user_id;
        match self.db(move |db| db.contacts_of(user_id)).await {
            Ok(contacts) => self.broadcast_presence(change, contacts),
            Err(e) => warn!("Could not load contacts of {} for presence: {}", user_id, e),
        }
    }

    fn broadcast_presence(&self, change: PresenceChange, contacts: Vec<Uuid>) {
        self.inner.dispatcher.send_to_users(
            &contacts,
            GatewayEvent::PresenceChanged {
                user_id: change.user_id,
                online: change.online,
            },
        );
    }

    /// New friends learn each other's current presence.
    fn share_presence(&self, a: Uuid, b: Uuid) {
        let now = Instant::now();
        for (subject, viewer) in [(a, b), (b, a)] {
            if self.inner.presence.is_online(subject, now) {
                self.inner.dispatcher.send_to_user(
                    viewer,
                    GatewayEvent::PresenceChanged {
                        user_id: subject,
                        online: true,
                    },
                );
            }
        }
    }
}
