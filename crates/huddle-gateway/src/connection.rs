use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use huddle_db::ChatError;
use huddle_types::api::ErrorKind;
use huddle_types::events::{GatewayCommand, GatewayEvent};
use huddle_types::models::NewMessage;

use crate::auth::user_id_from_token;
use crate::service::{ChatService, Session};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long an unauthenticated socket may stay open waiting for Identify.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connecting -> Authenticated -> Subscribed -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Authenticated,
    Subscribed,
    Closed,
}

fn advance(state: &mut ConnectionState, next: ConnectionState, user_id: Option<Uuid>) {
    trace!("Connection {:?}: {:?} -> {:?}", user_id, state, next);
    *state = next;
}

fn encode(event: &GatewayEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            None
        }
    }
}

/// Serve one WebSocket. `user_id` is set when the upgrade request already
/// carried a valid token; otherwise the client must send `Identify`.
pub async fn handle_connection(
    socket: WebSocket,
    service: ChatService,
    jwt_secret: Arc<str>,
    user_id: Option<Uuid>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut state = ConnectionState::Connecting;

    let user_id = match user_id {
        Some(id) => id,
        None => match wait_for_identify(&mut receiver, &jwt_secret).await {
            Some(id) => id,
            None => {
                warn!("WebSocket client failed to identify, closing");
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        },
    };
    advance(&mut state, ConnectionState::Authenticated, Some(user_id));

    let session = match service.connect(user_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Could not register connection for {}: {}", user_id, e);
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    advance(&mut state, ConnectionState::Subscribed, Some(user_id));

    let ready = GatewayEvent::Ready {
        user_id,
        room_ids: session.room_ids.clone(),
    };
    let sent = match encode(&ready) {
        Some(msg) => sender.send(msg).await.is_ok(),
        None => false,
    };
    if sent {
        run_connection_loop(sender, receiver, &service, session.conn_id, user_id, session.events).await;
    }

    service.disconnect(user_id, session.conn_id).await;
    advance(&mut state, ConnectionState::Closed, Some(user_id));
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    service: &ChatService,
    conn_id: Uuid,
    user_id: Uuid,
    mut events: tokio::sync::mpsc::UnboundedReceiver<GatewayEvent>,
) {
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events to the client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(msg) = encode(&event) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_service = service.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_service, conn_id, user_id, cmd).await,
                    Err(e) => {
                        warn!("{} bad command: {} -- raw: {}", user_id, e, truncate(&text, 200));
                        recv_service.dispatcher().send_to_connection(
                            conn_id,
                            GatewayEvent::Error {
                                command: "unknown".into(),
                                kind: ErrorKind::Invalid,
                                message: format!("unrecognized command: {e}"),
                            },
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                    recv_service.heartbeat(user_id).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, jwt_secret: &str) -> Option<Uuid> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) {
                    return user_id_from_token(&token, jwt_secret);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

/// Apply one command. Failures go back to this connection only.
async fn handle_command(service: &ChatService, conn_id: Uuid, user_id: Uuid, cmd: GatewayCommand) {
    let name = cmd.name();
    if let Err(e) = apply_command(service, conn_id, user_id, cmd).await {
        debug!("{} command {} failed: {}", user_id, name, e);
        service.dispatcher().send_to_connection(
            conn_id,
            GatewayEvent::Error {
                command: name.to_string(),
                kind: e.kind(),
                message: e.to_string(),
            },
        );
    }
}

async fn apply_command(
    service: &ChatService,
    conn_id: Uuid,
    user_id: Uuid,
    cmd: GatewayCommand,
) -> Result<(), ChatError> {
    match cmd {
        GatewayCommand::Identify { .. } => {
            Err(ChatError::InvalidState("connection is already identified".into()))
        }

        GatewayCommand::Heartbeat => {
            trace!("{} heartbeat", user_id);
            service.heartbeat(user_id).await;
            Ok(())
        }

        GatewayCommand::Subscribe { room_ids } => {
            let mut refused = Vec::new();
            for room_id in room_ids {
                match service.subscribe(conn_id, user_id, room_id).await {
                    Ok(()) => {}
                    Err(ChatError::Forbidden(_)) => refused.push(room_id),
                    Err(e) => return Err(e),
                }
            }
            if refused.is_empty() {
                Ok(())
            } else {
                Err(ChatError::Forbidden(format!("not a participant of rooms {refused:?}")))
            }
        }

        GatewayCommand::Unsubscribe { room_ids } => {
            for room_id in room_ids {
                service.unsubscribe(conn_id, room_id);
            }
            Ok(())
        }

        GatewayCommand::StartTyping { room_id } => service.start_typing(room_id, user_id).await,

        GatewayCommand::StopTyping { room_id } => {
            service.stop_typing(room_id, user_id);
            Ok(())
        }

        GatewayCommand::SendMessage { room_id, body } => {
            service.post_message(room_id, user_id, NewMessage::text(body)).await?;
            Ok(())
        }

        GatewayCommand::MarkRead {
            room_id,
            upto_message_id,
        } => {
            service.mark_read(room_id, user_id, upto_message_id).await?;
            Ok(())
        }

        GatewayCommand::SendFriendRequest { receiver_id } => {
            service.send_friend_request(user_id, receiver_id).await?;
            Ok(())
        }

        GatewayCommand::RespondFriendRequest {
            request_id,
            decision,
        } => {
            info!("{} responding to friend request {}: {}", user_id, request_id, decision);
            service.respond_to_request(request_id, user_id, decision).await?;
            Ok(())
        }
    }
}

/// Run commands against a registered session without a socket. Events and
/// errors land on the session's receiver exactly as they would on the wire.
pub async fn dispatch_command(service: &ChatService, session: &Session, cmd: GatewayCommand) {
    handle_command(service, session.conn_id, session.user_id, cmd).await;
}
