use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use enclave_db::Database;
use enclave_db::models::MessageRow;
use enclave_types::api::Claims;
use enclave_types::events::{
    ClientCommand, DirectMessageBroadcast, MessageBroadcast, ServerEvent,
};

use crate::limiter::{EventKind, MAX_RATE_LIMIT_WARNINGS, RateLimiter, Verdict};
use crate::router::{RoomKey, RoomRouter};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh connection may take to authenticate before it is dropped.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Upper bound on the message snapshot returned when joining a thread.
const THREAD_SNAPSHOT_LIMIT: u32 = 100;

/// Shared state handed to every connection task.
pub struct GatewayState {
    pub db: Arc<Database>,
    pub router: RoomRouter,
    pub limiter: Arc<RateLimiter>,
    pub jwt_secret: String,
}

/// What to do with the connection after a command has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// Per-connection state. Owned by the reader task; commands are dispatched
/// one at a time, so handlers never see it mid-mutation.
pub struct Session {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    /// At most one realm subscription; joining another evicts this one.
    pub realm: Option<Uuid>,
    /// At most one channel subscription; joining another evicts this one.
    pub channel: Option<Uuid>,
    /// Thread subscriptions are additive and survive channel switches.
    pub threads: HashSet<Uuid>,
    /// At most one voice room.
    pub voice: Option<Uuid>,
    /// Monotonic while connected; only reconnecting resets it.
    pub rate_limit_warnings: u32,
}

impl Session {
    pub fn new(conn_id: Uuid, user_id: Uuid, username: String) -> Self {
        Self {
            conn_id,
            user_id,
            username,
            realm: None,
            channel: None,
            threads: HashSet::new(),
            voice: None,
            rate_limit_warnings: 0,
        }
    }
}

pub async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: the first command must be Authenticate, within the deadline.
    let (user_id, username) = match wait_for_authenticate(&mut receiver, &state.jwt_secret).await {
        AuthOutcome::Accepted { user_id, username } => (user_id, username),
        AuthOutcome::Rejected(reason) => {
            warn!("WebSocket client failed to authenticate: {}", reason);
            let event = ServerEvent::AuthError { error: reason };
            let _ = sender
                .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                .await;
            return;
        }
        AuthOutcome::Gone => {
            warn!("WebSocket client did not authenticate, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: register the connection and confirm.
    let conn_id = Uuid::new_v4();
    let mut outbox = state.router.register(conn_id, user_id, &username).await;
    state
        .router
        .send_to_conn(
            conn_id,
            ServerEvent::Authenticated {
                user_id,
                username: username.clone(),
            },
        )
        .await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Writer: drain the outbox into the socket, with heartbeat pings.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbox.recv() => {
                    let Some(event) = event else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
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
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: dispatch inbound commands one at a time.
    let recv_state = state.clone();
    let mut session = Session::new(conn_id, user_id, username.clone());
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        if handle_command(&recv_state, &mut session, cmd).await == Flow::Disconnect
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let preview: String = text.chars().take(200).collect();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            session.username, session.user_id, e, preview
                        );
                        recv_state
                            .router
                            .send_to_conn(session.conn_id, err("unrecognized command"))
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
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

    // Release every room this connection occupied, then announce the
    // departure to the rooms that still have members.
    let released = state.router.unregister(conn_id).await;
    for room in released {
        match room {
            RoomKey::Channel(channel_id) => {
                state
                    .router
                    .broadcast(
                        room,
                        ServerEvent::UserLeftChannel {
                            channel_id,
                            user_id,
                            username: username.clone(),
                        },
                    )
                    .await;
            }
            RoomKey::Voice(channel_id) => {
                state
                    .router
                    .broadcast(room, ServerEvent::UserLeftVoice { channel_id, user_id })
                    .await;
            }
            _ => {}
        }
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

enum AuthOutcome {
    Accepted { user_id: Uuid, username: String },
    Rejected(String),
    /// Closed or silent until the deadline; nothing to reply to.
    Gone,
}

async fn wait_for_authenticate(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> AuthOutcome {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let deadline = tokio::time::timeout(AUTH_DEADLINE, async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(cmd) = serde_json::from_str::<ClientCommand>(&text) else {
                continue;
            };
            let ClientCommand::Authenticate { token } = cmd else {
                return AuthOutcome::Rejected("not authenticated".to_string());
            };
            return match decode::<Claims>(
                &token,
                &DecodingKey::from_secret(jwt_secret.as_bytes()),
                &Validation::default(),
            ) {
                Ok(data) => AuthOutcome::Accepted {
                    user_id: data.claims.sub,
                    username: data.claims.username,
                },
                Err(_) => AuthOutcome::Rejected("invalid token".to_string()),
            };
        }
        AuthOutcome::Gone
    });

    deadline.await.unwrap_or(AuthOutcome::Gone)
}

/// Handle one inbound command. Returns whether the connection stays open.
///
/// Every reply, including those to the origin connection, goes through the
/// router, so sessions can be driven without a socket.
pub async fn handle_command(
    state: &Arc<GatewayState>,
    session: &mut Session,
    cmd: ClientCommand,
) -> Flow {
    let kind = EventKind::of(&cmd);
    if let Verdict::Limited { retry_after } =
        state.limiter.check_and_consume(Some(session.user_id), kind)
    {
        session.rate_limit_warnings += 1;
        // Round up so clients never retry one second early.
        let retry_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        state
            .router
            .send_to_conn(
                session.conn_id,
                ServerEvent::RateLimitError {
                    error: "rate limit exceeded".to_string(),
                    event: cmd.name().to_string(),
                    retry_after: retry_secs,
                },
            )
            .await;

        if session.rate_limit_warnings > MAX_RATE_LIMIT_WARNINGS {
            warn!(
                "{} ({}) exceeded {} rate limit warnings, disconnecting",
                session.username, session.user_id, MAX_RATE_LIMIT_WARNINGS
            );
            return Flow::Disconnect;
        }
        return Flow::Continue;
    }

    if let Err(e) = dispatch(state, session, cmd).await {
        error!(
            "{} ({}) command failed: {:#}",
            session.username, session.user_id, e
        );
        reply(state, session, err("internal error")).await;
    }
    Flow::Continue
}

async fn dispatch(
    state: &Arc<GatewayState>,
    session: &mut Session,
    cmd: ClientCommand,
) -> Result<()> {
    match cmd {
        ClientCommand::Authenticate { .. } => {
            reply(state, session, err("already authenticated")).await;
            Ok(())
        }
        ClientCommand::JoinRealm { realm_id } => join_realm(state, session, realm_id).await,
        ClientCommand::JoinChannel { channel_id } => {
            join_channel(state, session, channel_id).await
        }
        ClientCommand::JoinThread { thread_id } => join_thread(state, session, thread_id).await,
        ClientCommand::SendMessage {
            content,
            thread_id,
            encrypted,
            encryption_metadata,
        } => send_message(state, session, content, thread_id, encrypted, encryption_metadata).await,
        ClientCommand::SendDirectMessage {
            target_user_id,
            content,
            encrypted,
            encryption_metadata,
        } => {
            send_direct_message(
                state,
                session,
                target_user_id,
                content,
                encrypted,
                encryption_metadata,
            )
            .await
        }
        ClientCommand::Typing => typing(state, session, true).await,
        ClientCommand::StopTyping => typing(state, session, false).await,
        ClientCommand::JoinVoice { channel_id } => join_voice(state, session, channel_id).await,
        ClientCommand::LeaveVoice { channel_id } => leave_voice(state, session, channel_id).await,
        ClientCommand::VoiceOffer {
            channel_id,
            target_user_id,
            payload,
        } => {
            info!(
                "{} ({}) -> voice offer to {}",
                session.username, session.user_id, target_user_id
            );
            state
                .router
                .send_to_user(
                    target_user_id,
                    ServerEvent::VoiceOffer {
                        channel_id,
                        from_user_id: session.user_id,
                        payload,
                    },
                )
                .await;
            Ok(())
        }
        ClientCommand::VoiceAnswer {
            channel_id,
            target_user_id,
            payload,
        } => {
            info!(
                "{} ({}) -> voice answer to {}",
                session.username, session.user_id, target_user_id
            );
            state
                .router
                .send_to_user(
                    target_user_id,
                    ServerEvent::VoiceAnswer {
                        channel_id,
                        from_user_id: session.user_id,
                        payload,
                    },
                )
                .await;
            Ok(())
        }
        ClientCommand::VoiceIceCandidate {
            channel_id,
            target_user_id,
            payload,
        } => {
            state
                .router
                .send_to_user(
                    target_user_id,
                    ServerEvent::VoiceIceCandidate {
                        channel_id,
                        from_user_id: session.user_id,
                        payload,
                    },
                )
                .await;
            Ok(())
        }
    }
}

async fn join_realm(
    state: &Arc<GatewayState>,
    session: &mut Session,
    realm_id: Uuid,
) -> Result<()> {
    let db = state.db.clone();
    let rid = realm_id.to_string();
    let uid = session.user_id.to_string();
    let is_member = tokio::task::spawn_blocking(move || db.is_realm_member(&rid, &uid)).await??;

    if !is_member {
        reply(state, session, err("not a member of this realm")).await;
        return Ok(());
    }

    // Entering a realm clears all channel-scoped state.
    if let Some(old) = session.realm.take() {
        state.router.leave(session.conn_id, RoomKey::Realm(old)).await;
    }
    evict_channel(state, session).await;
    for thread_id in std::mem::take(&mut session.threads) {
        state
            .router
            .leave(session.conn_id, RoomKey::Thread(thread_id))
            .await;
    }
    evict_voice(state, session).await;

    state
        .router
        .join(session.conn_id, RoomKey::Realm(realm_id))
        .await;
    session.realm = Some(realm_id);

    info!(
        "{} ({}) joined realm {}",
        session.username, session.user_id, realm_id
    );
    reply(state, session, ServerEvent::JoinedRealm { realm_id }).await;
    Ok(())
}

async fn join_channel(
    state: &Arc<GatewayState>,
    session: &mut Session,
    channel_id: Uuid,
) -> Result<()> {
    let Some(realm_id) = session.realm else {
        reply(state, session, err("join a realm first")).await;
        return Ok(());
    };

    let db = state.db.clone();
    let cid = channel_id.to_string();
    let channel = tokio::task::spawn_blocking(move || db.get_channel(&cid)).await??;

    let Some(channel) = channel else {
        reply(state, session, err("channel not found")).await;
        return Ok(());
    };
    if channel.realm_id != realm_id.to_string() {
        reply(state, session, err("channel is not in the current realm")).await;
        return Ok(());
    }

    evict_channel(state, session).await;

    state
        .router
        .join(session.conn_id, RoomKey::Channel(channel_id))
        .await;
    session.channel = Some(channel_id);

    state
        .router
        .broadcast_except(
            RoomKey::Channel(channel_id),
            session.conn_id,
            ServerEvent::UserJoinedChannel {
                channel_id,
                user_id: session.user_id,
                username: session.username.clone(),
            },
        )
        .await;

    info!(
        "{} ({}) joined channel {}",
        session.username, session.user_id, channel_id
    );
    reply(state, session, ServerEvent::JoinedChannel { channel_id }).await;
    Ok(())
}

async fn join_thread(
    state: &Arc<GatewayState>,
    session: &mut Session,
    thread_id: Uuid,
) -> Result<()> {
    let db = state.db.clone();
    let tid = thread_id.to_string();
    let uid = session.user_id.to_string();

    // Root message -> its channel -> realm membership, plus the snapshot,
    // in one blocking hop. Non-members get the same reply as a missing
    // thread.
    let snapshot = tokio::task::spawn_blocking(move || -> Result<Option<Vec<MessageRow>>> {
        let Some(root) = db.get_message(&tid)? else {
            return Ok(None);
        };
        let Some(channel) = db.get_channel(&root.channel_id)? else {
            return Ok(None);
        };
        if !db.is_realm_member(&channel.realm_id, &uid)? {
            return Ok(None);
        }
        Ok(Some(db.get_thread_messages(&tid, THREAD_SNAPSHOT_LIMIT)?))
    })
    .await??;

    let Some(rows) = snapshot else {
        reply(state, session, err("thread not found")).await;
        return Ok(());
    };

    let messages = rows
        .into_iter()
        .map(broadcast_from_row)
        .collect::<Result<Vec<_>>>()?;

    state
        .router
        .join(session.conn_id, RoomKey::Thread(thread_id))
        .await;
    session.threads.insert(thread_id);

    reply(
        state,
        session,
        ServerEvent::JoinedThread {
            thread_id,
            messages,
        },
    )
    .await;
    Ok(())
}

async fn send_message(
    state: &Arc<GatewayState>,
    session: &mut Session,
    content: String,
    thread_id: Option<Uuid>,
    encrypted: bool,
    encryption_metadata: Option<String>,
) -> Result<()> {
    let Some(current_channel) = session.channel else {
        reply(state, session, err("join a channel first")).await;
        return Ok(());
    };
    if content.trim().is_empty() {
        reply(state, session, err("message content is empty")).await;
        return Ok(());
    }

    // Thread replies require an explicit subscription, and their rows carry
    // the root's channel rather than the sender's current one.
    let channel_id = match thread_id {
        Some(t) if !session.threads.contains(&t) => {
            reply(state, session, err("join the thread first")).await;
            return Ok(());
        }
        Some(t) => {
            let db = state.db.clone();
            let tid = t.to_string();
            let root = tokio::task::spawn_blocking(move || db.get_message(&tid)).await??;
            match root {
                Some(root) => Uuid::parse_str(&root.channel_id)?,
                None => {
                    reply(state, session, err("thread not found")).await;
                    return Ok(());
                }
            }
        }
        None => current_channel,
    };

    let message_id = Uuid::new_v4();
    let created_at = Utc::now();

    {
        let db = state.db.clone();
        let id = message_id.to_string();
        let cid = channel_id.to_string();
        let tid = thread_id.map(|t| t.to_string());
        let uid = session.user_id.to_string();
        let body = content.clone();
        let meta = encryption_metadata.clone();
        let ts = created_at.to_rfc3339();
        tokio::task::spawn_blocking(move || {
            db.insert_message(
                &id,
                &cid,
                tid.as_deref(),
                &uid,
                &body,
                encrypted,
                meta.as_deref(),
                &ts,
            )
        })
        .await??;
    }

    let broadcast = MessageBroadcast {
        id: message_id,
        channel_id,
        user_id: session.user_id,
        username: session.username.clone(),
        content,
        thread_id,
        created_at,
        encrypted,
        encryption_metadata,
    };

    // Persisted first; a thread reply reaches the thread group only.
    match thread_id {
        Some(t) => {
            state
                .router
                .broadcast(RoomKey::Thread(t), ServerEvent::NewThreadMessage(broadcast))
                .await;
        }
        None => {
            state
                .router
                .broadcast(
                    RoomKey::Channel(channel_id),
                    ServerEvent::NewMessage(broadcast),
                )
                .await;
        }
    }
    Ok(())
}

async fn send_direct_message(
    state: &Arc<GatewayState>,
    session: &mut Session,
    target_user_id: Uuid,
    content: String,
    encrypted: bool,
    encryption_metadata: Option<String>,
) -> Result<()> {
    if content.trim().is_empty() {
        reply(state, session, err("message content is empty")).await;
        return Ok(());
    }

    let db = state.db.clone();
    let target = target_user_id.to_string();
    let target_row = tokio::task::spawn_blocking(move || db.get_user_by_id(&target)).await??;
    if target_row.is_none() {
        reply(state, session, err("user not found")).await;
        return Ok(());
    }

    let message_id = Uuid::new_v4();
    let created_at = Utc::now();

    {
        let db = state.db.clone();
        let id = message_id.to_string();
        let sender = session.user_id.to_string();
        let recipient = target_user_id.to_string();
        let body = content.clone();
        let meta = encryption_metadata.clone();
        let ts = created_at.to_rfc3339();
        tokio::task::spawn_blocking(move || {
            db.insert_direct_message(
                &id,
                &sender,
                &recipient,
                &body,
                encrypted,
                meta.as_deref(),
                &ts,
            )
        })
        .await??;
    }

    let broadcast = DirectMessageBroadcast {
        id: message_id,
        user_id: session.user_id,
        username: session.username.clone(),
        recipient_id: target_user_id,
        content,
        created_at,
        encrypted,
        encryption_metadata,
    };

    // Every connection of both parties hears it; an offline recipient
    // still has the row.
    state
        .router
        .send_to_user(
            target_user_id,
            ServerEvent::NewDirectMessage(broadcast.clone()),
        )
        .await;
    if target_user_id != session.user_id {
        state
            .router
            .send_to_user(session.user_id, ServerEvent::NewDirectMessage(broadcast))
            .await;
    }
    Ok(())
}

async fn typing(state: &Arc<GatewayState>, session: &mut Session, started: bool) -> Result<()> {
    // Best effort; silently ignored without a channel.
    let Some(channel_id) = session.channel else {
        return Ok(());
    };

    let event = if started {
        ServerEvent::UserTyping {
            channel_id,
            user_id: session.user_id,
            username: session.username.clone(),
        }
    } else {
        ServerEvent::UserStoppedTyping {
            channel_id,
            user_id: session.user_id,
            username: session.username.clone(),
        }
    };
    state
        .router
        .broadcast_except(RoomKey::Channel(channel_id), session.conn_id, event)
        .await;
    Ok(())
}

async fn join_voice(
    state: &Arc<GatewayState>,
    session: &mut Session,
    channel_id: Uuid,
) -> Result<()> {
    if session.voice == Some(channel_id) {
        let participants = state.router.voice_roster(channel_id).await;
        reply(
            state,
            session,
            ServerEvent::VoiceParticipants {
                channel_id,
                participants,
            },
        )
        .await;
        return Ok(());
    }

    let db = state.db.clone();
    let cid = channel_id.to_string();
    let uid = session.user_id.to_string();
    let allowed = tokio::task::spawn_blocking(move || -> Result<bool> {
        let Some(channel) = db.get_channel(&cid)? else {
            return Ok(false);
        };
        db.is_realm_member(&channel.realm_id, &uid)
    })
    .await??;

    if !allowed {
        reply(state, session, err("channel not found")).await;
        return Ok(());
    }

    // At most one voice room per session.
    evict_voice(state, session).await;

    let participants = state.router.voice_roster(channel_id).await;
    state
        .router
        .join(session.conn_id, RoomKey::Voice(channel_id))
        .await;
    session.voice = Some(channel_id);

    info!(
        "{} ({}) joined voice in channel {}",
        session.username, session.user_id, channel_id
    );
    reply(
        state,
        session,
        ServerEvent::VoiceParticipants {
            channel_id,
            participants,
        },
    )
    .await;
    state
        .router
        .broadcast_except(
            RoomKey::Voice(channel_id),
            session.conn_id,
            ServerEvent::UserJoinedVoice {
                channel_id,
                user_id: session.user_id,
                username: session.username.clone(),
            },
        )
        .await;
    Ok(())
}

async fn leave_voice(
    state: &Arc<GatewayState>,
    session: &mut Session,
    channel_id: Uuid,
) -> Result<()> {
    if session.voice == Some(channel_id) {
        evict_voice(state, session).await;
        info!(
            "{} ({}) left voice in channel {}",
            session.username, session.user_id, channel_id
        );
    }
    Ok(())
}

/// Leave the current channel, announcing the departure to whoever is left.
async fn evict_channel(state: &Arc<GatewayState>, session: &mut Session) {
    if let Some(channel_id) = session.channel.take() {
        state
            .router
            .leave(session.conn_id, RoomKey::Channel(channel_id))
            .await;
        state
            .router
            .broadcast(
                RoomKey::Channel(channel_id),
                ServerEvent::UserLeftChannel {
                    channel_id,
                    user_id: session.user_id,
                    username: session.username.clone(),
                },
            )
            .await;
    }
}

async fn evict_voice(state: &Arc<GatewayState>, session: &mut Session) {
    if let Some(channel_id) = session.voice.take() {
        state
            .router
            .leave(session.conn_id, RoomKey::Voice(channel_id))
            .await;
        state
            .router
            .broadcast(
                RoomKey::Voice(channel_id),
                ServerEvent::UserLeftVoice {
                    channel_id,
                    user_id: session.user_id,
                },
            )
            .await;
    }
}

async fn reply(state: &GatewayState, session: &Session, event: ServerEvent) {
    state.router.send_to_conn(session.conn_id, event).await;
}

fn err(text: &str) -> ServerEvent {
    ServerEvent::Error {
        error: text.to_string(),
    }
}

fn broadcast_from_row(row: MessageRow) -> Result<MessageBroadcast> {
    Ok(MessageBroadcast {
        id: Uuid::parse_str(&row.id)?,
        channel_id: Uuid::parse_str(&row.channel_id)?,
        user_id: Uuid::parse_str(&row.author_id)?,
        username: row.author_username,
        content: row.content,
        thread_id: row.thread_id.as_deref().map(Uuid::parse_str).transpose()?,
        created_at: DateTime::parse_from_rfc3339(&row.created_at)?.with_timezone(&Utc),
        encrypted: row.encrypted,
        encryption_metadata: row.encryption_metadata,
    })
}
