use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands sent FROM client TO server over the gateway WebSocket.
///
/// Every inbound frame is one tagged variant; the connection task dispatches
/// them one at a time in arrival order, so the session state machine never
/// sees interleaved handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Authenticate the connection with a signed identity token. Must be
    /// the first command; everything else is rejected until it succeeds.
    Authenticate { token: String },

    /// Enter a realm. Evicts the previous realm subscription, if any.
    JoinRealm { realm_id: Uuid },

    /// Enter a channel of the current realm. Evicts the previous channel
    /// subscription; thread subscriptions are unaffected.
    JoinChannel { channel_id: Uuid },

    /// Subscribe to a thread (additive). The reply carries the thread's
    /// existing messages so the client needs no second round trip.
    JoinThread { thread_id: Uuid },

    /// Post a message into the current channel, or into a thread when
    /// `thread_id` is set. Content is opaque to the server; for encrypted
    /// channels it is ciphertext plus client-side key-derivation metadata.
    SendMessage {
        content: String,
        #[serde(default)]
        thread_id: Option<Uuid>,
        #[serde(default)]
        encrypted: bool,
        #[serde(default)]
        encryption_metadata: Option<String>,
    },

    /// Post a direct message to another user.
    SendDirectMessage {
        target_user_id: Uuid,
        content: String,
        #[serde(default)]
        encrypted: bool,
        #[serde(default)]
        encryption_metadata: Option<String>,
    },

    /// Typing indicator for the current channel. Not persisted.
    Typing,
    StopTyping,

    /// Join the voice room keyed by this channel id. Independent of the
    /// text-channel state: a session may sit in voice for one channel
    /// while reading another.
    JoinVoice { channel_id: Uuid },
    LeaveVoice { channel_id: Uuid },

    /// WebRTC signaling, relayed verbatim to the target user. The server
    /// never inspects the payload.
    VoiceOffer {
        channel_id: Uuid,
        target_user_id: Uuid,
        payload: serde_json::Value,
    },
    VoiceAnswer {
        channel_id: Uuid,
        target_user_id: Uuid,
        payload: serde_json::Value,
    },
    VoiceIceCandidate {
        channel_id: Uuid,
        target_user_id: Uuid,
        payload: serde_json::Value,
    },
}

impl ClientCommand {
    /// Wire name of the command, used in rate-limit error replies.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Authenticate { .. } => "authenticate",
            ClientCommand::JoinRealm { .. } => "join_realm",
            ClientCommand::JoinChannel { .. } => "join_channel",
            ClientCommand::JoinThread { .. } => "join_thread",
            ClientCommand::SendMessage { .. } => "send_message",
            ClientCommand::SendDirectMessage { .. } => "send_direct_message",
            ClientCommand::Typing => "typing",
            ClientCommand::StopTyping => "stop_typing",
            ClientCommand::JoinVoice { .. } => "join_voice",
            ClientCommand::LeaveVoice { .. } => "leave_voice",
            ClientCommand::VoiceOffer { .. } => "voice_offer",
            ClientCommand::VoiceAnswer { .. } => "voice_answer",
            ClientCommand::VoiceIceCandidate { .. } => "voice_ice_candidate",
        }
    }
}

/// A message as fanned out to channel and thread groups, and as returned in
/// thread snapshots. Content and metadata are stored and relayed as opaque
/// strings; the server never decrypts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBroadcast {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub content: String,
    pub thread_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub encrypted: bool,
    pub encryption_metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessageBroadcast {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub recipient_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub encrypted: bool,
    pub encryption_metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceParticipantInfo {
    pub user_id: Uuid,
    pub username: String,
}

/// Events sent FROM server TO client over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Authentication succeeded; the session is now addressable by user id.
    Authenticated { user_id: Uuid, username: String },

    /// Authentication failed. The connection is closed after this event;
    /// the client must reconnect to retry.
    AuthError { error: String },

    JoinedRealm { realm_id: Uuid },
    JoinedChannel { channel_id: Uuid },

    /// Thread subscription confirmed, with the existing message snapshot.
    JoinedThread {
        thread_id: Uuid,
        messages: Vec<MessageBroadcast>,
    },

    /// A recoverable handler failure, delivered only to the originating
    /// connection.
    Error { error: String },

    NewMessage(MessageBroadcast),
    NewThreadMessage(MessageBroadcast),
    NewDirectMessage(DirectMessageBroadcast),

    UserTyping {
        channel_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    UserStoppedTyping {
        channel_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserJoinedChannel {
        channel_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    UserLeftChannel {
        channel_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// Current roster, sent to a joiner entering a voice room.
    VoiceParticipants {
        channel_id: Uuid,
        participants: Vec<VoiceParticipantInfo>,
    },
    UserJoinedVoice {
        channel_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    UserLeftVoice {
        channel_id: Uuid,
        user_id: Uuid,
    },

    /// Relayed WebRTC signaling. Payload is forwarded untouched.
    VoiceOffer {
        channel_id: Uuid,
        from_user_id: Uuid,
        payload: serde_json::Value,
    },
    VoiceAnswer {
        channel_id: Uuid,
        from_user_id: Uuid,
        payload: serde_json::Value,
    },
    VoiceIceCandidate {
        channel_id: Uuid,
        from_user_id: Uuid,
        payload: serde_json::Value,
    },

    /// Non-fatal unless the per-session warning threshold is exceeded.
    /// `retry_after` is seconds until the relevant window resets.
    RateLimitError {
        error: String,
        event: String,
        retry_after: u64,
    },
}
