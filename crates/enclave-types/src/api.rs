use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Channel, Realm, RealmSummary, Visibility};

// -- JWT Claims --

/// JWT claims shared by enclave-api (REST middleware) and enclave-gateway
/// (WebSocket authentication). Canonical definition lives here in
/// enclave-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Realms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRealmRequest {
    pub name: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub encrypted: bool,
    /// Optional caller-supplied raw realm key (hex). When absent and
    /// `encrypted` is set, the server generates one and returns it exactly
    /// once in the response.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateRealmResponse {
    #[serde(flatten)]
    pub realm: Realm,
    /// One-time raw realm key, present only when the server generated it.
    /// Never retrievable again; only a one-way hash is stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Key-derivation salt for the realm, handed to the creator for
    /// out-of-band distribution alongside the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_salt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
    /// Immutable per-channel encryption opt-in; defaults to false even
    /// inside an encrypted realm.
    #[serde(default)]
    pub encrypted: bool,
}

pub type CreateChannelResponse = Channel;

// -- Invitations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateInviteRequest {
    #[serde(default)]
    pub max_uses: Option<u32>,
    /// Lifetime in hours; absent means the code never expires.
    #[serde(default)]
    pub expires_in: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CreateInviteResponse {
    pub code: String,
    pub max_uses: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    /// True for encrypted realms: the invitee will also need the realm key,
    /// shared through a side channel the inviter controls.
    pub requires_encryption_key: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinByCodeRequest {
    pub code: String,
    #[serde(default)]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JoinByCodeResponse {
    pub success: bool,
    pub realm: RealmSummary,
}
