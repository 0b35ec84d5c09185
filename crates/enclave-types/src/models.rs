use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a user inside a realm. Stored as lowercase text in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealmRole {
    Owner,
    Admin,
    Member,
}

impl RealmRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealmRole::Owner => "owner",
            RealmRole::Admin => "admin",
            RealmRole::Member => "member",
        }
    }

    /// Invitation minting is restricted to roles above plain member.
    pub fn can_mint_invitations(&self) -> bool {
        matches!(self, RealmRole::Owner | RealmRole::Admin)
    }

    /// Channel administration shares the minting gate.
    pub fn can_manage_channels(&self) -> bool {
        matches!(self, RealmRole::Owner | RealmRole::Admin)
    }
}

impl std::str::FromStr for RealmRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(RealmRole::Owner),
            "admin" => Ok(RealmRole::Admin),
            "member" => Ok(RealmRole::Member),
            other => Err(format!("unknown realm role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

/// Public realm descriptor. The realm key hash and salt never leave the
/// database through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Realm {
    pub id: Uuid,
    pub name: String,
    pub visibility: Visibility,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
}

/// Minimal realm identification returned from invite joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmSummary {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub name: String,
    /// Per-channel end-to-end encryption flag. Independent of the realm
    /// flag: channels inside an encrypted realm still default to false.
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
}
