/// Database row types — these map directly to SQLite rows.
/// Distinct from enclave-types API models to keep the DB layer independent.
/// Ids and timestamps cross this boundary as TEXT; parsing is the caller's
/// concern.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: String,
}

pub struct RealmRow {
    pub id: String,
    pub name: String,
    pub visibility: String,
    pub encrypted: bool,
    pub key_hash: Option<String>,
    pub key_salt: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

pub struct ChannelRow {
    pub id: String,
    pub realm_id: String,
    pub name: String,
    pub encrypted: bool,
    pub encrypted_at: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub encrypted: bool,
    pub encryption_metadata: Option<String>,
    pub created_at: String,
}

pub struct InvitationRow {
    pub id: String,
    pub realm_id: String,
    pub code: String,
    pub created_by: String,
    pub max_uses: Option<u32>,
    pub uses_count: u32,
    pub expires_at: Option<String>,
    pub created_at: String,
}
