use std::fmt;

use crate::{CryptoError, keys, secret};

/// A raw realm key in transit between generation and the single response
/// that hands it to the creator. Intentionally neither `Clone`, `Serialize`
/// nor printable: the only way out is [`RawRealmKey::expose`], and `Debug`
/// redacts, so the key cannot end up in logs or storage by accident.
pub struct RawRealmKey(String);

impl RawRealmKey {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper for the one-time creation response.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for RawRealmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawRealmKey(..)")
    }
}

/// Everything realm creation needs: the raw key (returned once, never
/// stored) and the hash + salt pair that is persisted instead.
#[derive(Debug)]
pub struct RealmKeyMaterial {
    pub raw: RawRealmKey,
    pub key_hash: String,
    pub key_salt: String,
}

/// Build realm key material. A caller-supplied key is reused verbatim
/// (e.g. recreating an invite flow with a key already distributed);
/// otherwise a fresh 256-bit key is generated. The hash and salt are
/// always freshly computed.
pub fn create_realm_key(existing: Option<&str>) -> Result<RealmKeyMaterial, CryptoError> {
    let raw = match existing {
        Some(key) => key.to_string(),
        None => keys::generate_realm_key(),
    };

    let key_hash = secret::hash_secret(&raw)?;
    let key_salt = keys::generate_salt();

    Ok(RealmKeyMaterial {
        raw: RawRealmKey(raw),
        key_hash,
        key_salt,
    })
}

/// Check a candidate key against the stored hash at join time.
pub fn verify_realm_key(candidate: &str, stored_hash: &str) -> Result<bool, CryptoError> {
    secret::verify_secret(candidate, stored_hash)
}
