use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Iteration count for password-derived channel keys. Deliberately slow;
/// clients derive once per channel unlock and cache the result locally.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Derive a 256-bit symmetric key from a channel password and salt.
/// Deterministic: the same (password, salt) pair always yields the same
/// key, so every member of a channel derives the same key independently.
pub fn derive_password_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}
