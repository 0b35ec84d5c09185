use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;

/// Alphabet for invite codes: 32 characters, so a masked byte indexes it
/// without modulo bias. Skips the lookalikes I, O, 0 and 1.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fill a fixed-size buffer from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a random 256-bit realm key, hex encoded (64 characters).
pub fn generate_realm_key() -> String {
    hex::encode(random_bytes::<32>())
}

/// Generate a random 128-bit key-derivation salt, hex encoded (32 characters).
pub fn generate_salt() -> String {
    hex::encode(random_bytes::<16>())
}

/// Generate a short random code over [`CODE_ALPHABET`]. Uniqueness is the
/// caller's problem (collision-check against storage before use).
pub fn generate_code(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf.iter()
        .map(|b| CODE_ALPHABET[(b & 0x1f) as usize] as char)
        .collect()
}
