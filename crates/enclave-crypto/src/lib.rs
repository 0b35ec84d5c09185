//! Enclave crypto library.
//!
//! Stateless primitives shared by the key lifecycle services:
//! - password-based key derivation (PBKDF2-HMAC-SHA256, 100k iterations)
//! - authenticated message encryption (AES-256-GCM)
//! - one-way adaptive secret hashing (argon2id) for realm keys and passwords
//! - CSPRNG key, salt, and code-byte generation
//!
//! The server never decrypts channel traffic and never stores a raw realm
//! key; everything recoverable stops at this crate's hashing boundary.

pub mod encrypt;
pub mod kdf;
pub mod keys;
pub mod realm_key;
pub mod secret;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    /// Deliberately cause-free: wrong key, corrupted ciphertext, and
    /// tampered nonce must be indistinguishable to callers.
    #[error("decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("secret hashing failed: {0}")]
    Hashing(String),
}
