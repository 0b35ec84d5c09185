use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};

use crate::CryptoError;

/// AES-GCM standard nonce size. A fresh random nonce is drawn per
/// encryption; nonces must never repeat under the same key.
pub const NONCE_LEN: usize = 12;

/// Encrypt a plaintext with AES-256-GCM. Returns (ciphertext, nonce);
/// the 16-byte authentication tag is appended to the ciphertext.
pub fn encrypt_message(
    key: &[u8; 32],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt an AES-256-GCM ciphertext. Fails with [`CryptoError::DecryptionFailed`]
/// whenever the tag does not verify; the cause is never disclosed.
pub fn decrypt_message(
    key: &[u8; 32],
    ciphertext: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
