use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};

use crate::CryptoError;

/// One-way adaptive hash of a secret (realm key or account password),
/// returned as a PHC string with an embedded random salt.
pub fn hash_secret(secret: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CryptoError::Hashing(e.to_string()))
}

/// Verify a secret against a stored PHC hash. A mismatch is `Ok(false)`;
/// only malformed hashes or backend failures are errors.
pub fn verify_secret(secret: &str, stored_hash: &str) -> Result<bool, CryptoError> {
    let parsed = PasswordHash::new(stored_hash).map_err(|e| CryptoError::Hashing(e.to_string()))?;

    match Argon2::default().verify_password(secret.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(CryptoError::Hashing(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_secret("open sesame").unwrap();
        assert!(verify_secret("open sesame", &hash).unwrap());
        assert!(!verify_secret("open sesamf", &hash).unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_secret("open sesame").unwrap();
        let b = hash_secret("open sesame").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_hash_is_an_error_not_a_mismatch() {
        assert!(verify_secret("anything", "not-a-phc-string").is_err());
    }
}
