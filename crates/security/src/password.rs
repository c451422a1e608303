use argon2::password_hash::{rand_core::OsRng as ArgonOsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::AuthError;

/// Size of a freshly generated token signing secret.
pub const TOKEN_SECRET_LEN: usize = 32;

/// Hash a password using Argon2 with a random salt, returning a PHC string.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut ArgonOsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::MalformedHash(format!("password hashing failed: {e}")))?;

    Ok(password_hash.to_string())
}

/// Verify a password against a stored PHC hash. The comparison is done by
/// Argon2 in constant time.
pub fn verify_password(password: &str, hash: &str) -> Result<(), AuthError> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| AuthError::MalformedHash(e.to_string()))?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| AuthError::InvalidPassword)
}

/// Random key for signing access tokens.
pub fn generate_token_secret() -> Vec<u8> {
    let mut secret = vec![0u8; TOKEN_SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}
