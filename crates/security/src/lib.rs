//! Authentication for the media storage service.
//!
//! There is exactly one account. A client trades its username and password
//! for a short-lived signed token and then presents that token on every
//! storage request.

pub mod password;
pub mod token;

pub use password::{generate_token_secret, hash_password, verify_password, TOKEN_SECRET_LEN};
pub use token::{TokenAuthority, TOKEN_TTL};

use tracing::debug;

/// Authentication failures. Callers must only ever expose these as a generic
/// "unauthorized" answer; the variant is meant for server-side logs.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("password does not match")]
    InvalidPassword,
    #[error("stored password hash is unusable: {0}")]
    MalformedHash(String),
    #[error("cannot verify empty token")]
    MissingToken,
    #[error("token signed with an unexpected algorithm")]
    UnexpectedAlgorithm,
    #[error("token signature does not verify")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("failed to parse token: {0}")]
    MalformedToken(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// The single configured account.
#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
}

/// Checks credentials and hands out tokens for the configured account.
pub struct Authenticator {
    account: Account,
    tokens: TokenAuthority,
}

impl Authenticator {
    pub fn new(account: Account, token_secret: &[u8]) -> Self {
        Self {
            account,
            tokens: TokenAuthority::new(token_secret),
        }
    }

    pub fn username(&self) -> &str {
        &self.account.username
    }

    /// Returns a fresh token when `user` and `password` match the account.
    pub fn authenticate(&self, user: &str, password: &str) -> Result<String, AuthError> {
        if user != self.account.username {
            return Err(AuthError::UnknownUser(user.to_string()));
        }
        verify_password(password, &self.account.password_hash)?;

        let token = self.tokens.issue()?;
        debug!("Issued token for {}", user);
        Ok(token)
    }

    pub fn verify_token(&self, token: Option<&str>) -> Result<(), AuthError> {
        match token {
            Some(token) => self.tokens.verify(token),
            None => Err(AuthError::MissingToken),
        }
    }
}
