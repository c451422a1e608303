//! Stateless HS256 access tokens.
//!
//! A token only carries its issue and expiry time. Whether it is valid is
//! decided from the signature and the clock; nothing is stored server side,
//! so tokens cannot be revoked before they expire.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::AuthError;

/// Lifetime of an issued token.
pub const TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

const TOKEN_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: u64,
    exp: u64,
}

/// Issues and verifies tokens signed with a server-held symmetric key.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenAuthority {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(TOKEN_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl: TOKEN_TTL,
        }
    }

    pub fn issue(&self) -> Result<String, AuthError> {
        self.issue_at(SystemTime::now())
    }

    /// Issues a token as if it had been created at `issued_at`.
    pub fn issue_at(&self, issued_at: SystemTime) -> Result<String, AuthError> {
        let iat = issued_at
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthError::Signing("issue time before unix epoch".into()))?;
        let claims = Claims {
            iat: iat.as_secs(),
            exp: (iat + self.ttl).as_secs(),
        };

        encode(&Header::new(TOKEN_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|_| ())
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidAlgorithm => AuthError::UnexpectedAlgorithm,
                _ => AuthError::MalformedToken(err.to_string()),
            })
    }
}
