//! HMAC tokens for bridge commands that change the PLC.
//!
//! Token format: `base64(<unix_secs>:<client_id>:<hmac_sha256("<unix_secs>:<client_id>")>)`.
//! The client id must match the one announced in the connection's `hello`.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Tokens issued further in the future than this are rejected.
const MAX_CLOCK_SKEW_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token has expired (age: {age_secs}s, max: {max_secs}s)")]
    TokenExpired { age_secs: u64, max_secs: u64 },

    #[error("Token issued {ahead_secs}s in the future")]
    IssuedInFuture { ahead_secs: u64 },

    #[error("Invalid token format")]
    InvalidFormat,

    #[error("Token was issued to client '{token}', connection is '{connection}'")]
    ClientMismatch { token: String, connection: String },

    #[error("Token signature verification failed")]
    InvalidSignature,

    #[error("Token decode error: {0}")]
    DecodeError(String),

    #[error("Unusable HMAC key")]
    InvalidKey,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Shared secret for HMAC signing
    pub secret: Vec<u8>,
    /// Maximum token age in seconds
    pub max_age_secs: u64,
    /// Whether mutating commands need a token
    pub enabled: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: Vec::new(),
            max_age_secs: 300,
            enabled: false,
        }
    }
}

pub struct TokenValidator {
    secret: Vec<u8>,
    max_age_secs: u64,
}

impl TokenValidator {
    pub fn new(secret: Vec<u8>, max_age_secs: u64) -> Self {
        Self {
            secret,
            max_age_secs,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.secret.clone(), config.max_age_secs)
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidKey)
    }

    /// Checks signature, age and client binding of `token`.
    pub fn validate(&self, token: &str, client_id: &str) -> Result<TokenClaims, AuthError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|e| AuthError::DecodeError(e.to_string()))?;

        let mut parts = decoded.splitn(3, |&b| b == b':');
        let timestamp_bytes = parts.next().ok_or(AuthError::InvalidFormat)?;
        let client_bytes = parts.next().ok_or(AuthError::InvalidFormat)?;
        let signature = parts.next().ok_or(AuthError::InvalidFormat)?;
        let signed_len = timestamp_bytes.len() + 1 + client_bytes.len();

        let issued_at: u64 = std::str::from_utf8(timestamp_bytes)
            .map_err(|_| AuthError::InvalidFormat)?
            .parse()
            .map_err(|_| AuthError::InvalidFormat)?;
        let token_client =
            std::str::from_utf8(client_bytes).map_err(|_| AuthError::InvalidFormat)?;

        let now = unix_now_secs();
        if issued_at > now + MAX_CLOCK_SKEW_SECS {
            return Err(AuthError::IssuedInFuture {
                ahead_secs: issued_at - now,
            });
        }
        let age = now.saturating_sub(issued_at);
        if age > self.max_age_secs {
            return Err(AuthError::TokenExpired {
                age_secs: age,
                max_secs: self.max_age_secs,
            });
        }

        let mut mac = self.mac()?;
        mac.update(&decoded[..signed_len]);
        mac.verify_slice(signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        if token_client != client_id {
            return Err(AuthError::ClientMismatch {
                token: token_client.to_string(),
                connection: client_id.to_string(),
            });
        }

        Ok(TokenClaims {
            issued_at,
            age_secs: age,
            client_id: token_client.to_string(),
        })
    }

    /// Issues a token for `client_id`, which must not contain `:`.
    pub fn generate_token(&self, client_id: &str) -> Result<String, AuthError> {
        self.generate_token_at(client_id, unix_now_secs())
    }

    pub fn generate_token_at(&self, client_id: &str, issued_at: u64) -> Result<String, AuthError> {
        if client_id.contains(':') {
            return Err(AuthError::InvalidFormat);
        }
        let payload = format!("{issued_at}:{client_id}");
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        let mut token_data = payload.into_bytes();
        token_data.push(b':');
        token_data.extend_from_slice(&signature);
        Ok(base64::engine::general_purpose::STANDARD.encode(&token_data))
    }
}

#[derive(Debug, Clone)]
pub struct TokenClaims {
    /// Unix timestamp when the token was issued
    pub issued_at: u64,
    pub age_secs: u64,
    pub client_id: String,
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> Vec<u8> {
        b"test-secret-key-for-hmac".to_vec()
    }

    #[test]
    fn test_generate_and_validate_token() {
        let validator = TokenValidator::new(test_secret(), 300);

        let token = validator.generate_token("hmi-1").unwrap();
        let claims = validator.validate(&token, "hmi-1").unwrap();

        assert!(claims.age_secs < 5);
        assert_eq!(claims.client_id, "hmi-1");
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let validator = TokenValidator::new(test_secret(), 300);
        let wrong_validator = TokenValidator::new(b"wrong-key".to_vec(), 300);

        let token = wrong_validator.generate_token("hmi-1").unwrap();
        let result = validator.validate(&token, "hmi-1");

        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_token_bound_to_client() {
        let validator = TokenValidator::new(test_secret(), 300);
        let token = validator.generate_token("hmi-1").unwrap();
        assert!(matches!(
            validator.validate(&token, "hmi-2"),
            Err(AuthError::ClientMismatch { .. })
        ));
    }

    #[test]
    fn test_expired_and_future_tokens_rejected() {
        let validator = TokenValidator::new(test_secret(), 60);
        let now = unix_now_secs();

        let old = validator.generate_token_at("hmi-1", now - 120).unwrap();
        assert!(matches!(
            validator.validate(&old, "hmi-1"),
            Err(AuthError::TokenExpired { .. })
        ));

        let future = validator.generate_token_at("hmi-1", now + 600).unwrap();
        assert!(matches!(
            validator.validate(&future, "hmi-1"),
            Err(AuthError::IssuedInFuture { .. })
        ));
    }

    #[test]
    fn test_invalid_format_rejected() {
        let validator = TokenValidator::new(test_secret(), 300);

        // Not valid base64
        assert!(matches!(
            validator.validate("not-valid-base64!!!", "hmi-1"),
            Err(AuthError::DecodeError(_))
        ));

        // Valid base64 but no separators
        let invalid = base64::engine::general_purpose::STANDARD.encode(b"no-colon-here");
        assert!(matches!(
            validator.validate(&invalid, "hmi-1"),
            Err(AuthError::InvalidFormat)
        ));

        assert!(matches!(
            validator.generate_token("bad:id"),
            Err(AuthError::InvalidFormat)
        ));
    }
}
