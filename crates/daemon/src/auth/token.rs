//! Stateless authentication tokens.
//!
//! Tokens are HS256 JWTs carrying the user id, a fixed issuer and a 24 hour
//! expiry. Nothing is stored server-side: a token is valid exactly when its
//! signature checks out under the process signing key and the current time
//! is before `exp`.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use protocol::{ApiError, UserId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issuer embedded in every token.
pub const TOKEN_ISSUER: &str = "Filekeep";

/// Token lifetime in seconds.
pub const TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

/// Minimum accepted signing key length in bytes.
pub const MIN_KEY_LEN: usize = 32;

/// Length of a generated signing key in bytes.
const GENERATED_KEY_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signing key must be at least {MIN_KEY_LEN} bytes, got {0}")]
    KeyTooShort(usize),

    #[error("system clock is before the Unix epoch")]
    Clock,

    #[error("failed to sign token: {0}")]
    Encode(String),
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        ApiError::internal(err.to_string())
    }
}

/// Payload stored in the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

/// Signs and verifies tokens with one symmetric key fixed at construction.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(key: &[u8]) -> Result<Self, TokenError> {
        if key.len() < MIN_KEY_LEN {
            return Err(TokenError::KeyTooShort(key.len()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // exp is enforced by `verify_at` (rejects when now >= exp).
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
        })
    }

    /// Issue a token for `user_id` valid for [`TOKEN_LIFETIME_SECS`].
    pub fn issue(&self, user_id: UserId) -> Result<String, TokenError> {
        self.issue_at(user_id, unix_now()?)
    }

    /// Issue a token as if the current time were `now` (Unix seconds).
    pub fn issue_at(&self, user_id: UserId, now: u64) -> Result<String, TokenError> {
        let claims = Claims {
            user_id,
            iss: TOKEN_ISSUER.to_string(),
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Encode(e.to_string()))
    }

    /// Verify a token against the current time.
    ///
    /// Returns the user id, or `None` for any failure: bad signature,
    /// malformed structure, wrong issuer or expired. The reason is
    /// deliberately not reported.
    pub fn verify(&self, token: &str) -> Option<UserId> {
        let now = unix_now().ok()?;
        self.verify_at(token, now)
    }

    /// Verify a token as if the current time were `now` (Unix seconds).
    pub fn verify_at(&self, token: &str, now: u64) -> Option<UserId> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).ok()?;
        if now >= data.claims.exp {
            return None;
        }
        Some(data.claims.user_id)
    }
}

fn unix_now() -> Result<u64, TokenError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| TokenError::Clock)
}

/// Loads the signing key from `path`, or generates and saves a new one.
///
/// The file holds the key as base64 text. A freshly generated key is written
/// with mode 0600 on Unix.
pub fn load_or_generate_key(path: &Path) -> Result<Vec<u8>> {
    let engine = base64::engine::general_purpose::STANDARD;

    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read signing key: {}", path.display()))?;
        let key = engine
            .decode(contents.trim())
            .with_context(|| format!("Signing key is not valid base64: {}", path.display()))?;
        if key.len() < MIN_KEY_LEN {
            anyhow::bail!(
                "Invalid signing key in {}: expected at least {} bytes, got {}",
                path.display(),
                MIN_KEY_LEN,
                key.len()
            );
        }
        return Ok(key);
    }

    let mut key = vec![0u8; GENERATED_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    fs::write(path, engine.encode(&key))
        .with_context(|| format!("Failed to write signing key: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict signing key: {}", path.display()))?;
    }

    tracing::info!("Generated new signing key and saved to {:?}", path);
    Ok(key)
}
