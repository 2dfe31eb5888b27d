//! Credential backends for `POST /api/login`.
//!
//! The backend is chosen once from configuration; the login route calls it
//! the same way regardless of which one is active. Every rejection is an
//! [`ErrorKind::AuthFailure`](protocol::ErrorKind::AuthFailure) so the
//! caller cannot tell an unknown username from a wrong password.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::HeaderMap;
use protocol::messages::LoginRequest;
use protocol::ApiError;

use super::password::{verify_against_dummy, verify_password};
use crate::config::{AuthConfig, AuthMethod};
use crate::store::{StoreError, User, UserStore};

/// What a login request presented: its headers and raw body.
#[derive(Debug, Clone, Default)]
pub struct LoginAttempt {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Checks a login attempt and returns the authenticated user.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn authenticate(
        &self,
        attempt: &LoginAttempt,
        store: Arc<dyn UserStore>,
    ) -> Result<User, ApiError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Build the verifier selected by `[auth] method`.
pub fn from_config(config: &AuthConfig) -> Arc<dyn CredentialVerifier> {
    match config.method {
        AuthMethod::Password => Arc::new(PasswordVerifier),
        AuthMethod::Proxy => Arc::new(ProxyVerifier {
            header: config.header.clone(),
        }),
        AuthMethod::HostTrust => Arc::new(HostTrustVerifier {
            username: config.host_user.clone(),
        }),
    }
}

fn lookup(store: &dyn UserStore, username: &str) -> Result<User, ApiError> {
    match store.get_by_username(username) {
        Ok(user) => Ok(user),
        Err(StoreError::NotExist) => Err(ApiError::auth_failure(format!(
            "no user named {:?}",
            username
        ))),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

/// Username and password from a JSON body, checked against the argon2 hash.
pub struct PasswordVerifier;

#[async_trait]
impl CredentialVerifier for PasswordVerifier {
    async fn authenticate(
        &self,
        attempt: &LoginAttempt,
        store: Arc<dyn UserStore>,
    ) -> Result<User, ApiError> {
        let request: LoginRequest = serde_json::from_slice(&attempt.body)
            .map_err(|e| ApiError::auth_failure(format!("unreadable login body: {}", e)))?;

        tokio::task::spawn_blocking(move || {
            let user = match store.get_by_username(&request.username) {
                Ok(user) => user,
                Err(StoreError::NotExist) => {
                    verify_against_dummy(&request.password);
                    return Err(ApiError::auth_failure(format!(
                        "no user named {:?}",
                        request.username
                    )));
                }
                Err(e) => return Err(ApiError::internal(e.to_string())),
            };

            if verify_password(&request.password, &user.password) {
                Ok(user)
            } else {
                Err(ApiError::auth_failure(format!(
                    "wrong password for {:?}",
                    request.username
                )))
            }
        })
        .await
        .map_err(|e| ApiError::internal(format!("password check task failed: {}", e)))?
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Trusts a username header set by an authenticating reverse proxy.
pub struct ProxyVerifier {
    pub header: String,
}

#[async_trait]
impl CredentialVerifier for ProxyVerifier {
    async fn authenticate(
        &self,
        attempt: &LoginAttempt,
        store: Arc<dyn UserStore>,
    ) -> Result<User, ApiError> {
        let username = attempt
            .headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::auth_failure(format!("missing {} header", self.header)))?;

        lookup(store.as_ref(), username)
    }

    fn name(&self) -> &'static str {
        "proxy"
    }
}

/// No credentials at all: every login is the configured host user.
pub struct HostTrustVerifier {
    pub username: String,
}

#[async_trait]
impl CredentialVerifier for HostTrustVerifier {
    async fn authenticate(
        &self,
        _attempt: &LoginAttempt,
        store: Arc<dyn UserStore>,
    ) -> Result<User, ApiError> {
        lookup(store.as_ref(), &self.username)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
