//! User records and the storage capability behind them.
//!
//! The HTTP layer never caches a [`User`] across requests; every request
//! reads the current record through [`UserStore`].

mod json;

use std::path::PathBuf;

use protocol::messages::UserView;
use protocol::{ApiError, Permissions, UserId, ViewMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::UserDefaults;

pub use json::JsonUserStore;

/// Conditions a store can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record does not exist")]
    NotExist,

    #[error("record already exists")]
    Exist,

    #[error("store failure: {0}")]
    Other(String),
}

/// Resource-level mapping. Identity lookups must not use this; they fold
/// `NotExist` into an authentication failure instead.
impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotExist => ApiError::not_found("user does not exist"),
            StoreError::Exist => ApiError::conflict("user already exists"),
            StoreError::Other(msg) => ApiError::internal(msg),
        }
    }
}

/// A registered user.
///
/// `password` holds the PHC-formatted argon2 hash. It is persisted by the
/// store but never leaves the daemon: API responses use [`User::view`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password: String,
    pub locale: String,
    pub view_mode: ViewMode,
    /// Absolute root directory the user is confined to.
    pub scope: PathBuf,
    pub perm: Permissions,
}

impl User {
    /// The client-facing representation, without the password hash.
    pub fn view(&self) -> UserView {
        UserView {
            id: self.id,
            username: self.username.clone(),
            locale: self.locale.clone(),
            view_mode: self.view_mode,
            scope: self.scope.to_string_lossy().into_owned(),
            perm: self.perm,
        }
    }

    /// A new, unsaved user built from configured defaults. With
    /// `create_user_dir` the scope is `<scope>/<username>`.
    pub fn from_defaults(defaults: &UserDefaults, username: &str, password_hash: String) -> Self {
        let scope = if defaults.create_user_dir {
            defaults.scope.join(username)
        } else {
            defaults.scope.clone()
        };
        Self {
            id: 0,
            username: username.to_string(),
            password: password_hash,
            locale: defaults.locale.clone(),
            view_mode: defaults.view_mode,
            scope,
            perm: defaults.permissions,
        }
    }
}

/// Usernames become directory names under `create_user_dir`, so they must
/// be a single safe path segment.
pub fn validate_username(username: &str) -> Result<(), ApiError> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("username is empty"));
    }
    if trimmed != username
        || username == "."
        || username == ".."
        || username.contains(['/', '\\', '\0'])
    {
        return Err(ApiError::validation(format!(
            "username {:?} is not a valid name",
            username
        )));
    }
    Ok(())
}

/// Persistent user storage.
pub trait UserStore: Send + Sync {
    fn get(&self, id: UserId) -> Result<User, StoreError>;

    fn get_by_username(&self, username: &str) -> Result<User, StoreError>;

    /// All users ordered by id.
    fn list(&self) -> Result<Vec<User>, StoreError>;

    /// Insert a new user. The `id` field is ignored and a fresh one is
    /// assigned; the stored record is returned. Fails with
    /// [`StoreError::Exist`] when the username is taken.
    fn save(&self, user: User) -> Result<User, StoreError>;

    /// Replace an existing user. Fails with [`StoreError::NotExist`] for an
    /// unknown id and [`StoreError::Exist`] when renaming onto another
    /// user's name.
    fn update(&self, user: &User) -> Result<(), StoreError>;

    fn delete(&self, id: UserId) -> Result<(), StoreError>;
}
