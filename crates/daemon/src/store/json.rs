//! JSON-file user store.
//!
//! Users live in memory behind a `RwLock` and every mutation is written
//! through to disk (temp file + rename) before the call returns, so a crash
//! never leaves a truncated database behind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use protocol::UserId;
use serde::{Deserialize, Serialize};

use super::{StoreError, User, UserStore};

const STORE_VERSION: u32 = 1;

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct UserStoreData {
    /// Version of the store format (for future migrations).
    version: u32,
    /// Next id to hand out. Ids are never reused, even after deletion.
    next_id: UserId,
    users: Vec<User>,
}

#[derive(Debug)]
struct StoreState {
    next_id: UserId,
    users: HashMap<UserId, User>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            next_id: 1,
            users: HashMap::new(),
        }
    }
}

impl StoreState {
    fn username_taken(&self, username: &str, except: Option<UserId>) -> bool {
        self.users
            .values()
            .any(|u| u.username == username && Some(u.id) != except)
    }
}

/// Thread-safe user store persisted to a JSON file.
pub struct JsonUserStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl JsonUserStore {
    /// Creates an empty store that will persist to `path`.
    ///
    /// This does not read the file; call [`JsonUserStore::load`] or use
    /// [`JsonUserStore::open`].
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Creates a store and loads any existing data from `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the store from its JSON file.
    ///
    /// A missing file leaves the store empty. A file that exists but cannot
    /// be parsed is an error.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("User store not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read user store: {}", self.path.display()))?;

        let data: UserStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse user store: {}", self.path.display()))?;

        if data.version != STORE_VERSION {
            anyhow::bail!(
                "Unsupported user store version {} in {}",
                data.version,
                self.path.display()
            );
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on user store"))?;

        state.users = data.users.into_iter().map(|u| (u.id, u)).collect();
        let max_id = state.users.keys().copied().max().unwrap_or(0);
        state.next_id = data.next_id.max(max_id + 1);

        tracing::info!("Loaded {} users from {:?}", state.users.len(), self.path);
        Ok(())
    }

    /// Number of stored users.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.users.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Other("user store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Other("user store lock poisoned".to_string()))
    }

    /// Writes `state` to disk atomically. Called with the write lock held so
    /// concurrent mutations are serialized on disk in the same order as in
    /// memory.
    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        self.write_file(state)
            .map_err(|e| StoreError::Other(format!("{:#}", e)))
    }

    fn write_file(&self, state: &StoreState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create user store directory: {}", parent.display())
            })?;
        }

        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);

        let data = UserStoreData {
            version: STORE_VERSION,
            next_id: state.next_id,
            users,
        };

        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize user store")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp user store: {}", temp_path.display())
        })?;

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp user store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved {} users to {:?}", data.users.len(), self.path);
        Ok(())
    }
}

impl UserStore for JsonUserStore {
    fn get(&self, id: UserId) -> Result<User, StoreError> {
        self.read()?.users.get(&id).cloned().ok_or(StoreError::NotExist)
    }

    fn get_by_username(&self, username: &str) -> Result<User, StoreError> {
        self.read()?
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or(StoreError::NotExist)
    }

    fn list(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.read()?.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    fn save(&self, mut user: User) -> Result<User, StoreError> {
        let mut state = self.write()?;

        if state.username_taken(&user.username, None) {
            return Err(StoreError::Exist);
        }

        user.id = state.next_id;
        state.next_id += 1;
        state.users.insert(user.id, user.clone());

        if let Err(e) = self.persist(&state) {
            state.users.remove(&user.id);
            state.next_id -= 1;
            return Err(e);
        }

        tracing::info!(user_id = user.id, username = %user.username, "User created");
        Ok(user)
    }

    fn update(&self, user: &User) -> Result<(), StoreError> {
        let mut state = self.write()?;

        if !state.users.contains_key(&user.id) {
            return Err(StoreError::NotExist);
        }
        if state.username_taken(&user.username, Some(user.id)) {
            return Err(StoreError::Exist);
        }

        let previous = state.users.insert(user.id, user.clone());

        if let Err(e) = self.persist(&state) {
            if let Some(previous) = previous {
                state.users.insert(previous.id, previous);
            }
            return Err(e);
        }

        tracing::debug!(user_id = user.id, "User updated");
        Ok(())
    }

    fn delete(&self, id: UserId) -> Result<(), StoreError> {
        let mut state = self.write()?;

        let removed = state.users.remove(&id).ok_or(StoreError::NotExist)?;

        if let Err(e) = self.persist(&state) {
            state.users.insert(removed.id, removed);
            return Err(e);
        }

        tracing::info!(user_id = id, username = %removed.username, "User deleted");
        Ok(())
    }
}
