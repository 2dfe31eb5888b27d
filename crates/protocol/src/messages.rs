//! Request and response bodies exchanged over the HTTP API.
//!
//! All structured payloads are JSON. Field names use camelCase on the wire
//! so browser clients can consume them without remapping.

use serde::{Deserialize, Serialize};

/// Numeric user identifier, assigned by the store on insert.
pub type UserId = u64;

// ============================================================================
// Authentication
// ============================================================================

/// Body of `POST /api/login`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Body of `POST /api/signup`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
}

// ============================================================================
// Users
// ============================================================================

/// The fixed set of capability bits attached to every user.
///
/// `admin` implies every other bit. `share` and `execute` are carried for
/// clients that act on them; no resource operation on this server checks
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub admin: bool,
    pub create: bool,
    pub rename: bool,
    pub modify: bool,
    pub delete: bool,
    pub share: bool,
    pub download: bool,
    pub execute: bool,
}

impl Permissions {
    /// Every bit set, including `admin`.
    pub fn all() -> Self {
        Self {
            admin: true,
            create: true,
            rename: true,
            modify: true,
            delete: true,
            share: true,
            download: true,
            execute: true,
        }
    }

    /// Only `download`: the user can browse and read but not change anything.
    pub fn read_only() -> Self {
        Self {
            download: true,
            ..Self::default()
        }
    }
}

/// Default file view for a user's client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    List,
    Mosaic,
}

/// A user as returned by the API. The password hash is never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: UserId,
    pub username: String,
    pub locale: String,
    pub view_mode: ViewMode,
    pub scope: String,
    pub perm: Permissions,
}

/// Body of `POST /api/users` and `PUT /api/users/{id}`.
///
/// Absent fields keep their current value on update and take the configured
/// default on create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub locale: Option<String>,
    pub view_mode: Option<ViewMode>,
    pub scope: Option<String>,
    pub perm: Option<Permissions>,
}

// ============================================================================
// Resources
// ============================================================================

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingEntry {
    pub name: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time, Unix epoch seconds.
    pub modified: u64,
    pub is_dir: bool,
}

/// A complete directory listing as a client sees it once the streamed body
/// has been read: `{"path": "/docs", "items": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub path: String,
    pub items: Vec<ListingEntry>,
}

/// Single-item action selected with `PATCH ...?action=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    Rename,
    Copy,
}

impl PatchAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rename" | "move" => Some(PatchAction::Rename),
            "copy" => Some(PatchAction::Copy),
            _ => None,
        }
    }
}

/// Operation applied to every item of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Delete,
    Copy,
    Move,
}

/// One entry of a batch. Paths are relative to the directory in the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub from: String,
    /// Destination for copy/move; ignored for delete.
    #[serde(default)]
    pub to: Option<String>,
}

/// Body of `PATCH /api/resources/{dir}` in batch form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub action: BatchAction,
    pub items: Vec<BatchItem>,
}

/// Result for one batch item. `error` carries the status line of the
/// failure, e.g. `"409 Conflict"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub path: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `GET /api/resources/{file}?checksum=sha256`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumResponse {
    pub path: String,
    pub size: u64,
    pub algorithm: String,
    pub checksum: String,
}
