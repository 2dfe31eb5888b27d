//! # Filekeep Protocol Library
//!
//! Wire types for the Filekeep file-management API, shared by the daemon
//! and any Rust client.
//!
//! ## Overview
//!
//! - **Error taxonomy**: [`ErrorKind`] and [`ApiError`], with the mapping to
//!   HTTP status lines that every failed request is reduced to
//! - **Messages**: login/signup bodies, user records, permission bits,
//!   directory listings, batch requests and per-item outcomes
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ApiError, ErrorKind};
//! use protocol::messages::Permissions;
//!
//! let perm = Permissions::read_only();
//! assert!(perm.download && !perm.delete);
//!
//! let err = ApiError::conflict("destination exists");
//! assert_eq!(err.kind(), ErrorKind::Conflict);
//! assert_eq!(err.status_line(), "409 Conflict");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Request and response bodies
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ApiError, ErrorKind, Result};
pub use messages::{Permissions, UserId, ViewMode};
