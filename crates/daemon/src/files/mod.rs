//! File operations confined to per-user scopes.
//!
//! - [`scope`] turns a logical path plus an operation into a
//!   [`ResolvedTarget`] or a denial
//! - [`browser`] streams sorted directory listings
//! - [`transfer`] streams downloads and commits uploads atomically
//! - [`ops`] deletes, renames and copies, singly or in batches
//!
//! # Security
//!
//! Nothing outside [`scope`] builds filesystem paths from request input.
//! Symlinks are resolved and must stay inside the user's scope root.

pub mod browser;
pub mod ops;
pub mod scope;
pub mod transfer;

pub use browser::{list_directory, ListingReceiver};
pub use scope::{resolve_for, Operation, ResolvedTarget, ScopeResolver};
pub use transfer::{open_download, write_atomic, Download, TransferError};
