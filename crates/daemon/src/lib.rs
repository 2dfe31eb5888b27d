//! # Filekeep Daemon Library
//!
//! This crate provides the server side of Filekeep: a multi-user file
//! manager exposed over a small HTTP API.
//!
//! ## Overview
//!
//! Every user owns a scope, an absolute directory they are confined to, and
//! a set of permission bits. The daemon provides:
//!
//! - **Authentication**: signed tokens, argon2 password hashes and
//!   pluggable credential backends (password, proxy header, host trust)
//! - **Scope resolution**: logical paths are cleaned, permission-checked and
//!   confined to the caller's scope before anything touches the disk
//! - **Resources**: streamed directory listings, ranged downloads, atomic
//!   uploads, rename/copy/delete and batch operations
//! - **User administration**: a JSON-backed user store with admin routes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Orchestrator                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │       HTTP server (routing, request logging)       │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐   │
//! │  │ Token codec  │  │    Scope     │  │  User store   │   │
//! │  │ + verifiers  │  │   resolver   │  │    (JSON)     │   │
//! │  └──────────────┘  └──────────────┘  └───────────────┘   │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │    Files: browser, transfer, ops (confined I/O)    │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = Orchestrator::new(config)?;
//!     if let Some(password) = orchestrator.bootstrap_admin().await? {
//!         println!("admin password: {}", password);
//!     }
//!
//!     // Serves until `orchestrator.stop()` is called.
//!     orchestrator.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Tokens, password hashing and credential verifiers
//! - [`store`]: User records and the JSON user store
//! - [`files`]: Scope resolution, listings, transfers and file operations
//! - [`server`]: HTTP connection loop and route handlers
//! - [`orchestrator`]: Startup wiring and lifecycle

pub mod auth;
pub mod config;
pub mod files;
pub mod orchestrator;
pub mod server;
pub mod store;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use auth::{CredentialVerifier, TokenCodec};

pub use files::{Operation, ResolvedTarget, ScopeResolver};

pub use store::{JsonUserStore, User, UserStore};

pub use server::{serve, AppState};

pub use orchestrator::{Orchestrator, OrchestratorState};
