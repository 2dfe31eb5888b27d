//! Daemon orchestrator for wiring together all components.
//!
//! The `Orchestrator` loads the signing key and user store described by the
//! configuration, makes sure an administrator exists, and runs the HTTP
//! server until it is told to stop.

use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::Permissions;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{hash_password, load_or_generate_key};
use crate::config::Config;
use crate::server::{self, AppState};
use crate::store::{JsonUserStore, User, UserStore};

/// Length of the generated first-run admin password.
const BOOTSTRAP_PASSWORD_LEN: usize = 24;

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    /// Accepting connections.
    Running,
    ShuttingDown,
}

/// Owns the shared server state and the shutdown signal.
pub struct Orchestrator {
    config: Config,
    store: Arc<JsonUserStore>,
    app: Arc<AppState>,
    state: Arc<RwLock<OrchestratorState>>,
    shutdown_token: CancellationToken,
}

impl Orchestrator {
    /// Load the signing key and user store, and prepare the default scope
    /// directory.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let key = load_or_generate_key(&config.key_path())?;

        let store = Arc::new(
            JsonUserStore::open(config.users_path()).context("Failed to load user store")?,
        );

        std::fs::create_dir_all(&config.defaults.scope).with_context(|| {
            format!(
                "Failed to create default scope: {}",
                config.defaults.scope.display()
            )
        })?;

        let app = AppState::new(
            config.clone(),
            &key,
            Arc::clone(&store) as Arc<dyn UserStore>,
        )
        .context("Failed to initialize token codec")?;

        Ok(Self {
            config,
            store,
            app: Arc::new(app),
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            shutdown_token: CancellationToken::new(),
        })
    }

    /// On an empty store, create the host user as an administrator with a
    /// random password. Returns the generated password, if any.
    pub async fn bootstrap_admin(&self) -> Result<Option<String>> {
        if !self.store.is_empty()? {
            debug!("User store populated, skipping admin bootstrap");
            return Ok(None);
        }

        let password: String = rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(BOOTSTRAP_PASSWORD_LEN)
            .map(char::from)
            .collect();

        let to_hash = password.clone();
        let hash = tokio::task::spawn_blocking(move || hash_password(&to_hash))
            .await
            .context("Password hashing task failed")??;

        let mut admin = User::from_defaults(&self.config.defaults, &self.config.auth.host_user, hash);
        admin.scope = self.config.defaults.scope.clone();
        admin.perm = Permissions::all();

        let admin = self.store.save(admin)?;
        info!(
            user_id = admin.id,
            username = %admin.username,
            "Created initial admin account"
        );
        Ok(Some(password))
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Running;
        }

        let result = server::serve(
            listener,
            Arc::clone(&self.app),
            self.shutdown_token.clone(),
        )
        .await;

        *self.state.write().await = OrchestratorState::Stopped;
        if let Err(e) = &result {
            warn!(error = %e, "HTTP server stopped with error");
        }
        info!("Daemon orchestrator stopped");
        result.context("HTTP server failed")
    }

    /// Signal the server to stop accepting connections.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if *state == OrchestratorState::Running {
            *state = OrchestratorState::ShuttingDown;
            info!("Stopping daemon orchestrator...");
        }
        self.shutdown_token.cancel();
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Token that is cancelled when the orchestrator stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::clone(&self.app)
    }

    pub fn store(&self) -> &Arc<JsonUserStore> {
        &self.store
    }
}
