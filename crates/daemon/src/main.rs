//! Filekeep daemon entry point.
//!
//! This binary provides the CLI interface for running the file server and
//! managing its users and configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::auth::hash_password;
use daemon::config::{default_config_path, Config};
use daemon::store::{validate_username, JsonUserStore, User, UserStore};
use daemon::Orchestrator;
use protocol::Permissions;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Filekeep - multi-user file management over HTTP
#[derive(Parser)]
#[command(name = "filekeep")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve,

    /// Manage users in the local user store
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum UsersAction {
    /// Add a user with the configured defaults
    Add {
        /// Login name
        username: String,

        /// Password (generated and printed when omitted)
        #[arg(short, long)]
        password: Option<String>,

        /// Grant every permission, including admin
        #[arg(long)]
        admin: bool,

        /// Absolute root directory instead of the default scope
        #[arg(long, value_name = "DIR")]
        scope: Option<PathBuf>,
    },

    /// List all users
    List,

    /// Remove a user by name
    Remove {
        /// Login name
        username: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

const GENERATED_PASSWORD_LEN: usize = 24;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Users { action } => {
            config.validate()?;
            run_users(&config, action).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists at {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            }
            ConfigAction::Show => {
                print!("{}", config.to_toml()?);
            }
        },
        Commands::Version => {
            println!("filekeep {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Console logging, plus a daily rolling file when `server.log_dir` is set.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.to_lowercase()))
    };

    let (file_layer, guard) = match &config.server.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "filekeep.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Filekeep daemon starting...");

    let orchestrator = Arc::new(Orchestrator::new(config)?);

    if let Some(password) = orchestrator.bootstrap_admin().await? {
        tracing::warn!(
            password = %password,
            "Generated initial admin password; it will not be shown again"
        );
    }

    let signal_target = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_target.stop().await;
    });

    orchestrator.run().await
}

/// Wait for Ctrl+C or, on Unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to register SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
}

async fn run_users(config: &Config, action: UsersAction) -> anyhow::Result<()> {
    let store = JsonUserStore::open(config.users_path())?;

    match action {
        UsersAction::Add {
            username,
            password,
            admin,
            scope,
        } => {
            validate_username(&username)?;
            let (password, generated) = match password {
                Some(p) if !p.is_empty() => (p, false),
                Some(_) => anyhow::bail!("Password must not be empty"),
                None => (generate_password(), true),
            };

            let to_hash = password.clone();
            let hash = tokio::task::spawn_blocking(move || hash_password(&to_hash))
                .await
                .context("Password hashing task failed")??;

            let mut user = User::from_defaults(&config.defaults, &username, hash);
            if let Some(scope) = scope {
                if !scope.is_absolute() {
                    anyhow::bail!("Scope must be an absolute path: {}", scope.display());
                }
                user.scope = scope;
            }
            if admin {
                user.perm = Permissions::all();
            }

            std::fs::create_dir_all(&user.scope).with_context(|| {
                format!("Failed to create scope directory: {}", user.scope.display())
            })?;

            let user = store
                .save(user)
                .with_context(|| format!("Failed to add user {}", username))?;
            println!("Added user {} (id {})", user.username, user.id);
            if generated {
                println!("Password: {}", password);
            }
        }
        UsersAction::List => {
            let users = store.list()?;
            print_users_table(&users);
        }
        UsersAction::Remove { username } => {
            let user = store
                .get_by_username(&username)
                .with_context(|| format!("No user named {}", username))?;
            store.delete(user.id)?;
            println!("Removed user {} (id {})", user.username, user.id);
        }
    }

    Ok(())
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Print users in a formatted ASCII table.
fn print_users_table(users: &[User]) {
    if users.is_empty() {
        println!("No users.");
        return;
    }

    let name_width = users
        .iter()
        .map(|u| u.username.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!("{:>4}  {:<name_width$}  {:<5}  SCOPE", "ID", "USERNAME", "ADMIN");
    println!("{}", "-".repeat(name_width + 24));

    for user in users {
        println!(
            "{:>4}  {:<name_width$}  {:<5}  {}",
            user.id,
            user.username,
            if user.perm.admin { "yes" } else { "no" },
            user.scope.display()
        );
    }

    println!();
    println!("Total: {} user(s)", users.len());
}
