// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quayside service binary
//!
//! - `quayside service workers`: run queue workers and crons until SIGTERM/Ctrl-C
//! - `quayside admin config dump|load`: export or import the settings document
//! - `quayside admin flags set|unset <flag>`: toggle an operational flag

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use quayside_model::{FeatureFlag, ServiceSettings};
use sqlx::SqlitePool;
use tracing::{info, warn};

use quayside_environment::crons::{register_builtin_jobs, start_crons};
use quayside_environment::{
    Config, Environment, ShutdownContext, set_environment, take_environment,
};

#[derive(Debug, Parser)]
#[command(name = "quayside", version, about = "Quayside service environment")]
struct Cli {
    /// SQLite database URL (overrides QUAYSIDE_DATABASE_URL).
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Worker tasks per queue (overrides QUAYSIDE_NUM_WORKERS).
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run service processes.
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    /// Administrative tasks against the service database.
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ServiceCommand {
    /// Run queue workers and crons.
    Workers {
        /// Do not start the maintenance crons.
        #[arg(long, default_value_t = false)]
        disable_background_jobs: bool,
    },
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Settings document.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Operational feature flags.
    Flags {
        #[command(subcommand)]
        command: FlagsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Write the settings document as JSON to a file or stdout.
    Dump {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Replace the settings document with a JSON file.
    Load {
        #[arg(long)]
        path: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum FlagsCommand {
    /// Turn a flag on.
    Set { flag: FeatureFlag },
    /// Turn a flag off.
    Unset { flag: FeatureFlag },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quayside_environment=info,quayside_model=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(workers) = cli.workers {
        config.num_workers = workers;
    }

    match cli.command {
        Commands::Service {
            command:
                ServiceCommand::Workers {
                    disable_background_jobs,
                },
        } => run_workers(config, disable_background_jobs).await,
        Commands::Admin { command } => {
            config.disable_queues = true;
            run_admin(config, command).await
        }
    }
}

async fn run_workers(config: Config, disable_background_jobs: bool) -> anyhow::Result<()> {
    info!(queue = %config.queue_name, workers = config.num_workers, "Starting quayside workers");

    let env = Environment::initialize(config).await?;
    set_environment(env.clone());
    register_builtin_jobs(&env);

    let crons = if disable_background_jobs {
        info!("Background jobs disabled");
        Vec::new()
    } else {
        start_crons(&env, env.context())
    };

    info!("Quayside workers ready");
    wait_for_shutdown().await?;
    info!("Shutdown signal received");

    let env: Arc<Environment> = take_environment().unwrap_or(env);
    let ctx = ShutdownContext::with_timeout(env.config().shutdown_timeout);
    let closed = env.close(ctx).await;

    // crons hold a child of the root token, cancelled by a closer
    futures::future::join_all(crons).await;

    closed?;
    info!("Quayside workers shut down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn run_admin(config: Config, command: AdminCommand) -> anyhow::Result<()> {
    let env = Environment::initialize(config).await?;
    let result = admin(env.db(), command).await;

    let ctx = ShutdownContext::with_timeout(env.config().shutdown_timeout);
    let closed = env.close(ctx).await;

    result?;
    closed?;
    Ok(())
}

async fn admin(pool: SqlitePool, command: AdminCommand) -> anyhow::Result<()> {
    match command {
        AdminCommand::Config {
            command: ConfigCommand::Dump { path },
        } => {
            let settings = ServiceSettings::find_or_create(&pool).await?;
            let json = serde_json::to_string_pretty(&settings)?;
            match path {
                Some(path) => {
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), "Settings dumped");
                }
                None => println!("{}", json),
            }
        }
        AdminCommand::Config {
            command: ConfigCommand::Load { path },
        } => {
            let data = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut settings: ServiceSettings = serde_json::from_str(&data)
                .with_context(|| format!("invalid settings document in {}", path.display()))?;
            settings.validate()?;
            settings.save(&pool).await?;
            info!(path = %path.display(), "Settings loaded");
        }
        AdminCommand::Flags {
            command: FlagsCommand::Set { flag },
        } => set_flag(&pool, flag, true).await?,
        AdminCommand::Flags {
            command: FlagsCommand::Unset { flag },
        } => set_flag(&pool, flag, false).await?,
    }
    Ok(())
}

async fn set_flag(pool: &SqlitePool, flag: FeatureFlag, value: bool) -> anyhow::Result<()> {
    let mut settings = ServiceSettings::find_or_create(pool).await?;
    settings.flags.persist(pool, flag, value).await?;
    info!(%flag, value, "Feature flag updated");
    Ok(())
}
