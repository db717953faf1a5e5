// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered environment initialization.
//!
//! Steps, in order, each registering its teardown before returning:
//!
//! | # | Step | Closer |
//! |---|------|--------|
//! | 1 | database pool + migrations | (registered by `close`) |
//! | 2 | local queue | `local-queue` (background) |
//! | 3 | durable queue | `application-queue` |
//! | 4 | queue group | `remote-queue-group` |
//! | 5 | process manager | `process-manager` (background) |
//! | 6 | root cancellation token | `env-captured-context-cancel` (background) |
//!
//! If a step fails, the closers registered so far are run before the error
//! is returned, so no worker task outlives a failed initialization.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::closer::{Closer, ShutdownContext, run_closers};
use crate::config::Config;
use crate::environment::{Environment, Resources};
use crate::error::{Error, Result};
use crate::migrations;
use crate::process::ProcessManager;
use crate::queue::{
    DurableQueue, DurableQueueOptions, JobRegistry, LocalQueue, QueueGroup, QueueGroupOptions,
};

/// Polling interval of the local queue drain check.
const LOCAL_QUEUE_DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// SQLite busy timeout for pooled connections.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Build an [`Environment`] from `config`.
///
/// The configuration is validated before anything is opened.
pub async fn initialize(config: Config) -> Result<Arc<Environment>> {
    config.validate()?;

    info!(
        queue = %config.queue_name,
        workers = config.num_workers,
        disable_queues = config.disable_queues,
        "Initializing environment"
    );

    let mut sequencer = Sequencer {
        config,
        closers: Vec::new(),
    };

    match sequencer.run().await {
        Ok(resources) => {
            let Sequencer { config, closers } = sequencer;
            info!(closers = closers.len(), "Environment initialized");
            Ok(Arc::new(Environment::from_parts(config, resources, closers)))
        }
        Err(e) => {
            error!(error = %e, "Environment initialization failed");
            sequencer.rollback().await;
            Err(e)
        }
    }
}

struct Sequencer {
    config: Config,
    closers: Vec<Closer>,
}

impl Sequencer {
    fn register<F, Fut>(&mut self, name: &'static str, background: bool, f: F)
    where
        F: FnOnce(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        debug!(closer = name, background, "Registered closer");
        self.closers.push(Closer::new(name, background, f));
    }

    async fn run(&mut self) -> Result<Resources> {
        let jobs = Arc::new(JobRegistry::new());

        let db = self
            .init_db()
            .await
            .map_err(|e| Error::resource_init("database", e))?;
        let local_queue = self
            .init_local_queue(&jobs)
            .map_err(|e| Error::resource_init("local queue", e))?;
        let remote_queue = self
            .init_remote_queue(&db, &jobs)
            .await
            .map_err(|e| Error::resource_init("durable queue", e))?;
        let queue_group = self.init_queue_group(&db, &jobs);
        let process_manager = self.init_process_manager();
        let root = self.init_context();

        Ok(Resources {
            db,
            jobs,
            local_queue,
            remote_queue,
            queue_group,
            process_manager,
            root,
        })
    }

    async fn init_db(&self) -> anyhow::Result<SqlitePool> {
        let url = self.config.database_url.as_str();
        let connect_options = SqliteConnectOptions::from_str(url)
            .context("invalid database url")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let in_memory = is_in_memory(url);
        let pool_options = || {
            let options = SqlitePoolOptions::new();
            if in_memory {
                // every connection to :memory: is its own database
                options
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
            } else {
                options.max_connections(self.config.max_connections)
            }
        };

        let lazy = pool_options().connect_lazy_with(connect_options.clone());
        let ping = tokio::time::timeout(
            self.config.ping_timeout,
            sqlx::query("SELECT 1").execute(&lazy),
        )
        .await;

        let pool = match ping {
            Ok(Ok(_)) => {
                debug!("Database reachable");
                lazy
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Database ping failed, connecting explicitly");
                lazy.close().await;
                self.dial(pool_options(), connect_options).await?
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.ping_timeout.as_millis() as u64,
                    "Database ping timed out, connecting explicitly"
                );
                lazy.close().await;
                self.dial(pool_options(), connect_options).await?
            }
        };

        migrations::run(&pool)
            .await
            .context("failed to run database migrations")?;
        info!("Database ready");
        Ok(pool)
    }

    async fn dial(
        &self,
        pool_options: SqlitePoolOptions,
        connect_options: SqliteConnectOptions,
    ) -> anyhow::Result<SqlitePool> {
        let dial_timeout = self.config.dial_timeout;
        let pool = tokio::time::timeout(dial_timeout, pool_options.connect_with(connect_options))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to database after {:?}", dial_timeout))?
            .context("failed to connect to database")?;
        Ok(pool)
    }

    fn init_local_queue(&mut self, jobs: &Arc<JobRegistry>) -> anyhow::Result<Arc<LocalQueue>> {
        let queue = Arc::new(LocalQueue::new(
            self.config.num_workers,
            self.config.local_queue_capacity,
            jobs.clone(),
        ));
        if !self.config.disable_queues {
            queue.start()?;
        }

        let closing = queue.clone();
        self.register("local-queue", true, move |ctx| drain_local_queue(closing, ctx));

        Ok(queue)
    }

    async fn init_remote_queue(
        &mut self,
        db: &SqlitePool,
        jobs: &Arc<JobRegistry>,
    ) -> anyhow::Result<Arc<DurableQueue>> {
        let queue = Arc::new(DurableQueue::new(
            db.clone(),
            self.config.queue_name.clone(),
            self.queue_options(),
            jobs.clone(),
        ));
        if !self.config.disable_queues {
            queue.start().await?;
        }

        let closing = queue.clone();
        self.register("application-queue", false, move |ctx| async move {
            closing.close(ctx.deadline()).await.map_err(anyhow::Error::from)
        });

        Ok(queue)
    }

    fn init_queue_group(&mut self, db: &SqlitePool, jobs: &Arc<JobRegistry>) -> Arc<QueueGroup> {
        let group = Arc::new(QueueGroup::new(
            db.clone(),
            QueueGroupOptions {
                prefix: self.config.queue_name.clone(),
                ttl: self.config.group_ttl,
                prune_frequency: self.config.group_prune_frequency,
                queue: self.queue_options(),
                start_queues: !self.config.disable_queues,
            },
            jobs.clone(),
        ));
        if !self.config.disable_queues {
            group.start_pruner();
        }

        let closing = group.clone();
        self.register("remote-queue-group", false, move |ctx| async move {
            closing.close(ctx.deadline()).await.map_err(anyhow::Error::from)
        });

        group
    }

    fn init_process_manager(&mut self) -> Arc<ProcessManager> {
        let manager = Arc::new(ProcessManager::new(self.config.process_capacity));

        let closing = manager.clone();
        self.register("process-manager", true, move |ctx| async move {
            tokio::time::timeout_at(ctx.deadline(), closing.close())
                .await
                .map_err(|_| anyhow::anyhow!("processes still running at the deadline"))
        });

        manager
    }

    fn init_context(&mut self) -> CancellationToken {
        let root = CancellationToken::new();

        let cancel = root.clone();
        self.register("env-captured-context-cancel", true, move |_ctx| async move {
            cancel.cancel();
            anyhow::Ok(())
        });

        root
    }

    fn queue_options(&self) -> DurableQueueOptions {
        DurableQueueOptions {
            workers: self.config.num_workers,
            poll_interval: self.config.queue_poll_interval,
        }
    }

    /// Run the closers registered by the steps that succeeded.
    async fn rollback(&mut self) {
        let closers = std::mem::take(&mut self.closers);
        if closers.is_empty() {
            return;
        }

        warn!(closers = closers.len(), "Releasing resources of failed initialization");
        let ctx = ShutdownContext::with_timeout(self.config.shutdown_timeout);
        for failure in run_closers(closers, &ctx).await {
            warn!(closer = %failure.name, error = %failure.error, "Rollback closer failed");
        }
    }
}

async fn drain_local_queue(queue: Arc<LocalQueue>, ctx: ShutdownContext) -> anyhow::Result<()> {
    if !queue.is_started() {
        let stats = queue.stats();
        if stats.outstanding() > 0 {
            warn!(?stats, "Dropping jobs of a local queue that was never started");
        }
        queue.close().await;
        return Ok(());
    }

    if !queue
        .wait_idle(LOCAL_QUEUE_DRAIN_INTERVAL, ctx.deadline())
        .await
    {
        let stats = queue.stats();
        error!(?stats, "Local queue failed to stop with running jobs");
        queue.close().await;
        anyhow::bail!(
            "local queue failed to stop with running jobs ({} outstanding)",
            stats.outstanding()
        );
    }

    tokio::time::timeout_at(ctx.deadline(), queue.close())
        .await
        .map_err(|_| anyhow::anyhow!("local queue workers did not stop before the deadline"))
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> Config {
        Config {
            database_url: "sqlite::memory:".to_string(),
            disable_queues: true,
            ..Config::default()
        }
    }

    #[test]
    fn test_is_in_memory() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory("sqlite:file:test?mode=memory&cache=shared"));
        assert!(!is_in_memory("sqlite:/var/lib/quayside/quayside.db?mode=rwc"));
    }

    #[tokio::test]
    async fn test_registers_closers_in_order() {
        let env = initialize(memory_config()).await.unwrap();

        assert_eq!(
            env.closer_names(),
            vec![
                "local-queue",
                "application-queue",
                "remote-queue-group",
                "process-manager",
                "env-captured-context-cancel",
            ]
        );

        env.close(ShutdownContext::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_background_flags() {
        let mut sequencer = Sequencer {
            config: memory_config(),
            closers: Vec::new(),
        };
        sequencer.run().await.unwrap();

        let background: Vec<_> = sequencer
            .closers
            .iter()
            .filter(|closer| closer.is_background())
            .map(|closer| closer.name())
            .collect();
        assert_eq!(
            background,
            vec!["local-queue", "process-manager", "env-captured-context-cancel"]
        );

        sequencer.rollback().await;
    }

    #[tokio::test]
    async fn test_rollback_stops_started_queues() {
        let mut sequencer = Sequencer {
            config: Config {
                disable_queues: false,
                ..memory_config()
            },
            closers: Vec::new(),
        };
        let jobs = Arc::new(JobRegistry::new());

        let db = sequencer.init_db().await.unwrap();
        let local_queue = sequencer.init_local_queue(&jobs).unwrap();
        let remote_queue = sequencer.init_remote_queue(&db, &jobs).await.unwrap();
        assert!(local_queue.is_started());
        assert!(remote_queue.is_started());

        sequencer.rollback().await;

        assert!(sequencer.closers.is_empty());
        assert!(!local_queue.is_started());
        assert!(!remote_queue.is_started());
        tokio::time::timeout(Duration::from_secs(5), remote_queue.wait_closed())
            .await
            .expect("durable queue workers still running after rollback");
    }

    #[tokio::test]
    async fn test_invalid_config_touches_nothing() {
        let config = Config {
            num_workers: 0,
            ..memory_config()
        };

        let err = initialize(config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_queues_not_started_when_disabled() {
        let env = initialize(memory_config()).await.unwrap();

        assert!(!env.local_queue().is_started());
        assert!(!env.remote_queue().is_started());

        env.close(ShutdownContext::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
    }
}
