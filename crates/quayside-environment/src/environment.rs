// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The process-wide owner of shared resources and their teardown.
//!
//! Accessors take the read side of one `RwLock` and hand out cheap shared
//! handles, so any number of tasks can read concurrently. Registering a
//! closer and draining the registry in [`Environment::close`] take the write
//! side; the write lock is never held across an await.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::closer::{Closer, ShutdownContext, run_closers};
use crate::config::Config;
use crate::error::{Result, ShutdownError};
use crate::process::ProcessManager;
use crate::queue::{DurableQueue, JobRegistry, LocalQueue, QueueGroup};

/// Name of the closer `close` registers to release the database pool.
pub const DISCONNECT_DB_CLOSER: &str = "disconnect-db-client";

/// Shared handles built by the initialization sequencer.
#[derive(Clone)]
pub(crate) struct Resources {
    pub db: SqlitePool,
    pub jobs: Arc<JobRegistry>,
    pub local_queue: Arc<LocalQueue>,
    pub remote_queue: Arc<DurableQueue>,
    pub queue_group: Arc<QueueGroup>,
    pub process_manager: Arc<ProcessManager>,
    pub root: CancellationToken,
}

struct State {
    resources: Resources,
    closers: Vec<Closer>,
    closed: bool,
}

/// Aggregate of the database pool, queues, process manager, root
/// cancellation token and the closer registry.
pub struct Environment {
    config: Config,
    state: RwLock<State>,
}

impl Environment {
    /// Run the initialization sequencer against `config`.
    pub async fn initialize(config: Config) -> Result<Arc<Self>> {
        crate::sequencer::initialize(config).await
    }

    pub(crate) fn from_parts(config: Config, resources: Resources, closers: Vec<Closer>) -> Self {
        Self {
            config,
            state: RwLock::new(State {
                resources,
                closers,
                closed: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration the environment was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Database pool.
    pub fn db(&self) -> SqlitePool {
        self.read().resources.db.clone()
    }

    /// In-process bounded queue.
    pub fn local_queue(&self) -> Arc<LocalQueue> {
        self.read().resources.local_queue.clone()
    }

    /// The service's durable queue.
    pub fn remote_queue(&self) -> Arc<DurableQueue> {
        self.read().resources.remote_queue.clone()
    }

    /// Named durable queues.
    pub fn queue_group(&self) -> Arc<QueueGroup> {
        self.read().resources.queue_group.clone()
    }

    /// Child process tracker.
    pub fn process_manager(&self) -> Arc<ProcessManager> {
        self.read().resources.process_manager.clone()
    }

    /// Job handlers shared by every queue.
    pub fn jobs(&self) -> Arc<JobRegistry> {
        self.read().resources.jobs.clone()
    }

    /// A fresh child of the root token.
    ///
    /// Cancelling the child leaves the root and its other children alone.
    /// Cancelling the root (done by a closer during `close`) cancels every
    /// child.
    pub fn context(&self) -> CancellationToken {
        self.read().resources.root.child_token()
    }

    /// Append a closer to the registry.
    ///
    /// Allowed at any point, including from inside a running closer; such
    /// closers run in a later batch of the same `close`.
    pub fn register_closer<F, Fut>(&self, name: impl Into<String>, background: bool, f: F)
    where
        F: FnOnce(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let closer = Closer::new(name, background, f);
        debug!(closer = %closer.name(), background, "Registered closer");
        self.write().closers.push(closer);
    }

    /// Names of pending closers, in registration order.
    pub fn closer_names(&self) -> Vec<String> {
        self.read()
            .closers
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Run every registered closer concurrently and collect their failures.
    ///
    /// Registers [`DISCONNECT_DB_CLOSER`] first; it waits for the durable
    /// queues to stop before closing the pool. Closers registered while
    /// others run are picked up in further batches until the registry is
    /// empty. A second call is a no-op.
    pub async fn close(&self, ctx: ShutdownContext) -> std::result::Result<(), ShutdownError> {
        let resources = {
            let mut state = self.write();
            if state.closed {
                warn!("Environment already closed");
                return Ok(());
            }
            state.closed = true;
            state.resources.clone()
        };

        self.register_closer(DISCONNECT_DB_CLOSER, false, move |ctx: ShutdownContext| {
            disconnect_db(resources, ctx)
        });

        info!(
            closers = self.read().closers.len(),
            remaining_ms = ctx.remaining().as_millis() as u64,
            "Closing environment"
        );

        let mut failures = Vec::new();
        let mut batch_no = 0;
        loop {
            let batch = std::mem::take(&mut self.write().closers);
            if batch.is_empty() {
                break;
            }
            batch_no += 1;
            debug!(batch = batch_no, closers = batch.len(), "Running closers");
            failures.extend(run_closers(batch, &ctx).await);
        }

        if failures.is_empty() {
            info!("Environment closed");
            Ok(())
        } else {
            error!(failed = failures.len(), "Environment closed with errors");
            Err(ShutdownError::new(failures))
        }
    }
}

async fn disconnect_db(resources: Resources, ctx: ShutdownContext) -> anyhow::Result<()> {
    let queues_stopped = tokio::time::timeout_at(ctx.deadline(), async {
        futures::join!(
            resources.remote_queue.wait_closed(),
            resources.queue_group.wait_closed()
        )
    })
    .await;
    if queues_stopped.is_err() {
        warn!("Closing database pool while queues are still running");
    }

    tokio::time::timeout_at(ctx.deadline(), resources.db.close())
        .await
        .map_err(|_| anyhow::anyhow!("database pool did not close before the deadline"))?;
    debug!("Database pool closed");
    Ok(())
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("Environment")
            .field("queue", &self.config.queue_name)
            .field("closers", &state.closers.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}
