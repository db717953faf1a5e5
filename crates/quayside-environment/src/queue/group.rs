// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named group of durable queues.
//!
//! Queues are created on first use as `<prefix>.<name>` and share the
//! group's worker settings. A background pruner closes queues that have
//! been idle longer than the TTL and have nothing pending or running; a
//! later `get` recreates them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::QueueError;
use super::durable::{DurableQueue, DurableQueueOptions};
use super::job::JobRegistry;

/// Time given to a pruned queue to stop its workers.
const PRUNE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by every queue of a group.
#[derive(Debug, Clone)]
pub struct QueueGroupOptions {
    /// Prefix of every queue name.
    pub prefix: String,
    /// Idle time after which an empty queue is pruned.
    pub ttl: Duration,
    /// Pruning interval.
    pub prune_frequency: Duration,
    /// Worker settings of each queue.
    pub queue: DurableQueueOptions,
    /// Start workers of queues as they are created.
    pub start_queues: bool,
}

impl Default for QueueGroupOptions {
    fn default() -> Self {
        Self {
            prefix: "quayside".to_string(),
            ttl: Duration::from_secs(60),
            prune_frequency: Duration::from_secs(10 * 60),
            queue: DurableQueueOptions::default(),
            start_queues: true,
        }
    }
}

/// Lazily created named durable queues.
pub struct QueueGroup {
    pool: SqlitePool,
    options: QueueGroupOptions,
    registry: Arc<JobRegistry>,
    queues: tokio::sync::Mutex<HashMap<String, Arc<DurableQueue>>>,
    shutdown: CancellationToken,
    pruner: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl QueueGroup {
    /// Create an empty group.
    pub fn new(pool: SqlitePool, options: QueueGroupOptions, registry: Arc<JobRegistry>) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            pool,
            options,
            registry,
            queues: tokio::sync::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            pruner: Mutex::new(None),
            closed: AtomicBool::new(false),
            stopped,
        }
    }

    /// Prefix of every queue name.
    pub fn prefix(&self) -> &str {
        &self.options.prefix
    }

    /// Return the named queue, creating it on first use.
    pub async fn get(&self, name: &str) -> Result<Arc<DurableQueue>, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.options.prefix.clone()));
        }

        let mut queues = self.queues.lock().await;
        // close may have drained the map while we waited for the lock
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.options.prefix.clone()));
        }
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }

        let queue = Arc::new(DurableQueue::new(
            self.pool.clone(),
            format!("{}.{}", self.options.prefix, name),
            self.options.queue.clone(),
            Arc::clone(&self.registry),
        ));
        if self.options.start_queues {
            queue.start().await?;
        }

        queues.insert(name.to_string(), Arc::clone(&queue));
        debug!(queue = %queue.name(), "Created group queue");
        Ok(queue)
    }

    /// Names of the live queues, without the prefix, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close and drop queues idle longer than the TTL with nothing pending
    /// or running. Returns how many were pruned.
    pub async fn prune(&self) -> Result<usize, QueueError> {
        let pruned: Vec<Arc<DurableQueue>> = {
            let mut queues = self.queues.lock().await;
            let mut expired = Vec::new();
            for (name, queue) in queues.iter() {
                if queue.idle_for() < self.options.ttl {
                    continue;
                }
                if queue.stats().await?.outstanding() == 0 {
                    expired.push(name.clone());
                }
            }
            expired
                .iter()
                .filter_map(|name| queues.remove(name))
                .collect()
        };

        for queue in &pruned {
            if let Err(e) = queue.close(Instant::now() + PRUNE_CLOSE_TIMEOUT).await {
                warn!(queue = %queue.name(), error = %e, "Failed to close pruned queue");
            }
        }

        Ok(pruned.len())
    }

    /// Spawn the background pruner.
    pub fn start_pruner(self: &Arc<Self>) {
        let mut pruner = self.pruner.lock().unwrap_or_else(PoisonError::into_inner);
        if pruner.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let group = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let frequency = self.options.prune_frequency;

        *pruner = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = tokio::time::sleep(frequency) => {
                        let Some(group) = group.upgrade() else {
                            break;
                        };
                        match group.prune().await {
                            Ok(0) => {}
                            Ok(pruned) => info!(prefix = %group.prefix(), pruned, "Pruned idle queues"),
                            Err(e) => warn!(prefix = %group.prefix(), error = %e, "Queue pruning failed"),
                        }
                    }
                }
            }
            debug!("Queue group pruner stopped");
        }));
    }

    /// Stop the pruner and close every queue, each bounded by `deadline`.
    ///
    /// Returns the first queue failure after all queues were closed.
    pub async fn close(&self, deadline: Instant) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let pruner = self
            .pruner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = pruner {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!(prefix = %self.options.prefix, "Queue group pruner did not stop before the deadline");
            }
        }

        let queues: Vec<Arc<DurableQueue>> = self
            .queues
            .lock()
            .await
            .drain()
            .map(|(_, queue)| queue)
            .collect();

        let results =
            futures::future::join_all(queues.iter().map(|queue| queue.close(deadline))).await;

        let mut first_error = None;
        for (queue, result) in queues.iter().zip(results) {
            if let Err(e) = result {
                warn!(queue = %queue.name(), error = %e, "Failed to close group queue");
                first_error.get_or_insert(e);
            }
        }

        self.stopped.send_replace(true);
        info!(prefix = %self.options.prefix, queues = queues.len(), "Queue group closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait until [`close`](Self::close) has finished.
    pub async fn wait_closed(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl std::fmt::Debug for QueueGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueGroup")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
