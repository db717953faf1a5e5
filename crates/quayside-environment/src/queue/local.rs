// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded in-process queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::QueueError;
use super::job::{JobRecord, JobRegistry, JobStatus, QueueStats};

const LOCAL_QUEUE_NAME: &str = "local";

/// In-memory queue with a fixed number of workers.
///
/// `put` waits while `capacity` jobs are buffered and not yet picked up.
/// At most `capacity` records are retained: once the map grows past it, the
/// oldest finished jobs are evicted. Pending and running jobs are never
/// evicted.
pub struct LocalQueue {
    workers: usize,
    capacity: usize,
    registry: Arc<JobRegistry>,
    jobs: Mutex<HashMap<String, JobRecord>>,
    sender: mpsc::Sender<String>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<String>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl LocalQueue {
    /// Create a stopped queue.
    pub fn new(workers: usize, capacity: usize, registry: Arc<JobRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            workers: workers.max(1),
            capacity,
            registry,
            jobs: Mutex::new(HashMap::new()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the oldest finished records until at most `capacity` remain.
    fn evict_finished(&self, jobs: &mut HashMap<String, JobRecord>) {
        let limit = self.capacity.max(1);
        if jobs.len() <= limit {
            return;
        }

        let mut finished: Vec<_> = jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.completed_at.unwrap_or(job.created_at), job.id.clone()))
            .collect();
        finished.sort_unstable();

        let excess = jobs.len() - limit;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }

    /// Spawn the workers. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(LOCAL_QUEUE_NAME.to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in 0..self.workers {
            let queue = Arc::clone(self);
            tasks.spawn(async move { queue.run_worker(worker).await });
        }

        info!(
            workers = self.workers,
            capacity = self.capacity,
            "Local queue started"
        );
        Ok(())
    }

    /// Whether workers are running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn run_worker(&self, worker: usize) {
        debug!(worker, "Local queue worker started");

        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => None,

                id = async { self.receiver.lock().await.recv().await } => id,
            };

            let Some(id) = next else {
                break;
            };
            self.run_job(&id).await;
        }

        debug!(worker, "Local queue worker stopped");
    }

    async fn run_job(&self, id: &str) {
        let job = {
            let mut jobs = self.jobs();
            match jobs.get_mut(id) {
                Some(job) => {
                    job.mark_started();
                    job.clone()
                }
                None => return,
            }
        };

        let result = self
            .registry
            .execute(&job, self.shutdown.child_token())
            .await;

        match &result {
            Ok(_) => debug!(job_id = %job.id, job_type = %job.job_type, "Local job completed"),
            Err(e) => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                error = %e,
                "Local job failed"
            ),
        }

        let mut jobs = self.jobs();
        if let Some(record) = jobs.get_mut(id) {
            record.mark_finished(&result);
        }
        self.evict_finished(&mut jobs);
    }

    /// Enqueue a job, waiting while the queue is full.
    pub async fn put(&self, mut job: JobRecord) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(LOCAL_QUEUE_NAME.to_string()));
        }

        let id = job.id.clone();
        {
            let mut jobs = self.jobs();
            if jobs.contains_key(&id) {
                return Err(QueueError::Duplicate(id));
            }
            job.status = JobStatus::Pending;
            jobs.insert(id.clone(), job);
            self.evict_finished(&mut jobs);
        }

        if self.sender.send(id.clone()).await.is_err() {
            self.jobs().remove(&id);
            return Err(QueueError::Closed(LOCAL_QUEUE_NAME.to_string()));
        }
        Ok(())
    }

    /// Look up a job.
    pub fn get(&self, id: &str) -> Result<JobRecord, QueueError> {
        self.jobs()
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Job counts.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for job in self.jobs().values() {
            stats.count(job.status, 1);
        }
        stats
    }

    /// Poll every `interval` until no job is pending or running, or the
    /// deadline passes. Returns whether the queue drained.
    pub async fn wait_idle(&self, interval: Duration, deadline: Instant) -> bool {
        loop {
            if self.stats().outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    /// Stop accepting jobs, cancel running ones and wait for the workers.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let mut tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Local queue worker panicked");
            }
        }

        info!(stats = ?self.stats(), "Local queue closed");
    }
}

impl std::fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalQueue")
            .field("workers", &self.workers)
            .field("capacity", &self.capacity)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}
