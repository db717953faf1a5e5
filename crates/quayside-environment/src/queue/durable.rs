// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database-backed queue.
//!
//! Jobs live in the `queue_jobs` table, scoped by queue name, so they survive
//! restarts. Workers poll for pending jobs and claim them with a single
//! `UPDATE ... RETURNING`, which SQLite serializes, so a job is never claimed
//! twice. Jobs found `in_progress` when a queue starts were orphaned by a
//! previous process and go back to `pending`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::QueueError;
use super::job::{JobRecord, JobRegistry, JobStatus, QueueStats};

/// Worker settings of a durable queue.
#[derive(Debug, Clone)]
pub struct DurableQueueOptions {
    /// Worker tasks.
    pub workers: usize,
    /// Sleep between polls when no job is available.
    pub poll_interval: Duration,
}

impl Default for DurableQueueOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    payload: String,
    scopes: String,
    status: String,
    error: Option<String>,
    output: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|details| QueueError::Persistence {
                operation: "decode_job",
                details,
            })?;

        Ok(JobRecord {
            id: row.id,
            job_type: row.job_type,
            payload: serde_json::from_str(&row.payload)?,
            scopes: serde_json::from_str(&row.scopes)?,
            status,
            error: row.error,
            output: row
                .output
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const JOB_COLUMNS: &str =
    "id, job_type, payload, scopes, status, error, output, created_at, started_at, completed_at";

/// A named queue persisted in the database.
pub struct DurableQueue {
    name: String,
    pool: SqlitePool,
    options: DurableQueueOptions,
    registry: Arc<JobRegistry>,
    paused: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    stopped: watch::Sender<bool>,
    last_activity: Mutex<Instant>,
}

impl DurableQueue {
    /// Create a stopped queue.
    pub fn new(
        pool: SqlitePool,
        name: impl Into<String>,
        options: DurableQueueOptions,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            name: name.into(),
            pool,
            options,
            registry,
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            stopped,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recover orphaned jobs and spawn the workers. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let recovered = sqlx::query(
            r#"
            UPDATE queue_jobs SET status = 'pending', started_at = NULL
            WHERE queue = ? AND status = 'in_progress'
            "#,
        )
        .bind(&self.name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            warn!(queue = %self.name, recovered, "Reset orphaned in-progress jobs");
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in 0..self.options.workers.max(1) {
            let queue = Arc::clone(self);
            tasks.spawn(async move { queue.run_worker(worker).await });
        }

        info!(
            queue = %self.name,
            workers = self.options.workers,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "Durable queue started"
        );
        Ok(())
    }

    /// Whether workers are running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Stop or resume claiming jobs. Running jobs are not affected.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) != paused {
            info!(queue = %self.name, paused, "Durable queue execution toggled");
        }
    }

    /// Whether workers are currently not claiming jobs.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Time since the last enqueue or job completion.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    async fn run_worker(&self, worker: usize) {
        debug!(queue = %self.name, worker, "Durable queue worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let claimed = if self.is_paused() {
                Ok(None)
            } else {
                self.claim().await
            };

            match claimed {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(queue = %self.name, error = %e, "Failed to claim job"),
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        debug!(queue = %self.name, worker, "Durable queue worker stopped");
    }

    async fn claim(&self) -> Result<Option<JobRecord>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE queue_jobs SET status = 'in_progress', started_at = ?
            WHERE queue = ? AND status = 'pending' AND id = (
                SELECT id FROM queue_jobs
                WHERE queue = ? AND status = 'pending'
                ORDER BY created_at, id
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Utc::now())
        .bind(&self.name)
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn run_job(&self, mut job: JobRecord) {
        debug!(queue = %self.name, job_id = %job.id, job_type = %job.job_type, "Running job");

        let result = self
            .registry
            .execute(&job, self.shutdown.child_token())
            .await;

        if let Err(e) = &result {
            warn!(
                queue = %self.name,
                job_id = %job.id,
                job_type = %job.job_type,
                error = %e,
                "Job failed"
            );
        }

        job.mark_finished(&result);
        if let Err(e) = self.complete(&job).await {
            error!(queue = %self.name, job_id = %job.id, error = %e, "Failed to record job result");
        }
        self.touch();
    }

    async fn complete(&self, job: &JobRecord) -> Result<(), QueueError> {
        let output = job.output.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs SET status = ?, error = ?, output = ?, completed_at = ?
            WHERE queue = ? AND id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(output)
        .bind(job.completed_at)
        .bind(&self.name)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(QueueError::Persistence {
                operation: "complete_job",
                details: format!("expected 1 affected row(s), got {}", result.rows_affected()),
            });
        }
        Ok(())
    }

    /// Persist a new pending job.
    pub async fn put(&self, job: JobRecord) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.name.clone()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (queue, id, job_type, payload, scopes, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&self.name)
        .bind(&job.id)
        .bind(&job.job_type)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(serde_json::to_string(&job.scopes)?)
        .bind(job.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                self.touch();
                debug!(queue = %self.name, job_id = %job.id, "Job enqueued");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(QueueError::Duplicate(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a job.
    pub async fn get(&self, id: &str) -> Result<JobRecord, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM queue_jobs WHERE queue = ? AND id = ?",
            JOB_COLUMNS
        ))
        .bind(&self.name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    /// Job counts.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM queue_jobs WHERE queue = ? GROUP BY status",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<JobStatus>() {
                Ok(status) => stats.count(status, count.max(0) as u64),
                Err(details) => warn!(queue = %self.name, %details, "Skipping unknown job status"),
            }
        }
        Ok(stats)
    }

    /// Delete finished jobs of `job_type` completed before `cutoff`.
    /// Returns how many rows were removed.
    pub async fn prune_finished(
        &self,
        job_type: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE queue = ? AND job_type = ? AND status IN (?, ?) AND completed_at < ?
            "#,
        )
        .bind(&self.name)
        .bind(job_type)
        .bind(JobStatus::Completed.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Stop the workers, waiting for running jobs until `deadline`.
    ///
    /// Workers still running at the deadline are aborted; their jobs are
    /// picked up again on the next start.
    pub async fn close(&self, deadline: Instant) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let mut tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(queue = %self.name, error = %e, "Durable queue worker panicked");
                }
            }
        })
        .await;

        let result = match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                tasks.abort_all();
                warn!(queue = %self.name, "Aborted durable queue workers at deadline");
                Err(QueueError::CloseTimeout(self.name.clone()))
            }
        };

        self.stopped.send_replace(true);
        info!(queue = %self.name, "Durable queue closed");
        result
    }

    /// Wait until [`close`](Self::close) has stopped the workers.
    pub async fn wait_closed(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("paused", &self.is_paused())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run(&pool).await.unwrap();
        pool
    }

    fn registry() -> Arc<JobRegistry> {
        let registry = JobRegistry::new();
        registry.register_fn("echo", |job: JobRecord, _cancel| async move {
            Ok::<_, anyhow::Error>(Some(job.payload))
        });
        Arc::new(registry)
    }

    fn options() -> DurableQueueOptions {
        DurableQueueOptions {
            workers: 1,
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn wait_terminal(queue: &DurableQueue, id: &str) -> JobRecord {
        for _ in 0..500 {
            let job = queue.get(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_put_get_and_duplicate() {
        let pool = test_pool().await;
        let queue = DurableQueue::new(pool, "test", options(), registry());

        let job = JobRecord::new("j1", "echo", json!({"a": 1})).with_scopes(vec!["s".into()]);
        queue.put(job).await.unwrap();

        let stored = queue.get("j1").await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.payload, json!({"a": 1}));
        assert_eq!(stored.scopes, vec!["s".to_string()]);

        let err = queue
            .put(JobRecord::new("j1", "echo", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(_)));

        assert!(matches!(
            queue.get("missing").await,
            Err(QueueError::NotFound(_))
        ));
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_prune_finished_removes_old_rows_of_type() {
        let pool = test_pool().await;
        let queue = DurableQueue::new(pool, "test", options(), registry());
        let now = Utc::now();

        for (id, job_type, age_hours) in [
            ("old", "stats", 48),
            ("recent", "stats", 0),
            ("other", "echo", 48),
        ] {
            queue.put(JobRecord::new(id, job_type, Value::Null)).await.unwrap();
            let mut job = queue.get(id).await.unwrap();
            job.status = JobStatus::Completed;
            job.completed_at = Some(now - chrono::Duration::hours(age_hours));
            queue.complete(&job).await.unwrap();
        }
        queue.put(JobRecord::new("waiting", "stats", Value::Null)).await.unwrap();

        let cutoff = now - chrono::Duration::hours(24);
        assert_eq!(queue.prune_finished("stats", cutoff).await.unwrap(), 1);

        assert!(matches!(queue.get("old").await, Err(QueueError::NotFound(_))));
        assert!(queue.get("recent").await.is_ok());
        assert!(queue.get("other").await.is_ok());
        assert!(queue.get("waiting").await.is_ok());
        assert_eq!(queue.prune_finished("stats", cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queues_are_scoped_by_name() {
        let pool = test_pool().await;
        let a = DurableQueue::new(pool.clone(), "a", options(), registry());
        let b = DurableQueue::new(pool, "b", options(), registry());

        a.put(JobRecord::new("same", "echo", Value::Null)).await.unwrap();
        b.put(JobRecord::new("same", "echo", Value::Null)).await.unwrap();

        assert_eq!(a.stats().await.unwrap().total, 1);
        assert_eq!(b.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_workers_run_jobs() {
        let pool = test_pool().await;
        let queue = Arc::new(DurableQueue::new(pool, "test", options(), registry()));
        queue.start().await.unwrap();

        queue.put(JobRecord::new("ok", "echo", json!(7))).await.unwrap();
        queue.put(JobRecord::new("bad", "nope", Value::Null)).await.unwrap();

        let ok = wait_terminal(&queue, "ok").await;
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.output, Some(json!(7)));
        assert!(ok.started_at.is_some());

        let bad = wait_terminal(&queue, "bad").await;
        assert_eq!(bad.status, JobStatus::Failed);
        assert!(bad.error.unwrap().contains("nope"));

        queue
            .close(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        queue.wait_closed().await;
    }

    #[tokio::test]
    async fn test_start_resets_orphaned_jobs() {
        let pool = test_pool().await;
        let queue = DurableQueue::new(pool.clone(), "test", options(), registry());
        queue.put(JobRecord::new("orphan", "echo", json!(1))).await.unwrap();
        sqlx::query("UPDATE queue_jobs SET status = 'in_progress' WHERE id = 'orphan'")
            .execute(&pool)
            .await
            .unwrap();

        let queue = Arc::new(queue);
        queue.start().await.unwrap();
        let job = wait_terminal(&queue, "orphan").await;
        assert_eq!(job.status, JobStatus::Completed);

        queue
            .close(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_paused_queue_does_not_claim() {
        let pool = test_pool().await;
        let queue = Arc::new(DurableQueue::new(pool, "test", options(), registry()));
        queue.set_paused(true);
        queue.start().await.unwrap();
        queue.put(JobRecord::new("held", "echo", Value::Null)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.get("held").await.unwrap().status, JobStatus::Pending);

        queue.set_paused(false);
        assert_eq!(
            wait_terminal(&queue, "held").await.status,
            JobStatus::Completed
        );

        queue
            .close(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_put() {
        let pool = test_pool().await;
        let queue = DurableQueue::new(pool, "test", options(), registry());
        queue
            .close(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        queue.wait_closed().await;

        assert!(matches!(
            queue.put(JobRecord::new("late", "echo", Value::Null)).await,
            Err(QueueError::Closed(_))
        ));
    }
}
