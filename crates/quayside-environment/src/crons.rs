// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recurring maintenance work.
//!
//! Every minute the crons enqueue timestamped maintenance jobs: process
//! cleanup and local queue stats on the local queue, durable queue stats
//! on the durable queue. Job ids embed the minute, so a second enqueue in
//! the same minute is rejected as a duplicate and skipped.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use quayside_model::ServiceSettings;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::environment::Environment;
use crate::queue::{JobRecord, QueueError};

/// Interval of the built-in crons.
pub const CRON_INTERVAL: Duration = Duration::from_secs(60);

/// Removes finished processes from the process manager.
pub const PROCESS_CLEANUP_JOB: &str = "process-cleanup";

/// Logs local queue stats.
pub const LOCAL_QUEUE_STATS_JOB: &str = "local-queue-stats";

/// Logs durable queue stats and prunes its own finished rows.
pub const DURABLE_QUEUE_STATS_JOB: &str = "durable-queue-stats";

/// How long finished maintenance jobs are kept in the durable queue.
pub const MAINTENANCE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const JOB_ID_TIMESTAMP: &str = "%Y-%m-%d.%H-%M";

/// A named async operation repeated on a fixed interval.
#[derive(Debug, Clone)]
pub struct IntervalOperation {
    name: String,
    interval: Duration,
}

impl IntervalOperation {
    /// Operation called `name`, run every `interval`.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }

    /// Run `op` now and then every interval until `cancel` fires.
    ///
    /// Errors are logged and the loop continues. Ticks missed while an
    /// operation overran are skipped.
    pub fn spawn<F, Fut>(self, cancel: CancellationToken, mut op: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            // interval() panics on a zero period
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(operation = %self.name, interval_ms = self.interval.as_millis() as u64, "Interval operation started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = ticker.tick() => {
                        if let Err(e) = op().await {
                            error!(operation = %self.name, error = %e, "Interval operation failed");
                        }
                    }
                }
            }

            debug!(operation = %self.name, "Interval operation stopped");
        })
    }
}

/// Start the built-in crons. They stop when `cancel` fires.
pub fn start_crons(env: &Arc<Environment>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    info!(interval_secs = CRON_INTERVAL.as_secs(), "Starting crons");

    let local_env = Arc::downgrade(env);
    let local = IntervalOperation::new("local-maintenance", CRON_INTERVAL).spawn(
        cancel.clone(),
        move || local_tick(local_env.clone()),
    );

    let remote_env = Arc::downgrade(env);
    let remote = IntervalOperation::new("durable-maintenance", CRON_INTERVAL).spawn(
        cancel,
        move || remote_tick(remote_env.clone()),
    );

    vec![local, remote]
}

fn upgrade(env: &Weak<Environment>) -> anyhow::Result<Arc<Environment>> {
    env.upgrade()
        .ok_or_else(|| anyhow::anyhow!("environment was dropped"))
}

fn timestamped(job_type: &str) -> JobRecord {
    let stamp = Utc::now().format(JOB_ID_TIMESTAMP);
    JobRecord::new(format!("{}.{}", job_type, stamp), job_type, serde_json::Value::Null)
}

fn ignore_duplicate(result: Result<(), QueueError>) -> anyhow::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(QueueError::Duplicate(id)) => {
            debug!(job_id = %id, "Maintenance job already queued this minute");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Enqueue local maintenance jobs and sync execution gating.
pub(crate) async fn local_tick(env: Weak<Environment>) -> anyhow::Result<()> {
    let env = upgrade(&env)?;
    let settings = ServiceSettings::find_or_create(&env.db()).await?;
    let flags = &settings.flags;

    let remote = env.remote_queue();
    if remote.is_paused() != flags.disable_job_execution {
        info!(paused = flags.disable_job_execution, queue = %remote.name(), "Updating job execution state");
        remote.set_paused(flags.disable_job_execution);
    }

    if flags.disable_background_jobs || flags.disable_internal_metrics_reporting {
        debug!("Local maintenance jobs disabled");
        return Ok(());
    }

    let queue = env.local_queue();
    ignore_duplicate(queue.put(timestamped(PROCESS_CLEANUP_JOB)).await)?;
    ignore_duplicate(queue.put(timestamped(LOCAL_QUEUE_STATS_JOB)).await)?;
    Ok(())
}

/// Enqueue durable maintenance jobs.
pub(crate) async fn remote_tick(env: Weak<Environment>) -> anyhow::Result<()> {
    let env = upgrade(&env)?;
    let settings = ServiceSettings::find_or_create(&env.db()).await?;
    if settings.flags.disable_background_jobs || settings.flags.disable_internal_metrics_reporting {
        debug!("Durable maintenance jobs disabled");
        return Ok(());
    }

    ignore_duplicate(env.remote_queue().put(timestamped(DURABLE_QUEUE_STATS_JOB)).await)
}

/// Register the handlers of the built-in maintenance jobs.
pub fn register_builtin_jobs(env: &Arc<Environment>) {
    let jobs = env.jobs();

    let weak = Arc::downgrade(env);
    jobs.register_fn(PROCESS_CLEANUP_JOB, move |_job, _cancel| {
        let env = weak.clone();
        async move {
            let env = upgrade(&env)?;
            let removed = env.process_manager().clear();
            debug!(removed, "Cleared finished processes");
            Ok::<_, anyhow::Error>(Some(json!({ "removed": removed })))
        }
    });

    let weak = Arc::downgrade(env);
    jobs.register_fn(LOCAL_QUEUE_STATS_JOB, move |_job, _cancel| {
        let env = weak.clone();
        async move {
            let stats = upgrade(&env)?.local_queue().stats();
            info!(queue = "local", ?stats, "Queue stats");
            Ok::<_, anyhow::Error>(Some(serde_json::to_value(stats)?))
        }
    });

    let weak = Arc::downgrade(env);
    jobs.register_fn(DURABLE_QUEUE_STATS_JOB, move |_job, _cancel| {
        let env = weak.clone();
        async move {
            let queue = upgrade(&env)?.remote_queue();
            let cutoff = Utc::now() - chrono::Duration::from_std(MAINTENANCE_RETENTION)?;
            let pruned = queue.prune_finished(DURABLE_QUEUE_STATS_JOB, cutoff).await?;
            let stats = queue.stats().await?;
            info!(queue = %queue.name(), ?stats, pruned, "Queue stats");
            Ok::<_, anyhow::Error>(Some(serde_json::to_value(stats)?))
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closer::ShutdownContext;
    use crate::config::Config;
    use quayside_model::FeatureFlag;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn memory_env() -> Arc<Environment> {
        Environment::initialize(Config {
            database_url: "sqlite::memory:".to_string(),
            disable_queues: true,
            ..Config::default()
        })
        .await
        .unwrap()
    }

    async fn close(env: &Environment) {
        env.close(ShutdownContext::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    #[test]
    fn test_timestamped_id() {
        let job = timestamped(PROCESS_CLEANUP_JOB);
        assert_eq!(job.job_type, PROCESS_CLEANUP_JOB);
        let stamp = job.id.trim_start_matches("process-cleanup.");
        // YYYY-mm-dd.HH-MM
        assert_eq!(stamp.len(), 16);
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, JOB_ID_TIMESTAMP).is_ok());
    }

    #[test]
    fn test_ignore_duplicate() {
        assert!(ignore_duplicate(Err(QueueError::Duplicate("x".into()))).is_ok());
        assert!(ignore_duplicate(Err(QueueError::Closed("local".into()))).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_operation_continues_after_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let handle = IntervalOperation::new("flaky", Duration::from_secs(10)).spawn(
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        anyhow::bail!("tick {} failed", n);
                    }
                    Ok::<_, anyhow::Error>(())
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap();

        // ticks at 0, 10, 20 and 30 seconds
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_ticks_enqueue_maintenance_jobs() {
        let env = memory_env().await;

        local_tick(Arc::downgrade(&env)).await.unwrap();
        remote_tick(Arc::downgrade(&env)).await.unwrap();

        let local = env.local_queue().stats();
        assert_eq!(local.pending, 2);
        let remote = env.remote_queue().stats().await.unwrap();
        assert_eq!(remote.pending, 1);

        close(&env).await;
    }

    #[tokio::test]
    async fn test_metrics_flag_suppresses_jobs() {
        let env = memory_env().await;
        let pool = env.db();
        let mut settings = ServiceSettings::find_or_create(&pool).await.unwrap();
        settings
            .flags
            .persist(&pool, FeatureFlag::DisableInternalMetricsReporting, true)
            .await
            .unwrap();

        local_tick(Arc::downgrade(&env)).await.unwrap();
        remote_tick(Arc::downgrade(&env)).await.unwrap();

        assert_eq!(env.local_queue().stats().total, 0);
        assert_eq!(env.remote_queue().stats().await.unwrap().total, 0);

        close(&env).await;
    }

    #[tokio::test]
    async fn test_tick_mirrors_execution_flag() {
        let env = memory_env().await;
        let pool = env.db();
        let mut settings = ServiceSettings::find_or_create(&pool).await.unwrap();

        settings
            .flags
            .persist(&pool, FeatureFlag::DisableJobExecution, true)
            .await
            .unwrap();
        local_tick(Arc::downgrade(&env)).await.unwrap();
        assert!(env.remote_queue().is_paused());

        settings
            .flags
            .persist(&pool, FeatureFlag::DisableJobExecution, false)
            .await
            .unwrap();
        local_tick(Arc::downgrade(&env)).await.unwrap();
        assert!(!env.remote_queue().is_paused());

        close(&env).await;
    }

    #[tokio::test]
    async fn test_builtin_process_cleanup() {
        let env = memory_env().await;
        register_builtin_jobs(&env);

        let job = JobRecord::new("cleanup", PROCESS_CLEANUP_JOB, serde_json::Value::Null);
        let output = env
            .jobs()
            .execute(&job, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, Some(json!({ "removed": 0 })));

        let job = JobRecord::new("stats", DURABLE_QUEUE_STATS_JOB, serde_json::Value::Null);
        let output = env
            .jobs()
            .execute(&job, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.unwrap()["total"], 0);

        close(&env).await;
    }

    #[tokio::test]
    async fn test_durable_stats_job_prunes_stale_rows() {
        let env = memory_env().await;
        register_builtin_jobs(&env);
        let queue = env.remote_queue();

        let stale = Utc::now() - chrono::Duration::hours(25);
        sqlx::query(
            "INSERT INTO queue_jobs (queue, id, job_type, status, created_at, completed_at) \
             VALUES (?, 'stale', ?, 'completed', ?, ?)",
        )
        .bind(queue.name())
        .bind(DURABLE_QUEUE_STATS_JOB)
        .bind(stale)
        .bind(stale)
        .execute(&env.db())
        .await
        .unwrap();
        assert_eq!(queue.stats().await.unwrap().total, 1);

        let job = JobRecord::new("stats", DURABLE_QUEUE_STATS_JOB, serde_json::Value::Null);
        let output = env
            .jobs()
            .execute(&job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.unwrap()["total"], 0);
        assert!(queue.get("stale").await.is_err());

        close(&env).await;
    }

    #[tokio::test]
    async fn test_tick_fails_after_environment_dropped() {
        let env = memory_env().await;
        let weak = Arc::downgrade(&env);
        close(&env).await;
        drop(env);

        assert!(local_tick(weak).await.is_err());
    }
}
