// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job model shared by every queue.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the job has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A unit of work with an identity, a status and a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique within its queue.
    pub id: String,
    /// Selects the handler.
    pub job_type: String,
    /// Handler input.
    pub payload: Value,
    /// Scope tags reported back to submitters.
    pub scopes: Vec<String>,
    /// Current state.
    pub status: JobStatus,
    /// Failure message, set when failed.
    pub error: Option<String>,
    /// Handler output, set when completed.
    pub output: Option<Value>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Claim time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A new pending job.
    pub fn new(id: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            payload,
            scopes: Vec::new(),
            status: JobStatus::Pending,
            error: None,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach scope tags.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub(crate) fn mark_started(&mut self) {
        self.status = JobStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_finished(&mut self, result: &anyhow::Result<Option<Value>>) {
        match result {
            Ok(output) => {
                self.status = JobStatus::Completed;
                self.output = output.clone();
                self.error = None;
            }
            Err(e) => {
                self.status = JobStatus::Failed;
                self.error = Some(format!("{:#}", e));
            }
        }
        self.completed_at = Some(Utc::now());
    }
}

/// Job counts of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Every job the queue knows about.
    pub total: u64,
    /// Waiting jobs.
    pub pending: u64,
    /// Claimed jobs.
    pub in_progress: u64,
    /// Successful jobs.
    pub completed: u64,
    /// Failed jobs.
    pub failed: u64,
}

impl QueueStats {
    pub(crate) fn count(&mut self, status: JobStatus, n: u64) {
        self.total += n;
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::InProgress => self.in_progress += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }

    /// Jobs not yet finished.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_progress
    }
}

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. The token is cancelled when the queue shuts down.
    async fn run(&self, job: &JobRecord, cancel: CancellationToken) -> anyhow::Result<Option<Value>>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnJobHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(JobRecord, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    async fn run(&self, job: &JobRecord, cancel: CancellationToken) -> anyhow::Result<Option<Value>> {
        (self.0)(job.clone(), cancel).await
    }
}

/// Handlers by job type, shared by every queue of an environment.
#[derive(Default)]
pub struct JobRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for a job type.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Register an async closure as the handler for a job type.
    pub fn register_fn<F, Fut>(&self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JobRecord, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnJobHandler(f)));
    }

    /// Whether a handler exists for the job type.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Run a job with its handler. Unknown job types are an error.
    pub async fn execute(
        &self,
        job: &JobRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<Option<Value>> {
        // Clone out so the map shard is not locked while the job runs.
        let handler = self
            .handlers
            .get(&job.job_type)
            .map(|entry| entry.value().clone());

        match handler {
            Some(handler) => handler.run(job, cancel).await,
            None => anyhow::bail!("no handler registered for job type '{}'", job.job_type),
        }
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
