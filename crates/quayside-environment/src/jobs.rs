// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job submission and status on the durable queue.

use chrono::{DateTime, Utc};
use quayside_model::ServiceSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::queue::{JobRecord, JobStatus, QueueError, QueueStats};

/// A job to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Handler to run.
    pub job_type: String,
    /// Handler input.
    #[serde(default)]
    pub payload: Value,
    /// Scope tags echoed back to the submitter.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    /// Generated job id.
    pub id: String,
    /// Scope tags of the job.
    pub scopes: Vec<String>,
}

/// When a job moved through its states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTiming {
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Claim time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Run time in milliseconds, once finished.
    pub duration_ms: Option<i64>,
}

/// Status of one job plus the counts of its queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    /// Job id.
    pub id: String,
    /// Current state.
    pub status: JobStatus,
    /// State transition times.
    pub timing: JobTiming,
    /// Counts of the job's queue.
    pub queue_stats: QueueStats,
    /// Whether the job failed.
    pub has_errors: bool,
    /// Failure message.
    pub error: Option<String>,
}

impl From<(JobRecord, QueueStats)> for JobStatusReport {
    fn from((job, queue_stats): (JobRecord, QueueStats)) -> Self {
        let duration_ms = match (job.started_at, job.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        };

        Self {
            has_errors: job.error.is_some(),
            id: job.id,
            status: job.status,
            timing: JobTiming {
                created_at: job.created_at,
                started_at: job.started_at,
                completed_at: job.completed_at,
                duration_ms,
            },
            queue_stats,
            error: job.error,
        }
    }
}

/// Enqueue a job on the durable queue under a fresh id.
///
/// Rejected with [`Error::SubmissionDisabled`] while the
/// `disable_job_submission` flag is set.
pub async fn submit_job(env: &Environment, submission: JobSubmission) -> Result<SubmittedJob> {
    if submission.job_type.trim().is_empty() {
        return Err(Error::InvalidRequest("job_type must not be empty".to_string()));
    }

    let settings = ServiceSettings::find_or_create(&env.db()).await?;
    if settings.flags.disable_job_submission {
        return Err(Error::SubmissionDisabled);
    }

    let id = Uuid::new_v4().to_string();
    let scopes = submission.scopes;
    let job = JobRecord::new(&id, &submission.job_type, submission.payload)
        .with_scopes(scopes.clone());

    let queue = env.remote_queue();
    queue.put(job).await?;

    info!(job_id = %id, job_type = %submission.job_type, queue = %queue.name(), "Job submitted");
    Ok(SubmittedJob { id, scopes })
}

/// Status of a job on the durable queue.
pub async fn job_status(env: &Environment, id: &str) -> Result<JobStatusReport> {
    let queue = env.remote_queue();
    let job = match queue.get(id).await {
        Ok(job) => job,
        Err(QueueError::NotFound(_)) => return Err(Error::JobNotFound(id.to_string())),
        Err(e) => return Err(e.into()),
    };
    let stats = queue.stats().await?;

    Ok(JobStatusReport::from((job, stats)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_report_of_failed_job() {
        let mut job = JobRecord::new("job-1", "export", Value::Null);
        let started = job.created_at + Duration::seconds(1);
        job.status = JobStatus::Failed;
        job.started_at = Some(started);
        job.completed_at = Some(started + Duration::milliseconds(1500));
        job.error = Some("export target unreachable".to_string());

        let stats = QueueStats {
            total: 1,
            failed: 1,
            ..Default::default()
        };
        let report = JobStatusReport::from((job, stats));

        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.has_errors);
        assert_eq!(report.timing.duration_ms, Some(1500));
        assert_eq!(report.queue_stats.failed, 1);
    }

    #[test]
    fn test_report_of_pending_job() {
        let job = JobRecord::new("job-2", "export", Value::Null);
        let report = JobStatusReport::from((job, QueueStats::default()));

        assert_eq!(report.status, JobStatus::Pending);
        assert!(!report.has_errors);
        assert_eq!(report.timing.duration_ms, None);
    }

    #[test]
    fn test_submission_defaults() {
        let submission: JobSubmission = serde_json::from_str(r#"{"job_type": "export"}"#).unwrap();
        assert_eq!(submission.payload, Value::Null);
        assert!(submission.scopes.is_empty());
    }
}
