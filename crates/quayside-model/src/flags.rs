// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operational feature flags.
//!
//! Flags are a closed set. Toggling one in memory goes through the typed
//! [`FeatureFlags::set`]; [`FeatureFlags::persist`] additionally writes only
//! that key of the stored settings document so concurrent edits to other
//! sections are not clobbered.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::error::{ModelError, Result};
use crate::settings::SETTINGS_ID;

/// A single operational toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFlag {
    /// Workers stop claiming durable jobs.
    DisableJobExecution,
    /// New job submissions are rejected.
    DisableJobSubmission,
    /// Periodic maintenance jobs are not enqueued.
    DisableBackgroundJobs,
    /// Internal stats jobs are not enqueued.
    DisableInternalMetricsReporting,
}

impl FeatureFlag {
    /// Every flag, in document order.
    pub const ALL: [FeatureFlag; 4] = [
        FeatureFlag::DisableJobExecution,
        FeatureFlag::DisableJobSubmission,
        FeatureFlag::DisableBackgroundJobs,
        FeatureFlag::DisableInternalMetricsReporting,
    ];

    /// Key used in the settings document and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFlag::DisableJobExecution => "disable_job_execution",
            FeatureFlag::DisableJobSubmission => "disable_job_submission",
            FeatureFlag::DisableBackgroundJobs => "disable_background_jobs",
            FeatureFlag::DisableInternalMetricsReporting => "disable_internal_metrics_reporting",
        }
    }
}

impl fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown flag name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature flag '{0}'")]
pub struct UnknownFeatureFlag(pub String);

impl FromStr for FeatureFlag {
    type Err = UnknownFeatureFlag;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        FeatureFlag::ALL
            .into_iter()
            .find(|flag| flag.as_str() == normalized)
            .ok_or_else(|| UnknownFeatureFlag(s.to_string()))
    }
}

/// Flag values as stored in the settings document. All default to `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// See [`FeatureFlag::DisableJobExecution`].
    pub disable_job_execution: bool,
    /// See [`FeatureFlag::DisableJobSubmission`].
    pub disable_job_submission: bool,
    /// See [`FeatureFlag::DisableBackgroundJobs`].
    pub disable_background_jobs: bool,
    /// See [`FeatureFlag::DisableInternalMetricsReporting`].
    pub disable_internal_metrics_reporting: bool,
}

impl FeatureFlags {
    /// Current value of a flag.
    pub fn get(&self, flag: FeatureFlag) -> bool {
        match flag {
            FeatureFlag::DisableJobExecution => self.disable_job_execution,
            FeatureFlag::DisableJobSubmission => self.disable_job_submission,
            FeatureFlag::DisableBackgroundJobs => self.disable_background_jobs,
            FeatureFlag::DisableInternalMetricsReporting => {
                self.disable_internal_metrics_reporting
            }
        }
    }

    /// Set a flag in memory.
    pub fn set(&mut self, flag: FeatureFlag, value: bool) {
        let slot = match flag {
            FeatureFlag::DisableJobExecution => &mut self.disable_job_execution,
            FeatureFlag::DisableJobSubmission => &mut self.disable_job_submission,
            FeatureFlag::DisableBackgroundJobs => &mut self.disable_background_jobs,
            FeatureFlag::DisableInternalMetricsReporting => {
                &mut self.disable_internal_metrics_reporting
            }
        };
        *slot = value;
    }

    /// Set a flag and write it to the stored settings document.
    ///
    /// Only the flag's own key is updated. Fails with `NotFound` when no
    /// settings document exists; the in-memory value is left untouched on
    /// any failure.
    pub async fn persist(&mut self, pool: &SqlitePool, flag: FeatureFlag, value: bool) -> Result<()> {
        let path = format!("$.flags.{}", flag.as_str());
        let literal = if value { "true" } else { "false" };

        let result = sqlx::query(
            r#"
            UPDATE service_settings
            SET document = json_set(document, ?, json(?)), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(path)
        .bind(literal)
        .bind(Utc::now())
        .bind(SETTINGS_ID)
        .execute(pool)
        .await?;

        match result.rows_affected() {
            0 => Err(ModelError::not_found("settings", SETTINGS_ID)),
            1 => {
                self.set(flag, value);
                info!(flag = %flag, value, "Feature flag updated");
                Ok(())
            }
            n => Err(ModelError::unexpected_rows("set_feature_flag", 1, n)),
        }
    }
}
