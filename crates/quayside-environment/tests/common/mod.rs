// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for quayside-environment tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quayside_environment::jobs::{JobStatusReport, job_status};
use quayside_environment::{Config, Environment, ShutdownContext};

/// Environment backed by a database file in a temporary directory.
pub struct TestEnv {
    pub env: Arc<Environment>,
    _temp_dir: tempfile::TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with(|_| {}).await
    }

    /// Start an environment after adjusting the test configuration.
    pub async fn with(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let mut config = test_config(temp_dir.path());
        adjust(&mut config);
        let env = Environment::initialize(config)
            .await
            .expect("Failed to initialize environment");
        Self {
            env,
            _temp_dir: temp_dir,
        }
    }

    pub async fn close(&self) {
        self.env
            .close(shutdown_ctx())
            .await
            .expect("Failed to close environment");
    }
}

/// Fast-polling configuration with its database under `dir`.
pub fn test_config(dir: &Path) -> Config {
    Config {
        database_url: format!("sqlite:{}", dir.join("quayside.db").display()),
        max_connections: 4,
        queue_poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

pub fn shutdown_ctx() -> ShutdownContext {
    ShutdownContext::with_timeout(Duration::from_secs(5))
}

/// Poll a durable job until it finishes.
pub async fn wait_for_job(env: &Environment, id: &str) -> JobStatusReport {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let report = job_status(env, id).await.expect("Failed to get job status");
        if report.status.is_terminal() {
            return report;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} did not finish in time",
            id
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
