// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local process manager.
//!
//! Spawns child processes and tracks them until [`ProcessManager::clear`]
//! forgets the finished ones. Every process gets a monitor task that waits
//! for exit (or a kill request) and publishes the final state through a
//! watch channel, so callers can read or await it without holding the child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process manager errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// Every slot is taken by a running process.
    #[error("Process capacity of {0} exceeded")]
    CapacityExceeded(usize),

    /// No process with this id.
    #[error("Process '{0}' not found")]
    NotFound(String),

    /// The manager has been closed.
    #[error("Process manager is closed")]
    Closed,

    /// The command could not be started.
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        /// Program that failed to start.
        command: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Delivering a signal failed.
    #[error("Failed to signal process '{id}': {source}")]
    Signal {
        /// Process id.
        id: String,
        /// Underlying failure.
        #[source]
        source: nix::errno::Errno,
    },
}

/// What to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Program to execute.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
    /// Free-form labels.
    pub tags: Vec<String>,
}

impl ProcessOptions {
    /// Options for running `command` with `args`.
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Snapshot of a tracked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Manager-assigned id.
    pub id: String,
    /// OS process id while running.
    pub pid: Option<u32>,
    /// Program.
    pub command: String,
    /// Labels from the options.
    pub tags: Vec<String>,
    /// Whether the process is still alive.
    pub running: bool,
    /// Exit code, `None` while running or when killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether the manager killed it.
    pub killed: bool,
    /// Spawn time.
    pub started_at: DateTime<Utc>,
    /// Exit time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessInfo {
    /// Exited with code zero.
    pub fn success(&self) -> bool {
        !self.running && self.exit_code == Some(0)
    }
}

struct Tracked {
    info: watch::Receiver<ProcessInfo>,
    kill: CancellationToken,
}

/// Spawns and tracks child processes up to a fixed capacity.
pub struct ProcessManager {
    capacity: usize,
    processes: DashMap<String, Tracked>,
    closed: AtomicBool,
}

impl ProcessManager {
    /// Manager tracking at most `capacity` processes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            processes: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Maximum tracked processes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start a process.
    ///
    /// When at capacity, finished processes are cleared first; if every
    /// slot is still taken the call fails.
    pub async fn create(&self, options: ProcessOptions) -> Result<ProcessInfo, ProcessError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProcessError::Closed);
        }
        if self.processes.len() >= self.capacity {
            self.clear();
            if self.processes.len() >= self.capacity {
                return Err(ProcessError::CapacityExceeded(self.capacity));
            }
        }

        let mut command = Command::new(&options.command);
        command
            .args(&options.args)
            .envs(&options.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: options.command.clone(),
            source,
        })?;

        let id = Uuid::new_v4().to_string();
        let info = ProcessInfo {
            id: id.clone(),
            pid: child.id(),
            command: options.command.clone(),
            tags: options.tags.clone(),
            running: true,
            exit_code: None,
            killed: false,
            started_at: Utc::now(),
            finished_at: None,
        };

        let (sender, receiver) = watch::channel(info.clone());
        let kill = CancellationToken::new();
        self.processes.insert(
            id.clone(),
            Tracked {
                info: receiver,
                kill: kill.clone(),
            },
        );

        let process_id = id.clone();
        tokio::spawn(async move {
            let (status, killed) = tokio::select! {
                status = child.wait() => (status, false),
                _ = kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        warn!(process_id = %process_id, error = %e, "Failed to kill process");
                    }
                    (child.wait().await, true)
                }
            };

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(process_id = %process_id, error = %e, "Failed to wait for process");
                    None
                }
            };

            sender.send_modify(|info| {
                info.running = false;
                info.pid = None;
                info.exit_code = exit_code;
                info.killed = killed;
                info.finished_at = Some(Utc::now());
            });
            debug!(process_id = %process_id, ?exit_code, killed, "Process finished");
        });

        info!(process_id = %id, command = %options.command, pid = ?info.pid, "Process started");
        Ok(info)
    }

    /// Current state of a process.
    pub fn get(&self, id: &str) -> Result<ProcessInfo, ProcessError> {
        self.processes
            .get(id)
            .map(|tracked| tracked.info.borrow().clone())
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))
    }

    /// Every tracked process, oldest first.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut all: Vec<ProcessInfo> = self
            .processes
            .iter()
            .map(|entry| entry.info.borrow().clone())
            .collect();
        all.sort_by_key(|info| info.started_at);
        all
    }

    /// Wait for a process to finish.
    pub async fn wait(&self, id: &str) -> Result<ProcessInfo, ProcessError> {
        let mut receiver = self
            .processes
            .get(id)
            .map(|tracked| tracked.info.clone())
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;

        if receiver.wait_for(|info| !info.running).await.is_err() {
            debug!(process_id = %id, "Process monitor exited without a final state");
        }
        let info = receiver.borrow().clone();
        Ok(info)
    }

    /// Send a signal to a running process.
    pub fn signal(&self, id: &str, sig: Signal) -> Result<(), ProcessError> {
        let info = self.get(id)?;
        let Some(pid) = info.pid else {
            return Ok(());
        };

        signal::kill(Pid::from_raw(pid as i32), sig).map_err(|source| ProcessError::Signal {
            id: id.to_string(),
            source,
        })
    }

    /// Kill a process.
    pub fn kill(&self, id: &str) -> Result<(), ProcessError> {
        match self.processes.get(id) {
            Some(tracked) => {
                tracked.kill.cancel();
                Ok(())
            }
            None => Err(ProcessError::NotFound(id.to_string())),
        }
    }

    /// Forget finished processes. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let before = self.processes.len();
        self.processes.retain(|_, tracked| tracked.info.borrow().running);
        before.saturating_sub(self.processes.len())
    }

    /// Kill every running process, wait for them to exit and reject
    /// further creation.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let receivers: Vec<watch::Receiver<ProcessInfo>> = self
            .processes
            .iter()
            .map(|entry| {
                entry.kill.cancel();
                entry.info.clone()
            })
            .collect();

        let running = receivers.len();
        for mut receiver in receivers {
            let _ = receiver.wait_for(|info| !info.running).await;
        }

        info!(processes = running, "Process manager closed");
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("capacity", &self.capacity)
            .field("tracked", &self.processes.len())
            .finish()
    }
}
