// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Closers and the shutdown context they run under.
//!
//! A closer is a named teardown function. Every closer of a batch is
//! launched on its own task, background or not, and the batch is joined
//! until the context's deadline. Closers are expected to honor the
//! deadline themselves; one that is still running when it passes is left
//! to finish detached and reported as failed.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CloserFailure;

type CloserFn =
    Box<dyn FnOnce(ShutdownContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named teardown function.
pub struct Closer {
    name: String,
    background: bool,
    func: CloserFn,
}

impl Closer {
    /// Wrap an async teardown function.
    pub fn new<F, Fut>(name: impl Into<String>, background: bool, f: F) -> Self
    where
        F: FnOnce(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            background,
            func: Box::new(move |ctx| f(ctx).boxed()),
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether it was registered as a background closer.
    pub fn is_background(&self) -> bool {
        self.background
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("name", &self.name)
            .field("background", &self.background)
            .finish_non_exhaustive()
    }
}

/// Deadline and cancellation handed to every closer.
#[derive(Debug, Clone)]
pub struct ShutdownContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl ShutdownContext {
    /// Context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// When closers must be done.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Give up early. Every clone observes it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the deadline passed or the context was cancelled.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves at the deadline or on cancellation.
    pub async fn done(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Launch every closer concurrently and join them until the deadline.
///
/// Returns one failure per closer that errored, panicked, or was still
/// running at the deadline.
pub(crate) async fn run_closers(closers: Vec<Closer>, ctx: &ShutdownContext) -> Vec<CloserFailure> {
    let total = closers.len();
    let mut pending: BTreeMap<usize, String> = BTreeMap::new();
    let mut tasks = JoinSet::new();

    for (index, closer) in closers.into_iter().enumerate() {
        info!(
            closer = %closer.name,
            index,
            total,
            background = closer.background,
            remaining_ms = ctx.remaining().as_millis() as u64,
            "Calling closer"
        );

        pending.insert(index, closer.name);
        let func = closer.func;
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let result = match AssertUnwindSafe(async move { func(ctx).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(
                    "closer panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            (index, result)
        });
    }

    let mut failures = Vec::new();
    let mut timed_out = false;

    loop {
        match tokio::time::timeout_at(ctx.deadline(), tasks.join_next()).await {
            Ok(Some(Ok((index, result)))) => {
                let name = pending.remove(&index).unwrap_or_default();
                match result {
                    Ok(()) => debug!(closer = %name, "Closer finished"),
                    Err(error) => {
                        warn!(closer = %name, error = %error, "Closer failed");
                        failures.push(CloserFailure { name, error });
                    }
                }
            }
            Ok(Some(Err(e))) => error!(error = %e, "Closer task could not be joined"),
            Ok(None) => break,
            Err(_) => {
                timed_out = true;
                warn!(
                    still_running = pending.len(),
                    "Shutdown deadline reached with closers still running"
                );
                tasks.detach_all();
                break;
            }
        }
    }

    for (_, name) in pending {
        let error = if timed_out {
            anyhow::anyhow!("did not finish before the shutdown deadline")
        } else {
            anyhow::anyhow!("task ended without reporting a result")
        };
        failures.push(CloserFailure { name, error });
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_all_closers_run_despite_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut closers = Vec::new();
        for i in 0..4 {
            let calls = calls.clone();
            closers.push(Closer::new(format!("closer-{}", i), i % 2 == 0, move |_ctx| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    anyhow::bail!("broken");
                }
                Ok(())
            }));
        }

        let failures = run_closers(closers, &ShutdownContext::with_timeout(Duration::from_secs(5))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "closer-2");
        assert_eq!(failures[0].to_string(), "closer 'closer-2' failed: broken");
    }

    #[tokio::test]
    async fn test_closers_run_concurrently() {
        let closers: Vec<Closer> = (0..5)
            .map(|i| {
                Closer::new(format!("slow-{}", i), false, |_ctx| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    anyhow::Ok(())
                })
            })
            .collect();

        let started = std::time::Instant::now();
        let failures = run_closers(closers, &ShutdownContext::with_timeout(Duration::from_secs(5))).await;

        assert!(failures.is_empty());
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_panicking_closer_is_reported() {
        async fn explode() -> anyhow::Result<()> {
            panic!("kaboom")
        }

        let closers = vec![Closer::new("explodes", true, |_ctx| explode())];

        let failures = run_closers(closers, &ShutdownContext::with_timeout(Duration::from_secs(5))).await;

        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_deadline_reports_stuck_closer() {
        let closers = vec![
            Closer::new("stuck", false, |_ctx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                anyhow::Ok(())
            }),
            Closer::new("quick", false, |_ctx| async { anyhow::Ok(()) }),
        ];

        let failures = run_closers(closers, &ShutdownContext::with_timeout(Duration::from_millis(100))).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "stuck");
        assert!(failures[0].error.to_string().contains("deadline"));
    }

    #[tokio::test]
    async fn test_context_done() {
        let ctx = ShutdownContext::with_timeout(Duration::from_secs(60));
        assert!(!ctx.is_done());
        let clone = ctx.clone();
        ctx.cancel();
        clone.done().await;
        assert!(clone.is_done());
    }
}
