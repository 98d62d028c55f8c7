//! Active-run registry and shutdown drain.
//!
//! One registry is constructed at process start and shared (cheaply cloned)
//! by every engine handle. The state machine holds an [`ActiveRunGuard`] for
//! the lifetime of its loop, so deregistration happens on every exit path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("shutting down, not accepting new runs")]
    ShuttingDown,

    #[error("run {0} is already executing")]
    AlreadyActive(Uuid),
}

/// Result of [`ActiveRunRegistry::wait_for_drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub drained: bool,
    pub remaining: usize,
}

#[derive(Default)]
struct Inner {
    runs: DashSet<Uuid>,
    shutdown: CancellationToken,
}

/// Process-wide set of run ids currently inside the state-machine loop.
#[derive(Clone, Default)]
pub struct ActiveRunRegistry {
    inner: Arc<Inner>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. Refused once shutdown has begun or if the run id is
    /// already being driven.
    pub fn register(&self, run_id: Uuid) -> Result<ActiveRunGuard, RegistryError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }
        if !self.inner.runs.insert(run_id) {
            return Err(RegistryError::AlreadyActive(run_id));
        }
        tracing::debug!(run_id = %run_id, active = self.inner.runs.len(), "run registered");
        Ok(ActiveRunGuard {
            registry: self.clone(),
            run_id,
        })
    }

    pub fn count(&self) -> usize {
        self.inner.runs.len()
    }

    pub fn is_active(&self, run_id: &Uuid) -> bool {
        self.inner.runs.contains(run_id)
    }

    /// Stop accepting new runs. In-flight runs continue.
    pub fn begin_shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Poll until no runs remain or `timeout` elapses.
    pub async fn wait_for_drain(&self, timeout: Duration, poll_interval: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.count();
            if remaining == 0 {
                return DrainReport { drained: true, remaining: 0 };
            }
            if Instant::now() >= deadline {
                tracing::warn!(remaining, "drain timed out with runs still active");
                return DrainReport { drained: false, remaining };
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl std::fmt::Debug for ActiveRunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRunRegistry")
            .field("active", &self.count())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Deregisters its run when dropped.
#[derive(Debug)]
pub struct ActiveRunGuard {
    registry: ActiveRunRegistry,
    run_id: Uuid,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.registry.inner.runs.remove(&self.run_id);
        tracing::debug!(run_id = %self.run_id, "run deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_deregisters_on_drop() {
        let registry = ActiveRunRegistry::new();
        let id = Uuid::now_v7();
        {
            let _guard = registry.register(id).unwrap();
            assert_eq!(registry.count(), 1);
            assert!(registry.is_active(&id));
        }
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn duplicate_registration_refused() {
        let registry = ActiveRunRegistry::new();
        let id = Uuid::now_v7();
        let _guard = registry.register(id).unwrap();
        assert_eq!(registry.register(id).unwrap_err(), RegistryError::AlreadyActive(id));
    }

    #[test]
    fn shutdown_refuses_new_runs() {
        let registry = ActiveRunRegistry::new();
        let clone = registry.clone();
        clone.begin_shutdown();
        assert!(registry.is_shutting_down());
        assert_eq!(registry.register(Uuid::now_v7()).unwrap_err(), RegistryError::ShuttingDown);
    }

    #[tokio::test]
    async fn drain_completes_when_runs_finish() {
        let registry = ActiveRunRegistry::new();
        let guard = registry.register(Uuid::now_v7()).unwrap();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        let report = registry
            .wait_for_drain(Duration::from_secs(2), Duration::from_millis(5))
            .await;
        assert_eq!(report, DrainReport { drained: true, remaining: 0 });
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_remaining_count() {
        let registry = ActiveRunRegistry::new();
        let _a = registry.register(Uuid::now_v7()).unwrap();
        let _b = registry.register(Uuid::now_v7()).unwrap();

        let report = registry
            .wait_for_drain(Duration::from_millis(20), Duration::from_millis(5))
            .await;
        assert_eq!(report, DrainReport { drained: false, remaining: 2 });
    }
}
