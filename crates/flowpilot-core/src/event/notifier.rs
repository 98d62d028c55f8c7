//! Lifecycle notifier port.
//!
//! The engine emits `run.started`, `run.succeeded`, `run.failed`, and
//! `run.waiting_approval` through a [`LifecycleNotifier`]. Delivery is
//! best-effort: [`dispatch`] hands the event to a detached task and only logs
//! a failure, so a broken sink can never fail or stall a run.

use std::sync::Arc;

use flowpilot_types::event::LifecycleEvent;
use futures_util::future::BoxFuture;
use thiserror::Error;

use super::bus::EventBus;

#[derive(Debug, Clone, Error)]
#[error("notification '{event}' failed: {message}")]
pub struct NotifyError {
    pub event: String,
    pub message: String,
}

impl NotifyError {
    pub fn new(event: &LifecycleEvent, message: impl Into<String>) -> Self {
        Self {
            event: event.name().to_string(),
            message: message.into(),
        }
    }
}

/// External sink for lifecycle events (webhooks, queues, in-process bus).
pub trait LifecycleNotifier: Send + Sync {
    fn notify<'a>(&'a self, event: &'a LifecycleEvent) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl LifecycleNotifier for NoopNotifier {
    fn notify<'a>(&'a self, _event: &'a LifecycleEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Publishes onto an [`EventBus`].
#[derive(Debug, Clone)]
pub struct EventBusNotifier {
    bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

impl LifecycleNotifier for EventBusNotifier {
    fn notify<'a>(&'a self, event: &'a LifecycleEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            self.bus.publish(event.clone());
            Ok(())
        })
    }
}

/// Fire-and-forget delivery on a detached task. Errors are logged, never returned.
pub fn dispatch(notifier: Arc<dyn LifecycleNotifier>, event: LifecycleEvent) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&event).await {
            tracing::warn!(
                run_id = %event.run_id(),
                event = event.name(),
                error = %e,
                "lifecycle notification failed"
            );
        }
    });
}
