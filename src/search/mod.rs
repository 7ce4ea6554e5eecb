//! Full-text search notification.
//!
//! The search index lives out of process. The engine only tells it about
//! changes, from detached tasks, after the primary write committed. Failures
//! are logged and dropped; there is no retry queue.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error};

/// Errors reported by search notifiers.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Search index unavailable: {0}")]
    Unavailable(String),

    #[error("Search index rejected {target}: {reason}")]
    Rejected { target: String, reason: String },
}

/// Out-of-process full-text indexer.
#[async_trait]
pub trait SearchNotifier: Send + Sync {
    /// Adds or replaces the document stored under `target` (`namespace:id`).
    async fn update_index(&self, target: &str, record: &[u8]) -> Result<(), NotifyError>;

    /// Removes the document stored under `target`.
    async fn delete_index(&self, target: &str) -> Result<(), NotifyError>;
}

/// Notifier for deployments without a search index.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl SearchNotifier for NoopNotifier {
    async fn update_index(&self, _target: &str, _record: &[u8]) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn delete_index(&self, _target: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Fire-and-forget dispatch of notifications onto the runtime.
///
/// Every notification runs as its own task, so there is no ordering between
/// them: an update followed by a delete of the same target may reach the
/// notifier in either order.
#[derive(Clone)]
pub struct SearchDispatcher {
    notifier: Arc<dyn SearchNotifier>,
    runtime: Handle,
}

impl SearchDispatcher {
    pub fn new(notifier: Arc<dyn SearchNotifier>, runtime: Handle) -> Self {
        Self { notifier, runtime }
    }

    pub fn notify_update(&self, target: String, record: Vec<u8>) {
        let notifier = self.notifier.clone();
        self.runtime.spawn(async move {
            match notifier.update_index(&target, &record).await {
                Ok(()) => debug!(target = %target, "Search index updated"),
                Err(e) => error!(target = %target, "[search] UpdateIndex error: {}", e),
            }
        });
    }

    pub fn notify_delete(&self, target: String) {
        let notifier = self.notifier.clone();
        self.runtime.spawn(async move {
            match notifier.delete_index(&target).await {
                Ok(()) => debug!(target = %target, "Search index entry deleted"),
                Err(e) => error!(target = %target, "[search] DeleteIndex error: {}", e),
            }
        });
    }
}
