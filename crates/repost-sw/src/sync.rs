//! Platform-side background sync queue.
//!
//! Pages register tags while offline; when connectivity returns the queue is
//! flushed into the active worker. Failed tags are redelivered with backoff and
//! dropped once the retry budget is spent.

use repost_common::{retry_with_backoff_if, RetryConfig};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::lifecycle::ServiceWorkerContainer;
use crate::SwError;

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub delivered: Vec<String>,
    pub dropped: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Queue of sync tags awaiting delivery.
#[derive(Debug, Default)]
pub struct SyncManager {
    retry: RetryConfig,
    pending: Mutex<Vec<String>>,
}

impl SyncManager {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a tag. Returns `false` if it was already pending.
    pub async fn register(&self, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        let mut pending = self.pending.lock().await;
        if pending.contains(&tag) {
            debug!(tag = %tag, "Sync tag already pending");
            return false;
        }
        pending.push(tag);
        true
    }

    pub async fn pending(&self) -> Vec<String> {
        self.pending.lock().await.clone()
    }

    /// Deliver every pending tag to the active worker.
    ///
    /// With no active worker nothing is delivered and the queue is kept.
    pub async fn flush(&self, container: &ServiceWorkerContainer) -> SyncReport {
        let mut report = SyncReport::default();
        if container.active().await.is_none() {
            debug!("No active worker, keeping sync queue");
            return report;
        }

        let tags = std::mem::take(&mut *self.pending.lock().await);
        for tag in tags {
            let result = retry_with_backoff_if(&self.retry, is_retryable, || {
                container.dispatch_sync(&tag)
            })
            .await;

            match result {
                Ok(()) => report.delivered.push(tag),
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Dropping sync tag");
                    report.dropped.push(tag);
                }
            }
        }

        info!(
            delivered = report.delivered.len(),
            dropped = report.dropped.len(),
            "Sync queue flushed"
        );
        report
    }
}

fn is_retryable(err: &SwError) -> bool {
    match err {
        SwError::Sync { source, .. } => source.is_retryable(),
        SwError::State(_) => false,
        _ => true,
    }
}
