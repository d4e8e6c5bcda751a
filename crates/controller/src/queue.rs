//! An in-memory, ordered view of pending build IDs, backed by the Store
//! as the single source of truth. Never serialized to disk; rebuilt
//! from `pending` rows on every startup.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::assignment::{AssignError, AssignmentService};
use crate::domain::{Build, BuildStatus};
use crate::store::{BuildPatch, Store};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
}

pub struct QueueManager {
    inner: Mutex<VecDeque<String>>,
    stats_tx: watch::Sender<QueueStats>,
    store: Store,
}

/// Outcome of a dequeue attempt, after the transient/permanent
/// categorization below.
pub enum DequeueOutcome {
    Assigned(Build),
    Empty,
    Transient(AssignError),
    /// A build was removed from the queue and marked `failed` in the
    /// Store because the assignment transaction found it was no longer
    /// eligible.
    Failed(AssignError),
}

impl QueueManager {
    /// Rebuilds the queue from the Store's `pending` rows in submission
    /// order.
    pub async fn reconcile(store: Store) -> Result<Arc<Self>, sqlx::Error> {
        let pending = store.list_pending_in_submission_order().await?;
        let ids: VecDeque<String> = pending.into_iter().map(|b| b.id).collect();
        let (stats_tx, _rx) = watch::channel(QueueStats { pending: ids.len() });
        Ok(Arc::new(Self {
            inner: Mutex::new(ids),
            stats_tx,
            store,
        }))
    }

    pub async fn stats(&self) -> QueueStats {
        *self.stats_tx.borrow()
    }

    /// Appends a newly submitted build to the tail of the queue. The
    /// Store write (the row already being `pending`) has already
    /// happened by the time this is called; this only updates the
    /// in-memory cache and broadcasts the new count.
    pub async fn enqueue(&self, build_id: String) {
        let mut guard = self.inner.lock().await;
        guard.push_back(build_id);
        self.publish_stats(guard.len());
    }

    fn publish_stats(&self, pending: usize) {
        let _ = self.stats_tx.send(QueueStats { pending });
    }

    /// Attempts to assign the build at the head of the queue to
    /// `worker_id`. The Store's `next_pending_for_update` is the actual
    /// authority on which build is oldest-pending — the in-memory head
    /// is only consulted to skip a wasted transaction when the cache is
    /// already known empty.
    ///
    /// - transient failure (worker busy/offline/not found): the queue is
    ///   left untouched, and the error is surfaced so the caller can
    ///   retry or back off.
    /// - permanent failure (the build the transaction locked was no
    ///   longer pending): mark that build failed in the Store, then drop
    ///   it from the queue.
    ///
    /// A build is never silently dropped from the queue: every removal
    /// lands in either `assigned` or `failed` in the Store.
    pub async fn dequeue_for_worker(
        &self,
        assignment: &AssignmentService,
        worker_id: &str,
    ) -> DequeueOutcome {
        {
            let guard = self.inner.lock().await;
            if guard.is_empty() {
                return DequeueOutcome::Empty;
            }
        }

        match assignment.assign(worker_id).await {
            Ok(Some(build)) => {
                let mut guard = self.inner.lock().await;
                guard.retain(|id| id != &build.id);
                self.publish_stats(guard.len());
                DequeueOutcome::Assigned(build)
            }
            Ok(None) => {
                // The Store had nothing pending even though our cache
                // thought otherwise: a stale head, most likely a build
                // cancelled out from under us. Drop the stale entry.
                let mut guard = self.inner.lock().await;
                guard.pop_front();
                self.publish_stats(guard.len());
                DequeueOutcome::Empty
            }
            Err(err) if is_transient(&err) => DequeueOutcome::Transient(err),
            Err(err) => {
                if let Some(build_id) = err.offending_build() {
                    let _ = self
                        .store
                        .update_build_on_pool(
                            build_id,
                            BuildPatch::default()
                                .status(BuildStatus::Failed)
                                .error_message(Some(describe(&err))),
                        )
                        .await;
                    let mut guard = self.inner.lock().await;
                    guard.retain(|id| id != build_id);
                    self.publish_stats(guard.len());
                }
                DequeueOutcome::Failed(err)
            }
        }
    }
}

fn is_transient(err: &AssignError) -> bool {
    matches!(
        err,
        AssignError::WorkerBusy | AssignError::WorkerOffline | AssignError::WorkerNotFound
    )
}

fn describe(err: &AssignError) -> String {
    format!("assignment failed permanently: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_categorized_correctly() {
        assert!(is_transient(&AssignError::WorkerBusy));
        assert!(is_transient(&AssignError::WorkerOffline));
        assert!(is_transient(&AssignError::WorkerNotFound));
        assert!(!is_transient(&AssignError::BuildNotPending(
            "b1".to_string()
        )));
    }
}
