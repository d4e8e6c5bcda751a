//! The atomic build-to-worker binding, the hot path under contention
//! from many concurrently polling workers.

use chrono::Utc;

use crate::domain::{Build, BuildStatus, WorkerStatus};
use crate::store::{BuildPatch, Store, WorkerPatch};

#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("worker not registered")]
    WorkerNotFound,
    #[error("worker is already building (concurrency budget is 1)")]
    WorkerBusy,
    #[error("worker is offline")]
    WorkerOffline,
    /// Defensive: the row `next_pending_for_update` returned was no
    /// longer pending by the time of the update within the same
    /// transaction. Unreachable under normal operation since the select
    /// holds a row lock for the duration of the transaction, but handled
    /// explicitly rather than left to panic.
    #[error("build {0} was no longer pending")]
    BuildNotPending(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("assignment transaction timed out")]
    Timeout,
}

impl AssignError {
    pub fn offending_build(&self) -> Option<&str> {
        match self {
            AssignError::BuildNotPending(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

pub struct AssignmentService {
    store: Store,
}

impl AssignmentService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Binds the oldest pending build to `worker_id`, end to end:
    /// 1. open a transaction with a 5s timeout.
    /// 2. lock the worker row and check it has budget to accept another
    ///    build (budget fixed at 1: reject if already `building`). The
    ///    row lock is held for the rest of the transaction, so a second
    ///    concurrent poll for the same worker id blocks here instead of
    ///    racing the busy check against this call's commit.
    /// 3. select the oldest pending build, locking it, skipping locked rows.
    /// 4. update the build to `assigned`, stamping `last_heartbeat_at` so
    ///    a worker that never calls `heartbeat` is still reclaimable by
    ///    the timeout sweep instead of sitting on a null heartbeat forever.
    /// 5. update the worker to `building`.
    /// 6. commit.
    pub async fn assign(&self, worker_id: &str) -> Result<Option<Build>, AssignError> {
        let mut txn = self
            .store
            .begin_single_row()
            .await
            .map_err(map_timeout)?;

        let worker = self
            .store
            .get_worker_for_update(&mut txn, worker_id)
            .await?
            .ok_or(AssignError::WorkerNotFound)?;

        match worker.status {
            WorkerStatus::Building => {
                txn.rollback().await.ok();
                return Err(AssignError::WorkerBusy);
            }
            WorkerStatus::Offline => {
                txn.rollback().await.ok();
                return Err(AssignError::WorkerOffline);
            }
            WorkerStatus::Idle => {}
        }

        let Some(build) = self.store.next_pending_for_update(&mut txn).await? else {
            txn.rollback().await.ok();
            return Ok(None);
        };

        if build.status != BuildStatus::Pending {
            txn.rollback().await.ok();
            return Err(AssignError::BuildNotPending(build.id));
        }

        let now = Utc::now();
        let updated = self
            .store
            .update_build(
                &mut txn,
                &build.id,
                BuildPatch::default()
                    .status(BuildStatus::Assigned)
                    .worker_id(Some(worker_id.to_string()))
                    .touch_heartbeat(now),
            )
            .await?;

        self.store
            .update_worker(
                &mut *txn,
                worker_id,
                WorkerPatch::default()
                    .status(WorkerStatus::Building)
                    .touch(now),
            )
            .await?;

        txn.commit().await.map_err(map_timeout)?;

        Ok(Some(updated))
    }
}

fn map_timeout(err: sqlx::Error) -> AssignError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.message().contains("statement timeout") => {
            AssignError::Timeout
        }
        sqlx::Error::PoolTimedOut => AssignError::Timeout,
        _ => AssignError::Db(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offending_build_extracts_id() {
        let err = AssignError::BuildNotPending("b1".to_string());
        assert_eq!(err.offending_build(), Some("b1"));
        assert_eq!(AssignError::WorkerBusy.offending_build(), None);
    }
}
