//! Durable relational persistence, with the transactional
//! select-and-skip-locked primitive the rest of the service is built
//! around.

mod build;
mod log;
mod worker;

pub use build::{BuildPatch, NewBuild};
pub use log::NewLog;
pub use worker::WorkerPatch;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::domain::{Build, BuildLog, Worker};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

/// Transaction timeouts: 5s for single-row writes, 10s for bulk log
/// inserts.
const SINGLE_ROW_TIMEOUT: Duration = Duration::from_secs(5);
const BULK_TIMEOUT: Duration = Duration::from_secs(10);

impl Store {
    pub async fn connect(db_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(20)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begins a transaction with the given statement timeout applied
    /// via `SET LOCAL statement_timeout`, scoped to this transaction
    /// only.
    pub async fn begin_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut txn = self.pool.begin().await?;
        let ms = timeout.as_millis() as i64;
        sqlx::query(&format!("SET LOCAL statement_timeout = {ms}"))
            .execute(&mut *txn)
            .await?;
        Ok(txn)
    }

    pub async fn begin_single_row(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.begin_with_timeout(SINGLE_ROW_TIMEOUT).await
    }

    // -- Build operations ---------------------------------------------

    pub async fn insert_build(&self, attrs: NewBuild) -> Result<Build, sqlx::Error> {
        build::insert(&self.pool, attrs).await
    }

    pub async fn get_build(&self, id: &str) -> Result<Option<Build>, sqlx::Error> {
        build::get(&self.pool, id).await
    }

    /// Selects the oldest pending build, locking its row, skipping rows
    /// already locked by a concurrent caller. Must be called inside an
    /// open transaction.
    pub async fn next_pending_for_update(
        &self,
        txn: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<Build>, sqlx::Error> {
        build::next_pending_for_update(txn).await
    }

    pub async fn update_build(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        id: &str,
        patch: BuildPatch,
    ) -> Result<Build, sqlx::Error> {
        build::update(txn, id, patch).await
    }

    pub async fn update_build_on_pool(
        &self,
        id: &str,
        patch: BuildPatch,
    ) -> Result<Build, sqlx::Error> {
        let mut txn = self.begin_single_row().await?;
        let row = build::update(&mut txn, id, patch).await?;
        txn.commit().await?;
        Ok(row)
    }

    pub async fn mark_stuck_builds_as_failed(
        &self,
        timeout: Duration,
    ) -> Result<Vec<Build>, sqlx::Error> {
        let mut txn = self.begin_single_row().await?;
        let rows = build::mark_stuck_as_failed(&mut txn, timeout).await?;
        txn.commit().await?;
        Ok(rows)
    }

    pub async fn list_pending_in_submission_order(&self) -> Result<Vec<Build>, sqlx::Error> {
        build::list_pending(&self.pool).await
    }

    pub async fn find_active_build_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Option<Build>, sqlx::Error> {
        build::find_active_for_worker(&self.pool, worker_id).await
    }

    pub async fn stats(&self) -> Result<crate::domain::Stats, sqlx::Error> {
        build::stats(&self.pool).await
    }

    // -- Worker operations ----------------------------------------------

    pub async fn insert_or_refresh_worker(
        &self,
        id: &str,
        name: &str,
        capabilities: serde_json::Value,
        access_token: &str,
        ttl: Duration,
    ) -> Result<Worker, sqlx::Error> {
        worker::insert_or_refresh(&self.pool, id, name, capabilities, access_token, ttl).await
    }

    pub async fn get_worker(&self, id: &str) -> Result<Option<Worker>, sqlx::Error> {
        worker::get(&self.pool, id).await
    }

    /// Locks the worker row inside `txn`, for the atomic busy-check-then-
    /// update span in assignment.
    pub async fn get_worker_for_update(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        id: &str,
    ) -> Result<Option<Worker>, sqlx::Error> {
        worker::get_for_update(txn, id).await
    }

    pub async fn update_worker(
        &self,
        executor: impl sqlx::PgExecutor<'_>,
        id: &str,
        patch: WorkerPatch,
    ) -> Result<Worker, sqlx::Error> {
        worker::update(executor, id, patch).await
    }

    pub async fn mark_offline_if_stale(&self, timeout: Duration) -> Result<u64, sqlx::Error> {
        worker::mark_offline_if_stale(&self.pool, timeout).await
    }

    // -- Log operations ---------------------------------------------------

    pub async fn append_logs(&self, build_id: &str, entries: &[NewLog]) -> Result<(), sqlx::Error> {
        let mut txn = self.begin_with_timeout(BULK_TIMEOUT).await?;
        log::append(&mut txn, build_id, entries).await?;
        txn.commit().await
    }

    pub async fn list_logs(
        &self,
        build_id: &str,
        since: i64,
    ) -> Result<Vec<BuildLog>, sqlx::Error> {
        log::list_since(&self.pool, build_id, since).await
    }
}
