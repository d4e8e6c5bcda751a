use std::time::Duration;

use sqlx::{PgPool, Postgres, Transaction};

use crate::domain::{Worker, WorkerStatus};

#[derive(Default)]
pub struct WorkerPatch {
    pub status: Option<WorkerStatus>,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
    pub increment_completed: bool,
    pub increment_failed: bool,
}

impl WorkerPatch {
    pub fn status(mut self, status: WorkerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn touch(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
        self.last_seen_at = Some(at);
        self
    }

    pub fn rotate_token(mut self, token: String, expires_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.access_token = Some(token);
        self.access_token_expires_at = Some(expires_at);
        self
    }

    pub fn completed(mut self) -> Self {
        self.increment_completed = true;
        self
    }

    pub fn failed(mut self) -> Self {
        self.increment_failed = true;
        self
    }
}

pub async fn insert_or_refresh(
    pool: &PgPool,
    id: &str,
    name: &str,
    capabilities: serde_json::Value,
    access_token: &str,
    ttl: Duration,
) -> Result<Worker, sqlx::Error> {
    let expires_at = chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
    sqlx::query_as::<_, Worker>(
        r#"
        INSERT INTO workers (id, name, capabilities, status, access_token, access_token_expires_at, last_seen_at)
        VALUES ($1, $2, $3, 'idle', $4, $5, now())
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            capabilities = EXCLUDED.capabilities,
            status = CASE WHEN workers.status = 'offline' THEN 'idle' ELSE workers.status END,
            access_token = EXCLUDED.access_token,
            access_token_expires_at = EXCLUDED.access_token_expires_at,
            last_seen_at = now()
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(capabilities)
    .bind(access_token)
    .bind(expires_at)
    .fetch_one(pool)
    .await
}

pub async fn get(pool: &PgPool, id: &str) -> Result<Option<Worker>, sqlx::Error> {
    sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Locks the worker row for the duration of the transaction. Used by
/// assignment so the busy/idle check and the subsequent status flip to
/// `building` are atomic against a second concurrent poll from the same
/// worker id.
pub async fn get_for_update(
    txn: &mut Transaction<'_, Postgres>,
    id: &str,
) -> Result<Option<Worker>, sqlx::Error> {
    sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **txn)
        .await
}

pub async fn update(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    patch: WorkerPatch,
) -> Result<Worker, sqlx::Error> {
    let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new("UPDATE workers SET ");
    let mut sets = builder.separated(", ");

    if let Some(status) = patch.status {
        sets.push("status = ").push_bind_unseparated(status);
    }
    if let Some(token) = patch.access_token {
        sets.push("access_token = ").push_bind_unseparated(token);
    }
    if let Some(expires_at) = patch.access_token_expires_at {
        sets.push("access_token_expires_at = ")
            .push_bind_unseparated(expires_at);
    }
    if let Some(last_seen_at) = patch.last_seen_at {
        sets.push("last_seen_at = ").push_bind_unseparated(last_seen_at);
    }
    if patch.increment_completed {
        sets.push("builds_completed = builds_completed + 1");
    }
    if patch.increment_failed {
        sets.push("builds_failed = builds_failed + 1");
    }
    // Always-true no-op clause so a patch with no fields set is still valid SQL.
    sets.push("id = id");

    builder.push(" WHERE id = ").push_bind(id.to_string());
    builder.push(" RETURNING *");

    builder
        .build_query_as::<Worker>()
        .fetch_one(executor)
        .await
}

pub async fn mark_offline_if_stale(pool: &PgPool, timeout: Duration) -> Result<u64, sqlx::Error> {
    let cutoff = chrono::Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
    let result = sqlx::query(
        r#"
        UPDATE workers
        SET status = 'offline'
        WHERE status != 'offline' AND last_seen_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
