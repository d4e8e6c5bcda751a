use std::time::Duration;

use sqlx::{PgPool, Postgres, Transaction};

use crate::domain::{Build, BuildStatus, Platform, Stats};

pub struct NewBuild {
    pub id: String,
    pub platform: Platform,
    pub source_path: String,
    pub certs_path: Option<String>,
    pub access_token: String,
}

/// Partial update for a build row. Only `Some` fields are written; the
/// generic `update` operation builds one dynamic `UPDATE` via
/// `sqlx::QueryBuilder` rather than N bespoke methods.
#[derive(Default)]
pub struct BuildPatch {
    pub status: Option<BuildStatus>,
    pub worker_id: Option<Option<String>>,
    pub result_path: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl BuildPatch {
    pub fn status(mut self, status: BuildStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn worker_id(mut self, worker_id: Option<String>) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn result_path(mut self, path: Option<String>) -> Self {
        self.result_path = Some(path);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn touch_heartbeat(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
        self.last_heartbeat_at = Some(at);
        self
    }
}

pub async fn insert(pool: &PgPool, attrs: NewBuild) -> Result<Build, sqlx::Error> {
    sqlx::query_as::<_, Build>(
        r#"
        INSERT INTO builds (id, platform, status, source_path, certs_path, access_token)
        VALUES ($1, $2, 'pending', $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(&attrs.id)
    .bind(attrs.platform)
    .bind(&attrs.source_path)
    .bind(&attrs.certs_path)
    .bind(&attrs.access_token)
    .fetch_one(pool)
    .await
}

pub async fn get(pool: &PgPool, id: &str) -> Result<Option<Build>, sqlx::Error> {
    sqlx::query_as::<_, Build>("SELECT * FROM builds WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn next_pending_for_update(
    txn: &mut Transaction<'_, Postgres>,
) -> Result<Option<Build>, sqlx::Error> {
    sqlx::query_as::<_, Build>(
        r#"
        SELECT * FROM builds
        WHERE status = 'pending'
        ORDER BY submitted_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut **txn)
    .await
}

pub async fn update(
    txn: &mut Transaction<'_, Postgres>,
    id: &str,
    patch: BuildPatch,
) -> Result<Build, sqlx::Error> {
    let mut builder = sqlx::QueryBuilder::<Postgres>::new("UPDATE builds SET updated_at = now()");

    if let Some(status) = patch.status {
        builder.push(", status = ").push_bind(status);
    }
    if let Some(worker_id) = patch.worker_id {
        builder.push(", worker_id = ").push_bind(worker_id);
    }
    if let Some(result_path) = patch.result_path {
        builder.push(", result_path = ").push_bind(result_path);
    }
    if let Some(error_message) = patch.error_message {
        builder.push(", error_message = ").push_bind(error_message);
    }
    if let Some(heartbeat) = patch.last_heartbeat_at {
        builder.push(", last_heartbeat_at = ").push_bind(heartbeat);
    }

    builder.push(" WHERE id = ").push_bind(id.to_string());
    builder.push(" RETURNING *");

    builder
        .build_query_as::<Build>()
        .fetch_one(&mut **txn)
        .await
}

/// Any `assigned`/`building` build whose heartbeat has aged out becomes
/// `failed`. Returns the rows that were transitioned so the caller can
/// update worker counters.
pub async fn mark_stuck_as_failed(
    txn: &mut Transaction<'_, Postgres>,
    timeout: Duration,
) -> Result<Vec<Build>, sqlx::Error> {
    let cutoff = chrono::Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
    sqlx::query_as::<_, Build>(
        r#"
        UPDATE builds
        SET status = 'failed', error_message = 'heartbeat timeout', updated_at = now()
        WHERE status IN ('assigned', 'building') AND last_heartbeat_at < $1
        RETURNING *
        "#,
    )
    .bind(cutoff)
    .fetch_all(&mut **txn)
    .await
}

/// Finds the build currently claimed by `worker_id` (`assigned` or
/// `building`). With a concurrency budget of 1, a worker has at most one
/// such build, which is how `result`/`fail` locate their target without
/// requiring the build id on the path.
pub async fn find_active_for_worker(
    pool: &PgPool,
    worker_id: &str,
) -> Result<Option<Build>, sqlx::Error> {
    sqlx::query_as::<_, Build>(
        "SELECT * FROM builds WHERE worker_id = $1 AND status IN ('assigned', 'building') LIMIT 1",
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_pending(pool: &PgPool) -> Result<Vec<Build>, sqlx::Error> {
    sqlx::query_as::<_, Build>(
        "SELECT * FROM builds WHERE status = 'pending' ORDER BY submitted_at ASC",
    )
    .fetch_all(pool)
    .await
}

pub async fn stats(pool: &PgPool) -> Result<Stats, sqlx::Error> {
    let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT count(*) FROM workers WHERE status != 'offline') AS nodes_online,
            (SELECT count(*) FROM builds WHERE status = 'pending') AS builds_queued,
            (SELECT count(*) FROM builds WHERE status IN ('assigned', 'building')) AS active_builds,
            (SELECT count(*) FROM builds WHERE submitted_at >= date_trunc('day', now())) AS builds_today,
            (SELECT count(*) FROM builds) AS total_builds
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(Stats {
        nodes_online: row.0,
        builds_queued: row.1,
        active_builds: row.2,
        builds_today: row.3,
        total_builds: row.4,
    })
}
