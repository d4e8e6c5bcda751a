use sqlx::{PgPool, Postgres, Transaction};

use crate::domain::{BuildLog, LogLevel};

pub struct NewLog {
    pub level: LogLevel,
    pub message: String,
}

/// Bulk-insert log lines for a build. Append-only, ordered by insertion.
pub async fn append(
    txn: &mut Transaction<'_, Postgres>,
    build_id: &str,
    entries: &[NewLog],
) -> Result<(), sqlx::Error> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut builder = sqlx::QueryBuilder::<Postgres>::new(
        "INSERT INTO build_logs (build_id, level, message) ",
    );
    builder.push_values(entries, |mut row, entry| {
        row.push_bind(build_id)
            .push_bind(entry.level)
            .push_bind(&entry.message);
    });
    builder.build().execute(&mut **txn).await?;
    Ok(())
}

pub async fn list_since(
    pool: &PgPool,
    build_id: &str,
    since: i64,
) -> Result<Vec<BuildLog>, sqlx::Error> {
    sqlx::query_as::<_, BuildLog>(
        "SELECT * FROM build_logs WHERE build_id = $1 AND id > $2 ORDER BY id ASC",
    )
    .bind(build_id)
    .bind(since)
    .fetch_all(pool)
    .await
}
