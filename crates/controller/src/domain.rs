//! Closed, tagged-variant representations of the wire-facing enums in the
//! data model. Kept as plain Rust types so state-machine invariants are
//! checked by the compiler instead of at runtime string comparisons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Assigned,
    Building,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Building,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Source,
    Certs,
    Result,
}

impl ArtifactKind {
    /// File name the artifact is stored under within a build's directory.
    pub fn file_name(self, platform: Platform) -> &'static str {
        match (self, platform) {
            (ArtifactKind::Source, _) => "source.zip",
            (ArtifactKind::Certs, _) => "certs.zip",
            (ArtifactKind::Result, Platform::Ios) => "result.ipa",
            (ArtifactKind::Result, Platform::Android) => "result.apk",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Build {
    pub id: String,
    pub platform: Platform,
    pub status: BuildStatus,
    pub worker_id: Option<String>,
    pub source_path: Option<String>,
    pub certs_path: Option<String>,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
    pub access_token: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub capabilities: serde_json::Value,
    pub status: WorkerStatus,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub builds_completed: i64,
    pub builds_failed: i64,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct BuildLog {
    pub id: i64,
    pub build_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate snapshot returned by `GET /api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub nodes_online: i64,
    pub builds_queued: i64,
    pub active_builds: i64,
    pub builds_today: i64,
    pub total_builds: i64,
}
