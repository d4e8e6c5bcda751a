//! `/api/workers/*`: registration, polling (the entry point into C4/C5),
//! result upload, and failure reporting.

use axum::extract::{Multipart, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKind;
use crate::auth::{authorize_worker_build, generate_token, Principal};
use crate::domain::{BuildStatus, LogLevel, WorkerStatus};
use crate::error::{ApiError, ErrorKind};
use crate::queue::DequeueOutcome;
use crate::state::AppState;
use crate::store::{BuildPatch, NewLog, WorkerPatch};

use super::builds::{stream_field_to_artifact, BuildStatusResponse};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub name: String,
    #[serde(default = "default_capabilities")]
    pub capabilities: serde_json::Value,
}

fn default_capabilities() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub worker_id: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
}

/// `POST /api/workers/register` — admin only. Create-or-refresh: a
/// worker re-registering with the same id gets a fresh token rather
/// than a duplicate row.
pub async fn register(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    require_admin(&principal)?;

    if req.id.is_empty() {
        return Err(ApiError::bad_request("worker id must not be empty"));
    }

    let token = generate_token(32);
    let worker = state
        .store
        .insert_or_refresh_worker(
            &req.id,
            &req.name,
            req.capabilities,
            &token,
            state.config.worker_token_ttl(),
        )
        .await?;

    Ok(Json(RegisterResponse {
        worker_id: worker.id,
        access_token: token,
        access_token_expires_at: worker.access_token_expires_at,
    }))
}

#[derive(Serialize)]
pub struct PollResponse {
    pub job: Option<JobPayload>,
    /// Present only when this poll rotated the worker's session token
    /// (remaining TTL was under 30s). The worker must adopt it for all
    /// subsequent requests — `register` is admin-only, so a worker that
    /// missed a rotated token has no other way back to a valid session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_token: Option<RotatedToken>,
}

#[derive(Serialize)]
pub struct RotatedToken {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct JobPayload {
    pub id: String,
    pub platform: crate::domain::Platform,
    pub source_url: String,
    pub certs_url: Option<String>,
}

/// `GET /api/workers/poll` — the worker-session-authenticated entry
/// point into the Queue Manager / Assignment Service. Also rotates the
/// worker's own token and refreshes `last_seen_at`, since a poll is
/// itself a liveness signal.
pub async fn poll(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let worker_id = require_worker(&principal)?;

    let rotated_token = refresh_worker_liveness(&state, worker_id).await?;

    match state.queue.dequeue_for_worker(&state.assignment, worker_id).await {
        DequeueOutcome::Assigned(build) => Ok(Json(PollResponse {
            job: Some(JobPayload {
                id: build.id.clone(),
                platform: build.platform,
                source_url: format!("/api/builds/{}/source", build.id),
                certs_url: build
                    .certs_path
                    .as_ref()
                    .map(|_| format!("/api/builds/{}/certs", build.id)),
            }),
            rotated_token,
        })),
        DequeueOutcome::Empty => Ok(Json(PollResponse {
            job: None,
            rotated_token,
        })),
        DequeueOutcome::Transient(err) => Err(err.into()),
        DequeueOutcome::Failed(err) => Err(err.into()),
    }
}

/// Rotates the worker's token only when the remaining TTL is under 30s;
/// otherwise just touches `last_seen_at` so check-ins don't churn the
/// token on every poll. Returns the new token when rotation happened, so
/// the caller can surface it to the worker.
async fn refresh_worker_liveness(
    state: &AppState,
    worker_id: &str,
) -> Result<Option<RotatedToken>, ApiError> {
    let worker = state
        .store
        .get_worker(worker_id)
        .await?
        .ok_or_else(|| ApiError::not_found("worker not registered"))?;

    let now = Utc::now();
    let remaining = worker.access_token_expires_at - now;
    let mut patch = WorkerPatch::default().touch(now);
    let mut rotated = None;

    if remaining < chrono::Duration::seconds(30) {
        let token = generate_token(32);
        let expires_at = now
            + chrono::Duration::from_std(state.config.worker_token_ttl()).unwrap_or_default();
        patch = patch.rotate_token(token.clone(), expires_at);
        rotated = Some(RotatedToken {
            access_token: token,
            access_token_expires_at: expires_at,
        });
    }

    state
        .store
        .update_worker(state.store.pool(), worker_id, patch)
        .await?;
    Ok(rotated)
}

#[derive(Serialize)]
pub struct ResultAck {
    pub id: String,
    pub status: BuildStatus,
}

/// `POST /api/workers/result` — multipart upload of the finished
/// artifact. Streams into Artifact Storage, then transitions the build
/// to `completed` and the worker back to `idle`.
pub async fn result(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    mut multipart: Multipart,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let worker_id = require_worker(&principal)?;

    let build = state
        .store
        .find_active_build_for_worker(worker_id)
        .await?
        .ok_or_else(|| ApiError::conflict("worker has no build in progress"))?;
    authorize_worker_build(&principal, worker_id)?;

    let mut result_path: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        if field.name() == Some("result") {
            let path = stream_field_to_artifact(
                field,
                state.artifacts.as_ref(),
                ArtifactKind::Result,
                &build.id,
                build.platform,
                state.config.max_result_size,
            )
            .await?;
            result_path = Some(path);
        }
    }

    let result_path =
        result_path.ok_or_else(|| ApiError::bad_request("missing result field"))?;

    let updated = state
        .store
        .update_build_on_pool(
            &build.id,
            BuildPatch::default()
                .status(BuildStatus::Completed)
                .result_path(Some(result_path)),
        )
        .await?;

    state
        .store
        .update_worker(
            state.store.pool(),
            worker_id,
            WorkerPatch::default()
                .status(WorkerStatus::Idle)
                .touch(Utc::now())
                .completed(),
        )
        .await?;

    let log_entry = [NewLog {
        level: LogLevel::Info,
        message: format!("worker {worker_id} uploaded result, build completed"),
    }];
    if let Err(err) = state.store.append_logs(&updated.id, &log_entry).await {
        tracing::warn!(build_id = %updated.id, error = ?err, "failed to append completion log");
    }

    Ok(Json(ResultAck {
        id: updated.id,
        status: updated.status,
    }))
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub error_message: String,
}

/// `POST /api/workers/fail` — the worker reports it could not complete
/// its assigned build.
pub async fn fail(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<FailRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let worker_id = require_worker(&principal)?;

    let build = state
        .store
        .find_active_build_for_worker(worker_id)
        .await?
        .ok_or_else(|| ApiError::conflict("worker has no build in progress"))?;
    authorize_worker_build(&principal, worker_id)?;

    let updated = state
        .store
        .update_build_on_pool(
            &build.id,
            BuildPatch::default()
                .status(BuildStatus::Failed)
                .error_message(Some(req.error_message.clone())),
        )
        .await?;

    state
        .store
        .update_worker(
            state.store.pool(),
            worker_id,
            WorkerPatch::default()
                .status(WorkerStatus::Idle)
                .touch(Utc::now())
                .failed(),
        )
        .await?;

    let log_entry = [NewLog {
        level: LogLevel::Error,
        message: format!("worker {worker_id} reported failure: {}", req.error_message),
    }];
    if let Err(err) = state.store.append_logs(&updated.id, &log_entry).await {
        tracing::warn!(build_id = %updated.id, error = ?err, "failed to append failure log");
    }

    Ok(Json(BuildStatusResponse::from(updated)))
}

fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    match principal {
        Principal::Admin => Ok(()),
        _ => Err(ApiError::forbidden("admin access required")),
    }
}

fn require_worker(principal: &Principal) -> Result<&str, ApiError> {
    match principal {
        Principal::Worker { worker_id } => Ok(worker_id.as_str()),
        Principal::Admin => Err(ApiError::new(
            axum::http::StatusCode::FORBIDDEN,
            ErrorKind::Forbidden,
            anyhow::anyhow!("worker endpoints require a worker session, not an admin key"),
        )),
        _ => Err(ApiError::forbidden("worker session required")),
    }
}
