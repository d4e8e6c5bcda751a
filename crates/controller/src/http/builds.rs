use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactKind, ByteStream};
use crate::auth::{authorize_build, authorize_worker_build, Principal};
use crate::domain::{Build, BuildStatus, Platform};
use crate::error::ApiError;
use crate::store::BuildPatch;
use crate::state::AppState;

#[derive(Deserialize)]
struct SubmitMeta {
    platform: Platform,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: String,
    access_token: String,
}

#[derive(Serialize)]
pub struct BuildStatusResponse {
    pub id: String,
    pub platform: Platform,
    pub status: BuildStatus,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl From<Build> for BuildStatusResponse {
    fn from(b: Build) -> Self {
        Self {
            id: b.id,
            platform: b.platform,
            status: b.status,
            worker_id: b.worker_id,
            error_message: b.error_message,
            submitted_at: b.submitted_at,
            updated_at: b.updated_at,
            last_heartbeat_at: b.last_heartbeat_at,
        }
    }
}

/// Drains a multipart field chunk-by-chunk into the Artifact Storage
/// trait's `'static` byte stream, without buffering the whole field.
/// The field borrows from the `Multipart` extractor, so its chunks are
/// forwarded over an owned channel rather than boxed as a stream
/// directly — `put_stream`'s consumer and this field's producer are
/// driven concurrently in the same scope via `tokio::join!`, so neither
/// side needs to be spawned onto the runtime.
pub(crate) async fn stream_field_to_artifact(
    mut field: axum::extract::multipart::Field<'_>,
    artifacts: &dyn crate::artifact::ArtifactStore,
    kind: ArtifactKind,
    build_id: &str,
    platform: Platform,
    limit: u64,
) -> Result<String, ApiError> {
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(8);

    let produce = async move {
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let io_err = std::io::Error::new(std::io::ErrorKind::Other, err.to_string());
                    let _ = tx.send(Err(io_err)).await;
                    break;
                }
            }
        }
    };

    let stream: ByteStream = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    let (_, result) = tokio::join!(
        produce,
        artifacts.put_stream(kind, build_id, platform, limit, stream)
    );

    Ok(result?)
}

/// `POST /api/builds/submit` — admin only.
pub async fn submit(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&principal)?;

    let id = uuid::Uuid::new_v4().to_string();
    let mut platform: Option<Platform> = None;
    let mut source_path: Option<String> = None;
    let mut certs_path: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "meta" => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(err.to_string()))?;
                let meta: SubmitMeta = serde_json::from_str(&text)
                    .map_err(|err| ApiError::bad_request(format!("invalid meta: {err}")))?;
                platform = Some(meta.platform);
            }
            "source" => {
                let path = stream_field_to_artifact(
                    field,
                    state.artifacts.as_ref(),
                    ArtifactKind::Source,
                    &id,
                    Platform::Ios,
                    state.config.max_source_size,
                )
                .await?;
                source_path = Some(path);
            }
            "certs" => {
                let path = stream_field_to_artifact(
                    field,
                    state.artifacts.as_ref(),
                    ArtifactKind::Certs,
                    &id,
                    Platform::Ios,
                    state.config.max_certs_size,
                )
                .await?;
                certs_path = Some(path);
            }
            _ => {}
        }
    }

    let platform = platform.ok_or_else(|| ApiError::bad_request("missing meta.platform"))?;
    let source_path = source_path.ok_or_else(|| ApiError::bad_request("missing source field"))?;
    let access_token = crate::auth::generate_token(32);

    let build = state
        .store
        .insert_build(crate::store::NewBuild {
            id: id.clone(),
            platform,
            source_path,
            certs_path,
            access_token: access_token.clone(),
        })
        .await?;

    state.queue.enqueue(build.id.clone()).await;

    Ok(Json(SubmitResponse {
        id: build.id,
        access_token,
    }))
}

async fn load_authorized_build(
    state: &AppState,
    principal: &Principal,
    build_id: &str,
) -> Result<Build, ApiError> {
    let build = state
        .store
        .get_build(build_id)
        .await?
        .ok_or_else(|| ApiError::not_found("build not found"))?;
    authorize_build(principal, build_id)?;
    Ok(build)
}

/// `GET /api/builds/:id/status` — admin or the build's own token.
pub async fn status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = load_authorized_build(&state, &principal, &id).await?;
    Ok(Json(BuildStatusResponse::from(build)))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    since: i64,
}

/// `GET /api/builds/:id/logs?since=<seq>` — admin or the build's own token.
pub async fn logs(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    load_authorized_build(&state, &principal, &id).await?;
    let entries = state.store.list_logs(&id, query.since).await?;
    Ok(Json(entries))
}

/// `GET /api/builds/:id/download` — admin or the build's own token;
/// `409` unless the build is `completed`.
pub async fn download(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = load_authorized_build(&state, &principal, &id).await?;
    if build.status != BuildStatus::Completed {
        return Err(ApiError::conflict("build is not completed"));
    }
    let result_path = build
        .result_path
        .ok_or_else(|| ApiError::conflict("build has no result artifact"))?;

    let file = state.artifacts.open_stream(&result_path).await?;
    let stream = tokio_util::io::ReaderStream::new(file);
    Ok(Body::from_stream(stream))
}

/// `POST /api/builds/:id/cancel` — admin or the build's own token;
/// idempotent on an already-terminal build.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = load_authorized_build(&state, &principal, &id).await?;

    if build.status.is_terminal() {
        return Ok(Json(BuildStatusResponse::from(build)));
    }

    let updated = state
        .store
        .update_build_on_pool(&id, BuildPatch::default().status(BuildStatus::Cancelled))
        .await?;

    let artifacts = state.artifacts.clone();
    let build_id = id.clone();
    tokio::spawn(async move { artifacts.delete_build_files(&build_id).await });

    Ok(Json(BuildStatusResponse::from(updated)))
}

/// `POST /api/builds/:id/heartbeat` — the worker currently assigned to
/// this build.
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .store
        .get_build(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("build not found"))?;

    let worker_id = build
        .worker_id
        .as_deref()
        .ok_or_else(|| ApiError::conflict("build has no assigned worker"))?;
    authorize_worker_build(&principal, worker_id)?;

    let mut patch = BuildPatch::default().touch_heartbeat(Utc::now());
    if build.status == BuildStatus::Assigned {
        patch = patch.status(BuildStatus::Building);
    }

    let updated = state.store.update_build_on_pool(&id, patch).await?;
    Ok(Json(BuildStatusResponse::from(updated)))
}

/// `GET /api/builds/:id/source` and `/certs` — streams the uploaded
/// input artifacts down to the assigned worker. Not part of the
/// original endpoint table's explicit list, but required for the
/// worker-streams-source-down leg of the submit-to-result flow;
/// authorized the same way as the other build-scoped endpoints, plus
/// the worker currently assigned to the build.
pub async fn download_input(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .store
        .get_build(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("build not found"))?;

    if authorize_build(&principal, &id).is_err() {
        let worker_id = build
            .worker_id
            .as_deref()
            .ok_or_else(|| ApiError::not_found("no input artifact for this build"))?;
        authorize_worker_build(&principal, worker_id)?;
    }

    let path = match kind.as_str() {
        "source" => build
            .source_path
            .ok_or_else(|| ApiError::not_found("no source artifact"))?,
        "certs" => build
            .certs_path
            .ok_or_else(|| ApiError::not_found("no certs artifact"))?,
        _ => return Err(ApiError::not_found("unknown artifact kind")),
    };

    let file = state.artifacts.open_stream(&path).await?;
    let stream = tokio_util::io::ReaderStream::new(file);
    Ok(Body::from_stream(stream))
}

fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    match principal {
        Principal::Admin => Ok(()),
        _ => Err(ApiError::forbidden("admin access required")),
    }
}
