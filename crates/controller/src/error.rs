//! Wire-level error type shared by every HTTP handler: a status code
//! paired with an `anyhow::Error`, with `From` impls doing the
//! categorization so handlers can just use `?`.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::artifact::ArtifactError;
use crate::assignment::AssignError;
use crate::auth::AuthError;

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {source}")]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    #[source]
    pub source: anyhow::Error,
}

/// The wire-level error kinds, independent of HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    WorkerBusy,
    WorkerOffline,
    Timeout,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::WorkerBusy => "worker_busy",
            ErrorKind::WorkerOffline => "worker_offline",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, source: anyhow::Error) -> Self {
        Self {
            status,
            kind,
            source,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::BadRequest,
            anyhow::anyhow!(msg.into()),
        )
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorKind::Unauthenticated,
            anyhow::anyhow!(msg.into()),
        )
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            ErrorKind::Forbidden,
            anyhow::anyhow!(msg.into()),
        )
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorKind::NotFound,
            anyhow::anyhow!(msg.into()),
        )
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            anyhow::anyhow!(msg.into()),
        )
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::BadRequest,
            anyhow::anyhow!(msg.into()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, kind = %self.kind, error = ?self.source, "request failed");
        }
        let body = Json(ErrorBody {
            error: format!("{:#}", self.source),
        });
        (self.status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = ?err, "database error");
        match err {
            sqlx::Error::RowNotFound => ApiError::not_found("not found"),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Internal,
                anyhow::Error::new(other),
            ),
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::SizeExceeded { limit } => ApiError::payload_too_large(format!(
                "artifact exceeded the {limit}-byte size limit"
            )),
            ArtifactError::NotFound => ApiError::not_found("artifact not found"),
            ArtifactError::InvalidPath => {
                ApiError::bad_request("artifact path escapes storage root")
            }
            ArtifactError::Io(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Internal,
                anyhow::Error::new(err),
            ),
        }
    }
}

impl From<AssignError> for ApiError {
    fn from(err: AssignError) -> Self {
        match err {
            AssignError::WorkerNotFound => {
                ApiError::not_found("worker not registered")
            }
            AssignError::WorkerBusy => ApiError::new(
                StatusCode::CONFLICT,
                ErrorKind::WorkerBusy,
                anyhow::anyhow!("worker is already building"),
            ),
            AssignError::WorkerOffline => ApiError::new(
                StatusCode::CONFLICT,
                ErrorKind::WorkerOffline,
                anyhow::anyhow!("worker is offline"),
            ),
            AssignError::BuildNotPending(id) => ApiError::new(
                StatusCode::CONFLICT,
                ErrorKind::Conflict,
                anyhow::anyhow!("build {id} is no longer pending"),
            ),
            AssignError::Db(err) => err.into(),
            AssignError::Timeout => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Timeout,
                anyhow::anyhow!("assignment transaction timed out"),
            ),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials => {
                ApiError::unauthenticated("missing credentials")
            }
            AuthError::InvalidCredentials => ApiError::forbidden("invalid credentials"),
            AuthError::Db(err) => err.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal, err)
    }
}
