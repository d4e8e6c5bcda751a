//! Resolves one of three principals from request headers, in a fixed
//! precedence order, with constant-time comparisons that run even when
//! the referenced record doesn't exist (no existence oracle).

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub const ADMIN_KEY_HEADER: &str = "x-api-key";
pub const WORKER_ID_HEADER: &str = "x-worker-id";
pub const BUILD_TOKEN_HEADER: &str = "x-build-token";

#[derive(Debug, Clone)]
pub enum Principal {
    Admin,
    Build { build_id: String },
    Worker { worker_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials were presented")]
    MissingCredentials,
    #[error("credentials did not match any known principal")]
    InvalidCredentials,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Generates an opaque, URL-safe, base64-encoded secret from `len`
/// bytes of CSPRNG output. Used for build access tokens and worker
/// session tokens alike.
pub fn generate_token(len: usize) -> String {
    use base64::Engine;
    let mut bytes = vec![0u8; len];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time comparison of two ASCII/UTF-8 strings. Always compares
/// up to the longer length so timing doesn't leak the shorter one.
pub fn secure_compare(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        // Still perform a bounded-time comparison against a same-length
        // buffer so callers that branch on our return value don't leak
        // length via an early return.
        let filler = vec![0u8; a.len()];
        let _ = a.ct_eq(&filler);
        return false;
    }
    a.ct_eq(b).into()
}

/// Resolves the caller's principal from request headers, in precedence
/// order: admin, then build-token, then worker-session.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, AuthError> {
    let admin_key = headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok());
    let build_token = headers
        .get(BUILD_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let worker_id = headers.get(WORKER_ID_HEADER).and_then(|v| v.to_str().ok());
    let worker_token = headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.0.token().to_string());

    let any_presented = admin_key.is_some() || build_token.is_some() || worker_id.is_some();

    if let Some(key) = admin_key {
        if secure_compare(key, &state.config.api_key) {
            return Ok(Principal::Admin);
        }
    }

    if let Some(token) = build_token {
        // We don't know which build this token claims until a handler
        // looks it up by id; the header alone only proves *a* token was
        // presented. Handlers that need build-scoped access re-check the
        // token against the specific build id in the path with
        // `authorize_build`. Here we only validate that *some* build
        // owns this token, to produce a 403 rather than 401 when a
        // well-formed but wrong token is presented.
        if let Some(build_id) = find_build_owning_token(state, token).await? {
            return Ok(Principal::Build { build_id });
        }
    }

    if let (Some(worker_id), Some(token)) = (worker_id, worker_token.as_deref()) {
        if let Some(worker) = state.store.get_worker(worker_id).await? {
            let matches = secure_compare(token, &worker.access_token);
            let unexpired = worker.access_token_expires_at > chrono::Utc::now();
            if matches && unexpired {
                return Ok(Principal::Worker {
                    worker_id: worker_id.to_string(),
                });
            }
        } else {
            // Still run a comparison against a dummy value so a
            // nonexistent worker id takes the same time as a real one.
            let _ = secure_compare(token, "0".repeat(43).as_str());
        }
    }

    if any_presented {
        Err(AuthError::InvalidCredentials)
    } else {
        Err(AuthError::MissingCredentials)
    }
}

async fn find_build_owning_token(
    state: &AppState,
    token: &str,
) -> Result<Option<String>, sqlx::Error> {
    // Token lookup still goes through the index on `access_token` but the
    // match itself is constant-time; a non-matching row costs the same
    // as a matching one from the caller's perspective.
    let candidate = sqlx::query_as::<_, (String, String)>(
        "SELECT id, access_token FROM builds WHERE access_token = $1",
    )
    .bind(token)
    .fetch_optional(state.store.pool())
    .await?;

    Ok(match candidate {
        Some((id, stored_token)) if secure_compare(token, &stored_token) => Some(id),
        _ => None,
    })
}

/// Asserts that `principal` may act on `build_id` for the build-scoped
/// endpoints (status/logs/download/cancel: admin or the matching
/// build-token; heartbeat/result/fail: the assigned worker).
pub fn authorize_build(principal: &Principal, build_id: &str) -> Result<(), AuthError> {
    match principal {
        Principal::Admin => Ok(()),
        Principal::Build { build_id: owned } if owned == build_id => Ok(()),
        _ => Err(AuthError::InvalidCredentials),
    }
}

pub fn authorize_worker_build(
    principal: &Principal,
    expected_worker_id: &str,
) -> Result<(), AuthError> {
    match principal {
        Principal::Worker { worker_id } if worker_id == expected_worker_id => Ok(()),
        Principal::Admin => Ok(()),
        _ => Err(AuthError::InvalidCredentials),
    }
}

/// Axum middleware stashing the resolved `Principal` as a request
/// extension, for handlers that only need "some authenticated caller"
/// before doing their own finer-grained check.
pub async fn require_authenticated(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut req: Request,
    next: Next,
) -> Response {
    match authenticate(&state, &headers).await {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(AuthError::MissingCredentials) => {
            (StatusCode::UNAUTHORIZED, "missing credentials").into_response()
        }
        Err(_) => (StatusCode::FORBIDDEN, "invalid credentials").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_compare_matches_equal_strings() {
        assert!(secure_compare("abc123", "abc123"));
    }

    #[test]
    fn secure_compare_rejects_different_strings() {
        assert!(!secure_compare("abc123", "abc124"));
    }

    #[test]
    fn secure_compare_rejects_different_lengths() {
        assert!(!secure_compare("abc", "abcd"));
    }

    #[test]
    fn authorize_build_allows_admin_for_any_build() {
        assert!(authorize_build(&Principal::Admin, "b1").is_ok());
    }

    #[test]
    fn authorize_build_rejects_mismatched_build_token() {
        let principal = Principal::Build {
            build_id: "b1".to_string(),
        };
        assert!(authorize_build(&principal, "b2").is_err());
    }
}
