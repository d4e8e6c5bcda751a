//! C7: the axum HTTP surface assembling every submit/poll/heartbeat/
//! upload/download endpoint over the C1–C6 components.

pub mod builds;
pub mod stats;
pub mod workers;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::require_authenticated;
use crate::state::AppState;

/// The concurrency cap on in-flight requests: many concurrent pollers,
/// each of which may block briefly on a Store row lock.
const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Assembles the full `/api` surface. Every route other than
/// `GET /api/stats` runs behind `require_authenticated`, which resolves
/// one of the three principals and stashes it as a request extension;
/// handlers then apply their own finer-grained authorization check
/// (admin-only, build-owner, or worker-owner).
pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/builds/submit", post(builds::submit))
        .route("/builds/:id/status", get(builds::status))
        .route("/builds/:id/logs", get(builds::logs))
        .route("/builds/:id/download", get(builds::download))
        .route("/builds/:id/cancel", post(builds::cancel))
        .route("/builds/:id/heartbeat", post(builds::heartbeat))
        .route("/builds/:id/:kind", get(builds::download_input))
        .route("/workers/register", post(workers::register))
        .route("/workers/poll", get(workers::poll))
        .route("/workers/result", post(workers::result))
        .route("/workers/fail", post(workers::fail))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_authenticated,
        ));

    let public = Router::new().route("/stats", get(stats::stats));

    Router::new()
        .nest("/api", authenticated.merge(public))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .with_state(state)
}
