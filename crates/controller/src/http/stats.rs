//! `GET /api/stats`: a per-process cache with a short TTL so a public,
//! unauthenticated, frequently-polled endpoint doesn't put read load on
//! the Store proportional to dashboard traffic.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use tokio::sync::Mutex;

use crate::domain::Stats;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/stats` — public, unauthenticated.
pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let stats = state
        .stats_cache
        .get_or_refresh(|| async move { store.stats().await })
        .await?;
    Ok(Json(stats))
}

const TTL: Duration = Duration::from_secs(10);

pub struct StatsCache {
    inner: Mutex<Option<(Instant, Stats)>>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Returns the cached value if still fresh, otherwise computes a new
    /// one via `fetch` and caches it.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<Stats, sqlx::Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Stats, sqlx::Error>>,
    {
        let mut guard = self.inner.lock().await;
        if let Some((at, stats)) = &*guard {
            if at.elapsed() < TTL {
                return Ok(stats.clone());
            }
        }
        let stats = fetch().await?;
        *guard = Some((Instant::now(), stats.clone()));
        Ok(stats)
    }
}

impl Default for StatsCache {
    fn default() -> Self {
        Self::new()
    }
}
