//! Cache administration routes.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::server::AppState;
use crate::cache::CacheStats;

/// POST /api/cache/flush: drop every cached query result.
pub async fn flush_cache(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.pipeline.flush_cache();
    Json(json!({ "status": "ok" }))
}

/// GET /api/cache/stats
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.pipeline.cache_stats())
}
