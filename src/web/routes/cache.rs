use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};
use tracing::info;

use super::{ApiError, ApiResult};
use crate::web::state::AppState;

pub(crate) async fn cache_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cache = state.cache.clone();
    let stats = tokio::task::spawn_blocking(move || cache.stats())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let cfg = state.config_snapshot();
    Ok(Json(json!({
        "entries": stats.entries,
        "total_bytes": stats.total_bytes,
        "max_bytes": cfg.cache_max_bytes,
        "ttl_hours": cfg.cache_ttl_hours,
        "enabled": cfg.cache_enabled,
        "dir": state.cache.dir().to_string_lossy(),
    })))
}

pub(crate) async fn clear_cache(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cache = state.cache.clone();
    let removed = tokio::task::spawn_blocking(move || cache.clear())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    info!(target: "cache", removed, "image cache cleared");
    Ok(Json(json!({ "ok": true, "removed": removed })))
}
