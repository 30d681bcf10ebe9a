//! 图片代理：先查磁盘缓存，未命中时通过抓取器下载并回填缓存。

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ApiError, ApiResult};
use crate::download::fetcher::FetchError;
use crate::download::paths::detect_extension;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct ProxyQuery {
    pub(crate) url: String,
    #[serde(default)]
    pub(crate) source: Option<String>,
}

fn image_response(bytes: Vec<u8>, content_type: String, cache_state: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
            (header::HeaderName::from_static("x-cache"), cache_state.to_string()),
        ],
        Body::from(bytes),
    )
        .into_response()
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("cache task failed: {e}"))
}

pub(crate) async fn proxy_image(
    State(state): State<AppState>,
    Query(q): Query<ProxyQuery>,
) -> ApiResult<Response> {
    let url = q.url.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    let source = q
        .source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let (ttl_hours, max_bytes) = {
        let cfg = state.config();
        (cfg.effective_cache_ttl_hours(), cfg.cache_max_bytes)
    };

    if ttl_hours > 0 {
        let cache = state.cache.clone();
        let (u, s) = (url.clone(), source.clone());
        let hit = tokio::task::spawn_blocking(move || cache.get(&u, s.as_deref(), ttl_hours))
            .await
            .map_err(join_error)?;
        if let Some(hit) = hit {
            debug!(target: "cache", url = %url, "proxy cache hit");
            return Ok(image_response(hit.content, hit.content_type, "HIT"));
        }
    }

    let asset = state
        .fetcher
        .fetch(&url, source.as_deref())
        .await
        .map_err(|e| {
            warn!(target: "web", url = %url, upstream_status = ?e.status(), error = %e, "proxy fetch failed");
            match e {
                FetchError::InvalidUrl { .. } => ApiError::bad_request(e.to_string()),
                other => ApiError::new(StatusCode::BAD_GATEWAY, other.to_string()),
            }
        })?;

    let content_type = asset
        .content_type
        .clone()
        .filter(|c| c.starts_with("image/"))
        .unwrap_or_else(|| mime_for_ext(detect_extension(&url, None)).to_string());

    if ttl_hours > 0 {
        let cache = state.cache.clone();
        let bytes = asset.bytes.clone();
        let ct = content_type.clone();
        let (u, s) = (url.clone(), source.clone());
        tokio::task::spawn_blocking(move || {
            cache.put(&u, s.as_deref(), &bytes, Some(&ct), max_bytes, ttl_hours)
        })
        .await
        .map_err(join_error)?;
    }

    Ok(image_response(asset.bytes, content_type, "MISS"))
}

fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}
