//! 来源浏览：搜索、章节列表、作品目录。

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use super::{ApiError, ApiResult};
use crate::source::Scraper;
use crate::web::state::AppState;

fn scraper_for(state: &AppState, source: &str) -> ApiResult<Arc<dyn Scraper>> {
    state
        .scrapers
        .get(source)
        .ok_or_else(|| ApiError::bad_request(format!("unknown source: {}", source.trim())))
}

fn upstream_error(err: anyhow::Error) -> ApiError {
    warn!(target: "web", error = %format!("{err:#}"), "source request failed");
    ApiError::new(StatusCode::BAD_GATEWAY, format!("{err:#}"))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchQuery {
    pub(crate) source: String,
    #[serde(default)]
    pub(crate) q: String,
    #[serde(default = "first_page")]
    pub(crate) page: u32,
}

fn first_page() -> u32 {
    1
}

pub(crate) async fn api_search(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let scraper = scraper_for(&state, &q.source)?;
    let items = scraper
        .search(q.q.trim(), q.page.max(1))
        .await
        .map_err(upstream_error)?;
    Ok(Json(json!({ "items": items, "page": q.page.max(1) })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChaptersQuery {
    pub(crate) source: String,
    pub(crate) url: String,
}

pub(crate) async fn api_chapters(
    State(state): State<AppState>,
    Query(q): Query<ChaptersQuery>,
) -> ApiResult<Json<Value>> {
    if q.url.trim().is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    let scraper = scraper_for(&state, &q.source)?;
    let items = scraper
        .chapters(q.url.trim())
        .await
        .map_err(upstream_error)?;
    Ok(Json(json!({ "items": items })))
}

pub(crate) async fn api_library(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let items = state.catalog.contents()?;
    Ok(Json(json!({ "items": items })))
}
