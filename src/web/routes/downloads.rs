use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ApiError, ApiResult};
use crate::download::catalog::ChapterCatalog;
use crate::download::models::{JobId, NewJob};
use crate::web::state::AppState;

pub(crate) async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let items = state.store.list()?;
    let active = state.manager.active_jobs();
    Ok(Json(json!({ "items": items, "running": active })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueueReq {
    pub(crate) content_title: String,
    pub(crate) content_url: String,
    pub(crate) source: String,
    pub(crate) chapter_number: f64,
    pub(crate) chapter_url: String,
    #[serde(default)]
    pub(crate) chapter_title: Option<String>,
}

fn required<'a>(value: &'a str, name: &str) -> ApiResult<&'a str> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::bad_request(format!("{name} is required")));
    }
    Ok(v)
}

pub(crate) async fn queue_download(
    State(state): State<AppState>,
    Json(req): Json<QueueReq>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let content_title = required(&req.content_title, "content_title")?;
    let content_url = required(&req.content_url, "content_url")?;
    let source = required(&req.source, "source")?;
    let chapter_url = required(&req.chapter_url, "chapter_url")?;
    if !req.chapter_number.is_finite() || req.chapter_number < 0.0 {
        return Err(ApiError::bad_request("chapter_number must be a non-negative number"));
    }
    if state.scrapers.get(source).is_none() {
        return Err(ApiError::bad_request(format!("unknown source: {source}")));
    }

    let content_id = state
        .catalog
        .register_content(content_url, content_title, source)?;

    // 同一章节已有未结束的任务时直接返回
    let existing = state.store.list()?.into_iter().find(|j| {
        j.content_id == content_id
            && (j.chapter_number - req.chapter_number).abs() < 1e-9
            && j.status.is_active()
    });
    if let Some(job) = existing {
        return Ok((
            StatusCode::OK,
            Json(json!({ "job": job, "already_queued": true })),
        ));
    }

    let job = state.store.insert(NewJob {
        content_id,
        content_title: content_title.to_string(),
        chapter_number: req.chapter_number,
        chapter_title: req
            .chapter_title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        chapter_url: Some(chapter_url.to_string()),
        source: Some(source.to_string()),
    })?;
    info!(target: "web", job_id = job.id, content = %content_title, chapter = req.chapter_number, "download queued");
    state.manager.enqueue(job.id);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "job": job, "already_queued": false })),
    ))
}

pub(crate) async fn pause_download(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<Value>> {
    let job = state.manager.pause(id)?;
    Ok(Json(json!({ "job": job })))
}

pub(crate) async fn resume_download(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<Value>> {
    let job = state.manager.resume(id)?;
    Ok(Json(json!({ "job": job })))
}

pub(crate) async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<Value>> {
    let job = state.manager.cancel(id)?;
    Ok(Json(json!({ "job": job })))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeleteQuery {
    #[serde(default)]
    pub(crate) files: bool,
}

pub(crate) async fn delete_download(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(q): Query<DeleteQuery>,
) -> ApiResult<Json<Value>> {
    let job = state
        .store
        .get(id)?
        .ok_or_else(|| ApiError::not_found(format!("download {id} not found")))?;
    if job.status.is_active() || state.manager.is_active(id) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "cancel the download before deleting it",
        ));
    }

    let mut files_removed = false;
    if q.files
        && let Some(dir) = job.file_path.as_ref()
    {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => files_removed = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(target: "web", job_id = id, dir = %dir.display(), error = %e, "remove chapter files failed");
                return Err(ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("remove files failed: {e}"),
                ));
            }
        }
    }

    state.store.remove(id)?;
    info!(target: "web", job_id = id, files_removed, "download deleted");
    Ok(Json(json!({ "ok": true, "files_removed": files_removed })))
}
