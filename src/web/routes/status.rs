use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use super::ApiResult;
use crate::web::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) async fn api_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for job in state.store.list()? {
        *by_status.entry(job.status.as_str()).or_default() += 1;
    }
    let save_dir = state.config().default_save_dir();
    Ok(Json(json!({
        "version": VERSION,
        "bind_addr": state.bind.to_string(),
        "data_dir": state.data_dir.to_string_lossy(),
        "save_dir": save_dir.to_string_lossy(),
        "sources": state.scrapers.keys(),
        "running": state.manager.active_jobs(),
        "jobs": by_status,
    })))
}
