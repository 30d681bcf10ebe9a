use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

use super::{ApiError, ApiResult};
use crate::base_system::config::save_with_base;
use crate::base_system::context::Config;
use crate::web::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SettingsView {
    pub(crate) save_path: String,
    pub(crate) effective_save_dir: String,
    pub(crate) max_concurrent_downloads: usize,
    pub(crate) cache_enabled: bool,
    pub(crate) cache_max_bytes: u64,
    pub(crate) cache_ttl_hours: u64,
    pub(crate) request_timeout: u64,
    pub(crate) max_retries: u32,
}

impl From<&Config> for SettingsView {
    fn from(cfg: &Config) -> Self {
        Self {
            save_path: cfg.save_path.clone(),
            effective_save_dir: cfg.default_save_dir().to_string_lossy().to_string(),
            max_concurrent_downloads: cfg.max_concurrent_downloads,
            cache_enabled: cfg.cache_enabled,
            cache_max_bytes: cfg.cache_max_bytes,
            cache_ttl_hours: cfg.cache_ttl_hours,
            request_timeout: cfg.request_timeout,
            max_retries: cfg.max_retries,
        }
    }
}

pub(crate) async fn get_settings(State(state): State<AppState>) -> Json<SettingsView> {
    Json(SettingsView::from(&*state.config()))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SettingsPatch {
    pub(crate) save_path: Option<String>,
    pub(crate) max_concurrent_downloads: Option<usize>,
    pub(crate) cache_enabled: Option<bool>,
    pub(crate) cache_max_bytes: Option<u64>,
    pub(crate) cache_ttl_hours: Option<u64>,
}

fn apply_patch(cfg: &mut Config, patch: SettingsPatch) -> Result<bool, ApiError> {
    let mut restart_required = false;
    if let Some(v) = patch.save_path {
        cfg.save_path = v.trim().to_string();
    }
    if let Some(v) = patch.max_concurrent_downloads {
        if v == 0 {
            return Err(ApiError::bad_request("max_concurrent_downloads must be >= 1"));
        }
        // 并发上限在启动时确定
        restart_required = v != cfg.max_concurrent_downloads;
        cfg.max_concurrent_downloads = v;
    }
    if let Some(v) = patch.cache_enabled {
        cfg.cache_enabled = v;
    }
    if let Some(v) = patch.cache_max_bytes {
        cfg.cache_max_bytes = v;
    }
    if let Some(v) = patch.cache_ttl_hours {
        cfg.cache_ttl_hours = v;
    }
    Ok(restart_required)
}

pub(crate) async fn set_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<Value>> {
    let (old_cfg, new_cfg, restart_required) = {
        let mut g = state.config();
        let old = g.clone();
        let restart_required = apply_patch(&mut g, patch)?;
        (old, g.clone(), restart_required)
    };

    if let Err(e) = save_with_base(&new_cfg, Some(state.data_dir.as_path())) {
        // revert memory changes if persistence fails
        *state.config() = old_cfg;
        error!(target: "web", error = %e, "failed to persist config.yml");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("save settings failed: {e}"),
        ));
    }
    info!(target: "web", restart_required, "settings updated");

    // 缓存上限收紧后立即淘汰
    if new_cfg.cache_max_bytes < old_cfg.cache_max_bytes
        || new_cfg.effective_cache_ttl_hours() < old_cfg.effective_cache_ttl_hours()
    {
        let cache = state.cache.clone();
        let (max_bytes, ttl) = (new_cfg.cache_max_bytes, new_cfg.effective_cache_ttl_hours());
        tokio::task::spawn_blocking(move || {
            let report = cache.evict(max_bytes, ttl);
            tracing::debug!(target: "cache", removed = report.removed, remaining = report.remaining_bytes, "evicted after settings change");
        });
    }

    Ok(Json(json!({
        "ok": true,
        "restart_required": restart_required,
        "settings": SettingsView::from(&new_cfg),
    })))
}
