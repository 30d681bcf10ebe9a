use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum::middleware::{Next, from_fn};
use axum::response::Response;
use axum::routing::{get, post};
use tracing::info;

use super::routes;
use super::state::AppState;

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(routes::status::api_status))
        .route("/api/downloads", get(routes::downloads::list_downloads))
        .route(
            "/api/downloads/queue",
            post(routes::downloads::queue_download),
        )
        .route(
            "/api/downloads/:id",
            axum::routing::delete(routes::downloads::delete_download),
        )
        .route(
            "/api/downloads/:id/pause",
            post(routes::downloads::pause_download),
        )
        .route(
            "/api/downloads/:id/resume",
            post(routes::downloads::resume_download),
        )
        .route(
            "/api/downloads/:id/cancel",
            post(routes::downloads::cancel_download),
        )
        .route("/api/search", get(routes::sources::api_search))
        .route("/api/chapters", get(routes::sources::api_chapters))
        .route("/api/library", get(routes::sources::api_library))
        .route("/api/proxy", get(routes::proxy::proxy_image))
        .route(
            "/api/settings",
            get(routes::settings::get_settings).post(routes::settings::set_settings),
        )
        .route(
            "/api/cache",
            get(routes::cache::cache_stats).delete(routes::cache::clear_cache),
        )
        .layer(from_fn(access_log_mw))
        .with_state(state)
}

async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().to_string();
    let ip = req
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let resp = next.run(req).await;
    info!(target: "web", ip = %ip, method = %method, path = %path, status = %resp.status().as_u16(), "request");
    resp
}
