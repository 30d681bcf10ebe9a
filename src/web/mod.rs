//! HTTP 接口（axum）：下载队列控制、图片代理、设置与缓存管理。

mod router;
mod routes;
mod state;

use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::base_system::context::Config;
use crate::source::ScraperRegistry;
use state::AppState;

/// 阻塞运行服务直到收到 Ctrl+C。
pub fn run(config: Config, bind_override: Option<&str>, scrapers: ScraperRegistry) -> Result<()> {
    let bind_raw = bind_override
        .map(str::to_string)
        .or_else(|| std::env::var("MANGA_DL_ADDR").ok())
        .unwrap_or_else(|| config.bind_addr.clone());
    let bind = parse_bind_addr(&bind_raw)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run_async(bind, config, scrapers))
}

fn parse_bind_addr(raw: &str) -> Result<SocketAddr> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(anyhow!("empty bind addr"));
    }

    // Standard formats:
    // - IPv4: 127.0.0.1:8765
    // - IPv6: [::1]:8765
    if let Ok(a) = s.parse::<SocketAddr>() {
        return Ok(a);
    }

    // Tolerate missing brackets for IPv6, e.g. "::1:8765".
    if !s.starts_with('[')
        && let Some((host, port)) = s.rsplit_once(':')
        && host.contains(':')
        && !port.is_empty()
        && port.chars().all(|c| c.is_ascii_digit())
        && let Ok(a) = format!("[{host}]:{port}").parse::<SocketAddr>()
    {
        return Ok(a);
    }

    // Bare port.
    if let Ok(port) = s.parse::<u16>() {
        return Ok(SocketAddr::from(([127, 0, 0, 1], port)));
    }

    Err(anyhow!(
        "invalid bind address: '{s}'. Use '127.0.0.1:8765' or '[::1]:8765' (IPv6 needs brackets)."
    ))
}

async fn run_async(bind: SocketAddr, config: Config, scrapers: ScraperRegistry) -> Result<()> {
    let state = AppState::open(config, bind, scrapers)?;

    match state.manager.recover() {
        Ok(0) => {}
        Ok(n) => info!(target: "startup", recovered = n, "re-queued unfinished downloads"),
        Err(e) => warn!(target: "startup", error = %e, "download recovery failed"),
    }
    state.manager.start();

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow!(e).context(format!("bind failed: {bind}")))?;
    info!(target: "web", "listening on http://{bind}/");
    println!("Listening on http://{bind}/ (Ctrl+C to stop)");

    let app = router::build_router(state.clone());
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    state.manager.shutdown().await;
    served.map_err(|e| anyhow!(e))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(target: "web", "shutdown requested");
    println!("Stopping server...");
}
