//! Binary entrypoint for the Loom upload service.
use loom_control_plane::{build_router, config::Config, telemetry::init_tracing, AppState};
use tower_http::cors::CorsLayer;
use tracing::info;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    init_tracing(cfg.log_format);
    info!(config=?cfg, "config.loaded");
    let state = AppState::from_config(&cfg).await?;
    let app = build_router(state).layer(CorsLayer::permissive());
    info!(addr=%cfg.listen_addr, "loom-control-plane listening");
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await { tracing::warn!(error=%e, "shutdown.signal_install_failed"); }
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await; // graceful drain window
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
