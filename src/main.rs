use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use webview_tile_streamer::browser::FakeBrowser;
use webview_tile_streamer::codec::ImageCodec;
use webview_tile_streamer::config::ServerConfig;
use webview_tile_streamer::protocol::LengthPrefixedEncoder;
use webview_tile_streamer::registry::ServerState;
use webview_tile_streamer::transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse_with_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind_addr = config.bind_addr.clone();

    let browser = build_browser_control();
    let state = ServerState::new(config, browser, Arc::new(ImageCodec), Arc::new(LengthPrefixedEncoder));
    let sweep_task = Arc::clone(&state).spawn_idle_sweep();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, transport::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep_task.abort();
    Ok(())
}

#[cfg(feature = "cdp")]
fn build_browser_control() -> Arc<dyn webview_tile_streamer::browser::BrowserControl> {
    tracing::warn!("cdp feature enabled but no chromiumoxide::Browser wired at startup; falling back to the in-memory fake");
    Arc::new(FakeBrowser::new())
}

#[cfg(not(feature = "cdp"))]
fn build_browser_control() -> Arc<dyn webview_tile_streamer::browser::BrowserControl> {
    Arc::new(FakeBrowser::new())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to install ctrl-c handler"),
    }
}
