use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use coordinator::bridge::WebRtcRuntime;
use coordinator::catalog::AppCatalog;
use coordinator::config::CoordinatorConfig;
use coordinator::sandbox::ScriptSandbox;
use coordinator::session::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=info,webrtc=warn")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coordinator.yml".to_string());
    let config = if Path::new(&config_path).exists() {
        CoordinatorConfig::load(Path::new(&config_path))?
    } else {
        info!("no config file at {}, using defaults", config_path);
        CoordinatorConfig::default()
    };

    let catalog = AppCatalog::load(&config.catalog_path).context("load app catalog")?;
    let webrtc = WebRtcRuntime::from_config(&config.webrtc)
        .await
        .context("configure webrtc runtime")?;
    let sandbox = Arc::new(ScriptSandbox::new(
        config.start_script.clone(),
        config.stop_script.clone(),
    ));

    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState { config, webrtc, catalog, sandbox });

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("bind {}", listen_addr))?;
    info!("coordinator listening on {}", listen_addr);

    axum::serve(listener, coordinator::router(state))
        .await
        .context("serve http")?;
    Ok(())
}
