use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vouch_server::config::ServerConfig;
use vouch_server::store::Store;
use vouch_server::web::{AppState, LogRelay};
use vouch_server::{web, worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (VOUCH_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("VOUCH_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("vouch_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::parse();
    std::fs::create_dir_all(&config.datadir)?;
    let db_path = config.datadir.join("vouch.db");
    tracing::info!(path = %db_path.display(), "opening store");

    let store = Arc::new(Store::open(&db_path, config.store_options())?);
    let worker_handle = worker::spawn(store.clone());

    let state = Arc::new(AppState {
        store: store.clone(),
        relay: Arc::new(LogRelay),
    });
    let app = web::router(state);

    tracing::info!("command surface listening on {}", config.web_addr);
    let listener = tokio::net::TcpListener::bind(&config.web_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    store.shutdown();
    if worker_handle.join().is_err() {
        tracing::warn!("trust-map worker exited abnormally");
    }
    Ok(())
}
