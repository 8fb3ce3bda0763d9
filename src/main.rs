//! Backend entry point: wires the stores, clients, orchestrator, and
//! scheduler together, then serves the HTTP API.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skindiff_backend::{
    api::{self, AppState},
    keycache::HashNameCache,
    models::BootConfig,
    scheduler,
    scrapers::{BuffClient, YoupinClient},
    settings::SettingsStore,
    tokens::TokenStore,
    updater::UpdateManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let config = BootConfig::from_env();
    info!("🚀 Skindiff backend starting");

    let data_dir = Path::new(&config.data_dir);
    let tokens = Arc::new(TokenStore::load(data_dir.join("tokens_config.json")));
    let keycache = Arc::new(HashNameCache::load(data_dir.join("hashname_cache.json")));
    let settings = Arc::new(SettingsStore::new(keycache.clone()));

    let buff = Arc::new(BuffClient::new(tokens.clone()).context("Buff client init failed")?);
    let youpin =
        Arc::new(YoupinClient::new(tokens.clone()).context("Youpin client init failed")?);

    let manager = Arc::new(UpdateManager::new(
        buff.clone(),
        youpin.clone(),
        settings.clone(),
        keycache.clone(),
    ));

    let scheduler_state = scheduler::spawn(manager.clone(), settings.clone());
    info!("⏰ Refresh scheduler running");

    let state = AppState {
        manager,
        settings,
        tokens,
        buff,
        youpin,
        scheduler: scheduler_state,
    };
    let app = api::router(state, &config.api_base_path);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, base_path = %config.api_base_path, "🎯 API server listening");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skindiff_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
