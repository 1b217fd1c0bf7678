mod cli;
mod shutdown;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use serverbox_api::{build_app, new_state};
use serverbox_config::ProxyConfig;
use serverbox_lifecycle::{LifecycleManager, ResumeCoordinator};
use serverbox_provider::{
    BootstrapDriver, DaytonaConfig, DaytonaProviderAdapter, DefaultBootstrapDriver,
    LocalProviderAdapter, ProviderAdapter,
};
use serverbox_store::{InstanceStore, SqliteStore};
use tracing_subscriber::EnvFilter;

/// Port the bootstrapped upstream server listens on inside every sandbox.
const UPSTREAM_PORT: u16 = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    let _cli = Cli::parse();

    let config = ProxyConfig::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .init();

    let store: Arc<dyn InstanceStore> = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open store at {}", config.db_path))?,
    );

    let provider: Arc<dyn ProviderAdapter> = match &config.daytona_api_key {
        Some(api_key) => Arc::new(DaytonaProviderAdapter::new(DaytonaConfig {
            api_url: config
                .daytona_api_url
                .clone()
                .unwrap_or_else(|| "https://app.daytona.io/api".to_string()),
            api_key: api_key.clone(),
            target: config.daytona_target.clone(),
        })),
        None => {
            tracing::warn!("DAYTONA_API_KEY not set; falling back to the local provider adapter");
            Arc::new(LocalProviderAdapter::new())
        }
    };

    let bootstrap: Arc<dyn BootstrapDriver> =
        Arc::new(DefaultBootstrapDriver::new(provider.clone()));

    let manager = Arc::new(LifecycleManager::new(
        store.clone(),
        provider,
        bootstrap,
        UPSTREAM_PORT,
        config.process_env.clone(),
    ));
    let resume = Arc::new(ResumeCoordinator::new(manager.clone()));

    let proxy_base_url = format!("http://{}:{}", config.proxy_host, config.proxy_port);
    let state = new_state(
        manager,
        resume,
        config.admin_api_key.clone(),
        config.proxy_api_key.clone(),
        proxy_base_url,
        config.auto_resume,
        config.resume_timeout_ms,
        config.request_timeout_ms,
    );

    let app = build_app(state);
    let addr = format!("{}:{}", config.proxy_host, config.proxy_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    tracing::info!(%addr, "serverbox listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::signal())
        .await
        .context("server error")?;

    store.close().await.context("failed to close store")?;
    tracing::info!("shutdown complete");

    Ok(())
}
