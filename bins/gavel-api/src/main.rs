mod handlers;
mod routes;

use anyhow::{Context, Result};
use gavel_common::config::JudgeConfig;
use gavel_engine::{Judge, LanguageRegistry, MemoryStore, RedisStore, ResultStore, StaticCatalog};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub judge: Judge,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("GAVEL_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Gavel API booting...");

    let config = JudgeConfig::load_default().map_err(anyhow::Error::msg)?;

    let registry = LanguageRegistry::load_or_builtin(&config.languages_path)
        .context("Failed to load language adapters")?;
    info!(languages = ?registry.list_languages(), "Language adapters loaded");

    let catalog = StaticCatalog::load_or_empty(&config.exercises_path, config.limits.clone())
        .context("Failed to load exercises")?;

    let store: Arc<dyn ResultStore> = match &config.store.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, config.store.result_ttl_secs)
                .await
                .context("Failed to connect to Redis")?;
            info!("Connected to Redis: {}", url);
            Arc::new(store)
        }
        None => {
            info!("REDIS_URL not set, keeping results in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState {
        judge: Judge::new(config, registry, Arc::new(catalog), store),
    });

    // Build router
    let app = routes::routes().with_state(state.clone());

    // Start server
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    info!("HTTP server listening on {}", bind_addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.judge.shutdown().await;
    Ok(())
}
