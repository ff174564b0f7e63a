//! Problem allocator service - entry point.
//!
//! Seeds the problem catalog, repairs the capacity ledger if it drifted
//! while the service was down, then serves the allocation API over Axum.

mod api;
mod config;
mod db;
mod errors;

use std::sync::Arc;

use allocation_core::{AllocationEngine, EngineOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url, config.max_connections).await?;

    if let Some(path) = &config.problems_seed_path {
        let problems = db::load_seed_file(path).await?;
        let count = db::seed_problems(&pool, &problems).await?;
        info!("Seeded {count} problem statements from {path}");
    }

    // ─── Engine ───────────────────────────────────────────
    let store = Arc::new(SqliteStore::new(pool));
    let engine = Arc::new(AllocationEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        EngineOptions {
            max_contention_retries: config.max_contention_retries,
            resolver_seed: config.resolver_seed,
        },
    ));

    if config.reconcile_on_start {
        let drifts = engine.reconcile_ledger().await?;
        if drifts.is_empty() {
            info!("Capacity ledger consistent with allocation records");
        } else {
            warn!("Repaired {} capacity ledger rows at startup", drifts.len());
        }
    }

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState { engine, store }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
