// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod analyze;
pub mod api;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod learning;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod resilience;
pub mod scheduler;
pub mod status;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::EngineConfig;
pub use crate::engine::{BatchOutcome, Disposition, Engine};
pub use crate::error::{EngineError, EngineResult, StoreError};

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tracing::info;

use crate::api::AppState;
use crate::metrics::Metrics;
use crate::scheduler::spawn_backlog_scheduler;
use crate::store::SqliteStore;

/// Builds the full in-process app: config, store, engine, optional backlog
/// scheduler, API routes and `/metrics`.
pub async fn app() -> anyhow::Result<Router> {
    let cfg = EngineConfig::load().context("loading engine config")?;
    let metrics = Metrics::init().context("installing prometheus recorder")?;

    let store = SqliteStore::connect(&cfg.database_path)
        .await
        .with_context(|| format!("opening store at {}", cfg.database_path))?;
    let engine = Arc::new(Engine::new(Arc::new(store), cfg.clone()));

    if spawn_backlog_scheduler(engine.clone(), cfg.scheduler).is_some() {
        info!(
            target: "spam",
            interval_secs = cfg.scheduler.interval_secs,
            take = cfg.scheduler.take,
            "backlog scheduler started"
        );
    }

    Ok(router(AppState::new(engine)).merge(metrics.router()))
}
