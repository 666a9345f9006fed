//! One-shot backlog drain against the configured store. Prints the report as JSON.
//!
//! Usage: `drain_backlog [take] [max_rounds]`

use std::sync::Arc;

use anyhow::Context;
use inbound_spam_classifier::scheduler::drain_backlog;
use inbound_spam_classifier::store::SqliteStore;
use inbound_spam_classifier::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();

    let cfg = EngineConfig::load()?;
    let mut args = std::env::args().skip(1);
    let take = match args.next() {
        Some(s) => s.parse().context("take must be a positive integer")?,
        None => cfg.scheduler.take,
    };
    let max_rounds = match args.next() {
        Some(s) => s.parse().context("max_rounds must be a positive integer")?,
        None => cfg.scheduler.max_rounds,
    };

    let store = SqliteStore::connect(&cfg.database_path)
        .await
        .with_context(|| format!("opening store at {}", cfg.database_path))?;
    let engine = Engine::new(Arc::new(store), cfg);

    let report = drain_backlog(&engine, take, max_rounds).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
