//! Inbound Spam Classifier: binary entrypoint.
//! Boots the Axum HTTP server through Shuttle; all wiring lives in `app()`.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact fmt logs filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let router = inbound_spam_classifier::app()
        .await
        .map_err(shuttle_runtime::Error::Custom)?;
    Ok(router.into())
}
