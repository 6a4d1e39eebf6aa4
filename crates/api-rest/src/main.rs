//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the REST API server on its own.
//!
//! ## Intended use
//! Useful for development and debugging. The workspace's main `kia-run` binary additionally loads
//! a `.env` file before starting the same router.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the KIA REST API server.
///
/// # Environment Variables
/// - `KIA_REST_ADDR`: Server address (default: "0.0.0.0:3000")
/// - the `KIA_*` variables read by [`api_rest::state_from_env`]
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the engine cannot be configured or its journal cannot be replayed,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?)
                .add_directive("kia_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("KIA_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let state = api_rest::state_from_env()?;
    let app = api_rest::router(state);

    tracing::info!("-- Starting KIA REST API on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
