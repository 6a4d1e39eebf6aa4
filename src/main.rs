use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the KIA application
///
/// Loads `.env`, builds the engine from the `KIA_*` environment and serves the REST API.
///
/// # Environment Variables
/// - `KIA_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `KIA_DATA_DIR`: journal directory; records are kept in memory only when unset
/// - `KIA_IDL_COMPLETION_AGE_MONTHS`: age by which the basic schedule must be complete (default 9)
/// - `KIA_TARGET_MAX_AGE_MONTHS`: upper age of the immunization target population (default 18)
/// - `KIA_RESIDENTS_FILE`: optional YAML file of residents to seed the directory with
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If configuration, startup or the server fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kia=info".parse()?)
                .add_directive("kia_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("KIA_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let state = api_rest::state_from_env()?;
    let app = api_rest::router(state);

    tracing::info!("++ Starting KIA REST on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
