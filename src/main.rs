use anyhow::{Context, Result};
use clap::Parser;
use futures::FutureExt;
use sam_rest::{
    api::{router, AppState},
    config::Config,
    sam::SamModel,
    service::LazyModel,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::parse();
    tokio::fs::create_dir_all(&config.model_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.model_dir.display()))?;

    info!("Starting SAM REST API...");

    let loader_config = config.clone();
    let model = LazyModel::new(move || {
        let config = loader_config.clone();
        async move { SamModel::initialize(&config).await }.boxed()
    });
    let state = AppState::new(model, config.max_segments);

    if config.preload {
        state.model.get().await?;
    } else {
        info!("Model will be downloaded on first request if not present");
    }

    let app = router(state, config.body_limit);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("Listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
