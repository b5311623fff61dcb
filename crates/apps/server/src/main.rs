mod config;
mod query_client;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use streaming::TilePipeline;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::query_client::HttpQueryEngine;
use crate::routes::{AppState, router};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ServerConfig::from_env()?;
    let engine = HttpQueryEngine::new(reqwest::Client::new(), config.query_engine_url.clone());
    let pipeline = TilePipeline::new(config.engine.clone(), Arc::new(engine))
        .context("invalid engine config")?;

    pipeline
        .initialize()
        .await
        .with_context(|| format!("query engine at {} is unavailable", config.query_engine_url))?;
    if let Some(problem) = pipeline.stats().init_error {
        warn!(%problem, "serving with degraded tiles");
    }

    let state = AppState {
        pipeline,
        scheme: config.scheme.as_str().into(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    info!(
        "tile server listening on http://{} (scheme {}://)",
        config.addr, config.scheme
    );
    axum::serve(listener, app).await?;
    Ok(())
}
