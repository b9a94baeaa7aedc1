//! `bizlens serve`: run the HTTP API until ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use bizlens::api::{start_server, AppState};
use bizlens::{Config, Pipeline};

pub(crate) async fn cmd_serve(mut config: Config, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let pipeline = Arc::new(
        Pipeline::from_config(&config)
            .await
            .context("Failed to initialise pipeline")?,
    );
    info!(
        queries = pipeline.registry().len(),
        cache_ttl_secs = config.cache.ttl_secs,
        "Pipeline ready"
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    };
    start_server(&config.server, AppState::new(Arc::clone(&pipeline)), shutdown).await?;

    pipeline.shutdown().await;
    Ok(())
}
