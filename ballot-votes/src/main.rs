//! Ballot Votes - Main entry point.

use std::sync::Arc;

use anyhow::Result;
use ballot_common::config::Config;
use ballot_common::error::ResultExt;
use ballot_common::logging::init_logging;
use ballot_common::queue::{create_queue, RedisQueueConfig};
use ballot_votes::{Authorizer, PipelineSettings, SqlitePollStore, VotePipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Missing credentials stop the process before any worker starts
    let config = Config::load_and_validate()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Ballot Votes v{}", env!("CARGO_PKG_VERSION"));

    let authorizer = Authorizer::from_config(&config).context("building feed authorizer")?;
    let settings = PipelineSettings::from_config(&config)?;

    let store = SqlitePollStore::open(&config.store.path)
        .context(format!("opening poll store at {}", config.store.path.display()))?;

    let queue = create_queue(
        config.queue.backend,
        Some(RedisQueueConfig {
            url: config.queue.url.clone(),
            channel_prefix: config.queue.channel_prefix.clone(),
        }),
    )
    .await
    .context("connecting to message queue")?;

    let pipeline = VotePipeline::start(settings, Arc::new(store), authorizer, queue)?;

    let report = pipeline
        .run_until(async {
            match ballot_votes::wait_for_signal().await {
                Ok(name) => tracing::info!(signal = name, "Received signal, shutting down"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for signals, shutting down"),
            }
        })
        .await?;

    tracing::info!(
        sessions = report.supervisor.sessions_opened,
        terms = report.supervisor.terms_loaded_last,
        published = report.publisher.published,
        failed = report.publisher.failed,
        "Ballot Votes stopped"
    );

    Ok(())
}
