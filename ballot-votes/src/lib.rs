//! Ballot Votes - Live vote streamer for the Ballots services.
//!
//! Tracks every poll option as a hashtag on a real-time feed and publishes
//! one message per matching option to the `votes` topic.
//!
//! ## Architecture
//!
//! ```text
//! PollStore → TermSource → StreamSupervisor ──dial──▶ feed
//!                               │ Classifier
//!                               ▼
//!                         mpsc<VoteEvent> → Publisher → MessageQueue("votes")
//!
//! watchdog ──force_close (every minute)──▶ ConnectionFactory
//! SIGINT/SIGTERM → ShutdownCoordinator
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod auth;
pub mod classifier;
pub mod connection;
pub mod publisher;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod terms;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ballot_common::config::Config;
use ballot_common::error::{Error, Result, ResultExt};
use ballot_common::queue::MessageQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use auth::Authorizer;
pub use classifier::{
    matching_terms, Classifier, DecodeError, RecordDecoder, SessionEnd, StreamRecord,
};
pub use connection::{ConnectionFactory, DialError, StreamHandle};
pub use publisher::{Publisher, PublisherReport};
pub use shutdown::{spawn_watchdog, wait_for_signal, ShutdownCoordinator, ShutdownReport};
pub use store::{InMemoryPollStore, Poll, PollStore, SqlitePollStore};
pub use supervisor::{StreamSupervisor, SupervisorReport, SupervisorSettings, SupervisorState};
pub use terms::{TermSource, TrackedTerm, VoteEvent};

/// Runtime settings for a [`VotePipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub endpoint: Url,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub recycle_interval: Duration,
    pub vote_buffer: usize,
    pub topic: String,
    pub diagnostic_max_chars: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = Url::parse(&config.feed.endpoint).map_err(|e| {
            Error::Config(format!("invalid feed endpoint {}: {e}", config.feed.endpoint))
        })?;

        Ok(Self {
            endpoint,
            connect_timeout: config.connect_timeout(),
            poll_interval: config.poll_interval(),
            recycle_interval: config.recycle_interval(),
            vote_buffer: config.stream.vote_buffer,
            topic: config.queue.topic.clone(),
            diagnostic_max_chars: config.feed.diagnostic_max_chars,
        })
    }
}

/// The running set of workers: supervisor, publisher and watchdog.
pub struct VotePipeline {
    factory: Arc<ConnectionFactory>,
    coordinator: ShutdownCoordinator,
}

impl VotePipeline {
    /// Spawn every worker. Must be called from within a Tokio runtime.
    pub fn start(
        settings: PipelineSettings,
        store: Arc<dyn PollStore>,
        authorizer: Authorizer,
        queue: Arc<dyn MessageQueue>,
    ) -> Result<Self> {
        let factory = Arc::new(
            ConnectionFactory::new(settings.connect_timeout)
                .map_err(DialError::from)
                .context("building feed HTTP client")?,
        );
        let stop = CancellationToken::new();
        let (votes_tx, votes_rx) = mpsc::channel(settings.vote_buffer.max(1));

        let publisher = tokio::spawn(Publisher::new(queue, settings.topic.clone()).run(votes_rx));

        let supervisor = StreamSupervisor::new(
            TermSource::new(store),
            Arc::clone(&factory),
            authorizer,
            votes_tx.clone(),
            stop.clone(),
            SupervisorSettings {
                endpoint: settings.endpoint.clone(),
                poll_interval: settings.poll_interval,
                diagnostic_max_chars: settings.diagnostic_max_chars,
            },
        );
        let supervisor = tokio::spawn(supervisor.run());

        let watchdog = spawn_watchdog(Arc::clone(&factory), settings.recycle_interval, stop.clone());

        tracing::info!(
            endpoint = %settings.endpoint,
            topic = %settings.topic,
            "Vote pipeline started"
        );

        Ok(Self {
            factory: Arc::clone(&factory),
            coordinator: ShutdownCoordinator::new(
                stop, factory, votes_tx, supervisor, publisher, watchdog,
            ),
        })
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    /// Run until `signal` resolves, then shut down in order.
    pub async fn run_until<F>(self, signal: F) -> anyhow::Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        self.coordinator.run(signal).await
    }
}
