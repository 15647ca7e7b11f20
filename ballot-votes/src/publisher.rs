//! Vote publisher.
//!
//! Drains the vote channel into the message queue, one message per vote.
//! Publish failures are logged and the vote is dropped; the publisher only
//! returns once the channel is closed and empty, after stopping the queue.

use std::sync::Arc;

use ballot_common::queue::MessageQueue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::terms::VoteEvent;

/// Totals returned when the publisher stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherReport {
    pub published: u64,
    pub failed: u64,
}

pub struct Publisher {
    queue: Arc<dyn MessageQueue>,
    topic: String,
}

impl Publisher {
    pub fn new(queue: Arc<dyn MessageQueue>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
        }
    }

    pub async fn run(self, mut votes: mpsc::Receiver<VoteEvent>) -> PublisherReport {
        let mut report = PublisherReport::default();

        while let Some(vote) = votes.recv().await {
            match self.queue.publish(&self.topic, vote.payload()).await {
                Ok(()) => {
                    report.published += 1;
                    debug!(term = %vote.term, topic = %self.topic, "Vote published");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(term = %vote.term, error = %e, "Failed to publish vote");
                }
            }
        }

        if let Err(e) = self.queue.stop().await {
            warn!(error = %e, "Failed to stop queue client");
        }
        info!(
            published = report.published,
            failed = report.failed,
            "publisher stopped"
        );
        report
    }
}
