//! Signal handling, connection recycling and ordered shutdown.
//!
//! Shutdown order matters: the supervisor must be fully stopped before the
//! vote channel closes, and the publisher must drain the channel before the
//! process exits. [`ShutdownCoordinator`] owns the last vote `Sender` so the
//! channel closes exactly when it drops it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connection::ConnectionFactory;
use crate::publisher::PublisherReport;
use crate::supervisor::SupervisorReport;
use crate::terms::VoteEvent;

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

/// Force-close the current stream every `interval` until `stop` fires.
///
/// Recycling makes the supervisor reconnect with a freshly loaded term set,
/// so new polls start being tracked within one interval.
pub fn spawn_watchdog(
    factory: Arc<ConnectionFactory>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(session = ?factory.current_session_id(), "Recycling stream connection");
                    factory.force_close();
                }
            }
        }

        debug!("Watchdog stopped");
    })
}

/// Final totals from both workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub supervisor: SupervisorReport,
    pub publisher: PublisherReport,
}

pub struct ShutdownCoordinator {
    stop: CancellationToken,
    factory: Arc<ConnectionFactory>,
    votes: mpsc::Sender<VoteEvent>,
    supervisor: JoinHandle<SupervisorReport>,
    publisher: JoinHandle<PublisherReport>,
    watchdog: JoinHandle<()>,
}

impl ShutdownCoordinator {
    /// `votes` must be the last `Sender` outside the supervisor task.
    pub fn new(
        stop: CancellationToken,
        factory: Arc<ConnectionFactory>,
        votes: mpsc::Sender<VoteEvent>,
        supervisor: JoinHandle<SupervisorReport>,
        publisher: JoinHandle<PublisherReport>,
        watchdog: JoinHandle<()>,
    ) -> Self {
        Self {
            stop,
            factory,
            votes,
            supervisor,
            publisher,
            watchdog,
        }
    }

    /// Wait for `signal`, then stop every worker in order.
    ///
    /// All steps run even if a worker panicked; the first panic is returned
    /// as an error afterwards.
    pub async fn run<F>(self, signal: F) -> anyhow::Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!("Shutdown requested");

        self.stop.cancel();
        self.factory.force_close();

        let mut failure: Option<anyhow::Error> = None;
        let mut report = ShutdownReport::default();

        match self.supervisor.await {
            Ok(supervisor) => report.supervisor = supervisor,
            Err(e) => {
                error!(error = %e, "Stream supervisor task failed");
                failure.get_or_insert(anyhow::anyhow!("stream supervisor task failed: {e}"));
            }
        }

        drop(self.votes);

        match self.publisher.await {
            Ok(publisher) => report.publisher = publisher,
            Err(e) => {
                error!(error = %e, "Publisher task failed");
                failure.get_or_insert(anyhow::anyhow!("publisher task failed: {e}"));
            }
        }

        if let Err(e) = self.watchdog.await {
            error!(error = %e, "Watchdog task failed");
        }

        info!(
            sessions = report.supervisor.sessions_opened,
            published = report.publisher.published,
            failed = report.publisher.failed,
            "Shutdown complete"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
