//! Stream supervisor.
//!
//! Keeps exactly one filtered stream open against the feed, rebuilding the
//! track filter from the poll store before every session:
//!
//! ```text
//! Idle ──terms──▶ Connecting ──2xx──▶ Streaming ──end──▶ Idle
//!   │                 │
//!   │                 └──error/non-2xx──▶ Backoff ──▶ Idle
//!   └──stop──▶ Stopped
//! ```
//!
//! The supervisor never exits on its own: every failure leads back to Idle,
//! whose poll-interval wait throttles retries. Only the stop token ends it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Response;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;

use ballot_common::util::{sanitize_for_log, truncate_with_ellipsis};

use crate::auth::Authorizer;
use crate::classifier::{Classifier, SessionEnd};
use crate::connection::{ConnectionFactory, DialError, StreamConnection, StreamHandle};
use crate::terms::{hashtags, track_parameter, TermSnapshot, TermSource, TrackedTerm, VoteEvent};

/// Upper bound on diagnostic bytes read from a rejected response.
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Per-chunk wait while reading a rejection body.
const DIAGNOSTIC_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
    Stopped,
}

/// Totals returned when the supervisor stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub sessions_opened: u64,
    pub terms_loaded_last: usize,
}

/// Settings for a [`StreamSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub endpoint: Url,
    pub poll_interval: Duration,
    pub diagnostic_max_chars: usize,
}

pub struct StreamSupervisor {
    terms: TermSource,
    factory: Arc<ConnectionFactory>,
    authorizer: Authorizer,
    votes: mpsc::Sender<VoteEvent>,
    stop: CancellationToken,
    settings: SupervisorSettings,
    state: SupervisorState,
}

/// Outcome of one Connecting + Streaming pass.
enum SessionOutcome {
    Ended(SessionEnd),
    Failed,
    Stopped,
}

impl StreamSupervisor {
    pub fn new(
        terms: TermSource,
        factory: Arc<ConnectionFactory>,
        authorizer: Authorizer,
        votes: mpsc::Sender<VoteEvent>,
        stop: CancellationToken,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            terms,
            factory,
            authorizer,
            votes,
            stop,
            settings,
            state: SupervisorState::Idle,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run until the stop token is cancelled.
    pub async fn run(mut self) -> SupervisorReport {
        let mut report = SupervisorReport::default();
        info!(endpoint = %self.settings.endpoint, "Stream supervisor started");

        loop {
            if self.stop.is_cancelled() {
                self.transition(SupervisorState::Stopped);
                break;
            }

            tokio::select! {
                _ = self.stop.cancelled() => continue,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            let terms = match self.terms.load_terms().await {
                Ok(terms) => terms,
                Err(e) => {
                    warn!(error = %e, "Failed to load tracked terms");
                    self.transition(SupervisorState::Backoff);
                    self.transition(SupervisorState::Idle);
                    continue;
                }
            };
            report.terms_loaded_last = terms.len();

            self.transition(SupervisorState::Connecting);
            let session_id = uuid::Uuid::new_v4();
            let span = info_span!("stream_session", %session_id, terms = terms.len());

            match self.session(terms, &mut report).instrument(span).await {
                SessionOutcome::Ended(SessionEnd::VotesClosed) => {
                    error!("Vote channel closed while streaming, stopping supervisor");
                    self.transition(SupervisorState::Stopped);
                    break;
                }
                SessionOutcome::Ended(_) => {}
                SessionOutcome::Failed => self.transition(SupervisorState::Backoff),
                SessionOutcome::Stopped => {
                    debug!("Stop requested before streaming began");
                    continue;
                }
            }
            self.transition(SupervisorState::Idle);
        }

        info!(
            sessions = report.sessions_opened,
            terms = report.terms_loaded_last,
            "Stream supervisor stopped"
        );
        report
    }

    async fn session(&mut self, terms: Vec<TrackedTerm>, report: &mut SupervisorReport) -> SessionOutcome {
        // A stop that landed during term load must not open a new session:
        // force_close has already run and would miss the new handle.
        if self.stop.is_cancelled() {
            return SessionOutcome::Stopped;
        }
        let tags = hashtags(&terms);

        let request = match self.build_request(&terms) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to build stream request");
                return SessionOutcome::Failed;
            }
        };

        let dialed = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return SessionOutcome::Stopped,
            dialed = self.factory.dial(request) => dialed,
        };

        let StreamConnection { response, handle } = match dialed {
            Ok(conn) if self.stop.is_cancelled() => {
                conn.handle.close();
                return SessionOutcome::Stopped;
            }
            Ok(conn) => conn,
            Err(DialError::ClosedByCaller) => {
                debug!("Dial interrupted by close");
                return SessionOutcome::Failed;
            }
            Err(DialError::Transport(e)) => {
                warn!(error = %e, hashtags = ?tags, "Failed to connect to feed");
                return SessionOutcome::Failed;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let line = first_line(response, MAX_DIAGNOSTIC_BYTES, &handle).await;
            handle.close();
            warn!(
                status = %status,
                hashtags = ?tags,
                body = %truncate_with_ellipsis(&sanitize_for_log(&line), self.settings.diagnostic_max_chars),
                "Feed rejected stream request"
            );
            return SessionOutcome::Failed;
        }

        report.sessions_opened += 1;
        self.transition(SupervisorState::Streaming);
        info!(handle = handle.id(), hashtags = ?tags, "Streaming");

        let snapshot: TermSnapshot = terms.into();
        let mut classifier = Classifier::new(snapshot, self.votes.clone());
        let end = classifier.run(response.bytes_stream(), &handle).await;

        match &end {
            SessionEnd::Eof | SessionEnd::ClosedByCaller => {
                info!(reason = %end, votes = classifier.votes_sent(), "Stream session ended")
            }
            _ => warn!(reason = %end, votes = classifier.votes_sent(), "Stream session ended"),
        }
        handle.close();

        SessionOutcome::Ended(end)
    }

    fn build_request(&self, terms: &[TrackedTerm]) -> anyhow::Result<reqwest::Request> {
        let form = vec![("track".to_string(), track_parameter(terms))];
        let authorization = self
            .authorizer
            .authorization_header("POST", &self.settings.endpoint, &form)?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&form)
            .finish();

        let request = self
            .factory
            .client()
            .post(self.settings.endpoint.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(AUTHORIZATION, authorization)
            .body(body)
            .build()?;

        Ok(request)
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Supervisor state");
            self.state = next;
        }
    }
}

/// First line of a response body, reading at most `limit` bytes.
///
/// Stops early with whatever was read once `handle` closes.
async fn first_line(response: Response, limit: usize, handle: &StreamHandle) -> String {
    let mut body = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while buf.len() < limit && !buf.contains(&b'\n') {
        let next = tokio::select! {
            biased;
            _ = handle.closed() => break,
            next = tokio::time::timeout(DIAGNOSTIC_READ_TIMEOUT, body.next()) => next,
        };
        match next {
            Ok(Some(Ok(chunk))) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }

    let text = String::from_utf8_lossy(&buf[..buf.len().min(limit)]);
    text.lines().next().unwrap_or_default().trim().to_string()
}
