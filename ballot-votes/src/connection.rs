//! Interruptible connection factory.
//!
//! Every streaming request goes through [`ConnectionFactory::dial`], which
//! tracks the most recent session's [`StreamHandle`]. Any task can call
//! [`ConnectionFactory::force_close`] to end the in-flight request or body
//! read; the reader sees [`DialError::ClosedByCaller`] or a closed handle
//! rather than racing on a raw socket.
//!
//! The factory only holds a `Weak` reference: a session's lifetime belongs
//! to the supervisor that opened it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Connection closed by caller")]
    ClosedByCaller,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<DialError> for ballot_common::Error {
    fn from(err: DialError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Close handle for one streaming session.
#[derive(Debug)]
pub struct StreamHandle {
    id: u64,
    closed: CancellationToken,
}

impl StreamHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the session closed and wake any pending read. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(handle = self.id, "Closing stream handle");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the handle is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// One open response from the feed plus its close handle.
#[derive(Debug)]
pub struct StreamConnection {
    pub response: reqwest::Response,
    pub handle: Arc<StreamHandle>,
}

/// Opens streaming requests and keeps a single slot for the current session.
pub struct ConnectionFactory {
    client: reqwest::Client,
    current: Mutex<Weak<StreamHandle>>,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    /// Build a factory whose client gives up on connecting after `connect_timeout`.
    ///
    /// No overall request timeout is set: the body is expected to stream
    /// indefinitely.
    pub fn new(connect_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            current: Mutex::new(Weak::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Close the previous session, register a new one, and issue the request.
    pub async fn dial(&self, request: reqwest::Request) -> Result<StreamConnection, DialError> {
        let handle = self.register();

        let response = tokio::select! {
            biased;
            _ = handle.closed() => return Err(DialError::ClosedByCaller),
            result = self.client.execute(request) => result?,
        };

        // A close that raced the response still wins.
        if handle.is_closed() {
            return Err(DialError::ClosedByCaller);
        }

        Ok(StreamConnection { response, handle })
    }

    /// Close the currently tracked session, if it is still alive.
    pub fn force_close(&self) {
        let current = self.lock_current().upgrade();
        if let Some(handle) = current {
            handle.close();
        }
    }

    /// Id of the live session, if any.
    pub fn current_session_id(&self) -> Option<u64> {
        self.lock_current()
            .upgrade()
            .filter(|h| !h.is_closed())
            .map(|h| h.id())
    }

    pub(crate) fn register(&self) -> Arc<StreamHandle> {
        let handle = Arc::new(StreamHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed)));

        let mut current = self.lock_current();
        if let Some(previous) = current.upgrade() {
            previous.close();
        }
        *current = Arc::downgrade(&handle);

        handle
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Weak<StreamHandle>> {
        // The slot only holds a Weak; a panic elsewhere cannot leave it inconsistent.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ConnectionFactory {
        ConnectionFactory::new(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_register_closes_previous() {
        let factory = factory();
        let first = factory.register();
        assert_eq!(factory.current_session_id(), Some(first.id()));

        let second = factory.register();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(factory.current_session_id(), Some(second.id()));
    }

    #[test]
    fn test_force_close_current() {
        let factory = factory();
        let handle = factory.register();

        factory.force_close();
        assert!(handle.is_closed());
        assert_eq!(factory.current_session_id(), None);

        // Idempotent, and harmless with nothing tracked.
        factory.force_close();
        drop(handle);
        factory.force_close();
    }

    #[test]
    fn test_factory_does_not_extend_lifetime() {
        let factory = factory();
        let handle = factory.register();
        let weak = Arc::downgrade(&handle);
        drop(handle);
        assert!(weak.upgrade().is_none());
        assert_eq!(factory.current_session_id(), None);
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let handle = Arc::new(StreamHandle::new(7));
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.closed().await })
        };

        handle.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_transport_error() {
        let factory = factory();
        // Port 9 on localhost is almost never listening; a refused connect is a transport error.
        let request = factory
            .client()
            .post("http://127.0.0.1:9/filter")
            .build()
            .unwrap();

        match factory.dial(request).await {
            Err(DialError::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
