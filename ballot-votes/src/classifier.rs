//! Record decoding and vote classification.
//!
//! The feed body is a continuous sequence of JSON objects, separated by
//! whitespace and keep-alive newlines, with no framing guarantees relative to
//! network chunks. [`RecordDecoder`] buffers bytes and yields whole records;
//! [`Classifier`] turns each record into one [`VoteEvent`] per matching term.

use std::fmt;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::StreamHandle;
use crate::terms::{TermSnapshot, TrackedTerm, VoteEvent};

/// One decoded feed record. Only the text is of interest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StreamRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Largest incomplete record the decoder will hold.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Incomplete record of {pending} bytes exceeds the {limit} byte limit")]
    TooLarge { pending: usize, limit: usize },
}

/// Incremental decoder over concatenated JSON objects.
#[derive(Debug)]
pub struct RecordDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_RECORD_BYTES)
    }
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that gives up once an incomplete record grows past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete record, or `None` when more bytes are needed.
    pub fn next_record(&mut self) -> Result<Option<StreamRecord>, DecodeError> {
        let mut records =
            serde_json::Deserializer::from_slice(&self.buffer).into_iter::<StreamRecord>();

        match records.next() {
            Some(Ok(record)) => {
                let consumed = records.byte_offset();
                self.buffer.drain(..consumed);
                Ok(Some(record))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buffer.len() > self.limit {
                    return Err(DecodeError::TooLarge {
                        pending: self.buffer.len(),
                        limit: self.limit,
                    });
                }
                Ok(None)
            }
            Some(Err(e)) => Err(DecodeError::Malformed(e)),
            None => {
                // Only whitespace left.
                self.buffer.clear();
                Ok(None)
            }
        }
    }
}

/// Every term contained in `text`, case-insensitively, in snapshot order.
pub fn matching_terms<'a>(
    text: &str,
    terms: &'a [TrackedTerm],
) -> impl Iterator<Item = &'a TrackedTerm> + 'a {
    let text = text.to_lowercase();
    terms.iter().filter(move |term| text.contains(term.as_str()))
}

/// Why a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the body.
    Eof,
    /// A record could not be decoded.
    Decode(String),
    /// The body stream failed mid-read.
    Transport(String),
    /// The handle was closed by the watchdog or the coordinator.
    ClosedByCaller,
    /// The vote receiver is gone; nothing more can be delivered.
    VotesClosed,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("end of stream"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::ClosedByCaller => f.write_str("closed by caller"),
            Self::VotesClosed => f.write_str("vote channel closed"),
        }
    }
}

/// Classifies the records of one session against its term snapshot.
pub struct Classifier {
    terms: TermSnapshot,
    votes: mpsc::Sender<VoteEvent>,
    sent: u64,
}

impl Classifier {
    pub fn new(terms: TermSnapshot, votes: mpsc::Sender<VoteEvent>) -> Self {
        Self {
            terms,
            votes,
            sent: 0,
        }
    }

    /// Votes handed to the channel so far.
    pub fn votes_sent(&self) -> u64 {
        self.sent
    }

    /// Read `body` until it ends, fails, or `handle` is closed.
    pub async fn run<S, B, E>(&mut self, body: S, handle: &StreamHandle) -> SessionEnd
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        futures_util::pin_mut!(body);
        let mut decoder = RecordDecoder::new();

        loop {
            loop {
                match decoder.next_record() {
                    Ok(Some(record)) => {
                        if let Err(end) = self.classify(&record).await {
                            return end;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return SessionEnd::Decode(e.to_string()),
                }
            }

            let next = tokio::select! {
                biased;
                _ = handle.closed() => return SessionEnd::ClosedByCaller,
                next = body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                None => {
                    if decoder.pending() > 0 {
                        debug!(bytes = decoder.pending(), "Discarding partial record at end of stream");
                    }
                    return SessionEnd::Eof;
                }
            }
        }
    }

    async fn classify(&mut self, record: &StreamRecord) -> Result<(), SessionEnd> {
        for term in matching_terms(&record.text, &self.terms) {
            debug!(term = %term, "vote");
            self.votes
                .send(VoteEvent::new(term.clone()))
                .await
                .map_err(|_| SessionEnd::VotesClosed)?;
            self.sent += 1;
        }
        Ok(())
    }
}
