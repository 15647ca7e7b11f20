//! Tracked terms and the term source.
//!
//! A tracked term is a lower-cased poll option. The term set is rebuilt from
//! the poll store on every supervisor iteration; a streaming session works
//! from an immutable snapshot taken when it was opened.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::store::{PollStore, StoreResult};

/// A lower-cased keyword derived from a poll option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedTerm(String);

impl TrackedTerm {
    /// Build a term from a raw poll option.
    pub fn new(option: &str) -> Self {
        Self(option.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hashtag form used in the feed's track filter.
    pub fn hashtag(&self) -> String {
        format!("#{}", self.0)
    }
}

impl fmt::Display for TrackedTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TrackedTerm {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Immutable term snapshot shared by one streaming session.
pub type TermSnapshot = Arc<[TrackedTerm]>;

/// A matched term, produced by the classifier and consumed once by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteEvent {
    pub term: TrackedTerm,
}

impl VoteEvent {
    pub fn new(term: TrackedTerm) -> Self {
        Self { term }
    }

    /// Queue payload: the raw term bytes.
    pub fn payload(&self) -> &[u8] {
        self.term.as_str().as_bytes()
    }
}

/// Loads the tracked-term set from the poll store.
#[derive(Clone)]
pub struct TermSource {
    store: Arc<dyn PollStore>,
}

impl TermSource {
    pub fn new(store: Arc<dyn PollStore>) -> Self {
        Self { store }
    }

    /// Concatenate every poll's options, lower-cased, keeping duplicates.
    ///
    /// No polls is an empty set, not an error.
    pub async fn load_terms(&self) -> StoreResult<Vec<TrackedTerm>> {
        let polls = self.store.list_polls().await?;

        let terms: Vec<TrackedTerm> = polls
            .iter()
            .flat_map(|poll| poll.options.iter())
            .map(|option| TrackedTerm::new(option))
            .collect();

        debug!(polls = polls.len(), terms = terms.len(), "Terms loaded");
        Ok(terms)
    }
}

/// Hashtag list in request order (`#cats`, `#dogs`).
pub fn hashtags(terms: &[TrackedTerm]) -> Vec<String> {
    terms.iter().map(TrackedTerm::hashtag).collect()
}

/// The `track` form value: comma-joined hashtags.
pub fn track_parameter(terms: &[TrackedTerm]) -> String {
    hashtags(terms).join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryPollStore, Poll};

    fn poll(options: &[&str]) -> Poll {
        Poll::new("poll", options.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_load_terms_concatenates_and_lowercases() {
        let store = InMemoryPollStore::with_polls(vec![
            poll(&["Cats", "DOGS"]),
            poll(&["Tea", "cats"]),
        ]);
        let source = TermSource::new(Arc::new(store));

        let terms = source.load_terms().await.unwrap();
        let terms: Vec<&str> = terms.iter().map(TrackedTerm::as_str).collect();
        assert_eq!(terms, vec!["cats", "dogs", "tea", "cats"]);
    }

    #[tokio::test]
    async fn test_load_terms_empty_store() {
        let source = TermSource::new(Arc::new(InMemoryPollStore::new()));
        assert!(source.load_terms().await.unwrap().is_empty());
    }

    #[test]
    fn test_track_parameter() {
        let terms = vec![TrackedTerm::new("Cats"), TrackedTerm::new("dogs")];
        assert_eq!(track_parameter(&terms), "#cats,#dogs");
        assert_eq!(track_parameter(&[]), "");
    }

    #[test]
    fn test_vote_payload_is_raw_term() {
        let vote = VoteEvent::new(TrackedTerm::new("Ice Cream"));
        assert_eq!(vote.payload(), b"ice cream");
    }
}
