//! Configuration management for Ballots services.
//!
//! All services share a unified configuration file at `~/.ballots/config.json`
//! (override the location with `BALLOTS_CONFIG`).
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Feed credentials (→ secrets.feed.*)
//! - `SP_TWITTER_KEY` → secrets.feed.consumer_key
//! - `SP_TWITTER_SECRET` → secrets.feed.consumer_secret
//! - `SP_TWITTER_ACCESSTOKEN` → secrets.feed.access_token
//! - `SP_TWITTER_ACCESSSECRET` → secrets.feed.access_secret
//! - `BEARER_TOKEN` → secrets.feed.bearer_token
//!
//! ## Infrastructure
//! - `BALLOTS_FEED_ENDPOINT` → feed.endpoint
//! - `BALLOTS_DB_PATH` → store.path
//! - `BALLOTS_QUEUE_URL` → queue.url
//! - `BALLOTS_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::QueueBackend;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".ballots"),
        |dirs| dirs.home_dir().join(".ballots"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var_os("BALLOTS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("config.json"))
}

// ============================================================================
// Feed Configuration
// ============================================================================

/// How requests to the streaming feed are authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedAuthMode {
    /// OAuth 1.0a request signing (consumer + access credentials).
    #[default]
    OAuth1,
    /// Static bearer token.
    Bearer,
}

/// Streaming feed endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Filter endpoint the track request is POSTed to
    #[serde(default = "default_feed_endpoint")]
    pub endpoint: String,

    /// Authorization scheme the endpoint expects
    #[serde(default)]
    pub auth: FeedAuthMode,

    /// TCP/TLS connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum characters of an error diagnostic line kept in logs
    #[serde(default = "default_diagnostic_max_chars")]
    pub diagnostic_max_chars: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: default_feed_endpoint(),
            auth: FeedAuthMode::default(),
            connect_timeout_secs: default_connect_timeout(),
            diagnostic_max_chars: default_diagnostic_max_chars(),
        }
    }
}

fn default_feed_endpoint() -> String {
    "https://stream.twitter.com/1.1/statuses/filter.json".into()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_diagnostic_max_chars() -> usize {
    200
}

// ============================================================================
// Secrets Configuration
// ============================================================================

/// Grouped secrets configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Streaming feed credentials
    #[serde(default)]
    pub feed: FeedSecrets,
}

/// Streaming feed credentials.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct FeedSecrets {
    #[serde(default)]
    pub consumer_key: Option<String>,
    #[serde(default)]
    pub consumer_secret: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_secret: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl std::fmt::Debug for FeedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mask(v: &Option<String>) -> &'static str {
            if v.is_some() {
                "<set>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("FeedSecrets")
            .field("consumer_key", &mask(&self.consumer_key))
            .field("consumer_secret", &mask(&self.consumer_secret))
            .field("access_token", &mask(&self.access_token))
            .field("access_secret", &mask(&self.access_secret))
            .field("bearer_token", &mask(&self.bearer_token))
            .finish()
    }
}

// ============================================================================
// Stream / Store / Queue Configuration
// ============================================================================

/// Stream supervisor timing and buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Wait between supervisor iterations (term reload + reconnect)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Forced connection recycling period
    #[serde(default = "default_recycle_interval")]
    pub recycle_interval_secs: u64,

    /// Vote channel capacity between classifier and publisher
    #[serde(default = "default_vote_buffer")]
    pub vote_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            recycle_interval_secs: default_recycle_interval(),
            vote_buffer: default_vote_buffer(),
        }
    }
}

fn default_poll_interval() -> u64 {
    2
}

fn default_recycle_interval() -> u64 {
    60
}

fn default_vote_buffer() -> usize {
    1
}

/// Poll store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding poll definitions
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    config_dir().join("ballots.db")
}

/// Message queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue backend
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,

    /// Backend URL (redis://host:port)
    #[serde(default = "default_queue_url")]
    pub url: String,

    /// Channel prefix for namespacing
    #[serde(default)]
    pub channel_prefix: String,

    /// Topic votes are published to
    #[serde(default = "default_vote_topic")]
    pub topic: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            url: default_queue_url(),
            channel_prefix: String::new(),
            topic: default_vote_topic(),
        }
    }
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Redis
}

fn default_queue_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_vote_topic() -> String {
    crate::queue::topics::VOTES.into()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets clamped to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default)]
    pub feed: FeedConfig,

    /// Grouped secrets
    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let feed = &mut self.secrets.feed;
        if let Some(v) = lookup("SP_TWITTER_KEY") {
            feed.consumer_key = Some(v);
        }
        if let Some(v) = lookup("SP_TWITTER_SECRET") {
            feed.consumer_secret = Some(v);
        }
        if let Some(v) = lookup("SP_TWITTER_ACCESSTOKEN") {
            feed.access_token = Some(v);
        }
        if let Some(v) = lookup("SP_TWITTER_ACCESSSECRET") {
            feed.access_secret = Some(v);
        }
        if let Some(v) = lookup("BEARER_TOKEN") {
            feed.bearer_token = Some(v);
        }

        if let Some(endpoint) = lookup("BALLOTS_FEED_ENDPOINT") {
            self.feed.endpoint = endpoint;
        }
        if let Some(path) = lookup("BALLOTS_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("BALLOTS_QUEUE_URL") {
            self.queue.url = url;
        }
        if let Some(level) = lookup("BALLOTS_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    // =========================================================================
    // Duration accessors
    // =========================================================================

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.stream.poll_interval_secs)
    }

    pub fn recycle_interval(&self) -> Duration {
        Duration::from_secs(self.stream.recycle_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.feed.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(
            config.feed.endpoint,
            "https://stream.twitter.com/1.1/statuses/filter.json"
        );
        assert_eq!(config.feed.auth, FeedAuthMode::OAuth1);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.recycle_interval(), Duration::from_secs(60));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.stream.vote_buffer, 1);
        assert_eq!(config.queue.topic, "votes");
        assert_eq!(config.queue.backend, QueueBackend::Redis);
        assert!(config.store.path.ends_with("ballots.db"));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "feed": {{ "auth": "bearer" }},
                "stream": {{ "poll_interval_secs": 5 }},
                "queue": {{ "backend": "memory" }},
                "observability": {{ "level": "debug", "format": "json" }}
            }}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.feed.auth, FeedAuthMode::Bearer);
        assert_eq!(config.stream.poll_interval_secs, 5);
        assert_eq!(config.stream.recycle_interval_secs, 60);
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Config::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("SP_TWITTER_KEY", "ck"),
            ("SP_TWITTER_SECRET", "cs"),
            ("SP_TWITTER_ACCESSTOKEN", "at"),
            ("SP_TWITTER_ACCESSSECRET", "as"),
            ("BEARER_TOKEN", "bt"),
            ("BALLOTS_DB_PATH", "/tmp/polls.db"),
            ("BALLOTS_LOG_LEVEL", "trace"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.secrets.feed.consumer_key.as_deref(), Some("ck"));
        assert_eq!(config.secrets.feed.consumer_secret.as_deref(), Some("cs"));
        assert_eq!(config.secrets.feed.access_token.as_deref(), Some("at"));
        assert_eq!(config.secrets.feed.access_secret.as_deref(), Some("as"));
        assert_eq!(config.secrets.feed.bearer_token.as_deref(), Some("bt"));
        assert_eq!(config.store.path, PathBuf::from("/tmp/polls.db"));
        assert_eq!(config.observability.log_level, "trace");
        assert_eq!(config.queue.url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_secrets_debug_is_masked() {
        let secrets = FeedSecrets {
            consumer_key: Some("very-secret-key".into()),
            ..Default::default()
        };
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("very-secret-key"));
        assert!(rendered.contains("<set>"));
        assert!(rendered.contains("<unset>"));
    }
}
