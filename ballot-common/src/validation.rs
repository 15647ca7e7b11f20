//! Configuration validation for Ballots services.
//!
//! Missing feed credentials are the one startup condition that must stop
//! the process before any worker is spawned.

use thiserror::Error;

use crate::config::{
    Config, FeedAuthMode, FeedConfig, FeedSecrets, ObservabilityConfig, StreamConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.feed.validate() {
            errors.push(e);
        }

        if let Err(e) = self.secrets.feed.validate_for(self.feed.auth) {
            errors.push(e);
        }

        if let Err(e) = self.stream.validate() {
            errors.push(e);
        }

        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        if self.queue.topic.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "queue.topic".into(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load with environment overrides and validate.
    pub fn load_and_validate() -> crate::Result<Self> {
        Self::load_with_env()
            .map_err(|e| crate::Error::Config(format!("{e:#}")))?
            .validated()
    }

    /// Return `self` if it validates, otherwise a [`crate::Error::Config`].
    pub fn validated(self) -> crate::Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

impl From<ValidationError> for crate::Error {
    fn from(err: ValidationError) -> Self {
        Self::Config(err.to_string())
    }
}

impl Validate for FeedConfig {
    fn validate(&self) -> ValidationResult<()> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| ValidationError::InvalidValue {
            field: "feed.endpoint".into(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidValue {
                field: "feed.endpoint".into(),
                reason: format!("unsupported scheme: {}", url.scheme()),
            });
        }

        if self.connect_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "feed.connect_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

impl FeedSecrets {
    /// Validate that the credentials the auth mode needs are present.
    pub fn validate_for(&self, mode: FeedAuthMode) -> ValidationResult<()> {
        let required: Vec<(&str, &Option<String>)> = match mode {
            FeedAuthMode::OAuth1 => vec![
                ("secrets.feed.consumer_key", &self.consumer_key),
                ("secrets.feed.consumer_secret", &self.consumer_secret),
                ("secrets.feed.access_token", &self.access_token),
                ("secrets.feed.access_secret", &self.access_secret),
            ],
            FeedAuthMode::Bearer => vec![("secrets.feed.bearer_token", &self.bearer_token)],
        };

        let mut missing: Vec<ValidationError> = required
            .into_iter()
            .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(field, _)| ValidationError::MissingField {
                field: field.to_string(),
            })
            .collect();

        match missing.len() {
            0 => Ok(()),
            1 => Err(missing.remove(0)),
            _ => Err(ValidationError::Multiple(missing)),
        }
    }
}

impl Validate for StreamConfig {
    fn validate(&self) -> ValidationResult<()> {
        let positive: [(&str, u64); 3] = [
            ("stream.poll_interval_secs", self.poll_interval_secs),
            ("stream.recycle_interval_secs", self.recycle_interval_secs),
            ("stream.vote_buffer", self.vote_buffer as u64),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(ValidationError::InvalidValue {
                    field: field.into(),
                    reason: "must be greater than 0".into(),
                });
            }
        }

        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}
