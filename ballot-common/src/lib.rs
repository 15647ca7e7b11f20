//! Ballot Common - Shared types, utilities, and configuration for the Ballots services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - The message queue abstraction votes are published through
//! - Utility functions used across services

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod util;
pub mod validation;

pub use config::{
    Config, FeedAuthMode, FeedConfig, FeedSecrets, ObservabilityConfig, QueueConfig, StoreConfig,
    StreamConfig,
};
pub use error::{Error, Result};
pub use queue::{InMemoryQueue, MessageQueue, QueueBackend, QueueError, QueueResult};
pub use validation::{Validate, ValidationError, ValidationResult};
