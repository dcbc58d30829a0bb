//! Infrastructure layer: job stores, workers, handlers, config.

pub mod config;
pub mod handlers;
pub mod jobs;

pub use config::{AppConfig, ConfigError};
