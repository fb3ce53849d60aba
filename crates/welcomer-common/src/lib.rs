//! Welcomer Common - Shared types and utilities
//!
//! This crate provides the configuration, error definitions, request/record
//! types and the metrics collector used across all welcomer-images components.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::{CacheKind, DriftSnapshot, ImageMetrics, Route};
pub use types::*;
