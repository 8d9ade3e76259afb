//! Core adapter state: configuration, errors, metrics.

pub mod config;
pub mod error;
pub mod metrics;

pub use config::{AdapterConfig, AdapterContext, EndpointMode};
pub use error::{AdapterError, Result};
pub use metrics::Metrics;
