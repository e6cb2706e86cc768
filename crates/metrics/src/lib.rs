//! Metrics for fleetcron.
//!
//! Code records through the `metrics` crate facade, which is a no-op until a
//! recorder is installed. With the `prometheus` feature, [`init_metrics`] can
//! serve the metrics over HTTP for scraping.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fleetcron_metrics::{counter, cron, labels};
//!
//! counter!(cron::JOB_TIMEOUT, labels::JOB => "nightly").increment(1);
//! ```
//!
//! # Features
//!
//! - `prometheus`: Prometheus exporter with an HTTP scrape endpoint

mod definitions;
pub mod error;
mod recorder;

pub use {
    definitions::*,
    error::{Error, Result},
    recorder::{MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
