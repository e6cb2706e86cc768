//! Metrics recorder initialization and configuration.

use std::net::SocketAddr;

use tracing::info;

use crate::Result;

/// Configuration for the metrics system.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorderConfig {
    /// Whether metrics collection is enabled
    pub enabled: bool,
    /// Address for the Prometheus scrape endpoint. Without one, metrics are
    /// recorded but not served.
    pub listen: Option<SocketAddr>,
    /// Global labels to add to all metrics
    pub global_labels: Vec<(String, String)>,
}

/// Initialize the metrics system.
///
/// Call once at startup, from within a tokio runtime. When the `prometheus`
/// feature is disabled this only logs, and the facade macros stay no-ops.
///
/// # Errors
///
/// Returns an error if the exporter fails to build or bind.
pub fn init_metrics(config: MetricsRecorderConfig) -> Result<()> {
    if !config.enabled {
        info!("Metrics collection is disabled");
        return Ok(());
    }

    #[cfg(feature = "prometheus")]
    {
        let listen = config.listen;
        init_prometheus(config)?;
        info!(listen = ?listen, "Prometheus metrics exporter initialized");
        Ok(())
    }

    #[cfg(not(feature = "prometheus"))]
    {
        info!(listen = ?config.listen, "Metrics feature not enabled at compile time");
        Ok(())
    }
}

#[cfg(feature = "prometheus")]
fn init_prometheus(config: MetricsRecorderConfig) -> Result<()> {
    use {
        crate::{buckets, cron},
        metrics_exporter_prometheus::{Matcher, PrometheusBuilder},
    };

    let mut builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(cron::JOB_LATENCY_SECONDS.to_string()),
        &buckets::JOB_LATENCY,
    )?;

    for (key, value) in config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    match config.listen {
        Some(addr) => builder.with_http_listener(addr).install()?,
        None => {
            builder.install_recorder()?;
        },
    }
    Ok(())
}
