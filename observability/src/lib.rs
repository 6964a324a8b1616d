//! Tracing/metrics bootstrap shared by the gateway binary.
//!
//! Kept deliberately small: a log-format switch plus an `EnvFilter`-driven
//! subscriber, and a Prometheus recorder for the handful of counters the
//! gateway emits. No OTLP span exporter — the access-control plane has no
//! downstream trace collector in scope, see DESIGN.md.

use anyhow::{anyhow, Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(anyhow!("unsupported log format: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "avika-gateway".into(),
            log_format: LogFormat::Pretty,
            log_level: "info".into(),
        }
    }
}

/// Install the global tracing subscriber. Idempotent failure is surfaced as
/// an error rather than panicking, so callers (including tests that may
/// init more than once) can decide how to handle it.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(config.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::Registry::default().with(env_filter);
    let result = match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .try_init(),
    };
    result.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Prometheus exporter wrapper returning rendered metrics text.
#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    pub fn install_with_defaults() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus recorder")?;
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format_variants() {
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert!(LogFormat::from_str("??").is_err());
    }
}
