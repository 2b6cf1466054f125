//! # rsh-telemetry
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` built from a
//! default level plus per-module overrides (`RUST_LOG` wins when set), and a
//! fmt layer in JSON or human-readable form.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown log level: {0}")]
    InvalidLevel(String),

    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Output encoding of log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Where log lines go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogTarget {
    #[default]
    Stdout,
    Stderr,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "rsh_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
    pub target: LogTarget,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
            target: LogTarget::Stdout,
        }
    }
}

impl TelemetryConfig {
    /// Server defaults: JSON lines on stdout.
    pub fn server(level: &str) -> Result<Self, TelemetryError> {
        Ok(Self {
            log_level: parse_level(level)?,
            ..Self::default()
        })
    }

    /// Client defaults: compact text on stderr so stdout stays clean for
    /// command output.
    pub fn client(level: &str) -> Result<Self, TelemetryError> {
        Ok(Self {
            log_level: parse_level(level)?,
            format: LogFormat::Pretty,
            target: LogTarget::Stderr,
            ..Self::default()
        })
    }

    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }

    /// The `EnvFilter` directive string, e.g. `info,rsh_engine=debug`.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

pub fn parse_level(level: &str) -> Result<Level, TelemetryError> {
    Level::from_str(level.trim()).map_err(|_| TelemetryError::InvalidLevel(level.to_string()))
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let writer = match config.target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true)
                    .with_writer(writer),
            )
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(writer),
            )
            .try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_includes_module_overrides() {
        let config = TelemetryConfig::default()
            .with_module_level("rsh_engine", Level::DEBUG)
            .with_module_level("rsh_server", Level::TRACE);
        assert_eq!(config.filter_directive(), "info,rsh_engine=debug,rsh_server=trace");
    }

    #[test]
    fn client_defaults_to_stderr_text() {
        let config = TelemetryConfig::client("warn").unwrap();
        assert_eq!(config.log_level, Level::WARN);
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.target, LogTarget::Stderr);
    }

    #[test]
    fn server_defaults_to_json() {
        let config = TelemetryConfig::server("DEBUG").unwrap();
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn bad_level_is_rejected() {
        assert!(matches!(
            TelemetryConfig::server("loud"),
            Err(TelemetryError::InvalidLevel(_))
        ));
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
