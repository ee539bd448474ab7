use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSection;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    Level(String),
    #[error("invalid log format: {0} (expected pretty or json)")]
    Format(String),
    #[error("logging already initialised: {0}")]
    Init(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self, LoggingError> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::Format(other.to_string())),
        }
    }
}

pub fn parse_level(level: &str) -> Result<Level, LoggingError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LoggingError::Level(level.to_string())),
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(section: &LoggingSection) -> Result<(), LoggingError> {
    let level = parse_level(&section.level)?;
    let format = LogFormat::parse(&section.format)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_ascii_lowercase()));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|err| LoggingError::Init(err.to_string()))
}
