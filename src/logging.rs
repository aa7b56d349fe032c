//! Tracing subscriber setup for binaries and tests embedding the crate.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::AppError;

const DEFAULT_LOG_FILTER: &str = "sf_bulk_sync=info";

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directives; `RUST_LOG`, then `sf_bulk_sync=info` when unset.
    pub filter: Option<String>,
    /// Colored output.
    pub ansi: bool,
}

/// Installs a stderr `fmt` subscriber.
///
/// # Errors
///
/// - `AppError::Config` - the filter directives do not parse
/// - `AppError::Internal` - a global subscriber is already installed
pub fn init_logging(config: LogConfig) -> Result<(), AppError> {
    let filter = build_filter(config.filter.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(config.ansi)
                .with_target(false),
        )
        .with(filter)
        .try_init()
        .map_err(|e| AppError::Internal(format!("Failed to install log subscriber: {}", e)))
}

fn build_filter(explicit: Option<&str>) -> Result<EnvFilter, AppError> {
    match explicit {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| AppError::Config(format!("Invalid log filter: {}", e))),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}
