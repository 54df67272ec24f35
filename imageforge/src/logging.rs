//! Logging initialization.
//!
//! Structured logging via `tracing`, written to stdout in a single-line
//! format suitable for log shippers. The level comes from the `-log-level`
//! flag; `RUST_LOG` overrides it when set, which is handy for turning one
//! module up without redeploying.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level {level:?}: {source}")]
    InvalidLevel {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Initializes the global subscriber.
///
/// `level` is any `tracing` filter directive, usually just a level name
/// (`debug`, `info`, `warn`, `error`).
pub fn init(level: &str) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|source| LoggingError::InvalidLevel {
            level: level.to_string(),
            source,
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}
