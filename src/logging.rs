//! Logging setup.
//!
//! The library only emits `tracing` events. Binaries and tests that want
//! to see them call [`init_logging`] once.

use std::str::FromStr;

use tracing::Level;

use crate::config::LoggingConfig;
use crate::error::{SegmentError, SegmentResult};

/// Parses a level name such as `"info"` or `"DEBUG"`.
pub fn parse_level(level: &str) -> SegmentResult<Level> {
    Level::from_str(level.trim()).map_err(|_| SegmentError::Config {
        reason: format!(
            "unknown log level '{level}', expected one of error, warn, info, debug, trace"
        ),
    })
}

/// Installs a global fmt subscriber at the configured level.
///
/// Returns `Ok(false)` if a global subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> SegmentResult<bool> {
    let level = parse_level(&config.level)?;
    Ok(tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok())
}
