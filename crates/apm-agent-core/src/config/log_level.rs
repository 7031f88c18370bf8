//! Log level configuration.
//!
//! Defines the `LogLevel` enum and provides parsing from strings
//! (case-insensitive) and lenient deserialization from environment values.
//!
//! # Default
//!
//! If no log level is specified or an invalid value is provided, the pipeline
//! defaults to **WARN**.

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::error;

/// Pipeline log level controlling verbosity of diagnostic output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Very serious errors that prevent normal operation.
    Error,
    /// Hazardous situations that may lead to errors. This is the default.
    #[default]
    Warn,
    /// Useful information about normal operations.
    Info,
    /// Lower priority information for debugging.
    Debug,
    /// Very low priority, extremely verbose information.
    Trace,
}

// Accepted spellings, most severe first.
const NAMES: [(&str, LogLevel); 5] = [
    ("error", LogLevel::Error),
    ("warn", LogLevel::Warn),
    ("info", LogLevel::Info),
    ("debug", LogLevel::Debug),
    ("trace", LogLevel::Trace),
];

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl LogLevel {
    /// Converts this `LogLevel` to a `tracing` level filter for subscriber
    /// installation.
    #[must_use]
    pub fn as_level_filter(self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        NAMES
            .iter()
            .find(|(name, _)| wanted.eq_ignore_ascii_case(name))
            .map(|&(_, level)| level)
            .ok_or_else(|| {
                format!(
                    "unrecognized log level '{s}', expected one of error, warn, info, debug, trace"
                )
            })
    }
}

/// Lenient deserialization: invalid or non-string input logs an error and
/// falls back to `Warn` so the pipeline can start with bad configuration.
impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;

        let level = match raw.as_str().map(LogLevel::from_str) {
            Some(Ok(level)) => level,
            Some(Err(reason)) => {
                error!("{reason}, falling back to WARN");
                LogLevel::Warn
            }
            None => {
                error!("log level must be a string, got {raw}, falling back to WARN");
                LogLevel::Warn
            }
        };
        Ok(level)
    }
}
