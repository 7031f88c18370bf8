//! Pipeline configuration.
//!
//! Configuration starts from hard-coded defaults and is overlaid by any
//! number of sources, applied in registration order. The only built-in
//! source reads `APM_*` environment variables.
//!
//! ## Edge Cases and Behaviors
//!
//! - **Trusted account key**: When unset, falls back to the account id, so
//!   single-account installations need no extra configuration.
//! - **Invalid enum values**: Logged and replaced by the documented default;
//!   configuration never aborts startup.
//! - **Whitespace**: String values are trimmed; values that are empty after
//!   trimming are treated as unset.
//! - **Zero intervals**: A report period of `0` falls back to the default
//!   (60 seconds).

pub mod env;
pub mod log_level;
pub mod sampling;

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::{log_level::LogLevel, sampling::RemoteParentSampling};

/// Applies a captured value over the running configuration.
///
/// The three-argument form moves an `Option` field over the matching config
/// field when it is `Some`; the four-argument form moves a list field when
/// it is non-empty.
#[macro_export]
macro_rules! overlay {
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = $source.$field.take() {
            $config.$field = value;
        }
    };
    ($target:expr, $field:ident, $source:expr, $source_field:ident) => {
        if !$source.$source_field.is_empty() {
            $target.$field = ::std::mem::take(&mut $source.$source_field);
        }
    };
}

/// Error produced by a configuration source.
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    /// The source was present but could not be interpreted.
    #[error("could not read configuration: {0}")]
    Invalid(String),
}

/// A provider of configuration values, layered over the defaults.
#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn build(&mut self) -> Config {
        let mut loaded = 0usize;
        for source in &self.sources {
            if let Err(error) = source.load(&mut self.config) {
                error!("configuration source failed: {error}");
            } else {
                loaded += 1;
            }
        }

        if loaded == 0 && !self.sources.is_empty() {
            debug!("no configuration source loaded, continuing with defaults");
        }

        // Single-account installations trust their own account by default
        if self.config.trusted_account_key.is_empty() {
            self.config
                .trusted_account_key
                .clone_from(&self.config.account_id);
        }

        if self.config.app_name.trim().is_empty() {
            self.config.app_name = default_app_name();
        }

        if self.config.report_period_seconds == 0 {
            self.config.report_period_seconds = default_report_period_seconds();
        }

        self.config.clone()
    }
}

/// Include/exclude rule lists for one attribute destination (or the global
/// chain when used for the `attributes` field).
///
/// Rules are exact attribute keys, optionally ending in `*` to match a key
/// prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AttributeRuleList {
    #[serde(deserialize_with = "deserialize_string_list")]
    pub include: Vec<String>,
    #[serde(deserialize_with = "deserialize_string_list")]
    pub exclude: Vec<String>,
}

/// Pipeline configuration.
///
/// Built from defaults plus any number of [`ConfigSource`]s. All fields have
/// working defaults; an empty environment yields a usable (if anonymous)
/// configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    /// Application name reported as the entity name in linking metadata.
    pub app_name: String,
    /// Entity identifier assigned by the backend, if known.
    pub entity_guid: String,
    /// Account id this process reports into.
    pub account_id: String,
    /// Application id within the account.
    pub primary_app_id: String,
    /// Accounts whose inbound trace context is trusted. Falls back to
    /// `account_id` when unset.
    pub trusted_account_key: String,
    /// Run identifier included in every harvest envelope.
    pub agent_run_id: String,
    pub log_level: LogLevel,
    pub distributed_tracing_enabled: bool,
    /// Suppress the legacy single-header payload on outbound requests and
    /// emit only the W3C header pair.
    pub exclude_legacy_dt_header: bool,
    /// Override applied when the remote parent was sampled.
    pub remote_parent_sampled: RemoteParentSampling,
    /// Override applied when the remote parent was not sampled.
    pub remote_parent_not_sampled: RemoteParentSampling,
    /// Transactions sampled per report period when no remote decision exists.
    pub sampling_target: u32,
    pub span_events_enabled: bool,
    pub transaction_events_max_samples: usize,
    pub span_events_max_samples: usize,
    pub error_events_max_samples: usize,
    pub log_events_max_samples: usize,
    /// Segments materialized as spans per transaction, beyond which only
    /// always-keep segments survive.
    pub max_segments: usize,
    pub report_period_seconds: u64,
    /// Global attribute rules, applied to every destination.
    pub attributes: AttributeRuleList,
    pub transaction_events_attributes: AttributeRuleList,
    pub transaction_trace_attributes: AttributeRuleList,
    pub span_events_attributes: AttributeRuleList,
    pub error_events_attributes: AttributeRuleList,
    pub log_events_attributes: AttributeRuleList,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_name: default_app_name(),
            entity_guid: String::new(),
            account_id: String::new(),
            primary_app_id: String::new(),
            trusted_account_key: String::new(),
            agent_run_id: String::new(),
            log_level: LogLevel::default(),
            distributed_tracing_enabled: true,
            exclude_legacy_dt_header: false,
            remote_parent_sampled: RemoteParentSampling::Default,
            remote_parent_not_sampled: RemoteParentSampling::Default,
            sampling_target: 10,
            span_events_enabled: true,
            transaction_events_max_samples: 10_000,
            span_events_max_samples: 2_000,
            error_events_max_samples: 100,
            log_events_max_samples: 10_000,
            max_segments: 1_000,
            report_period_seconds: default_report_period_seconds(),
            attributes: AttributeRuleList::default(),
            transaction_events_attributes: AttributeRuleList::default(),
            transaction_trace_attributes: AttributeRuleList::default(),
            span_events_attributes: AttributeRuleList::default(),
            error_events_attributes: AttributeRuleList::default(),
            log_events_attributes: AttributeRuleList::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from defaults plus the process environment.
    #[must_use]
    pub fn from_env() -> Config {
        ConfigBuilder::default()
            .add_source(env::EnvConfigSource)
            .build()
    }

    #[must_use]
    pub fn report_period(&self) -> Duration {
        Duration::from_secs(self.report_period_seconds)
    }
}

fn default_app_name() -> String {
    "Application".to_string()
}

fn default_report_period_seconds() -> u64 {
    60
}

/// Deserializes comma-separated strings into a list, trimming whitespace and
/// skipping empty entries. A JSON array of strings is also accepted.
pub fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(split_list(&s)),
        serde_json::Value::Array(entries) => Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                serde_json::Value::String(s) => {
                    let trimmed = s.trim().to_string();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(trimmed)
                    }
                }
                other => {
                    error!("Expected a string in attribute rule list, got {:?}", other);
                    None
                }
            })
            .collect()),
        other => {
            error!("Expected a string or array for list, got {:?}", other);
            Ok(Vec::new())
        }
    }
}

/// Splits a comma-separated value into trimmed, non-empty entries.
pub(crate) fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}
