//! Environment variable configuration source.
//!
//! Reads `APM_*` variables into a partial configuration and merges any set
//! values over the current configuration. Unset or empty variables leave the
//! existing value untouched; unparseable values are logged and skipped.

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

use crate::config::{
    log_level::LogLevel, sampling::RemoteParentSampling, split_list, Config, ConfigError,
    ConfigSource,
};
use crate::overlay;

#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

/// Partial configuration captured from the environment.
#[derive(Default)]
struct EnvConfig {
    app_name: Option<String>,
    entity_guid: Option<String>,
    account_id: Option<String>,
    primary_app_id: Option<String>,
    trusted_account_key: Option<String>,
    agent_run_id: Option<String>,
    log_level: Option<LogLevel>,
    distributed_tracing_enabled: Option<bool>,
    exclude_legacy_dt_header: Option<bool>,
    remote_parent_sampled: Option<RemoteParentSampling>,
    remote_parent_not_sampled: Option<RemoteParentSampling>,
    sampling_target: Option<u32>,
    span_events_enabled: Option<bool>,
    transaction_events_max_samples: Option<usize>,
    span_events_max_samples: Option<usize>,
    error_events_max_samples: Option<usize>,
    log_events_max_samples: Option<usize>,
    max_segments: Option<usize>,
    report_period_seconds: Option<u64>,
    attributes_include: Vec<String>,
    attributes_exclude: Vec<String>,
    transaction_events_include: Vec<String>,
    transaction_events_exclude: Vec<String>,
    transaction_trace_include: Vec<String>,
    transaction_trace_exclude: Vec<String>,
    span_events_include: Vec<String>,
    span_events_exclude: Vec<String>,
    error_events_include: Vec<String>,
    error_events_exclude: Vec<String>,
    log_events_include: Vec<String>,
    log_events_exclude: Vec<String>,
}

impl EnvConfig {
    fn from_env() -> Self {
        EnvConfig {
            app_name: non_empty_var("APM_APP_NAME"),
            entity_guid: non_empty_var("APM_ENTITY_GUID"),
            account_id: non_empty_var("APM_ACCOUNT_ID"),
            primary_app_id: non_empty_var("APM_PRIMARY_APP_ID"),
            trusted_account_key: non_empty_var("APM_TRUSTED_ACCOUNT_KEY"),
            agent_run_id: non_empty_var("APM_AGENT_RUN_ID"),
            log_level: parsed_var::<LogLevel>("APM_LOG_LEVEL"),
            distributed_tracing_enabled: bool_var("APM_DISTRIBUTED_TRACING_ENABLED"),
            exclude_legacy_dt_header: bool_var("APM_EXCLUDE_LEGACY_DT_HEADER"),
            remote_parent_sampled: parsed_var("APM_REMOTE_PARENT_SAMPLED"),
            remote_parent_not_sampled: parsed_var("APM_REMOTE_PARENT_NOT_SAMPLED"),
            sampling_target: parsed_var("APM_SAMPLING_TARGET"),
            span_events_enabled: bool_var("APM_SPAN_EVENTS_ENABLED"),
            transaction_events_max_samples: parsed_var("APM_TRANSACTION_EVENTS_MAX_SAMPLES"),
            span_events_max_samples: parsed_var("APM_SPAN_EVENTS_MAX_SAMPLES"),
            error_events_max_samples: parsed_var("APM_ERROR_EVENTS_MAX_SAMPLES"),
            log_events_max_samples: parsed_var("APM_LOG_EVENTS_MAX_SAMPLES"),
            max_segments: parsed_var("APM_MAX_SEGMENTS"),
            report_period_seconds: parsed_var("APM_REPORT_PERIOD_SECONDS"),
            attributes_include: list_var("APM_ATTRIBUTES_INCLUDE"),
            attributes_exclude: list_var("APM_ATTRIBUTES_EXCLUDE"),
            transaction_events_include: list_var("APM_TRANSACTION_EVENTS_ATTRIBUTES_INCLUDE"),
            transaction_events_exclude: list_var("APM_TRANSACTION_EVENTS_ATTRIBUTES_EXCLUDE"),
            transaction_trace_include: list_var("APM_TRANSACTION_TRACE_ATTRIBUTES_INCLUDE"),
            transaction_trace_exclude: list_var("APM_TRANSACTION_TRACE_ATTRIBUTES_EXCLUDE"),
            span_events_include: list_var("APM_SPAN_EVENTS_ATTRIBUTES_INCLUDE"),
            span_events_exclude: list_var("APM_SPAN_EVENTS_ATTRIBUTES_EXCLUDE"),
            error_events_include: list_var("APM_ERROR_EVENTS_ATTRIBUTES_INCLUDE"),
            error_events_exclude: list_var("APM_ERROR_EVENTS_ATTRIBUTES_EXCLUDE"),
            log_events_include: list_var("APM_LOG_EVENTS_ATTRIBUTES_INCLUDE"),
            log_events_exclude: list_var("APM_LOG_EVENTS_ATTRIBUTES_EXCLUDE"),
        }
    }
}

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let mut source = EnvConfig::from_env();

        overlay!(config, source, app_name);
        overlay!(config, source, entity_guid);
        overlay!(config, source, account_id);
        overlay!(config, source, primary_app_id);
        overlay!(config, source, trusted_account_key);
        overlay!(config, source, agent_run_id);
        overlay!(config, source, log_level);
        overlay!(config, source, distributed_tracing_enabled);
        overlay!(config, source, exclude_legacy_dt_header);
        overlay!(config, source, remote_parent_sampled);
        overlay!(config, source, remote_parent_not_sampled);
        overlay!(config, source, sampling_target);
        overlay!(config, source, span_events_enabled);
        overlay!(config, source, transaction_events_max_samples);
        overlay!(config, source, span_events_max_samples);
        overlay!(config, source, error_events_max_samples);
        overlay!(config, source, log_events_max_samples);
        overlay!(config, source, max_segments);
        overlay!(config, source, report_period_seconds);
        overlay!(config.attributes, include, source, attributes_include);
        overlay!(config.attributes, exclude, source, attributes_exclude);
        overlay!(
            config.transaction_events_attributes,
            include,
            source,
            transaction_events_include
        );
        overlay!(
            config.transaction_events_attributes,
            exclude,
            source,
            transaction_events_exclude
        );
        overlay!(
            config.transaction_trace_attributes,
            include,
            source,
            transaction_trace_include
        );
        overlay!(
            config.transaction_trace_attributes,
            exclude,
            source,
            transaction_trace_exclude
        );
        overlay!(
            config.span_events_attributes,
            include,
            source,
            span_events_include
        );
        overlay!(
            config.span_events_attributes,
            exclude,
            source,
            span_events_exclude
        );
        overlay!(
            config.error_events_attributes,
            include,
            source,
            error_events_include
        );
        overlay!(
            config.error_events_attributes,
            exclude,
            source,
            error_events_exclude
        );
        overlay!(
            config.log_events_attributes,
            include,
            source,
            log_events_include
        );
        overlay!(
            config.log_events_attributes,
            exclude,
            source,
            log_events_exclude
        );

        Ok(())
    }
}

/// Reads a variable, trimming whitespace; empty values count as unset.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads and parses a variable, logging and skipping unparseable values.
fn parsed_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = non_empty_var(name)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}: {}", name, e);
            None
        }
    }
}

fn bool_var(name: &str) -> Option<bool> {
    let raw = non_empty_var(name)?;
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        other => {
            warn!("Ignoring {}: expected a boolean, got {:?}", name, other);
            None
        }
    }
}

fn list_var(name: &str) -> Vec<String> {
    non_empty_var(name)
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    // Environment mutation is process-wide, so every variable this test
    // touches is unique to it.
    #[test]
    fn test_env_source_overrides_defaults() {
        std::env::set_var("APM_ACCOUNT_ID", "1349956");
        std::env::set_var("APM_REMOTE_PARENT_NOT_SAMPLED", "always_on");
        std::env::set_var("APM_SPAN_EVENTS_MAX_SAMPLES", "500");
        std::env::set_var("APM_ATTRIBUTES_EXCLUDE", "request.headers.*, password");

        let config = ConfigBuilder::default().add_source(EnvConfigSource).build();

        assert_eq!(config.account_id, "1349956");
        // No explicit trust key: account id is trusted
        assert_eq!(config.trusted_account_key, "1349956");
        assert_eq!(
            config.remote_parent_not_sampled,
            RemoteParentSampling::AlwaysOn
        );
        assert_eq!(config.span_events_max_samples, 500);
        assert_eq!(
            config.attributes.exclude,
            vec!["request.headers.*".to_string(), "password".to_string()]
        );

        std::env::remove_var("APM_ACCOUNT_ID");
        std::env::remove_var("APM_REMOTE_PARENT_NOT_SAMPLED");
        std::env::remove_var("APM_SPAN_EVENTS_MAX_SAMPLES");
        std::env::remove_var("APM_ATTRIBUTES_EXCLUDE");
    }

    #[test]
    fn test_unparseable_values_are_skipped() {
        std::env::set_var("APM_MAX_SEGMENTS", "lots");
        std::env::set_var("APM_DISTRIBUTED_TRACING_ENABLED", "maybe");

        let config = ConfigBuilder::default().add_source(EnvConfigSource).build();

        assert_eq!(config.max_segments, 1_000);
        assert!(config.distributed_tracing_enabled);

        std::env::remove_var("APM_MAX_SEGMENTS");
        std::env::remove_var("APM_DISTRIBUTED_TRACING_ENABLED");
    }
}
