// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unscoped metric table.
//!
//! Aggregates named metric series into six-field summaries and drains them
//! into the harvest envelope. Supportability counters for the tracing API,
//! payload acceptance outcomes, and caller/transport durations all land here.

use std::collections::HashMap;

use serde_json::{json, Value};

/// Aggregated values for one metric series.
///
/// Serialized into the harvest envelope as
/// `[count, total, exclusive, min, max, sum_of_squares]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MetricSummary {
    pub count: u64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl MetricSummary {
    /// Folds one timing observation into the summary.
    fn record(&mut self, value: f64, exclusive: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.total += value;
        self.exclusive += exclusive;
        self.sum_of_squares += value * value;
    }

    /// Folds a count-only observation, leaving the value fields untouched.
    fn increment(&mut self) {
        self.count += 1;
    }

    /// Folds another summary for the same series into this one.
    fn absorb(&mut self, other: &MetricSummary) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        self.sum_of_squares += other.sum_of_squares;
    }

    fn as_value(self) -> Value {
        json!([
            self.count,
            self.total,
            self.exclusive,
            self.min,
            self.max,
            self.sum_of_squares
        ])
    }
}

/// Identity of one metric series. The scope is reserved for metrics reported
/// against a transaction name; supportability counters are unscoped.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricId {
    pub name: String,
    pub scope: Option<String>,
}

impl MetricId {
    fn as_value(&self) -> Value {
        match &self.scope {
            Some(scope) => json!({ "name": self.name, "scope": scope }),
            None => json!({ "name": self.name }),
        }
    }
}

/// Table of metric series accumulated over one harvest window.
#[derive(Debug, Default)]
pub struct MetricTable {
    metrics: HashMap<MetricId, MetricSummary>,
}

impl MetricTable {
    #[must_use]
    pub fn new() -> Self {
        MetricTable::default()
    }

    /// Adds a count-only sample to the unscoped series `name`.
    pub fn increment(&mut self, name: &str) {
        self.entry(name).increment();
    }

    /// Adds a timing sample (seconds) to the unscoped series `name`.
    pub fn record_duration(&mut self, name: &str, value: f64, exclusive: f64) {
        self.entry(name).record(value, exclusive);
    }

    fn entry(&mut self, name: &str) -> &mut MetricSummary {
        self.metrics
            .entry(MetricId {
                name: name.to_string(),
                scope: None,
            })
            .or_default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<MetricSummary> {
        self.metrics
            .get(&MetricId {
                name: name.to_string(),
                scope: None,
            })
            .copied()
    }

    /// Count of the unscoped series `name`, zero when absent. Convenient for
    /// supportability assertions.
    #[must_use]
    pub fn count(&self, name: &str) -> u64 {
        self.get(name).map_or(0, |summary| summary.count)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Drains the table, leaving it empty for the next window.
    pub fn take(&mut self) -> HashMap<MetricId, MetricSummary> {
        std::mem::take(&mut self.metrics)
    }

    /// Folds a drained table into this one. Transactions buffer their own
    /// counters and merge them here at end, one lock acquisition per
    /// transaction.
    pub fn merge(&mut self, drained: HashMap<MetricId, MetricSummary>) {
        for (id, summary) in drained {
            self.metrics.entry(id).or_default().absorb(&summary);
        }
    }

    /// Builds the metric envelope for one harvest window and resets the
    /// table.
    ///
    /// Envelope shape:
    /// `[agent_run_id, start, stop, [[{"name": N}, [count, total, exclusive,
    /// min, max, sum_of_squares]], ...]]`
    pub fn flush_envelope(&mut self, agent_run_id: &str, start: u64, stop: u64) -> Value {
        let drained = self.take();
        let mut data: Vec<Value> = drained
            .iter()
            .map(|(id, summary)| json!([id.as_value(), summary.as_value()]))
            .collect();
        // Deterministic envelope ordering for downstream diffing
        data.sort_by(|a, b| a[0].to_string().cmp(&b[0].to_string()));
        json!([agent_run_id, start, stop, data])
    }
}

/// Exact metric names recorded by the pipeline.
pub mod names {
    pub const ACCEPT_PAYLOAD_SUCCESS: &str = "Supportability/DistributedTrace/AcceptPayload/Success";
    pub const ACCEPT_PAYLOAD_EXCEPTION: &str =
        "Supportability/DistributedTrace/AcceptPayload/Exception";
    pub const ACCEPT_PAYLOAD_PARSE_EXCEPTION: &str =
        "Supportability/DistributedTrace/AcceptPayload/ParseException";
    pub const ACCEPT_PAYLOAD_IGNORED_MULTIPLE: &str =
        "Supportability/DistributedTrace/AcceptPayload/Ignored/Multiple";
    pub const ACCEPT_PAYLOAD_IGNORED_MAJOR_VERSION: &str =
        "Supportability/DistributedTrace/AcceptPayload/Ignored/MajorVersion";
    pub const ACCEPT_PAYLOAD_IGNORED_UNTRUSTED_ACCOUNT: &str =
        "Supportability/DistributedTrace/AcceptPayload/Ignored/UntrustedAccount";
    pub const ACCEPT_PAYLOAD_IGNORED_CREATE_BEFORE_ACCEPT: &str =
        "Supportability/DistributedTrace/AcceptPayload/Ignored/CreateBeforeAccept";
    pub const CREATE_PAYLOAD_SUCCESS: &str = "Supportability/DistributedTrace/CreatePayload/Success";
    pub const TRACE_CONTEXT_ACCEPT_SUCCESS: &str = "Supportability/TraceContext/Accept/Success";
    pub const TRACE_CONTEXT_CREATE_SUCCESS: &str = "Supportability/TraceContext/Create/Success";
    pub const TRACE_STATE_NO_NR_ENTRY: &str = "Supportability/TraceContext/TraceState/NoNrEntry";
    pub const TRACE_STATE_INVALID_NR_ENTRY: &str =
        "Supportability/TraceContext/TraceState/InvalidNrEntry";

    /// Supportability counter for one public API function.
    #[must_use]
    pub fn api(function: &str) -> String {
        format!("Supportability/api/{function}")
    }

    /// Rollup series for time spent in transactions started by a remote
    /// caller.
    #[must_use]
    pub fn duration_by_caller(
        parent_type: &str,
        account: &str,
        app: &str,
        transport: &str,
    ) -> String {
        format!("DurationByCaller/{parent_type}/{account}/{app}/{transport}/all")
    }

    /// Rollup series for the time a request spent in transit before this
    /// transaction started.
    #[must_use]
    pub fn transport_duration(
        parent_type: &str,
        account: &str,
        app: &str,
        transport: &str,
    ) -> String {
        format!("TransportDuration/{parent_type}/{account}/{app}/{transport}/all")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_is_count_only() {
        let mut table = MetricTable::new();
        table.increment(names::TRACE_CONTEXT_ACCEPT_SUCCESS);
        table.increment(names::TRACE_CONTEXT_ACCEPT_SUCCESS);

        let summary = table
            .get(names::TRACE_CONTEXT_ACCEPT_SUCCESS)
            .expect("series exists");
        assert_eq!(summary.count, 2);
        assert!((summary.total - 0.0).abs() < f64::EPSILON);
        assert!((summary.max - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_duration_tracks_bounds() {
        let mut table = MetricTable::new();
        let name = names::duration_by_caller("App", "1349956", "41346604", "HTTP");
        table.record_duration(&name, 0.25, 0.25);
        table.record_duration(&name, 0.05, 0.05);
        table.record_duration(&name, 0.75, 0.75);

        let summary = table.get(&name).expect("series exists");
        assert_eq!(summary.count, 3);
        assert!((summary.total - 1.05).abs() < 1e-9);
        assert!((summary.min - 0.05).abs() < f64::EPSILON);
        assert!((summary.max - 0.75).abs() < f64::EPSILON);
        assert!((summary.sum_of_squares - (0.0625 + 0.0025 + 0.5625)).abs() < 1e-9);
    }

    #[test]
    fn test_flush_envelope_resets_table() {
        let mut table = MetricTable::new();
        table.increment(names::ACCEPT_PAYLOAD_SUCCESS);

        let envelope = table.flush_envelope("run-42", 100, 160);
        assert!(table.is_empty());

        let parts = envelope.as_array().expect("envelope is an array");
        assert_eq!(parts[0], "run-42");
        assert_eq!(parts[1], 100);
        assert_eq!(parts[2], 160);
        let data = parts[3].as_array().expect("data is an array");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0][0]["name"], names::ACCEPT_PAYLOAD_SUCCESS);
        assert_eq!(data[0][1][0], 1);
    }

    #[test]
    fn test_merge_folds_drained_tables() {
        let mut transaction_local = MetricTable::new();
        transaction_local.increment(names::ACCEPT_PAYLOAD_SUCCESS);
        transaction_local.record_duration("TransportDuration/App/1/2/HTTP/all", 0.5, 0.5);

        let mut shared = MetricTable::new();
        shared.increment(names::ACCEPT_PAYLOAD_SUCCESS);
        shared.record_duration("TransportDuration/App/1/2/HTTP/all", 2.0, 2.0);
        shared.merge(transaction_local.take());

        assert_eq!(shared.count(names::ACCEPT_PAYLOAD_SUCCESS), 2);
        let summary = shared.get("TransportDuration/App/1/2/HTTP/all").unwrap();
        assert_eq!(summary.count, 2);
        assert!((summary.total - 2.5).abs() < f64::EPSILON);
        assert!((summary.min - 0.5).abs() < f64::EPSILON);
        assert!((summary.max - 2.0).abs() < f64::EPSILON);
        assert!(transaction_local.is_empty());
    }

    #[test]
    fn test_api_name_shape() {
        assert_eq!(
            names::api("add_custom_parameter"),
            "Supportability/api/add_custom_parameter"
        );
    }
}
