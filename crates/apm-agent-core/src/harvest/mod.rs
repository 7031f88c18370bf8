// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timer-driven harvest cycle.
//!
//! [`HarvestState`] is the shared buffer transactions feed: four event
//! reservoirs and the metric table, each behind its own `Mutex`. A
//! [`Harvester`] drains the state once per report period and hands the
//! resulting envelopes to the configured [`Collector`]. Cancellation
//! triggers one final drain so nothing recorded before shutdown is lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::events::reservoir::SampledReservoir;
use crate::events::{envelope, AnalyticsEvent};
use crate::metrics::{MetricId, MetricSummary, MetricTable};

/// Harvest pipeline fault, raised by collectors.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    #[error("collector rejected {endpoint}: {message}")]
    Rejected {
        endpoint: &'static str,
        message: String,
    },
}

/// The envelope kinds produced each window, in flush order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    TransactionEvents,
    SpanEvents,
    ErrorEvents,
    LogEvents,
    Metrics,
}

impl EnvelopeKind {
    /// Collector endpoint this envelope belongs to.
    #[must_use]
    pub fn endpoint(self) -> &'static str {
        match self {
            EnvelopeKind::TransactionEvents => "analytic_event_data",
            EnvelopeKind::SpanEvents => "span_event_data",
            EnvelopeKind::ErrorEvents => "error_event_data",
            EnvelopeKind::LogEvents => "log_event_data",
            EnvelopeKind::Metrics => "metric_data",
        }
    }
}

/// Receives harvest envelopes. The wire transport behind this trait is the
/// host's concern; a failure drops that window's data after an error log,
/// it never stalls or crashes the pipeline.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn send(&self, kind: EnvelopeKind, envelope: Value) -> Result<(), HarvestError>;
}

/// Shared, lock-guarded buffers between transactions and the harvest loop.
///
/// Transactions take each lock briefly — an event offer or one metric merge
/// at end — and the harvester swaps buffers out whole, so contention stays
/// low even with many concurrent transactions.
#[derive(Debug)]
pub struct HarvestState {
    transaction_events: Mutex<SampledReservoir>,
    span_events: Mutex<SampledReservoir>,
    error_events: Mutex<SampledReservoir>,
    log_events: Mutex<SampledReservoir>,
    metrics: Mutex<MetricTable>,
}

impl HarvestState {
    #[must_use]
    pub fn from_config(config: &Config) -> HarvestState {
        HarvestState {
            transaction_events: Mutex::new(SampledReservoir::new(
                config.transaction_events_max_samples,
            )),
            span_events: Mutex::new(SampledReservoir::new(config.span_events_max_samples)),
            error_events: Mutex::new(SampledReservoir::new(config.error_events_max_samples)),
            log_events: Mutex::new(SampledReservoir::new(config.log_events_max_samples)),
            metrics: Mutex::new(MetricTable::new()),
        }
    }

    #[allow(clippy::expect_used)]
    pub fn offer_transaction_event(&self, event: AnalyticsEvent, priority: f64) -> bool {
        self.transaction_events
            .lock()
            .expect("lock poisoned")
            .offer(event, priority)
    }

    #[allow(clippy::expect_used)]
    pub fn offer_span_event(&self, event: AnalyticsEvent, priority: f64) -> bool {
        self.span_events
            .lock()
            .expect("lock poisoned")
            .offer(event, priority)
    }

    #[allow(clippy::expect_used)]
    pub fn offer_error_event(&self, event: AnalyticsEvent, priority: f64) -> bool {
        self.error_events
            .lock()
            .expect("lock poisoned")
            .offer(event, priority)
    }

    #[allow(clippy::expect_used)]
    pub fn offer_log_event(&self, event: AnalyticsEvent, priority: f64) -> bool {
        self.log_events
            .lock()
            .expect("lock poisoned")
            .offer(event, priority)
    }

    /// Folds a transaction's drained metric table into the shared one.
    #[allow(clippy::expect_used)]
    pub fn merge_metrics(&self, drained: HashMap<MetricId, MetricSummary>) {
        self.metrics.lock().expect("lock poisoned").merge(drained);
    }

    /// Count of an unscoped metric series. Diagnostic and test aid.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn metric_count(&self, name: &str) -> u64 {
        self.metrics.lock().expect("lock poisoned").count(name)
    }

    /// Swaps every buffer out under its lock and builds the window's
    /// envelopes outside them. Empty buffers produce no envelope.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn drain(
        &self,
        agent_run_id: &str,
        window_start: u64,
        window_stop: u64,
    ) -> Vec<(EnvelopeKind, Value)> {
        let mut envelopes = Vec::new();
        for (kind, reservoir) in [
            (EnvelopeKind::TransactionEvents, &self.transaction_events),
            (EnvelopeKind::SpanEvents, &self.span_events),
            (EnvelopeKind::ErrorEvents, &self.error_events),
            (EnvelopeKind::LogEvents, &self.log_events),
        ] {
            let (metadata, events) = reservoir.lock().expect("lock poisoned").flush();
            if events.is_empty() {
                continue;
            }
            envelopes.push((kind, envelope(agent_run_id, metadata, &events)));
        }

        let metric_envelope = {
            let mut metrics = self.metrics.lock().expect("lock poisoned");
            if metrics.is_empty() {
                None
            } else {
                Some(metrics.flush_envelope(agent_run_id, window_start, window_stop))
            }
        };
        if let Some(value) = metric_envelope {
            envelopes.push((EnvelopeKind::Metrics, value));
        }
        envelopes
    }
}

/// Owns the harvest loop for one agent.
pub struct Harvester {
    state: Arc<HarvestState>,
    collector: Arc<dyn Collector>,
    agent_run_id: String,
    period: Duration,
    window_start: u64,
    cancel: CancellationToken,
}

impl Harvester {
    #[must_use]
    pub fn new(
        state: Arc<HarvestState>,
        collector: Arc<dyn Collector>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Harvester {
        Harvester {
            state,
            collector,
            agent_run_id: config.agent_run_id.clone(),
            period: config.report_period(),
            window_start: unix_time_s(),
            cancel,
        }
    }

    /// Runs until the token is cancelled, then drains once more.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.period);
        // A tokio interval fires its first tick immediately; consume it so
        // the first real harvest happens one full period in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.harvest().await;
                }
                () = self.cancel.cancelled() => {
                    debug!("harvest loop cancelled, draining final window");
                    self.harvest().await;
                    return;
                }
            }
        }
    }

    async fn harvest(&mut self) {
        let window_stop = unix_time_s();
        let envelopes = self
            .state
            .drain(&self.agent_run_id, self.window_start, window_stop);
        self.window_start = window_stop;

        for (kind, envelope) in envelopes {
            if let Err(err) = self.collector.send(kind, envelope).await {
                error!("dropping {} for this window: {err}", kind.endpoint());
            }
        }
    }
}

fn unix_time_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn create_test_event(event_type: &str) -> AnalyticsEvent {
        let mut intrinsics = serde_json::Map::new();
        intrinsics.insert("type".to_string(), json!(event_type));
        AnalyticsEvent::new(intrinsics, serde_json::Map::new(), serde_json::Map::new())
    }

    fn create_test_state() -> HarvestState {
        HarvestState::from_config(&Config::default())
    }

    struct CapturingCollector {
        envelopes: Mutex<Vec<(EnvelopeKind, Value)>>,
    }

    #[async_trait]
    impl Collector for CapturingCollector {
        async fn send(&self, kind: EnvelopeKind, envelope: Value) -> Result<(), HarvestError> {
            self.envelopes.lock().unwrap().push((kind, envelope));
            Ok(())
        }
    }

    struct FailingCollector;

    #[async_trait]
    impl Collector for FailingCollector {
        async fn send(&self, kind: EnvelopeKind, _envelope: Value) -> Result<(), HarvestError> {
            Err(HarvestError::Rejected {
                endpoint: kind.endpoint(),
                message: "offline".to_string(),
            })
        }
    }

    #[test]
    fn test_drain_skips_empty_buffers() {
        let state = create_test_state();
        assert!(state.offer_span_event(create_test_event("Span"), 0.5));

        let envelopes = state.drain("run-1", 0, 60);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].0, EnvelopeKind::SpanEvents);
        assert_eq!(envelopes[0].1[0], json!("run-1"));
    }

    #[test]
    fn test_drain_resets_buffers() {
        let state = create_test_state();
        state.offer_transaction_event(create_test_event("Transaction"), 0.5);
        let mut local = MetricTable::new();
        local.increment("Supportability/api/add_custom_parameter");
        state.merge_metrics(local.take());

        let first = state.drain("run-1", 0, 60);
        assert_eq!(first.len(), 2);
        assert!(state.drain("run-1", 60, 120).is_empty());
        assert_eq!(
            state.metric_count("Supportability/api/add_custom_parameter"),
            0
        );
    }

    #[test]
    fn test_drain_reports_reservoir_metadata() {
        let config = Config {
            span_events_max_samples: 2,
            ..Config::default()
        };
        let state = HarvestState::from_config(&config);
        for _ in 0..5 {
            state.offer_span_event(create_test_event("Span"), 0.5);
        }

        let envelopes = state.drain("run-1", 0, 60);
        let (_, envelope) = &envelopes[0];
        assert_eq!(envelope[1]["reservoir_size"], json!(2));
        assert_eq!(envelope[1]["events_seen"], json!(5));
    }

    #[tokio::test]
    async fn test_cancellation_drains_final_window() {
        let config = Config {
            agent_run_id: "run-9".to_string(),
            ..Config::default()
        };
        let state = Arc::new(HarvestState::from_config(&config));
        let collector = Arc::new(CapturingCollector {
            envelopes: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let harvester = Harvester::new(
            Arc::clone(&state),
            Arc::clone(&collector) as Arc<dyn Collector>,
            &config,
            cancel.clone(),
        );

        state.offer_transaction_event(create_test_event("Transaction"), 1.5);
        let handle = tokio::spawn(harvester.run());
        cancel.cancel();
        handle.await.unwrap();

        let captured = collector.envelopes.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, EnvelopeKind::TransactionEvents);
        assert_eq!(captured[0].1[0], json!("run-9"));
    }

    #[tokio::test]
    async fn test_collector_failure_does_not_stall_shutdown() {
        let config = Config::default();
        let state = Arc::new(HarvestState::from_config(&config));
        state.offer_error_event(create_test_event("TransactionError"), 1.0);
        let cancel = CancellationToken::new();
        let harvester = Harvester::new(
            Arc::clone(&state),
            Arc::new(FailingCollector),
            &config,
            cancel.clone(),
        );

        let handle = tokio::spawn(harvester.run());
        cancel.cancel();
        handle.await.unwrap();

        // The window was dropped; nothing is retried.
        assert!(state.drain("run-1", 0, 60).is_empty());
    }
}
