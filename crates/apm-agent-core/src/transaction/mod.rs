//! The per-request transaction context.
//!
//! A [`Transaction`] is an explicit value the host threads through its call
//! chain; two transactions in one process never share state, so concurrent
//! requests record independently. Everything a transaction observes —
//! segments, attributes, errors, log lines, supportability counters — is
//! buffered locally and only touches the shared [`HarvestState`] once, at
//! [`Transaction::end`].
//!
//! After `end()` the object stays usable but inert: every operation
//! returns `false` / `None` without logging noise.

pub mod segments;
pub mod span_builder;

use std::collections::HashMap;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::attributes::filter::AttributeFilter;
use crate::attributes::{
    AttributeError, AttributeOrigin, AttributeStore, Destination, Destinations,
};
use crate::config::Config;
use crate::events::AnalyticsEvent;
use crate::harvest::HarvestState;
use crate::hostname;
use crate::metrics::{names, MetricTable};
use crate::traces::context::{TraceContext, TransportType};
use crate::traces::propagation::carrier::{Extractor, Injector};
use crate::traces::propagation::payload::Payload;
use crate::traces::propagation::{
    HeadersOutcome, LinkState, OutboundContext, PayloadOutcome, Propagation,
};
use crate::traces::sampler::{AdaptiveSampler, SamplingDecision, SamplingState};
use crate::traces::{format_span_id, format_trace_id};
use crate::transaction::segments::{SegmentArena, SegmentToken, SpanCategory};
use crate::transaction::span_builder::{
    append_parent_intrinsics, build_span_events, SpanBuildParams,
};

/// Error candidate recorded by [`Transaction::notice_error`].
#[derive(Clone, Debug)]
pub struct ErrorInfo {
    pub message: String,
    pub class: String,
    pub timestamp_ms: u64,
}

/// Classifies an error into a group label from the transaction's custom
/// attributes and the error itself. Registered per transaction.
pub type ErrorGroupCallback =
    dyn Fn(&Map<String, Value>, &ErrorInfo) -> Option<String> + Send + Sync;

#[derive(Clone, Debug)]
struct LogRecord {
    severity: String,
    message: String,
    timestamp_ms: u64,
    span_guid: Option<u64>,
}

/// Distributed-tracing linkage for one transaction: the accepted inbound
/// context plus the lockout flags the acceptance ladder consults.
#[derive(Debug, Default)]
struct DtState {
    inbound: Option<Box<TraceContext>>,
    accepted: bool,
    outbound_created: bool,
}

impl DtState {
    fn link(&self) -> LinkState {
        LinkState {
            accepted: self.accepted,
            outbound_created: self.outbound_created,
        }
    }
}

pub struct Transaction {
    config: Arc<Config>,
    propagation: Arc<Propagation>,
    harvest: Arc<HarvestState>,
    filter: Arc<AttributeFilter>,
    sampler: Arc<Mutex<AdaptiveSampler>>,
    rng: fastrand::Rng,
    name: String,
    trace_id: u128,
    guid: u64,
    start_ms: u64,
    dt: DtState,
    sampling: SamplingState,
    attributes: AttributeStore,
    arena: SegmentArena,
    errors: Vec<ErrorInfo>,
    logs: Vec<LogRecord>,
    error_group: Option<Box<ErrorGroupCallback>>,
    /// Per-transaction buffer, merged into the shared table at `end`.
    metrics: MetricTable,
    recording: bool,
}

impl Transaction {
    pub(crate) fn new(
        name: &str,
        config: Arc<Config>,
        propagation: Arc<Propagation>,
        harvest: Arc<HarvestState>,
        filter: Arc<AttributeFilter>,
        sampler: Arc<Mutex<AdaptiveSampler>>,
        mut rng: fastrand::Rng,
    ) -> Transaction {
        let start_ms = unix_time_ms();
        let trace_id = rng.u128(1..=u128::MAX);
        let guid = rng.u64(1..=u64::MAX);
        let root_guid = rng.u64(1..=u64::MAX);
        let sampling = SamplingState::new(&mut rng);
        Transaction {
            config,
            propagation,
            harvest,
            filter,
            sampler,
            rng,
            name: name.to_string(),
            trace_id,
            guid,
            start_ms,
            dt: DtState::default(),
            sampling,
            attributes: AttributeStore::new(),
            arena: SegmentArena::new(root_guid, name, start_ms),
            errors: Vec::new(),
            logs: Vec::new(),
            error_group: None,
            metrics: MetricTable::new(),
            recording: true,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn trace_id(&self) -> u128 {
        self.trace_id
    }

    #[must_use]
    pub fn guid(&self) -> u64 {
        self.guid
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// The accepted inbound context, if one exists. Immutable once set.
    #[must_use]
    pub fn inbound_context(&self) -> Option<&TraceContext> {
        self.dt.inbound.as_deref()
    }

    /// The frozen `(sampled, priority)` pair, if freezing has happened.
    #[must_use]
    pub fn sampling_decision(&self) -> Option<SamplingDecision> {
        self.sampling.decision()
    }

    /// Accepts legacy payload text (plain or base64 JSON) as this
    /// transaction's inbound context.
    pub fn accept_trace_payload(&mut self, text: &str, transport_type: TransportType) -> bool {
        if !self.recording {
            return false;
        }
        self.record_api("accept_trace_payload");
        let outcome =
            self.propagation
                .accept_payload(self.dt.link(), text, transport_type, unix_time_ms());
        self.apply_payload_outcome(outcome)
    }

    /// Accepts W3C trace headers from a carrier, falling back to the
    /// legacy `newrelic` header when no traceparent is present.
    pub fn accept_trace_headers(
        &mut self,
        carrier: &dyn Extractor,
        transport_type: TransportType,
    ) -> bool {
        if !self.recording {
            return false;
        }
        self.record_api("accept_trace_headers");
        let outcome =
            self.propagation
                .accept_headers(self.dt.link(), carrier, transport_type, unix_time_ms());
        match outcome {
            HeadersOutcome::Accepted { context, tracestate } => {
                if let Some(name) = tracestate.metric_name() {
                    self.metrics.increment(name);
                }
                self.metrics.increment(names::TRACE_CONTEXT_ACCEPT_SUCCESS);
                self.adopt_context(*context);
                true
            }
            HeadersOutcome::FromPayload(outcome) => self.apply_payload_outcome(outcome),
            HeadersOutcome::IgnoredMultiple => {
                self.metrics.increment(names::ACCEPT_PAYLOAD_IGNORED_MULTIPLE);
                false
            }
            HeadersOutcome::IgnoredCreateBeforeAccept => {
                self.metrics
                    .increment(names::ACCEPT_PAYLOAD_IGNORED_CREATE_BEFORE_ACCEPT);
                false
            }
            HeadersOutcome::ParseFailure | HeadersOutcome::Missing | HeadersOutcome::Disabled => {
                false
            }
        }
    }

    /// Writes outbound trace headers into the carrier. Freezes the
    /// sampling decision and locks out later accepts.
    pub fn insert_trace_headers(&mut self, carrier: &mut dyn Injector) -> bool {
        if !self.recording {
            return false;
        }
        self.record_api("insert_trace_headers");
        if !self.propagation.is_enabled() {
            return false;
        }
        let decision = self.freeze_sampling();
        let now_ms = unix_time_ms();
        let outbound = self.outbound_context(decision, now_ms);
        let inserted = self.propagation.insert_headers(&outbound, carrier);
        if inserted {
            self.dt.outbound_created = true;
            self.arena.mark_always_keep_current();
            self.metrics.increment(names::TRACE_CONTEXT_CREATE_SUCCESS);
        }
        inserted
    }

    /// Builds the legacy outbound payload, for callers that still send the
    /// single `newrelic` header or embed the payload in a message.
    pub fn create_trace_payload(&mut self) -> Option<Payload> {
        if !self.recording {
            return None;
        }
        self.record_api("create_trace_payload");
        if !self.propagation.is_enabled() {
            return None;
        }
        let decision = self.freeze_sampling();
        let now_ms = unix_time_ms();
        let outbound = self.outbound_context(decision, now_ms);
        let payload = self.propagation.create_payload(&outbound);
        self.dt.outbound_created = true;
        self.arena.mark_always_keep_current();
        self.metrics.increment(names::CREATE_PAYLOAD_SUCCESS);
        Some(payload)
    }

    /// Transaction-scope custom attribute, reported on transaction, trace
    /// and error destinations per the filter rules.
    pub fn add_custom_parameter(&mut self, key: &str, value: &Value) -> bool {
        if !self.recording {
            return false;
        }
        self.record_api("add_custom_parameter");
        let result = self.attributes.insert(
            &self.filter,
            key,
            value,
            AttributeOrigin::Custom,
            Destinations::CUSTOM_DEFAULT,
        );
        report_attribute_result("add_custom_parameter", key, result)
    }

    /// Custom attribute scoped to the current segment's span. Each segment
    /// scope has its own budget.
    pub fn add_custom_span_parameter(&mut self, key: &str, value: &Value) -> bool {
        if !self.recording {
            return false;
        }
        self.record_api("add_custom_span_parameter");
        let Some(store) = self.arena.current_attributes_mut() else {
            return false;
        };
        let result = store.insert(
            &self.filter,
            key,
            value,
            AttributeOrigin::Custom,
            Destinations::SPAN_EVENT,
        );
        report_attribute_result("add_custom_span_parameter", key, result)
    }

    /// Agent-origin attribute on the current segment (`http.url`,
    /// `db.statement`, ...). Failures are dropped silently.
    pub fn add_segment_attribute(&mut self, key: &str, value: &Value) {
        if !self.recording {
            return;
        }
        let Some(store) = self.arena.current_attributes_mut() else {
            return;
        };
        if let Err(err) = store.insert(
            &self.filter,
            key,
            value,
            AttributeOrigin::Agent,
            Destinations::SPAN_EVENT.union(Destinations::TRANSACTION_TRACE),
        ) {
            debug!("segment attribute {key:?} dropped: {err}");
        }
    }

    /// Identifiers for log decoration: trace id, current span id, and the
    /// entity fields from configuration.
    pub fn get_linking_metadata(&mut self) -> HashMap<String, String> {
        if self.recording {
            self.record_api("get_linking_metadata");
        }
        let mut metadata = HashMap::new();
        metadata.insert("trace.id".to_string(), format_trace_id(self.trace_id));
        if let Some(guid) = self.arena.current_guid() {
            metadata.insert("span.id".to_string(), format_span_id(guid));
        }
        if !self.config.entity_guid.is_empty() {
            metadata.insert("entity.guid".to_string(), self.config.entity_guid.clone());
        }
        metadata.insert("entity.name".to_string(), self.config.app_name.clone());
        metadata.insert("hostname".to_string(), hostname::detect());
        metadata
    }

    /// Registers the error-group callback consulted when error events are
    /// assembled at `end`. A later registration replaces the earlier one.
    pub fn set_error_group_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Map<String, Value>, &ErrorInfo) -> Option<String> + Send + Sync + 'static,
    {
        if !self.recording {
            return;
        }
        self.record_api("set_error_group_callback");
        self.error_group = Some(Box::new(callback));
    }

    /// Records an error candidate and pins the current segment so span
    /// sampling keeps it.
    pub fn notice_error(&mut self, message: &str, class: &str) {
        if !self.recording {
            return;
        }
        self.errors.push(ErrorInfo {
            message: message.to_string(),
            class: class.to_string(),
            timestamp_ms: unix_time_ms(),
        });
        self.arena.mark_always_keep_current();
    }

    /// Captures a log line with this transaction's linking context. The
    /// span id is resolved now, not at `end`, so the line points at the
    /// segment that was active when it was written.
    pub fn record_log_event(&mut self, severity: &str, message: &str) {
        if !self.recording {
            return;
        }
        self.logs.push(LogRecord {
            severity: severity.to_string(),
            message: message.to_string(),
            timestamp_ms: unix_time_ms(),
            span_guid: self.arena.current_guid(),
        });
    }

    /// Opens a segment under the current one.
    pub fn start_segment(&mut self, name: &str, category: SpanCategory) -> Option<SegmentToken> {
        if !self.recording {
            return None;
        }
        let guid = self.rng.u64(1..=u64::MAX);
        Some(self.arena.start(guid, name, category, unix_time_ms()))
    }

    /// Closes a segment. `false` when the token was already closed or the
    /// transaction is over.
    pub fn end_segment(&mut self, token: SegmentToken) -> bool {
        if !self.recording {
            return false;
        }
        self.arena.end(token, unix_time_ms())
    }

    /// Stops recording, assembles every event this transaction produced,
    /// offers them to the shared reservoirs and merges the buffered
    /// metrics. Idempotent; the second call does nothing.
    pub fn end(&mut self) {
        if !self.recording {
            return;
        }
        self.recording = false;
        let end_ms = unix_time_ms();
        self.arena.finish_open(end_ms);
        let decision = self.freeze_sampling();
        let duration_s = end_ms.saturating_sub(self.start_ms) as f64 / 1_000.0;

        let transaction_event = self.build_transaction_event(decision, duration_s);
        self.harvest
            .offer_transaction_event(transaction_event, decision.priority);

        if decision.sampled && self.config.span_events_enabled {
            let params = SpanBuildParams {
                trace_id: self.trace_id,
                transaction_guid: self.guid,
                sampled: decision.sampled,
                priority: decision.priority,
                max_segments: self.config.max_segments,
                inbound: self.dt.inbound.as_deref(),
            };
            for event in build_span_events(&self.arena, &params) {
                self.harvest.offer_span_event(event, decision.priority);
            }
        }

        let errors = mem::take(&mut self.errors);
        for error in &errors {
            let event = self.build_error_event(error, decision, duration_s);
            self.harvest.offer_error_event(event, decision.priority);
        }

        let logs = mem::take(&mut self.logs);
        for log in &logs {
            let event = self.build_log_event(log);
            self.harvest.offer_log_event(event, decision.priority);
        }

        self.record_caller_rollups(duration_s);
        self.harvest.merge_metrics(self.metrics.take());
    }

    fn record_api(&mut self, function: &str) {
        self.metrics.increment(&names::api(function));
    }

    fn apply_payload_outcome(&mut self, outcome: PayloadOutcome) -> bool {
        if let Some(name) = outcome.metric_name() {
            self.metrics.increment(name);
        }
        match outcome {
            PayloadOutcome::Accepted(context) => {
                self.adopt_context(*context);
                true
            }
            _ => false,
        }
    }

    fn adopt_context(&mut self, context: TraceContext) {
        self.trace_id = context.trace_id;
        self.sampling.adopt_inbound(
            context.remote_sampling_flag(),
            context.sampled,
            context.priority,
        );
        self.dt.accepted = true;
        self.dt.inbound = Some(Box::new(context));
        self.arena.mark_always_keep_current();
    }

    #[allow(clippy::expect_used)]
    fn freeze_sampling(&mut self) -> SamplingDecision {
        let remote_parent_sampled = self.config.remote_parent_sampled;
        let remote_parent_not_sampled = self.config.remote_parent_not_sampled;
        let sampler = Arc::clone(&self.sampler);
        self.sampling.freeze(
            remote_parent_sampled,
            remote_parent_not_sampled,
            move || sampler.lock().expect("lock poisoned").decide(),
        )
    }

    fn outbound_span_id(&self, decision: SamplingDecision) -> Option<u64> {
        (self.config.span_events_enabled && decision.sampled)
            .then(|| self.arena.current_guid())
            .flatten()
    }

    fn outbound_context(&self, decision: SamplingDecision, timestamp_ms: u64) -> OutboundContext<'_> {
        OutboundContext {
            trace_id: self.trace_id,
            transaction_id: self.guid,
            span_id: self.outbound_span_id(decision),
            sampled: decision.sampled,
            priority: decision.priority,
            timestamp_ms,
            tracing_vendors: self
                .dt
                .inbound
                .as_deref()
                .map_or(&[], |context| context.tracing_vendors.as_slice()),
        }
    }

    fn build_transaction_event(
        &self,
        decision: SamplingDecision,
        duration_s: f64,
    ) -> AnalyticsEvent {
        let mut intrinsics = Map::new();
        intrinsics.insert("type".to_string(), json!("Transaction"));
        intrinsics.insert("name".to_string(), json!(self.name));
        intrinsics.insert("timestamp".to_string(), json!(self.start_ms));
        intrinsics.insert("duration".to_string(), json!(duration_s));
        intrinsics.insert("totalTime".to_string(), json!(duration_s));
        intrinsics.insert("priority".to_string(), json!(decision.priority));
        intrinsics.insert("sampled".to_string(), json!(decision.sampled));
        intrinsics.insert("guid".to_string(), json!(format_span_id(self.guid)));
        intrinsics.insert("traceId".to_string(), json!(format_trace_id(self.trace_id)));
        if !self.errors.is_empty() {
            intrinsics.insert("error".to_string(), json!(true));
        }
        if let Some(context) = self.dt.inbound.as_deref() {
            append_parent_intrinsics(&mut intrinsics, context);
            if let Some(transaction_id) = context.parent_transaction_id {
                intrinsics.insert("parentId".to_string(), json!(format_span_id(transaction_id)));
            }
            if let Some(span_id) = context.parent_span_id {
                intrinsics.insert("parentSpanId".to_string(), json!(format_span_id(span_id)));
            }
        }
        AnalyticsEvent::new(
            intrinsics,
            self.attributes.user_map(Destination::TransactionEvent),
            self.attributes.agent_map(Destination::TransactionEvent),
        )
    }

    fn build_error_event(
        &self,
        error: &ErrorInfo,
        decision: SamplingDecision,
        duration_s: f64,
    ) -> AnalyticsEvent {
        let mut intrinsics = Map::new();
        intrinsics.insert("type".to_string(), json!("TransactionError"));
        intrinsics.insert("error.class".to_string(), json!(error.class));
        intrinsics.insert("error.message".to_string(), json!(error.message));
        intrinsics.insert("timestamp".to_string(), json!(error.timestamp_ms));
        intrinsics.insert("transactionName".to_string(), json!(self.name));
        intrinsics.insert("duration".to_string(), json!(duration_s));
        intrinsics.insert("priority".to_string(), json!(decision.priority));
        intrinsics.insert("sampled".to_string(), json!(decision.sampled));
        intrinsics.insert("guid".to_string(), json!(format_span_id(self.guid)));
        intrinsics.insert("traceId".to_string(), json!(format_trace_id(self.trace_id)));

        let user = self.attributes.user_map(Destination::ErrorEvent);
        let mut agent = self.attributes.agent_map(Destination::ErrorEvent);
        if let Some(group) = self.error_group_label(&user, error) {
            agent.insert("error.group.name".to_string(), json!(group));
        }
        AnalyticsEvent::new(intrinsics, user, agent)
    }

    /// Runs the registered callback, if any. A panic, a `None`, or an
    /// empty label all mean "no group": the event is emitted without the
    /// label, never dropped.
    fn error_group_label(&self, attributes: &Map<String, Value>, error: &ErrorInfo) -> Option<String> {
        let callback = self.error_group.as_ref()?;
        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(attributes, error))) {
            Ok(Some(group)) if !group.is_empty() => Some(group),
            Ok(_) => None,
            Err(_) => {
                warn!("error group callback panicked; label omitted");
                None
            }
        }
    }

    fn build_log_event(&self, log: &LogRecord) -> AnalyticsEvent {
        let mut intrinsics = Map::new();
        intrinsics.insert("severity".to_string(), json!(log.severity));
        intrinsics.insert("message".to_string(), json!(log.message));
        intrinsics.insert("timestamp".to_string(), json!(log.timestamp_ms));

        // Linking context goes through an attribute store so log-event
        // filter rules and the context value cap apply.
        let mut context = AttributeStore::new();
        let values = [
            ("trace.id", Some(format_trace_id(self.trace_id))),
            ("span.id", log.span_guid.map(format_span_id)),
            (
                "entity.guid",
                (!self.config.entity_guid.is_empty()).then(|| self.config.entity_guid.clone()),
            ),
            ("entity.name", Some(self.config.app_name.clone())),
            ("hostname", Some(hostname::detect())),
        ];
        for (key, value) in values {
            if let Some(value) = value {
                let _ = context.insert(
                    &self.filter,
                    key,
                    &json!(value),
                    AttributeOrigin::Agent,
                    Destinations::LOG_EVENT,
                );
            }
        }
        AnalyticsEvent::new(intrinsics, Map::new(), context.agent_map(Destination::LogEvent))
    }

    fn record_caller_rollups(&mut self, duration_s: f64) {
        let Some(context) = self.dt.inbound.as_deref() else {
            return;
        };
        let transport = context.transport_type.as_str();
        let duration_name = names::duration_by_caller(
            context.parent_type_str(),
            context.account_str(),
            context.app_str(),
            transport,
        );
        let transport_name = context.transport_duration.map(|_| {
            names::transport_duration(
                context.parent_type_str(),
                context.account_str(),
                context.app_str(),
                transport,
            )
        });
        let transport_duration = context.transport_duration;
        self.metrics
            .record_duration(&duration_name, duration_s, duration_s);
        if let (Some(name), Some(value)) = (transport_name, transport_duration) {
            self.metrics.record_duration(&name, value, value);
        }
    }
}

fn report_attribute_result(function: &str, key: &str, result: Result<(), AttributeError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err @ AttributeError::NotScalar(_)) => {
            warn!("{function}({key:?}) rejected: {err}");
            false
        }
        Err(err) => {
            debug!("{function}({key:?}) dropped: {err}");
            false
        }
    }
}

fn unix_time_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::harvest::EnvelopeKind;

    const TRACEPARENT: &str = "00-74be672b84ddc4e4b28be285632bbc0a-27ddd2d8890283b4-00";
    const TRACESTATE: &str =
        "123@nr=0-0-1349956-41346604-27ddd2d8890283b4-b28be285632bbc0a-0-1.1273-1569367663277";

    fn create_test_config() -> Config {
        Config {
            app_name: "test-app".to_string(),
            entity_guid: "MXxBUE18QVBQTElDQVRJT058OQ".to_string(),
            account_id: "1349956".to_string(),
            primary_app_id: "41346604".to_string(),
            trusted_account_key: "123".to_string(),
            agent_run_id: "run-1".to_string(),
            distributed_tracing_enabled: true,
            ..Config::default()
        }
    }

    fn create_test_transaction(config: Config) -> (Transaction, Arc<HarvestState>) {
        let config = Arc::new(config);
        let harvest = Arc::new(HarvestState::from_config(&config));
        let propagation = Arc::new(Propagation::new(&config));
        let filter = Arc::new(AttributeFilter::from_config(&config));
        let sampler = Arc::new(Mutex::new(AdaptiveSampler::new(
            config.sampling_target,
            config.report_period(),
        )));
        let transaction = Transaction::new(
            "WebTransaction/Go/hello",
            Arc::clone(&config),
            propagation,
            Arc::clone(&harvest),
            filter,
            sampler,
            fastrand::Rng::with_seed(42),
        );
        (transaction, harvest)
    }

    fn trusted_payload_text() -> String {
        json!({
            "v": [0, 1],
            "d": {
                "ty": "App",
                "ac": "9123",
                "ap": "51424",
                "id": "27ddd2d8890283b4",
                "tr": "3221bf09aa0bcf0d",
                "pr": 0.1234,
                "sa": true,
                "ti": 1_482_959_525_577_u64,
                "tx": "b28be285632bbc0a",
                "tk": "123"
            }
        })
        .to_string()
    }

    fn w3c_carrier() -> HashMap<String, String> {
        let mut carrier = HashMap::new();
        carrier.insert("traceparent".to_string(), TRACEPARENT.to_string());
        carrier.insert("tracestate".to_string(), TRACESTATE.to_string());
        carrier
    }

    /// Envelope of the given kind from one drained window, if any.
    fn envelope_of(envelopes: &[(EnvelopeKind, Value)], kind: EnvelopeKind) -> Option<&Value> {
        envelopes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, envelope)| envelope)
    }

    #[test]
    fn test_second_accept_is_ignored() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        assert!(transaction.accept_trace_payload(&trusted_payload_text(), TransportType::Http));
        let first_trace = transaction.trace_id();

        let other = trusted_payload_text().replace("3221bf09aa0bcf0d", "aaaaaaaaaaaaaaaa");
        assert!(!transaction.accept_trace_payload(&other, TransportType::Http));
        assert_eq!(transaction.trace_id(), first_trace);
        assert_eq!(
            transaction.inbound_context().unwrap().trace_id,
            0x3221_bf09_aa0b_cf0d
        );

        transaction.end();
        assert_eq!(harvest.metric_count(names::ACCEPT_PAYLOAD_SUCCESS), 1);
        assert_eq!(harvest.metric_count(names::ACCEPT_PAYLOAD_IGNORED_MULTIPLE), 1);
    }

    #[test]
    fn test_accept_after_create_is_ignored() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        assert!(transaction.create_trace_payload().is_some());
        assert!(!transaction.accept_trace_payload(&trusted_payload_text(), TransportType::Http));
        assert!(transaction.inbound_context().is_none());

        transaction.end();
        assert_eq!(
            harvest.metric_count(names::ACCEPT_PAYLOAD_IGNORED_CREATE_BEFORE_ACCEPT),
            1
        );
        assert_eq!(harvest.metric_count(names::CREATE_PAYLOAD_SUCCESS), 1);
    }

    #[test]
    fn test_custom_parameter_budget_is_64() {
        let (mut transaction, _harvest) = create_test_transaction(create_test_config());
        for i in 0..64 {
            assert!(transaction.add_custom_parameter(&format!("key{i}"), &json!(i)));
        }
        assert!(!transaction.add_custom_parameter("key64", &json!(64)));
        // Replacing an existing key is not a new slot
        assert!(transaction.add_custom_parameter("key0", &json!("updated")));
    }

    #[test]
    fn test_key_length_boundary() {
        let (mut transaction, _harvest) = create_test_transaction(create_test_config());
        assert!(transaction.add_custom_parameter(&"k".repeat(255), &json!(1)));
        assert!(!transaction.add_custom_parameter(&"k".repeat(256), &json!(1)));
    }

    #[test]
    fn test_span_scope_is_independent_of_transaction_scope() {
        let (mut transaction, _harvest) = create_test_transaction(create_test_config());
        assert!(transaction.add_custom_parameter("shared", &json!("transaction")));
        let token = transaction
            .start_segment("db.query", SpanCategory::Datastore)
            .unwrap();
        assert!(transaction.add_custom_span_parameter("shared", &json!("span")));

        assert_eq!(
            transaction.attributes.get("shared").unwrap().value,
            crate::attributes::AttributeValue::Text("transaction".to_string())
        );
        assert_eq!(
            transaction.arena.segments()[1].attributes.get("shared").unwrap().value,
            crate::attributes::AttributeValue::Text("span".to_string())
        );
        assert!(transaction.end_segment(token));
    }

    #[test]
    fn test_non_scalar_span_parameter_is_rejected() {
        let (mut transaction, _harvest) = create_test_transaction(create_test_config());
        assert!(!transaction.add_custom_span_parameter("key", &json!([1, 2, 3])));
        assert!(transaction.arena.segments()[0].attributes.is_empty());
    }

    #[test]
    fn test_each_segment_gets_a_fresh_budget() {
        let (mut transaction, _harvest) = create_test_transaction(create_test_config());
        let first = transaction
            .start_segment("first", SpanCategory::Generic)
            .unwrap();
        for i in 0..64 {
            assert!(transaction.add_custom_span_parameter(&format!("key{i}"), &json!(i)));
        }
        assert!(!transaction.add_custom_span_parameter("key64", &json!(64)));
        transaction.end_segment(first);

        let _second = transaction
            .start_segment("second", SpanCategory::Generic)
            .unwrap();
        for i in 0..64 {
            assert!(transaction.add_custom_span_parameter(&format!("key{i}"), &json!(i)));
        }
    }

    #[test]
    fn test_header_accept_adopts_w3c_identity() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        assert!(transaction.accept_trace_headers(&w3c_carrier(), TransportType::Https));

        assert_eq!(
            transaction.trace_id(),
            0x74be_672b_84dd_c4e4_b28b_e285_632b_bc0a
        );
        let inbound = transaction.inbound_context().unwrap();
        assert_eq!(inbound.parent_span_id, Some(0x27dd_d2d8_8902_83b4));
        assert_eq!(inbound.trusted_parent_id, Some(0x27dd_d2d8_8902_83b4));
        assert_eq!(inbound.sampled, Some(false));

        transaction.end();
        assert_eq!(harvest.metric_count(names::TRACE_CONTEXT_ACCEPT_SUCCESS), 1);
        // Trusted entry present: no tracestate diagnostic
        assert_eq!(harvest.metric_count(names::TRACE_STATE_NO_NR_ENTRY), 0);
    }

    #[test]
    fn test_insert_headers_writes_the_full_header_set() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        let mut carrier = HashMap::new();
        assert!(transaction.insert_trace_headers(&mut carrier));

        assert!(carrier.contains_key("traceparent"));
        assert!(carrier.contains_key("tracestate"));
        assert!(carrier.contains_key("newrelic"));
        let decision = transaction.sampling_decision().unwrap();
        assert!(decision.sampled, "first local decision of the window");

        transaction.end();
        assert_eq!(harvest.metric_count(names::TRACE_CONTEXT_CREATE_SUCCESS), 1);
        assert_eq!(
            harvest.metric_count(&names::api("insert_trace_headers")),
            1
        );
    }

    #[test]
    fn test_linking_metadata_shape() {
        let (mut transaction, _harvest) = create_test_transaction(create_test_config());
        let metadata = transaction.get_linking_metadata();

        assert_eq!(metadata["trace.id"].len(), 32);
        assert_eq!(metadata["span.id"].len(), 16);
        assert_eq!(metadata["entity.guid"], "MXxBUE18QVBQTElDQVRJT058OQ");
        assert_eq!(metadata["entity.name"], "test-app");
        assert!(!metadata["hostname"].is_empty());
    }

    #[test]
    fn test_linking_metadata_omits_empty_entity_guid() {
        let config = Config {
            entity_guid: String::new(),
            ..create_test_config()
        };
        let (mut transaction, _harvest) = create_test_transaction(config);
        let metadata = transaction.get_linking_metadata();
        assert!(!metadata.contains_key("entity.guid"));
    }

    #[test]
    fn test_end_assembles_all_event_kinds() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        assert!(transaction.accept_trace_payload(&trusted_payload_text(), TransportType::Kafka));
        let token = transaction
            .start_segment("work", SpanCategory::Generic)
            .unwrap();
        transaction.record_log_event("INFO", "processing");
        transaction.notice_error("boom", "std::io::Error");
        transaction.end_segment(token);
        transaction.end();

        assert_eq!(
            harvest.metric_count(&names::api("accept_trace_payload")),
            1,
            "api counters merge at end"
        );
        assert_eq!(harvest.metric_count("DurationByCaller/App/9123/51424/Kafka/all"), 1);
        assert_eq!(harvest.metric_count("TransportDuration/App/9123/51424/Kafka/all"), 1);

        let envelopes = harvest.drain("run-1", 0, 60);
        let spans = envelope_of(&envelopes, EnvelopeKind::SpanEvents)
            .expect("inbound sa=true inherits sampled");
        let span_events = spans[2].as_array().unwrap();
        assert_eq!(span_events.len(), 2);
        assert_eq!(span_events[0][0]["entryPoint"], json!(true));
        assert_eq!(span_events[0][0]["parent.type"], json!("App"));
        assert_eq!(span_events[0][0]["parent.transportType"], json!("Kafka"));

        let transactions = envelope_of(&envelopes, EnvelopeKind::TransactionEvents).unwrap();
        let transaction_event = &transactions[2][0];
        assert_eq!(transaction_event[0]["error"], json!(true));
        assert_eq!(transaction_event[0]["parentSpanId"], json!("27ddd2d8890283b4"));
        assert_eq!(transaction_event[0]["parentId"], json!("b28be285632bbc0a"));
        assert_eq!(transaction_event[0]["priority"], json!(0.1234));

        let errors = envelope_of(&envelopes, EnvelopeKind::ErrorEvents).unwrap();
        assert_eq!(errors[2][0][0]["error.class"], json!("std::io::Error"));

        let logs = envelope_of(&envelopes, EnvelopeKind::LogEvents).unwrap();
        assert_eq!(logs[2][0][0]["severity"], json!("INFO"));
        assert_eq!(logs[2][0][2]["entity.name"], json!("test-app"));
        assert_eq!(logs[2][0][2]["trace.id"], json!("00000000000000003221bf09aa0bcf0d"));
    }

    #[test]
    fn test_error_group_callback_labels_the_event() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        transaction.add_custom_parameter("tier", &json!("checkout"));
        transaction.set_error_group_callback(|attributes, error| {
            let tier = attributes.get("tier")?.as_str()?;
            Some(format!("{tier}:{}", error.class))
        });
        transaction.notice_error("boom", "PaymentError");
        transaction.end();

        let envelopes = harvest.drain("run-1", 0, 60);
        let errors = envelope_of(&envelopes, EnvelopeKind::ErrorEvents).unwrap();
        assert_eq!(
            errors[2][0][2]["error.group.name"],
            json!("checkout:PaymentError")
        );
    }

    #[test]
    fn test_empty_error_group_label_is_omitted() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        transaction.set_error_group_callback(|_, _| Some(String::new()));
        transaction.notice_error("boom", "SomeError");
        transaction.end();

        let envelopes = harvest.drain("run-1", 0, 60);
        let errors = envelope_of(&envelopes, EnvelopeKind::ErrorEvents).unwrap();
        assert!(errors[2][0][2].get("error.group.name").is_none());
        assert_eq!(errors[2][0][0]["error.class"], json!("SomeError"));
    }

    #[test]
    fn test_panicking_error_group_callback_still_emits_the_event() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        transaction.set_error_group_callback(|_, _| panic!("classifier bug"));
        transaction.notice_error("boom", "SomeError");
        transaction.end();

        let envelopes = harvest.drain("run-1", 0, 60);
        let errors = envelope_of(&envelopes, EnvelopeKind::ErrorEvents).unwrap();
        assert_eq!(errors[2].as_array().unwrap().len(), 1);
        assert!(errors[2][0][2].get("error.group.name").is_none());
    }

    #[test]
    fn test_ended_transaction_goes_quiet() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        transaction.end();

        assert!(!transaction.is_recording());
        assert!(!transaction.accept_trace_payload(&trusted_payload_text(), TransportType::Http));
        assert!(!transaction.accept_trace_headers(&w3c_carrier(), TransportType::Http));
        assert!(transaction.create_trace_payload().is_none());
        let mut carrier = HashMap::new();
        assert!(!transaction.insert_trace_headers(&mut carrier));
        assert!(carrier.is_empty());
        assert!(!transaction.add_custom_parameter("key", &json!(1)));
        assert!(transaction.start_segment("late", SpanCategory::Generic).is_none());

        // Second end offers nothing new
        transaction.end();
        let envelopes = harvest.drain("run-1", 0, 60);
        let transactions = envelope_of(&envelopes, EnvelopeKind::TransactionEvents).unwrap();
        assert_eq!(transactions[1]["events_seen"], json!(1));
    }

    #[test]
    fn test_unsampled_transaction_offers_no_spans() {
        let config = Config {
            remote_parent_not_sampled: crate::config::sampling::RemoteParentSampling::AlwaysOff,
            ..create_test_config()
        };
        let (mut transaction, harvest) = create_test_transaction(config);
        assert!(transaction.accept_trace_headers(&w3c_carrier(), TransportType::Http));
        transaction.end();

        let envelopes = harvest.drain("run-1", 0, 60);
        assert!(envelope_of(&envelopes, EnvelopeKind::SpanEvents).is_none());
        let transactions = envelope_of(&envelopes, EnvelopeKind::TransactionEvents).unwrap();
        assert_eq!(transactions[2][0][0]["sampled"], json!(false));
    }

    #[test]
    fn test_log_events_resolve_span_at_record_time() {
        let (mut transaction, harvest) = create_test_transaction(create_test_config());
        let token = transaction
            .start_segment("inner", SpanCategory::Generic)
            .unwrap();
        let inner_guid = transaction.arena.current_guid().unwrap();
        transaction.record_log_event("WARN", "inside");
        transaction.end_segment(token);
        transaction.record_log_event("WARN", "outside");
        transaction.end();

        let envelopes = harvest.drain("run-1", 0, 60);
        let logs = envelope_of(&envelopes, EnvelopeKind::LogEvents).unwrap();
        assert_eq!(logs[2][0][2]["span.id"], json!(format_span_id(inner_guid)));
        assert_ne!(logs[2][1][2]["span.id"], logs[2][0][2]["span.id"]);
    }
}
