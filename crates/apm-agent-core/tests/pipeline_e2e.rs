//! End-to-end pipeline flow: transactions through the harvester to a
//! collector, covering every envelope kind and the failure policy.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use apm_agent_core::agent::Agent;
use apm_agent_core::config::Config;
use apm_agent_core::harvest::{Collector, EnvelopeKind, HarvestError};
use apm_agent_core::transaction::segments::SpanCategory;

struct CapturingCollector {
    sent: Mutex<Vec<(EnvelopeKind, Value)>>,
}

#[async_trait]
impl Collector for CapturingCollector {
    async fn send(&self, kind: EnvelopeKind, envelope: Value) -> Result<(), HarvestError> {
        self.sent.lock().unwrap().push((kind, envelope));
        Ok(())
    }
}

struct RejectingCollector;

#[async_trait]
impl Collector for RejectingCollector {
    async fn send(&self, kind: EnvelopeKind, _envelope: Value) -> Result<(), HarvestError> {
        Err(HarvestError::Rejected {
            endpoint: kind.endpoint(),
            message: "server returned 413".to_string(),
        })
    }
}

fn test_config() -> Config {
    Config {
        app_name: "checkout".to_string(),
        entity_guid: "MXxBUE18QVBQTElDQVRJT058OQ".to_string(),
        account_id: "1349956".to_string(),
        primary_app_id: "41346604".to_string(),
        trusted_account_key: "123".to_string(),
        agent_run_id: "run-9".to_string(),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_pipeline_delivers_every_envelope_kind() {
    let agent = Agent::new(test_config());

    let mut transaction = agent.start_transaction("WebTransaction/Go/checkout");
    assert!(transaction.add_custom_parameter("cart.items", &json!(3)));
    let token = transaction
        .start_segment("db.charge", SpanCategory::Datastore)
        .unwrap();
    assert!(transaction.add_custom_span_parameter("db.rows", &json!(1)));
    transaction.record_log_event("INFO", "charging card");
    transaction.end_segment(token);
    transaction.notice_error("card declined", "PaymentError");
    transaction.end();

    let collector = Arc::new(CapturingCollector {
        sent: Mutex::new(Vec::new()),
    });
    let cancel = CancellationToken::new();
    let handle = agent.spawn_harvester(
        Arc::clone(&collector) as Arc<dyn Collector>,
        cancel.clone(),
    );
    cancel.cancel();
    handle.await.unwrap();

    let sent = collector.sent.lock().unwrap();
    let kinds: Vec<EnvelopeKind> = sent.iter().map(|(kind, _)| *kind).collect();
    for kind in [
        EnvelopeKind::TransactionEvents,
        EnvelopeKind::SpanEvents,
        EnvelopeKind::ErrorEvents,
        EnvelopeKind::LogEvents,
        EnvelopeKind::Metrics,
    ] {
        assert!(kinds.contains(&kind), "missing envelope for {kind:?}");
    }

    for (kind, envelope) in sent.iter() {
        assert_eq!(envelope[0], json!("run-9"), "{kind:?} reports the run id");
    }

    let (_, transactions) = sent
        .iter()
        .find(|(kind, _)| *kind == EnvelopeKind::TransactionEvents)
        .unwrap();
    assert_eq!(transactions[2][0][0]["name"], json!("WebTransaction/Go/checkout"));
    assert_eq!(transactions[2][0][1]["cart.items"], json!(3));

    let (_, spans) = sent
        .iter()
        .find(|(kind, _)| *kind == EnvelopeKind::SpanEvents)
        .unwrap();
    let span_events = spans[2].as_array().unwrap();
    assert_eq!(span_events.len(), 2);
    assert_eq!(span_events[1][0]["name"], json!("db.charge"));
    assert_eq!(span_events[1][1]["db.rows"], json!(1));

    let (_, metrics) = sent
        .iter()
        .find(|(kind, _)| *kind == EnvelopeKind::Metrics)
        .unwrap();
    let data = metrics[3].as_array().unwrap();
    let api_counter = data
        .iter()
        .find(|entry| entry[0]["name"] == json!("Supportability/api/add_custom_parameter"))
        .expect("api supportability counter is harvested");
    assert_eq!(api_counter[1][0], json!(1));
}

#[tokio::test]
async fn test_rejected_window_is_dropped_not_fatal() {
    let agent = Agent::new(test_config());
    let mut transaction = agent.start_transaction("WebTransaction/Go/checkout");
    transaction.end();

    let cancel = CancellationToken::new();
    let handle = agent.spawn_harvester(Arc::new(RejectingCollector), cancel.clone());
    cancel.cancel();
    handle.await.unwrap();

    // The rejected window is gone; the buffers start the next window clean.
    let envelopes = agent.harvest_state().drain("run-9", 0, 60);
    assert!(envelopes
        .iter()
        .all(|(kind, _)| *kind != EnvelopeKind::TransactionEvents));
}

#[tokio::test]
async fn test_linking_metadata_matches_log_decoration() {
    let agent = Agent::new(test_config());
    let mut transaction = agent.start_transaction("WebTransaction/Go/checkout");
    let metadata = transaction.get_linking_metadata();
    transaction.record_log_event("WARN", "low stock");
    transaction.end();

    let envelopes = agent.harvest_state().drain("run-9", 0, 60);
    let (_, logs) = envelopes
        .iter()
        .find(|(kind, _)| *kind == EnvelopeKind::LogEvents)
        .unwrap();
    let agent_attributes = &logs[2][0][2];
    assert_eq!(agent_attributes["trace.id"], json!(metadata["trace.id"]));
    assert_eq!(agent_attributes["entity.guid"], json!(metadata["entity.guid"]));
    assert_eq!(agent_attributes["entity.name"], json!("checkout"));
    assert_eq!(agent_attributes["hostname"], json!(metadata["hostname"]));
}
