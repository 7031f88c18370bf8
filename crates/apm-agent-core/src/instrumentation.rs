//! Startup-time instrumentation registry.
//!
//! Hosts register a [`Wrapper`] per `(library, symbol)` pair while wiring
//! up, then [`resolve`](Registry::resolve) each instrumented call site once
//! and hold the returned handle. The per-invocation path is a plain
//! closure call; no string lookup happens per request.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::transaction::segments::SpanCategory;
use crate::transaction::Transaction;

/// Runs one instrumented host call. The wrapper receives the transaction
/// the host is tracking and the call itself; it brackets the call with
/// whatever segments or attributes the instrumentation wants. The inner
/// call must always run, even when the transaction is no longer
/// recording.
pub type Wrapper = Arc<dyn Fn(&mut Transaction, &mut dyn FnMut()) + Send + Sync>;

/// Wrapper registry keyed by `(library, symbol)`.
#[derive(Default)]
pub struct Registry {
    wrappers: HashMap<(String, String), Wrapper>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Registry {
        Registry {
            wrappers: HashMap::new(),
        }
    }

    /// Registers a wrapper for one call site. Registering the same pair
    /// twice replaces the earlier wrapper.
    pub fn register(&mut self, library: &str, symbol: &str, wrapper: Wrapper) {
        let key = (library.to_string(), symbol.to_string());
        if self.wrappers.insert(key, wrapper).is_some() {
            warn!("instrumentation wrapper for {library}::{symbol} replaced");
        }
    }

    /// The wrapper registered for this call site, if any. Callers keep the
    /// returned handle; resolution is a startup-time operation.
    #[must_use]
    pub fn resolve(&self, library: &str, symbol: &str) -> Option<Wrapper> {
        self.wrappers
            .get(&(library.to_string(), symbol.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }
}

/// The common wrapper: open a segment, run the call, close the segment.
#[must_use]
pub fn segment_wrapper(name: &str, category: SpanCategory) -> Wrapper {
    let name = name.to_string();
    Arc::new(move |transaction, call| {
        let token = transaction.start_segment(&name, category);
        call();
        if let Some(token) = token {
            transaction.end_segment(token);
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::attributes::filter::AttributeFilter;
    use crate::config::Config;
    use crate::harvest::{EnvelopeKind, HarvestState};
    use crate::traces::propagation::Propagation;
    use crate::traces::sampler::AdaptiveSampler;

    fn create_test_transaction() -> (Transaction, Arc<HarvestState>) {
        let config = Arc::new(Config {
            app_name: "test-app".to_string(),
            agent_run_id: "run-1".to_string(),
            distributed_tracing_enabled: true,
            ..Config::default()
        });
        let harvest = Arc::new(HarvestState::from_config(&config));
        let transaction = Transaction::new(
            "WebTransaction/Go/hello",
            Arc::clone(&config),
            Arc::new(Propagation::new(&config)),
            Arc::clone(&harvest),
            Arc::new(AttributeFilter::from_config(&config)),
            Arc::new(Mutex::new(AdaptiveSampler::new(
                config.sampling_target,
                config.report_period(),
            ))),
            fastrand::Rng::with_seed(7),
        );
        (transaction, harvest)
    }

    #[test]
    fn test_segment_wrapper_brackets_the_call() {
        let mut registry = Registry::new();
        registry.register(
            "postgres",
            "query",
            segment_wrapper("db.query", SpanCategory::Datastore),
        );
        let wrapper = registry.resolve("postgres", "query").unwrap();

        let (mut transaction, harvest) = create_test_transaction();
        let calls = AtomicUsize::new(0);
        wrapper(&mut transaction, &mut || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        transaction.end();

        let envelopes = harvest.drain("run-1", 0, 60);
        let spans = envelopes
            .iter()
            .find(|(kind, _)| *kind == EnvelopeKind::SpanEvents)
            .map(|(_, envelope)| envelope)
            .unwrap();
        let events = spans[2].as_array().unwrap();
        assert_eq!(events.len(), 2, "root plus the wrapped call");
        assert_eq!(events[1][0]["name"], serde_json::json!("db.query"));
        assert_eq!(events[1][0]["category"], serde_json::json!("datastore"));
    }

    #[test]
    fn test_duplicate_registration_replaces() {
        let mut registry = Registry::new();
        registry.register("redis", "get", segment_wrapper("first", SpanCategory::Generic));
        registry.register("redis", "get", segment_wrapper("second", SpanCategory::Generic));
        assert_eq!(registry.len(), 1);

        let (mut transaction, harvest) = create_test_transaction();
        let wrapper = registry.resolve("redis", "get").unwrap();
        wrapper(&mut transaction, &mut || {});
        transaction.end();

        let envelopes = harvest.drain("run-1", 0, 60);
        let spans = envelopes
            .iter()
            .find(|(kind, _)| *kind == EnvelopeKind::SpanEvents)
            .map(|(_, envelope)| envelope)
            .unwrap();
        assert_eq!(spans[2][1][0]["name"], serde_json::json!("second"));
    }

    #[test]
    fn test_resolve_unknown_pair_is_none() {
        let registry = Registry::new();
        assert!(registry.resolve("postgres", "query").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wrapped_call_runs_after_transaction_end() {
        let (mut transaction, _harvest) = create_test_transaction();
        transaction.end();

        let wrapper = segment_wrapper("late", SpanCategory::Generic);
        let calls = AtomicUsize::new(0);
        wrapper(&mut transaction, &mut || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
