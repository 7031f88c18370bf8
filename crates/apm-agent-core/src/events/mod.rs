//! Analytics event envelopes.
//!
//! Every event the pipeline reports (transaction, span, error, log) shares
//! one wire shape: a three-element array of intrinsics, user attributes, and
//! agent attributes. Reservoirs hold assembled events until the harvest
//! cycle drains them.

pub mod reservoir;

use serde::ser::{Serialize, SerializeTuple, Serializer};
use serde_json::{json, Map, Value};

use crate::events::reservoir::ReservoirMetadata;

/// One analytics event: `[intrinsics, user_attributes, agent_attributes]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalyticsEvent {
    pub intrinsics: Map<String, Value>,
    pub user: Map<String, Value>,
    pub agent: Map<String, Value>,
}

impl AnalyticsEvent {
    #[must_use]
    pub fn new(
        intrinsics: Map<String, Value>,
        user: Map<String, Value>,
        agent: Map<String, Value>,
    ) -> AnalyticsEvent {
        AnalyticsEvent {
            intrinsics,
            user,
            agent,
        }
    }

    /// The `type` intrinsic, when present.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.intrinsics.get("type").and_then(Value::as_str)
    }
}

impl Serialize for AnalyticsEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.intrinsics)?;
        tuple.serialize_element(&self.user)?;
        tuple.serialize_element(&self.agent)?;
        tuple.end()
    }
}

/// Builds the event envelope for one harvest window:
/// `[agent_run_id, {"reservoir_size": R, "events_seen": S}, [events...]]`.
#[must_use]
pub fn envelope(agent_run_id: &str, metadata: ReservoirMetadata, events: &[AnalyticsEvent]) -> Value {
    json!([
        agent_run_id,
        {
            "reservoir_size": metadata.reservoir_size,
            "events_seen": metadata.events_seen,
        },
        events,
    ])
}
