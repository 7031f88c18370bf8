//! Per-destination, per-scope attribute storage.
//!
//! Attributes are key/value pairs attached either to the transaction or to a
//! single span. Each insertion names a set of destinations (the event types
//! the attribute may appear on); configuration-driven filter rules then trim
//! that set per destination. Scopes never merge: the same key in the
//! transaction scope and a span scope yields two independent attributes.
//!
//! # Insertion pipeline
//!
//! 1. Non-scalar values (arrays, maps, null) are rejected.
//! 2. Keys longer than 255 bytes are rejected.
//! 3. String values are truncated on a UTF-8 boundary to the destination cap
//!    (255 bytes for log-event context values, 4095 otherwise).
//! 4. Filter rules trim the destination set; an empty result drops the
//!    attribute without consuming budget.
//! 5. Each scope holds at most 64 custom attributes. Re-inserting an existing
//!    key overwrites in place and never consumes budget.

pub mod filter;

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::attributes::filter::AttributeFilter;

/// Longest accepted attribute key, in bytes.
pub const MAX_KEY_BYTES: usize = 255;
/// Custom attributes allowed per scope.
pub const MAX_CUSTOM_ATTRIBUTES: usize = 64;
/// Byte cap for string values headed anywhere but log-event context.
pub const MAX_TEXT_BYTES: usize = 4095;
/// Byte cap for log-event context values.
pub const MAX_LOG_CONTEXT_TEXT_BYTES: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttributeError {
    #[error("attribute value must be a scalar, got {0}")]
    NotScalar(&'static str),
    #[error("attribute key is {0} bytes, limit is {MAX_KEY_BYTES}")]
    KeyTooLong(usize),
    #[error("scope already holds {MAX_CUSTOM_ATTRIBUTES} custom attributes")]
    BudgetExhausted,
}

/// Scalar attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
}

impl AttributeValue {
    /// Converts a caller-supplied JSON value, rejecting non-scalars.
    pub fn from_json(value: &Value) -> Result<AttributeValue, AttributeError> {
        match value {
            Value::String(s) => Ok(AttributeValue::Text(s.clone())),
            Value::Bool(b) => Ok(AttributeValue::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(AttributeValue::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(AttributeValue::Double(f))
                } else {
                    // u64 beyond i64::MAX; keep the magnitude as a double
                    Ok(AttributeValue::Double(n.as_u64().unwrap_or(0) as f64))
                }
            }
            Value::Null => Err(AttributeError::NotScalar("null")),
            Value::Array(_) => Err(AttributeError::NotScalar("array")),
            Value::Object(_) => Err(AttributeError::NotScalar("object")),
        }
    }

    /// Truncates text values to `cap` bytes on a character boundary.
    fn truncated(self, cap: usize) -> AttributeValue {
        match self {
            AttributeValue::Text(s) if s.len() > cap => {
                let mut end = cap;
                while end > 0 && !s.is_char_boundary(end) {
                    end -= 1;
                }
                AttributeValue::Text(s[..end].to_string())
            }
            other => other,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Value {
        match self {
            AttributeValue::Text(s) => Value::String(s.clone()),
            AttributeValue::Integer(i) => Value::from(*i),
            AttributeValue::Double(f) => Value::from(*f),
            AttributeValue::Boolean(b) => Value::from(*b),
        }
    }
}

/// Where an attribute came from. Failures inserting custom attributes are
/// reported to the caller; agent attribute failures are dropped silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeOrigin {
    Custom,
    Agent,
}

/// One event type an attribute can be reported on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    TransactionEvent,
    TransactionTrace,
    ErrorEvent,
    SpanEvent,
    LogEvent,
}

impl Destination {
    pub const ALL: [Destination; 5] = [
        Destination::TransactionEvent,
        Destination::TransactionTrace,
        Destination::ErrorEvent,
        Destination::SpanEvent,
        Destination::LogEvent,
    ];

    const fn bit(self) -> u8 {
        match self {
            Destination::TransactionEvent => 1,
            Destination::TransactionTrace => 1 << 1,
            Destination::ErrorEvent => 1 << 2,
            Destination::SpanEvent => 1 << 3,
            Destination::LogEvent => 1 << 4,
        }
    }
}

/// Set of destinations, stored as a bit mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Destinations(u8);

impl Destinations {
    pub const NONE: Destinations = Destinations(0);
    pub const TRANSACTION_EVENT: Destinations = Destinations(Destination::TransactionEvent.bit());
    pub const TRANSACTION_TRACE: Destinations = Destinations(Destination::TransactionTrace.bit());
    pub const ERROR_EVENT: Destinations = Destinations(Destination::ErrorEvent.bit());
    pub const SPAN_EVENT: Destinations = Destinations(Destination::SpanEvent.bit());
    pub const LOG_EVENT: Destinations = Destinations(Destination::LogEvent.bit());

    /// Default destinations for transaction-scope custom parameters.
    pub const CUSTOM_DEFAULT: Destinations = Destinations(
        Destination::TransactionEvent.bit()
            | Destination::TransactionTrace.bit()
            | Destination::ErrorEvent.bit(),
    );

    pub const ALL: Destinations = Destinations(
        Destination::TransactionEvent.bit()
            | Destination::TransactionTrace.bit()
            | Destination::ErrorEvent.bit()
            | Destination::SpanEvent.bit()
            | Destination::LogEvent.bit(),
    );

    #[must_use]
    pub const fn union(self, other: Destinations) -> Destinations {
        Destinations(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, destination: Destination) -> bool {
        self.0 & destination.bit() != 0
    }

    #[must_use]
    pub const fn with(self, destination: Destination) -> Destinations {
        Destinations(self.0 | destination.bit())
    }

    #[must_use]
    pub const fn without(self, destination: Destination) -> Destinations {
        Destinations(self.0 & !destination.bit())
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// An attribute retained by a store, with its post-filter destinations.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredAttribute {
    pub value: AttributeValue,
    pub origin: AttributeOrigin,
    pub destinations: Destinations,
}

/// Attribute storage for one scope (the transaction or a single span).
#[derive(Debug, Default)]
pub struct AttributeStore {
    entries: HashMap<String, StoredAttribute>,
    custom_count: usize,
}

impl AttributeStore {
    #[must_use]
    pub fn new() -> Self {
        AttributeStore::default()
    }

    /// Runs the insertion pipeline. `Ok(())` means the value was stored, or
    /// was dropped by filter rules alone (configuration is not a caller
    /// error).
    pub fn insert(
        &mut self,
        filter: &AttributeFilter,
        key: &str,
        value: &Value,
        origin: AttributeOrigin,
        requested: Destinations,
    ) -> Result<(), AttributeError> {
        let scalar = AttributeValue::from_json(value)?;

        if key.len() > MAX_KEY_BYTES {
            return Err(AttributeError::KeyTooLong(key.len()));
        }

        // Log context values over the cap are dropped whole; the log line
        // itself still reports. Other destinations truncate instead.
        if requested == Destinations::LOG_EVENT {
            if let AttributeValue::Text(text) = &scalar {
                if text.len() > MAX_LOG_CONTEXT_TEXT_BYTES {
                    tracing::debug!(
                        "log context attribute {:?} is {} bytes, limit is {MAX_LOG_CONTEXT_TEXT_BYTES}; dropped",
                        key,
                        text.len(),
                    );
                    return Ok(());
                }
            }
        }
        let scalar = scalar.truncated(MAX_TEXT_BYTES);

        let allowed = filter.apply(key, requested);
        if allowed.is_empty() {
            tracing::debug!("attribute {:?} removed by filter rules", key);
            return Ok(());
        }

        let replacing = self.entries.contains_key(key);
        if origin == AttributeOrigin::Custom && !replacing && self.custom_count >= MAX_CUSTOM_ATTRIBUTES
        {
            return Err(AttributeError::BudgetExhausted);
        }

        if !replacing && origin == AttributeOrigin::Custom {
            self.custom_count += 1;
        }
        if replacing {
            // Keep the budget honest when an agent attribute overwrites a
            // custom one or vice versa
            if let Some(existing) = self.entries.get(key) {
                match (existing.origin, origin) {
                    (AttributeOrigin::Custom, AttributeOrigin::Agent) => self.custom_count -= 1,
                    (AttributeOrigin::Agent, AttributeOrigin::Custom) => self.custom_count += 1,
                    _ => (),
                }
            }
        }
        self.entries.insert(
            key.to_string(),
            StoredAttribute {
                value: scalar,
                origin,
                destinations: allowed,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&StoredAttribute> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn custom_count(&self) -> usize {
        self.custom_count
    }

    /// Custom-origin attributes eligible for `destination`, as a JSON map.
    #[must_use]
    pub fn user_map(&self, destination: Destination) -> serde_json::Map<String, Value> {
        self.map_for(destination, AttributeOrigin::Custom)
    }

    /// Agent-origin attributes eligible for `destination`, as a JSON map.
    #[must_use]
    pub fn agent_map(&self, destination: Destination) -> serde_json::Map<String, Value> {
        self.map_for(destination, AttributeOrigin::Agent)
    }

    fn map_for(
        &self,
        destination: Destination,
        origin: AttributeOrigin,
    ) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        for (key, attribute) in &self.entries {
            if attribute.origin == origin && attribute.destinations.contains(destination) {
                map.insert(key.clone(), attribute.value.as_json());
            }
        }
        map
    }
}
