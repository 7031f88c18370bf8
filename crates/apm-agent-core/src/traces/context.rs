//! Distributed trace context structures.
//!
//! [`TraceContext`] is the in-memory form of an accepted inbound context,
//! whichever wire format carried it. Once a transaction accepts a context it
//! is immutable; later accept attempts are rejected by the propagation
//! policy without touching it.

use std::fmt::Display;
use std::str::FromStr;

/// Transport the inbound request arrived over. Recorded as the
/// `parent.transportType` intrinsic and in caller rollup metric names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportType {
    #[default]
    Unknown,
    Http,
    Https,
    Kafka,
    Jms,
    IronMq,
    Amqp,
    Queue,
    Other,
}

impl TransportType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Unknown => "Unknown",
            TransportType::Http => "HTTP",
            TransportType::Https => "HTTPS",
            TransportType::Kafka => "Kafka",
            TransportType::Jms => "JMS",
            TransportType::IronMq => "IronMQ",
            TransportType::Amqp => "AMQP",
            TransportType::Queue => "Queue",
            TransportType::Other => "Other",
        }
    }
}

impl Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unrecognized values map to `Unknown` so a caller typo never rejects an
/// otherwise valid accept call.
impl FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "http" => TransportType::Http,
            "https" => TransportType::Https,
            "kafka" => TransportType::Kafka,
            "jms" => TransportType::Jms,
            "ironmq" => TransportType::IronMq,
            "amqp" => TransportType::Amqp,
            "queue" => TransportType::Queue,
            "other" => TransportType::Other,
            _ => TransportType::Unknown,
        })
    }
}

/// Kind of agent that produced the inbound context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentType {
    App,
    Browser,
    Mobile,
}

impl ParentType {
    /// Numeric code used in the tracestate entry.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            ParentType::App => 0,
            ParentType::Browser => 1,
            ParentType::Mobile => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<ParentType> {
        match code {
            0 => Some(ParentType::App),
            1 => Some(ParentType::Browser),
            2 => Some(ParentType::Mobile),
            _ => None,
        }
    }

    /// Name used in the legacy payload `ty` field and parent intrinsics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParentType::App => "App",
            ParentType::Browser => "Browser",
            ParentType::Mobile => "Mobile",
        }
    }
}

impl FromStr for ParentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "App" => Ok(ParentType::App),
            "Browser" => Ok(ParentType::Browser),
            "Mobile" => Ok(ParentType::Mobile),
            other => Err(format!("unknown parent type {other:?}")),
        }
    }
}

/// One foreign tracestate entry, preserved verbatim for outbound
/// passthrough.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VendorEntry {
    pub key: String,
    pub value: String,
}

impl Display for VendorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// An accepted inbound trace context.
///
/// Fields that a wire format does not carry stay `None`; the sampler
/// computes anything missing when the local decision freezes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceContext {
    pub trace_id: u128,
    /// Span guid of the remote caller (the traceparent parent-id, or the
    /// legacy payload `d.id`).
    pub parent_span_id: Option<u64>,
    /// Transaction guid of the remote caller (`d.tx` or the tracestate
    /// transaction field).
    pub parent_transaction_id: Option<u64>,
    /// Remote sampling decision carried by the vendor entry or payload.
    /// Inherited as-is under default override settings.
    pub sampled: Option<bool>,
    pub priority: Option<f64>,
    /// Raw sampled bit from the traceparent flags. Absent for contexts
    /// accepted from a legacy payload. Selects which remote-parent
    /// override applies; the inherited decision stays with `sampled`.
    pub trace_flags_sampled: Option<bool>,
    pub parent_type: Option<ParentType>,
    pub account_id: Option<String>,
    pub app_id: Option<String>,
    pub transport_type: TransportType,
    /// Seconds the request spent in transit, clamped at zero.
    pub transport_duration: Option<f64>,
    /// Foreign tracestate entries in arrival order.
    pub tracing_vendors: Vec<VendorEntry>,
    /// Span guid from the trusted tracestate entry, when one was consumed.
    pub trusted_parent_id: Option<u64>,
}

impl TraceContext {
    /// The flag that selects a remote-parent sampling override: the
    /// traceparent sampled bit when the context came from W3C headers,
    /// otherwise the payload's own decision.
    #[must_use]
    pub fn remote_sampling_flag(&self) -> Option<bool> {
        self.trace_flags_sampled.or(self.sampled)
    }

    /// Parent type name for intrinsics and rollup metrics, `Unknown` when
    /// the wire format did not carry one.
    #[must_use]
    pub fn parent_type_str(&self) -> &'static str {
        self.parent_type.map_or("Unknown", ParentType::as_str)
    }

    /// Account id for rollup metric names, `Unknown` when absent.
    #[must_use]
    pub fn account_str(&self) -> &str {
        self.account_id.as_deref().unwrap_or("Unknown")
    }

    /// App id for rollup metric names, `Unknown` when absent.
    #[must_use]
    pub fn app_str(&self) -> &str {
        self.app_id.as_deref().unwrap_or("Unknown")
    }
}
