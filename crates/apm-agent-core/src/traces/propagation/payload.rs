//! Legacy single-header JSON payload codec.
//!
//! The `newrelic` header predates W3C Trace Context. Its value is a JSON
//! envelope, optionally base64-encoded for transports that cannot carry
//! raw JSON, with a `v` version pair and a `d` data object.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::Error;
use crate::traces::context::{ParentType, TraceContext, TransportType};

/// Header carrying the legacy JSON payload.
pub const PAYLOAD_HEADER: &str = "newrelic";

/// Highest payload major version this agent understands.
pub const SUPPORTED_MAJOR_VERSION: u64 = 1;

const PROPAGATOR_NAME: &str = "LegacyPayloadPropagator";

/// Why a payload could not be decoded or applied.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload text is not valid base64 or JSON")]
    Malformed,
    #[error("payload major version {0} is not supported")]
    UnsupportedMajorVersion(u64),
    #[error("payload field is missing or has the wrong type")]
    InvalidFields,
    #[error("payload carries neither d.tx nor d.id")]
    MissingSpanAndTransaction,
    #[error("parsed payload could not be applied to a trace context")]
    Unusable,
}

/// The `d` object of a payload envelope.
///
/// `tr` and span ids are hexadecimal strings on the wire. `ti` is a Unix
/// timestamp in milliseconds. Unknown fields from newer minor versions are
/// ignored on decode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    pub ty: String,
    pub ac: String,
    pub ap: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sa: Option<bool>,
    pub ti: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tk: Option<String>,
}

/// A legacy trace payload, as created for outgoing requests or decoded
/// from an incoming `newrelic` header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub v: (u64, u64),
    pub d: PayloadData,
}

impl Payload {
    /// Renders the payload as its plain JSON text form.
    pub fn text(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|_| Error::inject("unserializable payload", PROPAGATOR_NAME))
    }

    /// Renders the payload base64-encoded, safe for HTTP header transport.
    pub fn http_safe(&self) -> Result<String, Error> {
        Ok(STANDARD.encode(self.text()?))
    }

    /// Decodes payload text in either form. Base64 is detected by the
    /// absence of a leading `{`.
    ///
    /// The major version is checked before the full envelope is parsed so
    /// that payloads from future majors are reported as unsupported rather
    /// than malformed, whatever their shape.
    pub fn decode(text: &str) -> Result<Self, PayloadError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PayloadError::Malformed);
        }

        let json = if trimmed.starts_with('{') {
            trimmed.to_string()
        } else {
            let bytes = STANDARD
                .decode(trimmed)
                .map_err(|_| PayloadError::Malformed)?;
            String::from_utf8(bytes).map_err(|_| PayloadError::Malformed)?
        };

        let value: serde_json::Value =
            serde_json::from_str(&json).map_err(|_| PayloadError::Malformed)?;
        let major = value
            .get("v")
            .and_then(|v| v.get(0))
            .and_then(serde_json::Value::as_u64)
            .ok_or(PayloadError::Malformed)?;
        if major > SUPPORTED_MAJOR_VERSION {
            return Err(PayloadError::UnsupportedMajorVersion(major));
        }

        let payload: Payload =
            serde_json::from_value(value).map_err(|_| PayloadError::InvalidFields)?;
        if payload.d.tx.is_none() && payload.d.id.is_none() {
            return Err(PayloadError::MissingSpanAndTransaction);
        }
        Ok(payload)
    }

    /// Converts a decoded payload into an inbound trace context.
    ///
    /// `now_ms` anchors the transport duration, which is clamped to zero
    /// when the caller's clock is behind the payload timestamp.
    pub fn into_trace_context(
        self,
        transport_type: TransportType,
        now_ms: u64,
    ) -> Result<TraceContext, PayloadError> {
        let parent_type = self
            .d
            .ty
            .parse::<ParentType>()
            .map_err(|_| PayloadError::Unusable)?;
        let trace_id =
            u128::from_str_radix(&self.d.tr, 16).map_err(|_| PayloadError::Unusable)?;
        let parent_span_id = parse_hex_id(self.d.id.as_deref())?;
        let parent_transaction_id = parse_hex_id(self.d.tx.as_deref())?;

        let priority = self.d.pr.filter(|pr| {
            if pr.is_finite() {
                true
            } else {
                debug!("ignoring non-finite payload priority");
                false
            }
        });
        let transport_duration = now_ms.saturating_sub(self.d.ti) as f64 / 1000.0;

        Ok(TraceContext {
            trace_id,
            parent_span_id,
            parent_transaction_id,
            sampled: self.d.sa,
            priority,
            trace_flags_sampled: None,
            parent_type: Some(parent_type),
            account_id: Some(self.d.ac),
            app_id: Some(self.d.ap),
            transport_type,
            transport_duration: Some(transport_duration),
            tracing_vendors: Vec::new(),
            trusted_parent_id: None,
        })
    }
}

fn parse_hex_id(field: Option<&str>) -> Result<Option<u64>, PayloadError> {
    field
        .map(|s| u64::from_str_radix(s, 16).map_err(|_| PayloadError::Unusable))
        .transpose()
}
