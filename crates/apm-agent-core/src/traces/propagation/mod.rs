//! Distributed trace context propagation.
//!
//! Policy layer over the two wire codecs. W3C Trace Context headers are
//! preferred; the legacy `newrelic` payload header remains readable for
//! callers that have not migrated, and is attached outbound unless
//! configured away. [`Propagation`] applies the acceptance ladder — the
//! per-transaction lockout flags, the version gate, the trust gate, and
//! payload validation — and reports an outcome the transaction maps to
//! its supportability metrics.

pub mod carrier;
pub mod error;
pub mod payload;
pub mod w3c;

pub use error::Error;

use tracing::{debug, warn};

use self::carrier::{Extractor, Injector};
use self::payload::{Payload, PayloadData, PayloadError};
use crate::config::Config;
use crate::metrics::names;
use crate::traces::context::{TraceContext, TransportType, VendorEntry};
use crate::traces::{format_span_id, format_trace_id};

/// Per-transaction lockout flags consulted by the acceptance ladder.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkState {
    pub accepted: bool,
    pub outbound_created: bool,
}

/// Outcome of accepting legacy payload text.
#[derive(Debug, PartialEq)]
pub enum PayloadOutcome {
    Accepted(Box<TraceContext>),
    /// The payload parsed but could not be applied.
    Exception,
    /// The payload text could not be parsed or failed validation.
    ParseException,
    /// A context was already accepted on this transaction.
    IgnoredMultiple,
    /// The payload came from a newer major version.
    IgnoredMajorVersion,
    /// The payload was not produced under our trusted account key.
    IgnoredUntrustedAccount,
    /// Outbound headers were already created on this transaction.
    IgnoredCreateBeforeAccept,
    /// Distributed tracing is disabled; nothing is recorded.
    Disabled,
}

impl PayloadOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, PayloadOutcome::Accepted(_))
    }

    /// Supportability metric recorded for this outcome, if any.
    #[must_use]
    pub fn metric_name(&self) -> Option<&'static str> {
        match self {
            PayloadOutcome::Accepted(_) => Some(names::ACCEPT_PAYLOAD_SUCCESS),
            PayloadOutcome::Exception => Some(names::ACCEPT_PAYLOAD_EXCEPTION),
            PayloadOutcome::ParseException => Some(names::ACCEPT_PAYLOAD_PARSE_EXCEPTION),
            PayloadOutcome::IgnoredMultiple => Some(names::ACCEPT_PAYLOAD_IGNORED_MULTIPLE),
            PayloadOutcome::IgnoredMajorVersion => {
                Some(names::ACCEPT_PAYLOAD_IGNORED_MAJOR_VERSION)
            }
            PayloadOutcome::IgnoredUntrustedAccount => {
                Some(names::ACCEPT_PAYLOAD_IGNORED_UNTRUSTED_ACCOUNT)
            }
            PayloadOutcome::IgnoredCreateBeforeAccept => {
                Some(names::ACCEPT_PAYLOAD_IGNORED_CREATE_BEFORE_ACCEPT)
            }
            PayloadOutcome::Disabled => None,
        }
    }
}

/// What the tracestate header contributed to an accepted W3C context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracestateDisposition {
    /// Our trusted entry was present and parsed.
    Trusted,
    /// No entry under our trusted key, or no tracestate at all.
    NoEntry,
    /// An entry under our key was present but malformed.
    InvalidEntry,
}

impl TracestateDisposition {
    /// Supportability metric recorded alongside a header accept, if any.
    #[must_use]
    pub fn metric_name(self) -> Option<&'static str> {
        match self {
            TracestateDisposition::Trusted => None,
            TracestateDisposition::NoEntry => Some(names::TRACE_STATE_NO_NR_ENTRY),
            TracestateDisposition::InvalidEntry => Some(names::TRACE_STATE_INVALID_NR_ENTRY),
        }
    }
}

/// Outcome of accepting W3C headers from a carrier.
#[derive(Debug, PartialEq)]
pub enum HeadersOutcome {
    Accepted {
        context: Box<TraceContext>,
        tracestate: TracestateDisposition,
    },
    /// No traceparent was present; the legacy header carried the context.
    FromPayload(PayloadOutcome),
    IgnoredMultiple,
    IgnoredCreateBeforeAccept,
    /// Malformed traceparent; the transaction continues untraced.
    ParseFailure,
    /// The carrier held no recognized trace headers.
    Missing,
    Disabled,
}

/// Identity and frozen sampling decision of the local transaction, as
/// rendered into outbound headers.
#[derive(Clone, Debug)]
pub struct OutboundContext<'a> {
    pub trace_id: u128,
    pub transaction_id: u64,
    /// Current span guid. Absent when span events are disabled or the
    /// transaction is unsampled; the tracestate span field is then left
    /// empty and the legacy payload omits `d.id`.
    pub span_id: Option<u64>,
    pub sampled: bool,
    pub priority: f64,
    pub timestamp_ms: u64,
    pub tracing_vendors: &'a [VendorEntry],
}

/// Propagation policy derived from the agent configuration, resolved once
/// at agent startup.
#[derive(Clone, Debug)]
pub struct Propagation {
    enabled: bool,
    exclude_legacy_header: bool,
    account_id: String,
    primary_app_id: String,
    trusted_account_key: String,
}

impl Propagation {
    #[must_use]
    pub fn new(config: &Config) -> Propagation {
        Propagation {
            enabled: config.distributed_tracing_enabled,
            exclude_legacy_header: config.exclude_legacy_dt_header,
            account_id: config.account_id.clone(),
            primary_app_id: config.primary_app_id.clone(),
            trusted_account_key: config.trusted_account_key.clone(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Applies the acceptance ladder to legacy payload text.
    pub fn accept_payload(
        &self,
        link: LinkState,
        text: &str,
        transport_type: TransportType,
        now_ms: u64,
    ) -> PayloadOutcome {
        if !self.enabled {
            return PayloadOutcome::Disabled;
        }
        if link.accepted {
            return PayloadOutcome::IgnoredMultiple;
        }
        if link.outbound_created {
            return PayloadOutcome::IgnoredCreateBeforeAccept;
        }

        let payload = match Payload::decode(text) {
            Ok(payload) => payload,
            Err(PayloadError::UnsupportedMajorVersion(major)) => {
                debug!("ignoring trace payload from major version {major}");
                return PayloadOutcome::IgnoredMajorVersion;
            }
            Err(err) => {
                debug!("could not parse trace payload: {err}");
                return PayloadOutcome::ParseException;
            }
        };

        let trusted_by = payload.d.tk.as_deref().unwrap_or(&payload.d.ac);
        if trusted_by != self.trusted_account_key {
            debug!("ignoring trace payload from untrusted account {trusted_by}");
            return PayloadOutcome::IgnoredUntrustedAccount;
        }

        match payload.into_trace_context(transport_type, now_ms) {
            Ok(context) => PayloadOutcome::Accepted(Box::new(context)),
            Err(err) => {
                warn!("trace payload could not be applied: {err}");
                PayloadOutcome::Exception
            }
        }
    }

    /// Accepts W3C headers from a carrier, falling back to the legacy
    /// payload header when no traceparent is present.
    pub fn accept_headers(
        &self,
        link: LinkState,
        carrier: &dyn Extractor,
        transport_type: TransportType,
        now_ms: u64,
    ) -> HeadersOutcome {
        if !self.enabled {
            return HeadersOutcome::Disabled;
        }
        let Some(header) = carrier.get(w3c::TRACEPARENT_HEADER) else {
            if let Some(text) = carrier.get(payload::PAYLOAD_HEADER) {
                let outcome = self.accept_payload(link, text, transport_type, now_ms);
                return HeadersOutcome::FromPayload(outcome);
            }
            return HeadersOutcome::Missing;
        };
        if link.accepted {
            return HeadersOutcome::IgnoredMultiple;
        }
        if link.outbound_created {
            return HeadersOutcome::IgnoredCreateBeforeAccept;
        }

        let traceparent = match w3c::extract_traceparent(header) {
            Ok(traceparent) => traceparent,
            Err(err) => {
                debug!("{err}");
                return HeadersOutcome::ParseFailure;
            }
        };
        let tracestate = carrier
            .get(w3c::TRACESTATE_HEADER)
            .map(|header| w3c::extract_tracestate(header, &self.trusted_account_key))
            .unwrap_or_default();

        let disposition = if tracestate.trusted.is_some() {
            TracestateDisposition::Trusted
        } else if tracestate.invalid_trusted_entry {
            TracestateDisposition::InvalidEntry
        } else {
            TracestateDisposition::NoEntry
        };
        let context = build_w3c_context(traceparent, tracestate, transport_type, now_ms);
        HeadersOutcome::Accepted {
            context: Box::new(context),
            tracestate: disposition,
        }
    }

    /// Writes outbound trace headers into `carrier`: W3C traceparent and
    /// tracestate, plus the legacy header unless excluded. Returns `false`
    /// without touching the carrier when distributed tracing is disabled.
    pub fn insert_headers(&self, out: &OutboundContext<'_>, carrier: &mut dyn Injector) -> bool {
        if !self.enabled {
            return false;
        }

        let parent_id = out.span_id.unwrap_or(out.transaction_id);
        carrier.set(
            w3c::TRACEPARENT_HEADER,
            w3c::format_traceparent(out.trace_id, parent_id, out.sampled),
        );
        let params = w3c::TrustedEntryParams {
            trusted_account_key: &self.trusted_account_key,
            account_id: &self.account_id,
            app_id: &self.primary_app_id,
            span_id: out.span_id,
            transaction_id: out.transaction_id,
            sampled: out.sampled,
            priority: out.priority,
            timestamp_ms: out.timestamp_ms,
        };
        carrier.set(
            w3c::TRACESTATE_HEADER,
            w3c::format_tracestate(&params, out.tracing_vendors),
        );

        if !self.exclude_legacy_header {
            match self.create_payload(out).http_safe() {
                Ok(text) => carrier.set(payload::PAYLOAD_HEADER, text),
                Err(err) => warn!("could not attach legacy trace header: {err}"),
            }
        }
        true
    }

    /// Builds the legacy payload advertising this transaction as a remote
    /// parent.
    #[must_use]
    pub fn create_payload(&self, out: &OutboundContext<'_>) -> Payload {
        // tk repeats ac for most accounts; the field is only written when
        // the two differ.
        let trusted_key = (self.trusted_account_key != self.account_id)
            .then(|| self.trusted_account_key.clone());
        Payload {
            v: (0, 1),
            d: PayloadData {
                ty: "App".to_string(),
                ac: self.account_id.clone(),
                ap: self.primary_app_id.clone(),
                id: out.span_id.map(format_span_id),
                tr: format_trace_id(out.trace_id),
                pr: Some(out.priority),
                sa: Some(out.sampled),
                ti: out.timestamp_ms,
                tx: Some(format_span_id(out.transaction_id)),
                tk: trusted_key,
            },
        }
    }
}

fn build_w3c_context(
    traceparent: w3c::Traceparent,
    tracestate: w3c::Tracestate,
    transport_type: TransportType,
    now_ms: u64,
) -> TraceContext {
    let mut context = TraceContext {
        trace_id: traceparent.trace_id,
        parent_span_id: Some(traceparent.parent_id),
        trace_flags_sampled: Some(traceparent.sampled),
        transport_type,
        tracing_vendors: tracestate.vendors,
        ..TraceContext::default()
    };
    if let Some(trusted) = tracestate.trusted {
        context.parent_transaction_id = trusted.transaction_id;
        context.sampled = trusted.sampled;
        context.priority = trusted.priority;
        context.parent_type = Some(trusted.parent_type);
        context.account_id = Some(trusted.account_id);
        context.app_id = Some(trusted.app_id);
        context.trusted_parent_id = trusted.span_id;
        context.transport_duration =
            Some(now_ms.saturating_sub(trusted.timestamp_ms) as f64 / 1000.0);
    }
    context
}
