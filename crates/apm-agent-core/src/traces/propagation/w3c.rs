//! W3C Trace Context header codec.
//!
//! Parses and formats the `traceparent` and `tracestate` headers. The
//! `tracestate` header carries this agent's own entry under the
//! `{trusted_account_key}@nr` list key; entries from other vendors are
//! preserved verbatim, in order, for passthrough.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use super::error::Error;
use crate::traces::context::{ParentType, VendorEntry};
use crate::traces::{format_priority, format_span_id, format_trace_id};

/// W3C header carrying trace id, parent span id, and sampled flag.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// W3C header carrying vendor-specific tracing state.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Maximum number of foreign vendor entries preserved for passthrough.
/// Our own entry brings the outgoing list to the 32-entry limit.
pub const MAX_TRACING_VENDORS: usize = 31;

const PROPAGATOR_NAME: &str = "TraceContextPropagator";

lazy_static! {
    static ref TRACEPARENT_REGEX: Regex =
        Regex::new(r"(?i)^([a-f0-9]{2})-([a-f0-9]{32})-([a-f0-9]{16})-([a-f0-9]{2})(-.*)?$")
            .expect("TRACEPARENT_REGEX is valid");
    static ref ALL_ZERO_REGEX: Regex = Regex::new(r"^0+$").expect("ALL_ZERO_REGEX is valid");
}

/// Parsed `traceparent` header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Traceparent {
    pub trace_id: u128,
    pub parent_id: u64,
    pub sampled: bool,
}

/// Extracts a [`Traceparent`] from a raw header value.
///
/// Rejects the reserved version `ff`, all-zero trace or parent ids, and a
/// version-`00` header with trailing fields. Headers from future versions
/// are accepted as long as the first four fields are well formed.
pub fn extract_traceparent(header: &str) -> Result<Traceparent, Error> {
    let captures = TRACEPARENT_REGEX
        .captures(header.trim())
        .ok_or_else(|| Error::extract("malformed traceparent header", PROPAGATOR_NAME))?;

    let version = captures[1].to_lowercase();
    if version == "ff" {
        return Err(Error::extract("forbidden traceparent version", PROPAGATOR_NAME));
    }
    if version == "00" && captures.get(5).is_some() {
        return Err(Error::extract("malformed traceparent header", PROPAGATOR_NAME));
    }
    if ALL_ZERO_REGEX.is_match(&captures[2]) {
        return Err(Error::extract("all-zero trace id", PROPAGATOR_NAME));
    }
    if ALL_ZERO_REGEX.is_match(&captures[3]) {
        return Err(Error::extract("all-zero parent id", PROPAGATOR_NAME));
    }

    let trace_id = u128::from_str_radix(&captures[2], 16)
        .map_err(|_| Error::extract("trace id is not hexadecimal", PROPAGATOR_NAME))?;
    let parent_id = u64::from_str_radix(&captures[3], 16)
        .map_err(|_| Error::extract("parent id is not hexadecimal", PROPAGATOR_NAME))?;
    let flags = u8::from_str_radix(&captures[4], 16)
        .map_err(|_| Error::extract("trace flags are not hexadecimal", PROPAGATOR_NAME))?;

    Ok(Traceparent {
        trace_id,
        parent_id,
        sampled: flags & 0x01 == 0x01,
    })
}

/// Formats a `traceparent` header value, always at version `00`.
pub fn format_traceparent(trace_id: u128, span_id: u64, sampled: bool) -> String {
    format!(
        "00-{}-{}-{:02x}",
        format_trace_id(trace_id),
        format_span_id(span_id),
        u8::from(sampled)
    )
}

/// This agent's own tracestate entry, parsed from `{trusted_key}@nr=...`.
#[derive(Clone, Debug, PartialEq)]
pub struct TrustedEntry {
    pub version: u8,
    pub parent_type: ParentType,
    pub account_id: String,
    pub app_id: String,
    pub span_id: Option<u64>,
    pub transaction_id: Option<u64>,
    pub sampled: Option<bool>,
    pub priority: Option<f64>,
    pub timestamp_ms: u64,
}

/// Result of splitting an incoming `tracestate` header.
///
/// `trusted` holds the first entry under our trusted key, if one parsed.
/// `invalid_trusted_entry` is set when an entry under our key was present
/// but malformed; the caller still proceeds with the traceparent alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tracestate {
    pub trusted: Option<TrustedEntry>,
    pub invalid_trusted_entry: bool,
    pub vendors: Vec<VendorEntry>,
}

/// Splits a `tracestate` header into our trusted entry and foreign vendor
/// entries. Never fails: malformed list members are skipped and vendor
/// entries beyond [`MAX_TRACING_VENDORS`] are dropped.
pub fn extract_tracestate(header: &str, trusted_account_key: &str) -> Tracestate {
    let own_key = format!("{trusted_account_key}@nr");
    let mut state = Tracestate::default();
    let mut own_seen = false;

    for member in header.split(',') {
        let member = member.trim();
        if member.is_empty() {
            continue;
        }
        let Some((key, value)) = member.split_once('=') else {
            debug!("skipping tracestate member with no value: {member}");
            continue;
        };

        if key == own_key {
            if own_seen {
                debug!("skipping duplicate {own_key} tracestate entry");
                continue;
            }
            own_seen = true;
            match parse_trusted_entry(value) {
                Some(entry) => state.trusted = Some(entry),
                None => {
                    debug!("tracestate entry under {own_key} is malformed");
                    state.invalid_trusted_entry = true;
                }
            }
        } else if state.vendors.len() < MAX_TRACING_VENDORS {
            state.vendors.push(VendorEntry {
                key: key.to_string(),
                value: value.to_string(),
            });
        } else {
            debug!("dropping tracestate vendor entry beyond the passthrough limit: {key}");
        }
    }

    state
}

/// Parses the value of a `{trusted_key}@nr` entry.
///
/// The version-0 grammar is nine dash-separated fields:
/// `version-parentType-account-app-spanId-txnId-sampled-priority-timestamp`.
/// Span id, transaction id, sampled, and priority may be empty; when present
/// they must parse. Future versions may append fields, which are ignored.
fn parse_trusted_entry(value: &str) -> Option<TrustedEntry> {
    let fields: Vec<&str> = value.split('-').collect();
    if fields.len() < 9 {
        return None;
    }

    let version = fields[0].parse::<u8>().ok()?;
    if version == 0 && fields.len() != 9 {
        return None;
    }

    let parent_type = fields[1]
        .parse::<u8>()
        .ok()
        .and_then(ParentType::from_code)?;
    if fields[2].is_empty() || fields[3].is_empty() {
        return None;
    }

    let span_id = parse_optional(fields[4], |s| u64::from_str_radix(s, 16).ok())?;
    let transaction_id = parse_optional(fields[5], |s| u64::from_str_radix(s, 16).ok())?;
    let sampled = parse_optional(fields[6], |s| match s {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    })?;
    let priority = parse_optional(fields[7], |s| s.parse::<f64>().ok().filter(|p| p.is_finite()))?;
    let timestamp_ms = fields[8].parse::<u64>().ok()?;

    Some(TrustedEntry {
        version,
        parent_type,
        account_id: fields[2].to_string(),
        app_id: fields[3].to_string(),
        span_id,
        transaction_id,
        sampled,
        priority,
        timestamp_ms,
    })
}

/// Maps an empty field to `None` and a parse failure to an invalid entry.
fn parse_optional<T>(field: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<Option<T>> {
    if field.is_empty() {
        Some(None)
    } else {
        parse(field).map(Some)
    }
}

/// Fields of the outgoing trusted tracestate entry.
#[derive(Clone, Copy, Debug)]
pub struct TrustedEntryParams<'a> {
    pub trusted_account_key: &'a str,
    pub account_id: &'a str,
    pub app_id: &'a str,
    pub span_id: Option<u64>,
    pub transaction_id: u64,
    pub sampled: bool,
    pub priority: f64,
    pub timestamp_ms: u64,
}

/// Formats a `tracestate` header value with our entry first, followed by
/// the preserved vendor entries in their incoming order.
pub fn format_tracestate(params: &TrustedEntryParams<'_>, vendors: &[VendorEntry]) -> String {
    let span_field = params.span_id.map(format_span_id).unwrap_or_default();
    let mut header = format!(
        "{}@nr=0-0-{}-{}-{}-{}-{}-{}-{}",
        params.trusted_account_key,
        params.account_id,
        params.app_id,
        span_field,
        format_span_id(params.transaction_id),
        u8::from(params.sampled),
        format_priority(params.priority),
        params.timestamp_ms
    );
    for vendor in vendors {
        header.push(',');
        header.push_str(&vendor.to_string());
    }
    header
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    macro_rules! test_extract_traceparent {
        ($($name:ident: $value:expr,)*) => {
            $(
                #[test]
                fn $name() {
                    let (header, expected) = $value;
                    assert_eq!(extract_traceparent(header).ok(), expected);
                }
            )*
        }
    }

    test_extract_traceparent! {
        traceparent_not_sampled: (
            "00-74be672b84ddc4e4b28be285632bbc0a-27ddd2d8890283b4-00",
            Some(Traceparent {
                trace_id: 0x74be_672b_84dd_c4e4_b28b_e285_632b_bc0a,
                parent_id: 0x27dd_d2d8_8902_83b4,
                sampled: false,
            })
        ),
        traceparent_sampled: (
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            Some(Traceparent {
                trace_id: 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736,
                parent_id: 0x00f0_67aa_0ba9_02b7,
                sampled: true,
            })
        ),
        traceparent_uppercase_hex: (
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00F067AA0BA902B7-01",
            Some(Traceparent {
                trace_id: 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736,
                parent_id: 0x00f0_67aa_0ba9_02b7,
                sampled: true,
            })
        ),
        traceparent_surrounding_whitespace: (
            "  00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01  ",
            Some(Traceparent {
                trace_id: 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736,
                parent_id: 0x00f0_67aa_0ba9_02b7,
                sampled: true,
            })
        ),
        traceparent_future_version_extra_fields: (
            "cc-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra-fields",
            Some(Traceparent {
                trace_id: 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736,
                parent_id: 0x00f0_67aa_0ba9_02b7,
                sampled: true,
            })
        ),
        traceparent_version_zero_rejects_extra_fields: (
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
            None
        ),
        traceparent_forbidden_version: (
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            None
        ),
        traceparent_all_zero_trace_id: (
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            None
        ),
        traceparent_all_zero_parent_id: (
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            None
        ),
        traceparent_short_trace_id: (
            "00-4bf92f3577b34da6-00f067aa0ba902b7-01",
            None
        ),
        traceparent_not_hexadecimal: (
            "00-4bf92f3577b34da6a3ce929d0e0e473g-00f067aa0ba902b7-01",
            None
        ),
        traceparent_empty: ("", None),
    }

    #[test]
    fn traceparent_round_trip() {
        let header = format_traceparent(0x74be_672b_84dd_c4e4_b28b_e285_632b_bc0a, 0xff, true);
        assert_eq!(header, "00-74be672b84ddc4e4b28be285632bbc0a-00000000000000ff-01");

        let parsed = extract_traceparent(&header).ok();
        assert_eq!(
            parsed,
            Some(Traceparent {
                trace_id: 0x74be_672b_84dd_c4e4_b28b_e285_632b_bc0a,
                parent_id: 0xff,
                sampled: true,
            })
        );
    }

    #[test]
    fn tracestate_trusted_entry() {
        let state = extract_tracestate(
            "123@nr=0-0-1349956-41346604-27ddd2d8890283b4-b28be285632bbc0a-0-1.1273-1569367663277",
            "123",
        );

        assert_eq!(
            state.trusted,
            Some(TrustedEntry {
                version: 0,
                parent_type: ParentType::App,
                account_id: "1349956".to_string(),
                app_id: "41346604".to_string(),
                span_id: Some(0x27dd_d2d8_8902_83b4),
                transaction_id: Some(0xb28b_e285_632b_bc0a),
                sampled: Some(false),
                priority: Some(1.1273),
                timestamp_ms: 1_569_367_663_277,
            })
        );
        assert!(!state.invalid_trusted_entry);
        assert!(state.vendors.is_empty());
    }

    #[test]
    fn tracestate_preserves_vendor_order() {
        let state = extract_tracestate(
            "congo=t61rcWkgMzE,123@nr=0-0-1-2-----1569367663277,rojo=00f067aa0ba902b7",
            "123",
        );

        assert!(state.trusted.is_some());
        assert_eq!(
            state
                .vendors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["congo=t61rcWkgMzE", "rojo=00f067aa0ba902b7"]
        );
    }

    #[test]
    fn tracestate_no_trusted_entry() {
        let state = extract_tracestate("congo=t61rcWkgMzE", "123");

        assert_eq!(state.trusted, None);
        assert!(!state.invalid_trusted_entry);
        assert_eq!(state.vendors.len(), 1);
    }

    #[test]
    fn tracestate_other_account_entry_is_a_vendor() {
        let state = extract_tracestate("999@nr=0-0-1-2-----1569367663277", "123");

        assert_eq!(state.trusted, None);
        assert_eq!(state.vendors.len(), 1);
        assert_eq!(state.vendors[0].key, "999@nr");
    }

    #[test]
    fn tracestate_invalid_trusted_entry_is_flagged() {
        // Eight fields, not nine.
        let state = extract_tracestate("123@nr=0-0-1-2----1569367663277", "123");

        assert_eq!(state.trusted, None);
        assert!(state.invalid_trusted_entry);
    }

    #[test]
    fn tracestate_empty_optional_fields() {
        let state = extract_tracestate("123@nr=0-2-acct-app-----1569367663277", "123");

        let trusted = state.trusted.unwrap();
        assert_eq!(trusted.parent_type, ParentType::Mobile);
        assert_eq!(trusted.span_id, None);
        assert_eq!(trusted.transaction_id, None);
        assert_eq!(trusted.sampled, None);
        assert_eq!(trusted.priority, None);
    }

    #[test]
    fn tracestate_malformed_optional_field_invalidates_entry() {
        let state = extract_tracestate(
            "123@nr=0-0-1-2--b28be285632bbc0a-maybe-1.1273-1569367663277",
            "123",
        );

        assert_eq!(state.trusted, None);
        assert!(state.invalid_trusted_entry);
    }

    #[test]
    fn tracestate_unknown_parent_type_invalidates_entry() {
        let state = extract_tracestate("123@nr=0-9-1-2-----1569367663277", "123");

        assert_eq!(state.trusted, None);
        assert!(state.invalid_trusted_entry);
    }

    #[test]
    fn tracestate_vendor_passthrough_limit() {
        let header = (0..40)
            .map(|i| format!("v{i}=x"))
            .collect::<Vec<_>>()
            .join(",");
        let state = extract_tracestate(&header, "123");

        assert_eq!(state.vendors.len(), MAX_TRACING_VENDORS);
        assert_eq!(state.vendors[0].key, "v0");
        assert_eq!(state.vendors[MAX_TRACING_VENDORS - 1].key, "v30");
    }

    #[test]
    fn format_tracestate_own_entry_first() {
        let params = TrustedEntryParams {
            trusted_account_key: "123",
            account_id: "1349956",
            app_id: "41346604",
            span_id: Some(0x27dd_d2d8_8902_83b4),
            transaction_id: 0xb28b_e285_632b_bc0a,
            sampled: true,
            priority: 2.0,
            timestamp_ms: 1_569_367_663_277,
        };
        let vendors = vec![VendorEntry {
            key: "congo".to_string(),
            value: "t61rcWkgMzE".to_string(),
        }];

        assert_eq!(
            format_tracestate(&params, &vendors),
            "123@nr=0-0-1349956-41346604-27ddd2d8890283b4-b28be285632bbc0a-1-2.000000-1569367663277,congo=t61rcWkgMzE"
        );
    }

    #[test]
    fn format_tracestate_omits_span_id_when_absent() {
        let params = TrustedEntryParams {
            trusted_account_key: "123",
            account_id: "1",
            app_id: "2",
            span_id: None,
            transaction_id: 0xff,
            sampled: false,
            priority: 0.5,
            timestamp_ms: 1000,
        };

        assert_eq!(
            format_tracestate(&params, &[]),
            "123@nr=0-0-1-2--00000000000000ff-0-0.500000-1000"
        );
    }
}
