//! Materializes a finished segment arena into span events.

use serde_json::{json, Map, Value};

use crate::attributes::Destination;
use crate::events::AnalyticsEvent;
use crate::traces::context::TraceContext;
use crate::transaction::segments::SegmentArena;

/// Transaction-level facts shared by every span in the batch.
pub struct SpanBuildParams<'a> {
    pub trace_id: u128,
    pub transaction_guid: u64,
    pub sampled: bool,
    pub priority: f64,
    pub max_segments: usize,
    pub inbound: Option<&'a TraceContext>,
}

/// Walks the arena in start order and keeps the segments that survive the
/// cap: the root, anything flagged always-keep, and everything else while
/// the kept count stays under `max_segments`.
///
/// `parentId` of a kept span is the nearest kept ancestor, so dropped
/// intermediates never orphan their descendants. The root's parent is the
/// remote caller's span guid when an inbound context was accepted.
#[must_use]
pub fn build_span_events(
    arena: &SegmentArena,
    params: &SpanBuildParams<'_>,
) -> Vec<AnalyticsEvent> {
    let segments = arena.segments();
    // resolved[i] = guid of the nearest kept segment at or above i.
    let mut resolved: Vec<Option<u64>> = Vec::with_capacity(segments.len());
    let mut events = Vec::new();
    let mut kept = 0_usize;

    for (index, segment) in segments.iter().enumerate() {
        let inherited = match segment.parent {
            Some(parent) => resolved[parent],
            None => params.inbound.and_then(|context| context.parent_span_id),
        };
        let keep = index == 0 || segment.always_keep || kept < params.max_segments;
        if !keep {
            resolved.push(inherited);
            continue;
        }
        resolved.push(Some(segment.guid));
        kept += 1;

        let mut intrinsics = Map::new();
        intrinsics.insert("type".to_string(), json!("Span"));
        intrinsics.insert(
            "traceId".to_string(),
            json!(format!("{:032x}", params.trace_id)),
        );
        intrinsics.insert("guid".to_string(), json!(format!("{:016x}", segment.guid)));
        intrinsics.insert(
            "transactionId".to_string(),
            json!(format!("{:016x}", params.transaction_guid)),
        );
        if let Some(parent_guid) = inherited {
            intrinsics.insert("parentId".to_string(), json!(format!("{parent_guid:016x}")));
        }
        intrinsics.insert("name".to_string(), json!(segment.name));
        intrinsics.insert("category".to_string(), json!(segment.category.as_str()));
        intrinsics.insert("timestamp".to_string(), json!(segment.start_ms));
        intrinsics.insert(
            "duration".to_string(),
            json!(segment.duration_ms.unwrap_or(0) as f64 / 1_000.0),
        );
        intrinsics.insert("sampled".to_string(), json!(params.sampled));
        intrinsics.insert("priority".to_string(), json!(params.priority));
        if index == 0 {
            intrinsics.insert("entryPoint".to_string(), json!(true));
            intrinsics.insert("transaction.name".to_string(), json!(segment.name));
            if let Some(context) = params.inbound {
                append_parent_intrinsics(&mut intrinsics, context);
                if let Some(trusted) = context.trusted_parent_id {
                    intrinsics.insert(
                        "trustedParentId".to_string(),
                        json!(format!("{trusted:016x}")),
                    );
                }
                if !context.tracing_vendors.is_empty() {
                    let keys: Vec<&str> = context
                        .tracing_vendors
                        .iter()
                        .map(|vendor| vendor.key.as_str())
                        .collect();
                    intrinsics.insert("tracingVendors".to_string(), json!(keys.join(",")));
                }
            }
        }

        events.push(AnalyticsEvent::new(
            intrinsics,
            segment.attributes.user_map(Destination::SpanEvent),
            segment.attributes.agent_map(Destination::SpanEvent),
        ));
    }
    events
}

/// The `parent.*` intrinsics shared by the entry span and the transaction
/// event.
pub(crate) fn append_parent_intrinsics(intrinsics: &mut Map<String, Value>, context: &TraceContext) {
    intrinsics.insert("parent.type".to_string(), json!(context.parent_type_str()));
    if let Some(account) = &context.account_id {
        intrinsics.insert("parent.account".to_string(), json!(account));
    }
    if let Some(app) = &context.app_id {
        intrinsics.insert("parent.app".to_string(), json!(app));
    }
    intrinsics.insert(
        "parent.transportType".to_string(),
        json!(context.transport_type.as_str()),
    );
    if let Some(duration) = context.transport_duration {
        intrinsics.insert("parent.transportDuration".to_string(), json!(duration));
    }
}
