// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed trace identity, sampling, and wire propagation.
//!
//! This module owns everything that crosses a process boundary:
//! - **`context`**: The in-memory form of an accepted trace context
//! - **`propagation`**: Codecs between wire headers / payload text and
//!   [`context::TraceContext`], plus the acceptance policy ladder
//! - **`sampler`**: The frozen per-transaction sampling decision and the
//!   local adaptive fallback used when no remote decision arrives
//!
//! Identifiers are numeric internally (`u128` trace ids, `u64` span ids) and
//! rendered as fixed-width lowercase hex at the wire boundary.

pub mod context;
pub mod propagation;
pub mod sampler;

/// Renders a trace id as 32 lowercase hex characters.
#[must_use]
pub fn format_trace_id(trace_id: u128) -> String {
    format!("{trace_id:032x}")
}

/// Renders a span or transaction guid as 16 lowercase hex characters.
#[must_use]
pub fn format_span_id(span_id: u64) -> String {
    format!("{span_id:016x}")
}

/// Renders a sampling priority with exactly six decimal places.
///
/// The output is locale-independent; `2.0` renders as `"2.000000"`.
#[must_use]
pub fn format_priority(priority: f64) -> String {
    format!("{priority:.6}")
}
