//! # APM Agent Core
//!
//! This crate provides an in-process distributed tracing pipeline, designed to run
//! embedded within a host application. It converts trace context between wire
//! formats and an in-memory representation, freezes a sampling decision per
//! transaction, collects attributes and events into bounded priority-weighted
//! reservoirs, materializes a span tree from recorded segments, and hands harvest
//! envelopes to a collector on a timer.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - [`agent`]: Agent construction and transaction factory
//! - [`traces`]: Trace context, sampling, and wire propagation codecs
//! - [`transaction`]: The explicit per-request context object and its public API
//! - [`attributes`]: Per-destination, per-scope attribute storage and filtering
//! - [`events`]: Analytics event envelopes and sampled reservoirs
//! - [`harvest`]: Timer-driven harvest cycle and the collector seam
//! - [`metrics`]: Unscoped metric table, including supportability counters
//!
//! ## Failure policy
//!
//! Nothing in this crate may take the host application down. Malformed wire
//! input, attribute limit violations, callback failures, and collector faults
//! are recovered locally: the feature is skipped, a log line is emitted, and
//! where defined a supportability counter is incremented.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

/// Agent construction and transaction factory
pub mod agent;

/// Per-destination, per-scope attribute storage and filtering
pub mod attributes;

/// Defaults overlaid by environment-backed configuration sources
pub mod config;

/// Analytics event envelopes and sampled reservoirs
pub mod events;

/// Timer-driven harvest cycle and the collector seam
pub mod harvest;

/// Hostname detection for linking metadata
pub mod hostname;

/// Startup-time instrumentation registry
pub mod instrumentation;

/// Diagnostic line formatting and subscriber installation
pub mod logger;

/// Unscoped metric table and supportability counter names
pub mod metrics;

/// Trace context, sampling, and wire propagation codecs
pub mod traces;

/// The explicit per-request context object and its public API
pub mod transaction;

/// Crate version recorded in diagnostic logs at startup.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs the crate version at INFO level.
///
/// Called once from [`agent::Agent::from_env`]; hosts constructing the agent
/// another way can call it themselves after installing a subscriber.
pub fn log_build_info() {
    tracing::info!("apm-agent-core version: {}", AGENT_VERSION);
}
