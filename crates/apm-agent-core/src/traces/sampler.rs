//! Per-transaction sampling decisions.
//!
//! Every transaction draws a base priority in `[0, 1)` at start. The pair
//! `(sampled, priority)` freezes the first time either value is needed — at
//! outbound context creation or event assembly — and never changes after
//! that.
//!
//! An inbound context may supply two remote signals: the wire-level
//! sampled flag, which selects the `remote_parent_sampled` /
//! `remote_parent_not_sampled` override, and the inherited decision pair,
//! which passes through unchanged when the selected override is `default`.
//! Whatever is missing — including everything, for a locally rooted
//! transaction — the agent-wide [`AdaptiveSampler`] decides, and sampled
//! transactions get a one-point priority boost so reservoirs prefer them.

use std::time::{Duration, Instant};

use crate::config::sampling::RemoteParentSampling;

/// Priority assigned by forced sampling; above every organic priority.
pub const FORCED_SAMPLING_PRIORITY: f64 = 2.0;

/// A frozen sampling decision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingDecision {
    pub sampled: bool,
    pub priority: f64,
}

/// Sampling state for one transaction.
#[derive(Debug)]
pub struct SamplingState {
    base_priority: f64,
    remote_flag: Option<bool>,
    inherited_sampled: Option<bool>,
    inherited_priority: Option<f64>,
    frozen: Option<SamplingDecision>,
}

impl SamplingState {
    /// Draws the base priority from `rng`.
    pub fn new(rng: &mut fastrand::Rng) -> SamplingState {
        SamplingState::with_base_priority(rng.f64())
    }

    /// Fixed base priority, for deterministic tests.
    #[must_use]
    pub fn with_base_priority(base_priority: f64) -> SamplingState {
        SamplingState {
            base_priority,
            remote_flag: None,
            inherited_sampled: None,
            inherited_priority: None,
            frozen: None,
        }
    }

    /// Adopts the remote signals from an accepted context: the wire-level
    /// sampled flag that selects an override, and the inherited decision
    /// pair used when the selected override is `default`. Any absent field
    /// is computed locally at freeze.
    pub fn adopt_inbound(
        &mut self,
        remote_flag: Option<bool>,
        inherited_sampled: Option<bool>,
        inherited_priority: Option<f64>,
    ) {
        self.remote_flag = remote_flag;
        self.inherited_sampled = inherited_sampled;
        self.inherited_priority = inherited_priority;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// The frozen decision, if one exists.
    #[must_use]
    pub fn decision(&self) -> Option<SamplingDecision> {
        self.frozen
    }

    /// Freezes and returns the decision. Subsequent calls return the first
    /// result; the overrides and `local_decide` are consulted only once.
    pub fn freeze(
        &mut self,
        remote_parent_sampled: RemoteParentSampling,
        remote_parent_not_sampled: RemoteParentSampling,
        local_decide: impl FnOnce() -> bool,
    ) -> SamplingDecision {
        if let Some(decision) = self.frozen {
            return decision;
        }

        let knob = match self.remote_flag {
            Some(true) => remote_parent_sampled,
            Some(false) => remote_parent_not_sampled,
            None => RemoteParentSampling::Default,
        };
        let decision = match knob {
            RemoteParentSampling::Default => self.inherit_or_decide(local_decide),
            RemoteParentSampling::AlwaysOn => SamplingDecision {
                sampled: true,
                priority: self
                    .inherited_priority
                    .unwrap_or(self.base_priority)
                    .max(FORCED_SAMPLING_PRIORITY),
            },
            RemoteParentSampling::AlwaysOff => {
                let priority = match self.inherited_priority {
                    Some(priority) if priority < FORCED_SAMPLING_PRIORITY => priority,
                    _ => self.base_priority,
                };
                SamplingDecision {
                    sampled: false,
                    priority,
                }
            }
        };

        self.frozen = Some(decision);
        decision
    }

    fn inherit_or_decide(&self, local_decide: impl FnOnce() -> bool) -> SamplingDecision {
        let sampled = match self.inherited_sampled {
            Some(sampled) => sampled,
            None => local_decide(),
        };
        let priority = match self.inherited_priority {
            Some(priority) => priority,
            // Boost keeps sampled events ahead of unsampled ones in the
            // reservoirs while staying below the forced band
            None if sampled => self.base_priority + 1.0,
            None => self.base_priority,
        };
        SamplingDecision { sampled, priority }
    }
}

/// Agent-wide fallback sampler: the first `target` transactions of each
/// period are sampled, the rest are not.
#[derive(Debug)]
pub struct AdaptiveSampler {
    target: u32,
    period: Duration,
    window_start: Instant,
    sampled_in_window: u32,
}

impl AdaptiveSampler {
    #[must_use]
    pub fn new(target: u32, period: Duration) -> AdaptiveSampler {
        AdaptiveSampler {
            target,
            period,
            window_start: Instant::now(),
            sampled_in_window: 0,
        }
    }

    /// Decides whether the next locally-rooted transaction is sampled.
    pub fn decide(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.period {
            self.window_start = now;
            self.sampled_in_window = 0;
        }
        if self.sampled_in_window < self.target {
            self.sampled_in_window += 1;
            true
        } else {
            false
        }
    }
}
