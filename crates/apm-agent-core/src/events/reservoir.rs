// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Priority-weighted sampling reservoir.
//!
//! A fixed-capacity pool of analytics events. Offers below capacity are
//! always retained. At capacity, a candidate with a priority strictly higher
//! than the lowest retained priority replaces that lowest event; otherwise it
//! replaces probabilistically, with a probability that shrinks as more events
//! are seen. `events_seen` counts every offer, retained or not, so the
//! harvest metadata reports the true population size behind each sample.
//!
//! The RNG is injected and seedable so replacement behavior is reproducible
//! in tests.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::events::AnalyticsEvent;

/// Sampling metadata reported beside the retained events at flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReservoirMetadata {
    /// Capacity of the reservoir during the window.
    pub reservoir_size: usize,
    /// Offers observed during the window, retained or not.
    pub events_seen: u64,
}

#[derive(Debug)]
struct RetainedEvent {
    priority: f64,
    sequence: u64,
    event: AnalyticsEvent,
}

impl PartialEq for RetainedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RetainedEvent {}

impl PartialOrd for RetainedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetainedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties evict the older event first
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Fixed-capacity, priority-ordered event pool for one harvest window.
#[derive(Debug)]
pub struct SampledReservoir {
    capacity: usize,
    pending_capacity: Option<usize>,
    events_seen: u64,
    sequence: u64,
    retained: BinaryHeap<Reverse<RetainedEvent>>,
    rng: fastrand::Rng,
}

impl SampledReservoir {
    #[must_use]
    pub fn new(capacity: usize) -> SampledReservoir {
        SampledReservoir::with_rng(capacity, fastrand::Rng::new())
    }

    /// Deterministic reservoir for tests and replayable sampling.
    #[must_use]
    pub fn with_seed(capacity: usize, seed: u64) -> SampledReservoir {
        SampledReservoir::with_rng(capacity, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(capacity: usize, rng: fastrand::Rng) -> SampledReservoir {
        SampledReservoir {
            capacity,
            pending_capacity: None,
            events_seen: 0,
            sequence: 0,
            retained: BinaryHeap::with_capacity(capacity.saturating_add(1)),
            rng,
        }
    }

    /// Offers one event. Returns whether the event was retained.
    pub fn offer(&mut self, event: AnalyticsEvent, priority: f64) -> bool {
        self.events_seen += 1;
        if self.capacity == 0 {
            return false;
        }

        let sequence = self.sequence;
        self.sequence += 1;
        let candidate = RetainedEvent {
            priority,
            sequence,
            event,
        };

        if self.retained.len() < self.capacity {
            self.retained.push(Reverse(candidate));
            return true;
        }

        let lowest = match self.retained.peek() {
            Some(Reverse(lowest)) => lowest,
            None => return false,
        };

        let replace = if priority > lowest.priority {
            true
        } else {
            // Probability decays with the observed population so late
            // arrivals cannot crowd out an established sample
            let acceptance = self.capacity as f64 / self.events_seen as f64;
            self.rng.f64() < acceptance
        };

        if replace {
            self.retained.pop();
            self.retained.push(Reverse(candidate));
        }
        replace
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.retained.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    #[must_use]
    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests a new capacity. Applied at the next flush so an in-progress
    /// window keeps its accounting consistent.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.pending_capacity = Some(capacity);
    }

    /// Drains the reservoir and resets the window counters.
    ///
    /// Retained events are returned ordered by descending priority.
    pub fn flush(&mut self) -> (ReservoirMetadata, Vec<AnalyticsEvent>) {
        let metadata = ReservoirMetadata {
            reservoir_size: self.capacity,
            events_seen: self.events_seen,
        };

        let drained = std::mem::take(&mut self.retained);
        let mut events: Vec<RetainedEvent> = drained.into_iter().map(|Reverse(e)| e).collect();
        events.sort_by(|a, b| b.cmp(a));

        self.events_seen = 0;
        self.sequence = 0;
        if let Some(capacity) = self.pending_capacity.take() {
            self.capacity = capacity;
        }

        (metadata, events.into_iter().map(|e| e.event).collect())
    }
}
