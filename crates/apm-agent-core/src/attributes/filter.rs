//! Configuration-driven attribute filter rules.
//!
//! Rules come from the global `attributes` lists plus one include/exclude
//! pair per destination. A rule is an exact key or a key prefix ending in
//! `*`.
//!
//! # Precedence
//!
//! For each destination the best-matching rule decides:
//! 1. destination-specific rules beat global rules, so a destination include
//!    re-admits a key the global excludes removed;
//! 2. exact patterns beat wildcard patterns, longer prefixes beat shorter;
//! 3. at equal specificity, include wins.
//!
//! A key no rule matches keeps the destinations the insertion requested.

use crate::attributes::{Destination, Destinations};
use crate::config::{AttributeRuleList, Config};

#[derive(Clone, Debug)]
struct FilterRule {
    pattern: String,
    wildcard: bool,
    include: bool,
    destinations: Destinations,
    destination_specific: bool,
}

impl FilterRule {
    fn parse(
        raw: &str,
        include: bool,
        destinations: Destinations,
        destination_specific: bool,
    ) -> FilterRule {
        let (pattern, wildcard) = match raw.strip_suffix('*') {
            Some(prefix) => (prefix.to_string(), true),
            None => (raw.to_string(), false),
        };
        FilterRule {
            pattern,
            wildcard,
            include,
            destinations,
            destination_specific,
        }
    }

    fn matches(&self, key: &str) -> bool {
        if self.wildcard {
            key.starts_with(self.pattern.as_str())
        } else {
            key == self.pattern
        }
    }

    /// Higher compares as more authoritative.
    fn precedence(&self) -> (bool, bool, usize, bool) {
        (
            self.destination_specific,
            !self.wildcard,
            self.pattern.len(),
            self.include,
        )
    }
}

/// Compiled attribute filter. Built once per agent from configuration and
/// shared by every scope.
#[derive(Debug, Default)]
pub struct AttributeFilter {
    rules: Vec<FilterRule>,
}

impl AttributeFilter {
    #[must_use]
    pub fn from_config(config: &Config) -> AttributeFilter {
        let mut rules = Vec::new();
        push_rules(&mut rules, &config.attributes, Destinations::ALL, false);
        let per_destination = [
            (
                &config.transaction_events_attributes,
                Destinations::TRANSACTION_EVENT,
            ),
            (
                &config.transaction_trace_attributes,
                Destinations::TRANSACTION_TRACE,
            ),
            (&config.error_events_attributes, Destinations::ERROR_EVENT),
            (&config.span_events_attributes, Destinations::SPAN_EVENT),
            (&config.log_events_attributes, Destinations::LOG_EVENT),
        ];
        for (list, destinations) in per_destination {
            push_rules(&mut rules, list, destinations, true);
        }
        AttributeFilter { rules }
    }

    /// Trims `requested` to the destinations the rules allow for `key`.
    #[must_use]
    pub fn apply(&self, key: &str, requested: Destinations) -> Destinations {
        let mut allowed = requested;
        for destination in Destination::ALL {
            if !requested.contains(destination) {
                continue;
            }
            let best = self
                .rules
                .iter()
                .filter(|rule| rule.destinations.contains(destination) && rule.matches(key))
                .max_by_key(|rule| rule.precedence());
            if let Some(rule) = best {
                allowed = if rule.include {
                    allowed.with(destination)
                } else {
                    allowed.without(destination)
                };
            }
        }
        allowed
    }
}

fn push_rules(
    rules: &mut Vec<FilterRule>,
    list: &AttributeRuleList,
    destinations: Destinations,
    destination_specific: bool,
) {
    for raw in &list.include {
        rules.push(FilterRule::parse(
            raw,
            true,
            destinations,
            destination_specific,
        ));
    }
    for raw in &list.exclude {
        rules.push(FilterRule::parse(
            raw,
            false,
            destinations,
            destination_specific,
        ));
    }
}
