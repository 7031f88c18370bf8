//! Remote-parent sampling overrides.
//!
//! When a transaction is started by a remote caller, the inbound trace context
//! carries the caller's sampling decision. These knobs decide whether that
//! decision is inherited or overridden at the moment the local decision is
//! frozen.
//!
//! # Configuration
//!
//! Two independent knobs exist, selected by the inbound sampled flag:
//! - **Environment variable**: `APM_REMOTE_PARENT_SAMPLED=always_on`
//! - **Environment variable**: `APM_REMOTE_PARENT_NOT_SAMPLED=always_off`
//!
//! # Default
//!
//! If no value is specified or an invalid value is provided, the inbound
//! decision passes through unchanged.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer};
use tracing::error;

/// Behavior applied to the inbound sampling decision at freeze time.
///
/// The sampling priority scale reserves `2.0` and above for forced decisions:
/// `AlwaysOn` raises the priority to at least `2.0` so downstream reservoirs
/// prefer the event, while `AlwaysOff` keeps the priority strictly below
/// `2.0` and marks the transaction unsampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RemoteParentSampling {
    /// Inherit the inbound decision unchanged.
    #[default]
    Default,
    /// Force `sampled = true` and raise the priority to at least `2.0`.
    AlwaysOn,
    /// Force `sampled = false`; the priority stays strictly below `2.0`.
    AlwaysOff,
}

/// Parses override values from strings (case-insensitive).
///
/// Accepted values are `"default"`, `"always_on"`, and `"always_off"`.
/// Invalid inputs are logged and fall back to `Default`, so a typo in the
/// environment never prevents startup.
impl FromStr for RemoteParentSampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(RemoteParentSampling::Default),
            "always_on" => Ok(RemoteParentSampling::AlwaysOn),
            "always_off" => Ok(RemoteParentSampling::AlwaysOff),
            _ => {
                error!(
                    "Remote parent sampling value is invalid: {:?}, using default",
                    s
                );
                Ok(RemoteParentSampling::Default)
            }
        }
    }
}

impl Display for RemoteParentSampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            RemoteParentSampling::Default => "default",
            RemoteParentSampling::AlwaysOn => "always_on",
            RemoteParentSampling::AlwaysOff => "always_off",
        };
        write!(f, "{value}")
    }
}

impl<'de> Deserialize<'de> for RemoteParentSampling {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // FromStr is infallible by construction
        Ok(RemoteParentSampling::from_str(&s).unwrap_or_default())
    }
}
