// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host identity for linking metadata.
//!
//! Resolution order: the `APM_HOSTNAME` override, then `HOSTNAME`, then the
//! kernel hostname, then a fixed `"unknown"` marker so event decoration
//! always has a value to report.

use std::env;

use tracing::warn;

const FALLBACK: &str = "unknown";

/// Resolves the name this host reports in linking metadata.
#[must_use]
pub fn detect() -> String {
    for key in ["APM_HOSTNAME", "HOSTNAME"] {
        match env::var(key) {
            Ok(value) if !value.is_empty() => return value,
            _ => {}
        }
    }

    if let Some(kernel) = kernel_hostname() {
        return kernel;
    }

    warn!("no usable hostname source, reporting '{FALLBACK}'");
    FALLBACK.to_string()
}

// HOSTNAME is usually absent outside interactive shells, so on servers the
// kernel is the common source.
#[cfg(target_os = "linux")]
fn kernel_hostname() -> Option<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname").ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(not(target_os = "linux"))]
fn kernel_hostname() -> Option<String> {
    None
}
