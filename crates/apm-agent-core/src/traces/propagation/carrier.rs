//! Header carrier abstraction for context propagation.
//!
//! Trace context rides in whatever medium links two services: HTTP headers,
//! message queue metadata, or a JSON message body. The traits here hide the
//! medium from the propagation code. Header names are ASCII and proxies may
//! rewrite their case, so carriers lowercase keys on both write and lookup.
//!
//! # Inspired By
//!
//! Code inspired and adapted from the OpenTelemetry Rust project:
//! <https://github.com/open-telemetry/opentelemetry-rust/blob/main/opentelemetry/src/propagation/mod.rs>

use std::collections::HashMap;
use std::hash::BuildHasher;

use serde_json::Value;

/// Write half of a carrier.
pub trait Injector {
    /// Stores `value` under the lowercased form of `key`.
    fn set(&mut self, key: &str, value: String);
}

/// Read half of a carrier.
pub trait Extractor {
    /// Looks up `key` case-insensitively.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_ascii_lowercase(), value);
    }
}

impl<S: BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        let normalized = key.to_ascii_lowercase();
        HashMap::get(self, &normalized).map(String::as_str)
    }
}

/// JSON message bodies carry context as top-level string members. Writes to
/// a non-object `Value` are ignored and reads from one find nothing.
impl Injector for Value {
    fn set(&mut self, key: &str, value: String) {
        if let Some(body) = self.as_object_mut() {
            body.insert(key.to_ascii_lowercase(), Value::String(value));
        }
    }
}

impl Extractor for Value {
    fn get(&self, key: &str) -> Option<&str> {
        self.as_object()
            .and_then(|body| body.get(&key.to_ascii_lowercase()))
            .and_then(Value::as_str)
    }
}
