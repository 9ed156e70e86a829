//! Service configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Service construction options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, the middle subject token.
    pub name: String,
    /// Version, rendered as `v{version}` in subjects.
    pub version: String,
    /// Worker pool size.
    pub workers: usize,
    /// Optional per-invocation handler deadline.
    pub handler_timeout_ms: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: "1".to_string(),
            workers: 1,
            handler_timeout_ms: None,
        }
    }
}

impl ServiceConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}
