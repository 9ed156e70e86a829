//! Broker connection configuration types.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Default NATS server address.
pub const DEFAULT_SERVER: &str = "nats://localhost:4222";
/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Default `call` timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Broker construction options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Server addresses. Accepts one string (comma-separated allowed) or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub servers: Vec<String>,
    /// Authentication token.
    pub token: Option<String>,
    /// Client connection name reported to the server.
    pub name: Option<String>,
    /// Give up connecting after this long.
    pub connect_timeout_ms: u64,
    /// Deadline for `call` when none is given.
    pub request_timeout_ms: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_SERVER.to_string()],
            token: None,
            name: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl BrokerOptions {
    /// Options for the given servers, other settings at their defaults.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn split_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => split_servers(&value),
        OneOrMany::Many(values) => values.iter().flat_map(|v| split_servers(v)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_options_default() {
        let options = BrokerOptions::default();
        assert_eq!(options.servers, vec!["nats://localhost:4222"]);
        assert_eq!(options.request_timeout(), Duration::from_secs(10));
        assert!(options.token.is_none());
    }

    #[test]
    fn test_servers_single_string() {
        let options: BrokerOptions = serde_yaml::from_str("servers: nats://a:4222").unwrap();
        assert_eq!(options.servers, vec!["nats://a:4222"]);
    }

    #[test]
    fn test_servers_comma_separated() {
        let options: BrokerOptions =
            serde_yaml::from_str("servers: \"nats://a:4222, nats://b:4222\"").unwrap();
        assert_eq!(options.servers, vec!["nats://a:4222", "nats://b:4222"]);
    }

    #[test]
    fn test_servers_list() {
        let yaml = r#"
servers:
  - nats://a:4222
  - nats://b:4222
token: secret
"#;
        let options: BrokerOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.servers.len(), 2);
        assert_eq!(options.token.as_deref(), Some("secret"));
        // Unspecified fields keep their defaults
        assert_eq!(options.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn test_builder_methods() {
        let options = BrokerOptions::new(["nats://a:4222"])
            .with_token("t")
            .with_name("greeter")
            .with_request_timeout(Duration::from_millis(250));
        assert_eq!(options.token.as_deref(), Some("t"));
        assert_eq!(options.name.as_deref(), Some("greeter"));
        assert_eq!(options.request_timeout_ms, 250);
    }
}
