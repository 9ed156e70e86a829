//! Payload codec, subject derivation, and the reply envelope.
//!
//! Payloads travel as JSON. Replies to requests are wrapped in an envelope
//! with exactly one reserved key:
//!
//! ```text
//! {"result": <any>}      success
//! {"error": "<message>"} failure
//! ```

use serde::Serialize;
use serde_json::Value;

use crate::error::{BrokerError, Result};

/// Message used when an inbound payload is not valid JSON.
pub const INVALID_PAYLOAD: &str = "invalid payload";

/// Return the canonical subject for a service action.
///
/// Format: `v{version}.{service}.{action}`. Both the registering side and
/// the calling side derive subjects through this function.
pub fn action_subject(version: &str, service: &str, action: &str) -> String {
    format!("v{}.{}.{}", version, service, action)
}

/// Check that a name can be used as a single subject token.
///
/// Rejects empty names, dots (token separators), wildcards, and whitespace.
pub fn validate_token(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BrokerError::Configuration(format!("{} name is empty", kind)));
    }
    if name
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(BrokerError::Configuration(format!(
            "{} name '{}' is not a valid subject token",
            kind, name
        )));
    }
    Ok(())
}

/// Serialize a payload to JSON bytes.
pub fn encode_json<T: Serialize + ?Sized>(payload: &T) -> Result<bytes::Bytes> {
    Ok(serde_json::to_vec(payload)?.into())
}

/// Deserialize JSON bytes into a structured value.
pub fn decode_json(payload: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(payload)?)
}

/// Reply envelope for request/reply responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyEnvelope {
    Result(Value),
    Error(String),
}

impl ReplyEnvelope {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn encode(&self) -> Result<bytes::Bytes> {
        encode_json(self)
    }

    /// Decode a reply.
    ///
    /// Unreserved top-level keys are ignored. An `error` key wins over a
    /// `result` key. Invalid JSON is a codec failure; a reply that is not an
    /// object, or carries neither key, is a `BrokerError::Remote` failure.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = decode_json(payload)?;
        let Value::Object(mut map) = value else {
            return Err(BrokerError::Remote(
                "malformed reply: expected an object".to_string(),
            ));
        };

        if let Some(error) = map.remove("error") {
            let message = match error {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Ok(Self::Error(message));
        }

        match map.remove("result") {
            Some(result) => Ok(Self::Result(result)),
            None => Err(BrokerError::Remote(
                "malformed reply: missing 'result' or 'error'".to_string(),
            )),
        }
    }

    /// Convert into the caller-facing result.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error(message) => Err(BrokerError::Remote(message)),
        }
    }
}
