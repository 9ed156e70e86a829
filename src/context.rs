//! Per-invocation request context.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::broker::{CallOptions, NatsBroker, PublishOptions};
use crate::codec::ReplyEnvelope;
use crate::error::{BrokerError, Result};
use crate::transport::{Headers, InboundMessage, OutboundMessage};

/// Header carrying the correlation id across calls.
pub const CORRELATION_HEADER: &str = "Correlation-Id";

/// Everything a handler gets for one inbound message.
///
/// Built immediately before the handler runs and owned by that single
/// invocation.
pub struct RequestContext {
    /// Decoded (and validated, for actions) payload. `Null` for raw
    /// subscriptions; the bytes are in `msg.payload`.
    pub payload: Value,
    /// Raw inbound message: subject, reply address, headers, bytes.
    pub msg: InboundMessage,
    /// Correlation id from the inbound headers, or freshly generated.
    pub correlation_id: String,
    broker: NatsBroker,
}

impl RequestContext {
    pub(crate) fn new(broker: NatsBroker, msg: InboundMessage, payload: Value) -> Self {
        let correlation_id = msg
            .header(CORRELATION_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            payload,
            msg,
            correlation_id,
            broker,
        }
    }

    /// Broker the message arrived on, for calling other services.
    pub fn broker(&self) -> &NatsBroker {
        &self.broker
    }

    /// Subject the message arrived on.
    pub fn subject(&self) -> &str {
        &self.msg.subject
    }

    /// Reply address, when the sender expects an answer.
    pub fn reply_to(&self) -> Option<&str> {
        self.msg.reply.as_deref()
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BrokerError::Validation(e.to_string()))
    }

    fn correlation_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(CORRELATION_HEADER.to_string(), self.correlation_id.clone());
        headers
    }

    /// Call another action, forwarding this request's correlation id.
    pub async fn call<P>(
        &self,
        topic: &str,
        payload: &P,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        let options = CallOptions {
            timeout: timeout.into(),
            headers: Some(self.correlation_headers()),
        };
        self.broker.call_with(topic, payload, options).await
    }

    /// Publish an event, forwarding this request's correlation id.
    pub async fn publish<P>(&self, subject: &str, payload: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let options = PublishOptions {
            headers: Some(self.correlation_headers()),
            ..Default::default()
        };
        self.broker.publish_with(subject, payload, options).await
    }

    /// Answer the sender directly with a success envelope.
    ///
    /// Meant for plain subscriptions; actions reply with their return value.
    pub async fn respond(&self, result: Value) -> Result<()> {
        let Some(reply) = self.msg.reply.clone() else {
            return Err(BrokerError::Configuration(format!(
                "message on '{}' has no reply address",
                self.msg.subject
            )));
        };
        let payload = ReplyEnvelope::Result(result).encode()?;
        self.broker
            .send(OutboundMessage::new(reply, payload))
            .await
    }
}
