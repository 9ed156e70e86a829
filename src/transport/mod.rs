//! Transport Handle contract.
//!
//! This module contains:
//! - `Transport` trait: publish, request/reply, subscribe, flush, close
//! - `Connector` trait: establishes a `Transport` from `BrokerOptions`
//! - Message types shared by every implementation
//! - Implementations: NATS (`async-nats`), in-process channel

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::BrokerOptions;
use crate::error::Result;

pub mod channel;
#[cfg(feature = "nats")]
pub mod nats;

pub use channel::{ChannelConnector, ChannelServer, ChannelTransport};
#[cfg(feature = "nats")]
pub use nats::{NatsConnector, NatsTransport};

/// Message headers. Single-valued; the first value wins on inbound messages.
pub type Headers = BTreeMap<String, String>;

/// Stream of messages delivered to one subscription.
///
/// Dropping the stream releases the subscription at the transport.
pub type MessageStream = BoxStream<'static, InboundMessage>;

/// A message received from the transport.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Reply address, present when the sender expects an answer.
    pub reply: Option<String>,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Message headers.
    pub headers: Headers,
}

impl InboundMessage {
    /// Look up a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A message to send through the transport.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply: Option<String>,
    pub headers: Option<Headers>,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply: None,
            headers: None,
        }
    }

    pub fn with_reply(mut self, reply: Option<String>) -> Self {
        self.reply = reply;
        self
    }

    pub fn with_headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = headers.filter(|h| !h.is_empty());
        self
    }
}

/// Interface to the underlying publish/subscribe transport.
///
/// Implementations must be safe for concurrent use from every subscription
/// loop and every `call`/`publish` of one broker.
///
/// Implementations:
/// - `NatsTransport`: NATS core via `async-nats`
/// - `ChannelTransport`: in-process routing for standalone runs and tests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget send.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Wait until buffered outbound messages are written to the network.
    async fn flush(&self) -> Result<()>;

    /// Send a request and await exactly one reply.
    ///
    /// Fails with `BrokerError::Timeout` when no reply arrives within
    /// `timeout`. The `reply` field of `message` is ignored; the transport
    /// allocates its own reply address.
    async fn request(&self, message: OutboundMessage, timeout: Duration)
        -> Result<InboundMessage>;

    /// Subscribe to a subject, optionally joining a queue group.
    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<MessageStream>;

    /// Flush pending outbound work and release the connection.
    async fn close(&self) -> Result<()>;
}

/// Establishes transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &BrokerOptions) -> Result<Arc<dyn Transport>>;
}

/// Default connector for the compiled feature set.
#[cfg(feature = "nats")]
pub fn default_connector() -> Arc<dyn Connector> {
    Arc::new(NatsConnector)
}

/// Default connector for the compiled feature set.
///
/// Without the `nats` feature every broker gets its own in-process server.
#[cfg(not(feature = "nats"))]
pub fn default_connector() -> Arc<dyn Connector> {
    Arc::new(ChannelServer::new().connector())
}
