//! NATS core transport via `async-nats`.
//!
//! Request/reply uses the client's muxed inbox subscription, so a reply
//! that arrives after its request timed out is discarded by the client.

use std::sync::Arc;
use std::time::Duration;

use async_nats::client::RequestErrorKind;
use async_nats::{ConnectOptions, Event, HeaderMap, Message, Request, ServerAddr};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{Connector, Headers, InboundMessage, MessageStream, OutboundMessage, Transport};
use crate::config::BrokerOptions;
use crate::error::{BrokerError, Result};

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

impl From<Message> for InboundMessage {
    fn from(message: Message) -> Self {
        let mut headers = Headers::new();
        if let Some(map) = &message.headers {
            for (name, values) in map.iter() {
                if let Some(value) = values.first() {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }

        Self {
            subject: message.subject.to_string(),
            reply: message.reply.map(|r| r.to_string()),
            payload: message.payload,
            headers,
        }
    }
}

/// Parse configured server addresses.
fn server_addrs(options: &BrokerOptions) -> Result<Vec<ServerAddr>> {
    if options.servers.is_empty() {
        return Err(BrokerError::Connection("no servers configured".to_string()));
    }
    options
        .servers
        .iter()
        .map(|s| {
            s.parse::<ServerAddr>()
                .map_err(|e| BrokerError::Connection(format!("invalid server '{}': {}", s, e)))
        })
        .collect()
}

/// Transport backed by a connected `async_nats::Client`.
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Wrap an already connected client.
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Connect using broker options.
    pub async fn connect(options: &BrokerOptions) -> Result<Self> {
        let servers = server_addrs(options)?;

        let mut connect_options = ConnectOptions::new()
            .connection_timeout(options.connect_timeout())
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("Connected to NATS"),
                    Event::Disconnected => warn!("Disconnected from NATS"),
                    other => debug!(event = %other, "NATS connection event"),
                }
            });
        if let Some(token) = &options.token {
            connect_options = connect_options.token(token.clone());
        }
        if let Some(name) = &options.name {
            connect_options = connect_options.name(name);
        }

        let client = connect_options
            .connect(servers.as_slice())
            .await
            .map_err(|e| {
                BrokerError::Connection(format!(
                    "Failed to connect to NATS servers {:?}: {}",
                    options.servers, e
                ))
            })?;

        info!(servers = ?options.servers, "NATS client connected");
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let OutboundMessage {
            subject,
            payload,
            reply,
            headers,
        } = message;

        let result = match (reply, headers) {
            (None, None) => self.client.publish(subject, payload).await,
            (Some(reply), None) => self.client.publish_with_reply(subject, reply, payload).await,
            (None, Some(headers)) => {
                self.client
                    .publish_with_headers(subject, to_header_map(&headers), payload)
                    .await
            }
            (Some(reply), Some(headers)) => {
                self.client
                    .publish_with_reply_and_headers(subject, reply, to_header_map(&headers), payload)
                    .await
            }
        };
        result.map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to flush: {}", e)))
    }

    async fn request(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        let subject = message.subject;
        let mut request = Request::new()
            .payload(message.payload)
            .timeout(Some(timeout));
        if let Some(headers) = &message.headers {
            request = request.headers(to_header_map(headers));
        }

        match self.client.send_request(subject.clone(), request).await {
            Ok(reply) => Ok(reply.into()),
            Err(e) => Err(match e.kind() {
                RequestErrorKind::TimedOut => BrokerError::Timeout { subject, timeout },
                RequestErrorKind::NoResponders => BrokerError::NoResponders(subject),
                _ => BrokerError::Connection(e.to_string()),
            }),
        }
    }

    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<MessageStream> {
        let subscriber = match queue {
            Some(queue) => {
                self.client
                    .queue_subscribe(subject.to_string(), queue.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| BrokerError::Subscribe(format!("{}: {}", subject, e)))?;

        Ok(subscriber.map(InboundMessage::from).boxed())
    }

    async fn close(&self) -> Result<()> {
        // Outbound buffers are written before the client handle is dropped;
        // the connection closes once every clone of the client is gone.
        self.flush().await
    }
}

/// Connector producing `NatsTransport` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, options: &BrokerOptions) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(NatsTransport::connect(options).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addrs_parses_list() {
        let options = BrokerOptions {
            servers: vec![
                "nats://localhost:4222".to_string(),
                "nats://localhost:4223".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(server_addrs(&options).unwrap().len(), 2);
    }

    #[test]
    fn test_server_addrs_rejects_empty() {
        let options = BrokerOptions {
            servers: vec![],
            ..Default::default()
        };
        assert!(matches!(
            server_addrs(&options),
            Err(BrokerError::Connection(_))
        ));
    }

    #[test]
    fn test_header_map_conversion() {
        let mut headers = Headers::new();
        headers.insert("Correlation-Id".to_string(), "abc".to_string());
        let map = to_header_map(&headers);
        assert_eq!(
            map.get("Correlation-Id").map(|v| v.to_string()),
            Some("abc".to_string())
        );
    }
}
