//! In-process channel transport for standalone mode.
//!
//! A `ChannelServer` plays the role of the message broker: every
//! `ChannelTransport` connected to the same server sees the same subjects,
//! so several brokers in one process behave like several processes sharing
//! a NATS cluster. Supports NATS subject wildcards (`*`, `>`), queue groups
//! (one member per group receives each message), and request/reply through
//! private inbox subjects.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Connector, InboundMessage, MessageStream, OutboundMessage, Transport};
use crate::config::BrokerOptions;
use crate::error::{BrokerError, Result};

/// Prefix for reply inbox subjects.
const INBOX_PREFIX: &str = "_INBOX";

/// Check if a subject matches a subscription pattern.
///
/// Matching rules:
/// - Tokens are separated by `.`
/// - `*` matches exactly one token
/// - `>` as the last token matches one or more remaining tokens
/// - Any other token must match exactly
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Entry {
    pattern: String,
    queue: Option<String>,
    connection: u64,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct Router {
    entries: BTreeMap<u64, Entry>,
    /// Round-robin cursor per queue group.
    cursors: HashMap<String, usize>,
}

impl Router {
    /// Deliver a message to every matching plain subscriber and to one
    /// member of each matching queue group. Returns the delivery count.
    fn route(&mut self, message: &InboundMessage) -> usize {
        let mut plain = Vec::new();
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();

        for (id, entry) in &self.entries {
            if entry.sender.is_closed() || !subject_matches(&entry.pattern, &message.subject) {
                continue;
            }
            match &entry.queue {
                Some(queue) => groups.entry(queue.clone()).or_default().push(*id),
                None => plain.push(*id),
            }
        }

        let mut targets = plain;
        for (queue, members) in groups {
            let cursor = self.cursors.entry(queue).or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor = cursor.wrapping_add(1);
        }

        let mut delivered = 0;
        for id in targets {
            let sent = self
                .entries
                .get(&id)
                .map(|entry| entry.sender.send(message.clone()).is_ok())
                .unwrap_or(false);
            if sent {
                delivered += 1;
            } else {
                self.entries.remove(&id);
            }
        }
        delivered
    }
}

struct ServerInner {
    router: Mutex<Router>,
    next_id: AtomicU64,
    reachable: AtomicBool,
}

impl ServerInner {
    fn router(&self) -> MutexGuard<'_, Router> {
        // A panic while holding the lock cannot leave the routing table
        // half-updated, so a poisoned lock is still usable.
        self.router.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        pattern: &str,
        queue: Option<&str>,
        connection: u64,
    ) -> (u64, mpsc::UnboundedReceiver<InboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.router().entries.insert(
            id,
            Entry {
                pattern: pattern.to_string(),
                queue: queue.map(str::to_string),
                connection,
                sender,
            },
        );
        (id, receiver)
    }

    fn remove(&self, id: u64) {
        self.router().entries.remove(&id);
    }
}

/// In-process message broker shared by channel transports.
#[derive(Clone)]
pub struct ChannelServer {
    inner: Arc<ServerInner>,
}

impl Default for ChannelServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                router: Mutex::new(Router::default()),
                next_id: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the server going away (or coming back) for new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Open a connection to this server.
    pub fn connect(&self) -> Result<ChannelTransport> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(
                "no servers available for connection".to_string(),
            ));
        }
        Ok(ChannelTransport {
            server: self.inner.clone(),
            connection: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a connector that hands out connections to this server.
    pub fn connector(&self) -> ChannelConnector {
        ChannelConnector {
            server: self.clone(),
        }
    }

    /// Number of live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .router()
            .entries
            .values()
            .filter(|e| !e.sender.is_closed() && !e.pattern.starts_with(INBOX_PREFIX))
            .count()
    }
}

/// Connector for `ChannelServer`.
#[derive(Clone)]
pub struct ChannelConnector {
    server: ChannelServer,
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, options: &BrokerOptions) -> Result<Arc<dyn Transport>> {
        let transport = self.server.connect()?;
        info!(servers = ?options.servers, "Connected to channel server");
        Ok(Arc::new(transport))
    }
}

/// Routing table entry owned by a subscription or an inbox.
struct RouteGuard {
    id: u64,
    server: Arc<ServerInner>,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.server.remove(self.id);
    }
}

/// Subscription stream that unregisters itself when dropped.
struct ChannelSubscription {
    messages: UnboundedReceiverStream<InboundMessage>,
    _route: RouteGuard,
}

impl Stream for ChannelSubscription {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.messages).poll_next(cx)
    }
}

/// One connection to a `ChannelServer`.
pub struct ChannelTransport {
    server: Arc<ServerInner>,
    connection: u64,
    closed: AtomicBool,
}

impl ChannelTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        Ok(())
    }

    fn deliver(&self, message: OutboundMessage) -> usize {
        let inbound = InboundMessage {
            subject: message.subject,
            reply: message.reply,
            payload: message.payload,
            headers: message.headers.unwrap_or_default(),
        };
        self.server.router().route(&inbound)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.ensure_open()?;
        let subject = message.subject.clone();
        let receivers = self.deliver(message);
        debug!(subject = %subject, receivers, "Published message to channel");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn request(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        self.ensure_open()?;

        let subject = message.subject.clone();
        let inbox = format!("{}.{}", INBOX_PREFIX, Uuid::new_v4().simple());
        let (id, mut replies) = self.server.register(&inbox, None, self.connection);
        let _inbox = RouteGuard {
            id,
            server: self.server.clone(),
        };

        if self.deliver(message.with_reply(Some(inbox))) == 0 {
            return Err(BrokerError::NoResponders(subject));
        }

        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BrokerError::Connection("connection closed".to_string())),
            Err(_) => Err(BrokerError::Timeout { subject, timeout }),
        }
    }

    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<MessageStream> {
        self.ensure_open()?;
        if subject.is_empty() {
            return Err(BrokerError::Subscribe("empty subject".to_string()));
        }

        let (id, receiver) = self.server.register(subject, queue, self.connection);
        Ok(Box::pin(ChannelSubscription {
            messages: UnboundedReceiverStream::new(receiver),
            _route: RouteGuard {
                id,
                server: self.server.clone(),
            },
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.server
            .router()
            .entries
            .retain(|_, entry| entry.connection != self.connection);
        info!(connection = self.connection, "Channel connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
