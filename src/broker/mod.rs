//! Broker facade.
//!
//! `NatsBroker` owns one transport connection and exposes the full public
//! surface: `connect`, `call`, `publish`, `subscribe`, `unsubscribe`, and
//! graceful `shutdown` with a done signal.
//!
//! Connection state moves through
//! `Disconnected -> Connecting -> Connected -> Draining -> Closed`.
//! `call` and `publish` need `Connected` or `Draining` (in-flight handlers
//! still reply while draining); `subscribe` needs `Connected`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::codec::{encode_json, ReplyEnvelope};
use crate::config::BrokerOptions;
use crate::context::RequestContext;
use crate::dispatch::WorkerPool;
use crate::error::{BrokerError, Result};
use crate::schema::{handler_fn, ActionHandler, HandlerResult};
use crate::transport::{default_connector, Connector, Headers, OutboundMessage, Transport};

mod subscription;

pub(crate) use subscription::{handler_scope, in_handler, Dispatch};
use subscription::{ActiveSubscription, HandlerDispatch};
pub use subscription::{SubscribeOptions, Subscription};

/// Connection lifecycle of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Closed,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Options for `NatsBroker::call_with`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Reply deadline. Falls back to `BrokerOptions::request_timeout_ms`.
    pub timeout: Option<Duration>,
    pub headers: Option<Headers>,
}

/// Options for `NatsBroker::publish_with`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Reply address to attach to the message.
    pub reply: Option<String>,
    pub headers: Option<Headers>,
    /// Wait until the transport has written the message to the network.
    pub flush: bool,
}

/// Single-fire notification that the broker reached `Closed`.
///
/// Any number of clones may wait on it; once fired it stays fired.
#[derive(Clone)]
pub struct DoneSignal {
    state: watch::Receiver<BrokerState>,
}

impl DoneSignal {
    /// True once the broker is closed.
    pub fn is_done(&self) -> bool {
        *self.state.borrow() == BrokerState::Closed
    }

    /// Wait until the broker is closed.
    ///
    /// Also returns if the broker is dropped without shutting down.
    pub async fn wait(mut self) {
        let _ = self.state.wait_for(|s| *s == BrokerState::Closed).await;
    }
}

/// Calls services with a fixed default timeout.
#[derive(Clone)]
pub struct Emitter {
    broker: NatsBroker,
    timeout: Duration,
}

impl Emitter {
    pub async fn emit<P>(&self, topic: &str, payload: &P) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        self.broker.call(topic, payload, self.timeout).await
    }
}

struct BrokerInner {
    options: BrokerOptions,
    connector: Arc<dyn Connector>,
    state: watch::Sender<BrokerState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    subscriptions: Mutex<HashMap<u64, ActiveSubscription>>,
    pools: Mutex<Vec<Weak<WorkerPool>>>,
    next_subscription: AtomicU64,
}

/// Connected facade over one transport.
///
/// Cheap to clone; clones share the same connection. Create one per
/// process-level connection and pass it explicitly.
#[derive(Clone)]
pub struct NatsBroker {
    inner: Arc<BrokerInner>,
}

impl NatsBroker {
    /// Create a broker using the default connector (NATS).
    pub fn new(options: BrokerOptions) -> Self {
        Self::with_connector(options, default_connector())
    }

    /// Create a broker that connects through the given connector.
    pub fn with_connector(options: BrokerOptions, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(BrokerState::Disconnected);
        Self {
            inner: Arc::new(BrokerInner {
                options,
                connector,
                state,
                transport: RwLock::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                pools: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    pub fn state(&self) -> BrokerState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BrokerState::Connected
    }

    /// Connect to the configured servers.
    ///
    /// Only valid from `Disconnected`. On failure the broker stays
    /// `Disconnected` and the error is `BrokerError::Connection`.
    pub async fn connect(&self) -> Result<()> {
        let mut current = BrokerState::Disconnected;
        let started = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == BrokerState::Disconnected {
                *state = BrokerState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(BrokerError::Configuration(format!(
                "cannot connect: broker is {}",
                current
            )));
        }

        match self.inner.connector.connect(&self.inner.options).await {
            Ok(transport) => {
                *self.inner.transport.write().await = Some(transport);
                self.inner.state.send_replace(BrokerState::Connected);
                info!(servers = ?self.inner.options.servers, "Broker connected");
                Ok(())
            }
            Err(e) => {
                self.inner.state.send_replace(BrokerState::Disconnected);
                error!(servers = ?self.inner.options.servers, error = %e, "Failed to connect");
                Err(match e {
                    BrokerError::Connection(_) => e,
                    other => BrokerError::Connection(other.to_string()),
                })
            }
        }
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>> {
        match self.state() {
            BrokerState::Connected | BrokerState::Draining => {}
            _ => return Err(BrokerError::not_connected()),
        }
        self.inner
            .transport
            .read()
            .await
            .clone()
            .ok_or_else(BrokerError::not_connected)
    }

    /// Send a prepared message.
    pub(crate) async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.transport().await?.publish(message).await
    }

    /// Send a request and await exactly one reply.
    ///
    /// An `{"error": ..}` reply becomes `BrokerError::Remote`; no reply within
    /// `timeout` becomes `BrokerError::Timeout`. Never retries.
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
            headers: None,
        };
        self.call_with(topic, payload, options).await
    }

    /// Same as `call`.
    pub async fn request<P>(
        &self,
        topic: &str,
        payload: &P,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        self.call(topic, payload, timeout).await
    }

    /// `call`, deserializing the result into `T`.
    pub async fn call_as<T, P>(
        &self,
        topic: &str,
        payload: &P,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let value = self.call(topic, payload, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    #[tracing::instrument(name = "broker.call", skip_all, fields(subject = %topic))]
    pub async fn call_with<P>(&self, topic: &str, payload: &P, options: CallOptions) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        let transport = self.transport().await?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.options.request_timeout());
        let message =
            OutboundMessage::new(topic, encode_json(payload)?).with_headers(options.headers);

        let reply = transport.request(message, timeout).await?;
        ReplyEnvelope::decode(&reply.payload)?.into_result()
    }

    /// Calls bound to the configured default timeout.
    pub fn emit(&self) -> Emitter {
        Emitter {
            broker: self.clone(),
            timeout: self.inner.options.request_timeout(),
        }
    }

    /// Fire-and-forget publish. With `flush`, waits until the transport has
    /// written the message to the network (not until it is delivered).
    pub async fn publish<P>(&self, subject: &str, payload: &P, flush: bool) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let options = PublishOptions {
            flush,
            ..Default::default()
        };
        self.publish_with(subject, payload, options).await
    }

    #[tracing::instrument(name = "broker.publish", skip_all, fields(subject = %subject))]
    pub async fn publish_with<P>(
        &self,
        subject: &str,
        payload: &P,
        options: PublishOptions,
    ) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let transport = self.transport().await?;
        let message = OutboundMessage::new(subject, encode_json(payload)?)
            .with_reply(options.reply)
            .with_headers(options.headers);

        transport.publish(message).await?;
        if options.flush {
            transport.flush().await?;
        }
        Ok(())
    }

    /// Bind an async closure to `subject`, optionally in a queue group.
    pub async fn subscribe<F, Fut>(
        &self,
        subject: &str,
        handler: F,
        queue: Option<&str>,
    ) -> Result<Subscription>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let options = SubscribeOptions {
            queue: queue.map(str::to_string),
            raw: false,
        };
        self.subscribe_with(subject, handler_fn(handler), options)
            .await
    }

    /// Bind a handler object to `subject`.
    ///
    /// Messages are handled one at a time in arrival order. The handler's
    /// return value is not sent anywhere; use `RequestContext::respond` to
    /// answer requests.
    pub async fn subscribe_with(
        &self,
        subject: &str,
        handler: Arc<dyn ActionHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let dispatch = Arc::new(HandlerDispatch {
            broker: self.clone(),
            handler,
            raw: options.raw,
        });
        self.bind(subject, options.queue.as_deref(), dispatch).await
    }

    /// Subscribe and start a delivery loop feeding `dispatch`.
    pub(crate) async fn bind(
        &self,
        subject: &str,
        queue: Option<&str>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Subscription> {
        let transport = self.transport().await?;

        // Holding the map across the state check keeps shutdown from
        // missing a subscription created while it drains.
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let state = self.state();
        if state != BrokerState::Connected {
            return Err(BrokerError::Configuration(format!(
                "cannot subscribe to '{}': broker is {}",
                subject, state
            )));
        }

        let stream = transport.subscribe(subject, queue).await?;
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        subscriptions.insert(
            id,
            ActiveSubscription::spawn(subject.to_string(), stream, dispatch),
        );

        info!(subject = %subject, queue = ?queue, "Subscribed");
        Ok(Subscription::new(id, subject, queue))
    }

    /// Release a subscription. No callbacks are delivered once this returns.
    ///
    /// Called from inside a handler, including the subscription's own, it
    /// returns without waiting: the invocation already running finishes and
    /// no further messages are handed out.
    ///
    /// Releasing the same handle twice fails with `BrokerError::Configuration`.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let active = {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            let releasable = subscriptions
                .get(&subscription.id)
                .is_some_and(|active| !active.released);
            if releasable {
                subscriptions.remove(&subscription.id)
            } else {
                None
            }
        };

        let Some(active) = active else {
            return Err(BrokerError::Configuration(format!(
                "subscription on '{}' already released",
                subscription.subject()
            )));
        };

        active.stop().await;
        info!(subject = %subscription.subject(), "Unsubscribed");
        Ok(())
    }

    /// Release a subscription after at most `max_messages` more deliveries.
    ///
    /// The handle counts as released immediately.
    pub async fn unsubscribe_after(
        &self,
        subscription: &Subscription,
        max_messages: u64,
    ) -> Result<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        subscriptions.retain(|_, active| !(active.released && active.is_finished()));

        match subscriptions.get_mut(&subscription.id) {
            Some(active) if !active.released => {
                active.released = true;
                active.stop_after(max_messages);
                info!(
                    subject = %subscription.subject(),
                    max_messages,
                    "Unsubscribing after message limit"
                );
                Ok(())
            }
            _ => Err(BrokerError::Configuration(format!(
                "subscription on '{}' already released",
                subscription.subject()
            ))),
        }
    }

    /// Track a worker pool so shutdown waits for its in-flight work.
    pub(crate) async fn track_pool(&self, pool: &Arc<WorkerPool>) {
        let mut pools = self.inner.pools.lock().await;
        pools.retain(|p| p.strong_count() > 0);
        pools.push(Arc::downgrade(pool));
    }

    /// Signal that fires once the broker is closed.
    pub fn done_signal(&self) -> DoneSignal {
        DoneSignal {
            state: self.inner.state.subscribe(),
        }
    }

    /// Wait until the broker is closed.
    pub async fn is_done(&self) {
        self.done_signal().wait().await
    }

    /// Drain and close.
    ///
    /// Stops every subscription loop, waits for all tracked worker pools to
    /// finish in-flight handlers, flushes and closes the transport, then
    /// fires the done signal.
    ///
    /// Must be called from outside handlers: draining waits for every
    /// running handler, so a call from inside one fails with
    /// `BrokerError::Configuration`.
    pub async fn shutdown(&self) -> Result<()> {
        if in_handler() {
            return Err(BrokerError::Configuration(
                "cannot shut down from inside a handler".to_string(),
            ));
        }

        let mut current = BrokerState::Connected;
        let started = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == BrokerState::Connected {
                *state = BrokerState::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(BrokerError::Configuration(format!(
                "cannot shut down: broker is {}",
                current
            )));
        }
        info!("Broker draining");

        let active: Vec<ActiveSubscription> = {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            subscriptions.drain().map(|(_, active)| active).collect()
        };
        for subscription in active {
            subscription.stop().await;
        }

        let pools = std::mem::take(&mut *self.inner.pools.lock().await);
        for pool in pools.iter().filter_map(Weak::upgrade) {
            pool.drain().await;
        }

        let transport = self.inner.transport.write().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!(error = %e, "Error while closing transport");
            }
        }

        self.inner.state.send_replace(BrokerState::Closed);
        warn!("Broker connection closed");
        Ok(())
    }
}
