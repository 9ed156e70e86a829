//! Subscription handles and the per-subscription delivery loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::NatsBroker;
use crate::codec::decode_json;
use crate::context::RequestContext;
use crate::schema::ActionHandler;
use crate::transport::{InboundMessage, MessageStream};

tokio::task_local! {
    /// Set while a subscription or action handler is running.
    static IN_HANDLER: ();
}

/// Run a handler future with the in-handler marker set.
pub(crate) async fn handler_scope<F: Future>(handler: F) -> F::Output {
    IN_HANDLER.scope((), handler).await
}

/// Whether the current task is running a handler.
pub(crate) fn in_handler() -> bool {
    IN_HANDLER.try_with(|_| ()).is_ok()
}

/// Handle for one active binding between a subject and a handler.
///
/// Release it with `NatsBroker::unsubscribe`; releasing twice is an error.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: u64,
    subject: String,
    queue: Option<String>,
}

impl Subscription {
    pub(crate) fn new(id: u64, subject: &str, queue: Option<&str>) -> Self {
        Self {
            id,
            subject: subject.to_string(),
            queue: queue.map(str::to_string),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }
}

/// Options for `NatsBroker::subscribe_with`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group to join.
    pub queue: Option<String>,
    /// Skip JSON decoding; the handler reads `ctx.msg.payload`.
    pub raw: bool,
}

impl SubscribeOptions {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            raw: false,
        }
    }

    pub fn raw() -> Self {
        Self {
            queue: None,
            raw: true,
        }
    }
}

/// Control signal for a delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Stop,
    /// Deliver at most this many more messages, then stop.
    StopAfter(u64),
}

/// Turns inbound messages into handler invocations.
pub(crate) trait Dispatch: Send + Sync {
    /// Process one message. The loop awaits this before pulling the next one.
    fn dispatch(&self, message: InboundMessage) -> BoxFuture<'_, ()>;

    /// Whether a pending `dispatch` may be dropped when the loop stops.
    fn cancel_safe(&self) -> bool {
        false
    }
}

/// Book-keeping for a running delivery loop.
pub(crate) struct ActiveSubscription {
    control: watch::Sender<Control>,
    task: JoinHandle<()>,
    /// Handed back by `unsubscribe_after`; the loop may still be running.
    pub(crate) released: bool,
}

impl ActiveSubscription {
    pub(crate) fn spawn(
        subject: String,
        stream: MessageStream,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        let (control, receiver) = watch::channel(Control::Run);
        let task = tokio::spawn(run(subject, stream, dispatch, receiver));
        Self {
            control,
            task,
            released: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn stop_after(&self, max_messages: u64) {
        self.control.send_replace(Control::StopAfter(max_messages));
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Inside a handler the loop may be the caller's own task, or be blocked
    /// on a handler that waits for the caller. The stop is only signalled
    /// there and the loop exits once the running invocation returns.
    pub(crate) async fn stop(self) {
        self.control.send_replace(Control::Stop);
        if in_handler() {
            debug!("Stop requested from a handler, not waiting for the loop");
            return;
        }
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(error = %e, "Subscription loop panicked");
            }
        }
    }
}

enum Next {
    Control,
    Message(Option<InboundMessage>),
}

async fn run(
    subject: String,
    mut stream: MessageStream,
    dispatch: Arc<dyn Dispatch>,
    mut control: watch::Receiver<Control>,
) {
    let mut remaining: Option<u64> = None;

    loop {
        match *control.borrow_and_update() {
            Control::Stop => break,
            Control::StopAfter(n) if remaining.is_none() => remaining = Some(n),
            _ => {}
        }
        if remaining == Some(0) {
            break;
        }

        let next = tokio::select! {
            biased;
            changed = control.changed() => match changed {
                Ok(()) => Next::Control,
                Err(_) => break,
            },
            message = stream.next() => Next::Message(message),
        };

        let message = match next {
            Next::Control => continue,
            Next::Message(Some(message)) => message,
            Next::Message(None) => {
                debug!(subject = %subject, "Subscription stream ended");
                break;
            }
        };

        if dispatch.cancel_safe() {
            let stopped = tokio::select! {
                biased;
                _ = control.wait_for(|c| *c == Control::Stop) => true,
                _ = dispatch.dispatch(message) => false,
            };
            if stopped {
                break;
            }
        } else {
            dispatch.dispatch(message).await;
        }

        if let Some(n) = remaining.as_mut() {
            *n -= 1;
        }
    }

    debug!(subject = %subject, "Subscription loop stopped");
}

/// Dispatch for plain subscriptions: decode, then run the handler inline.
pub(crate) struct HandlerDispatch {
    pub(crate) broker: NatsBroker,
    pub(crate) handler: Arc<dyn ActionHandler>,
    pub(crate) raw: bool,
}

impl Dispatch for HandlerDispatch {
    fn dispatch(&self, message: InboundMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let payload = if self.raw {
                Value::Null
            } else {
                match decode_json(&message.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(subject = %message.subject, error = %e, "Dropping undecodable message");
                        return;
                    }
                }
            };

            let subject = message.subject.clone();
            let ctx = RequestContext::new(self.broker.clone(), message, payload);
            let invocation = AssertUnwindSafe(self.handler.handle(ctx)).catch_unwind();
            match handler_scope(invocation).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(subject = %subject, error = %e, "Subscription handler failed")
                }
                Err(_) => error!(subject = %subject, "Subscription handler panicked"),
            }
        })
    }
}
