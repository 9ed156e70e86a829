//! Dispatch engine.
//!
//! Binds actions to subjects and turns each inbound message into a
//! bounded, validated handler invocation:
//!
//! 1. Wait for a worker-pool slot (back-pressure: the subscription pulls no
//!    further messages until a slot is free)
//! 2. Decode the JSON payload
//! 3. Run the action's validator, if any
//! 4. Invoke the handler with a fresh `RequestContext`
//! 5. Reply `{"result": ..}` or `{"error": ..}` when a reply address is
//!    present; otherwise log failures and drop the message
//!
//! The slot is held until the reply is published and released on every
//! exit path, including handler panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::broker::{handler_scope, Dispatch, NatsBroker};
use crate::codec::{decode_json, ReplyEnvelope, INVALID_PAYLOAD};
use crate::context::RequestContext;
use crate::schema::ActionSchema;
use crate::transport::{InboundMessage, OutboundMessage};

mod pool;

pub use pool::WorkerPool;

/// Message used when a handler exceeds its deadline.
pub const HANDLER_TIMED_OUT: &str = "handler timed out";
/// Message used when a handler panics.
pub const HANDLER_PANICKED: &str = "handler panicked";

/// Result of processing one message through an action.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    /// Handler returned a value.
    Success(Value),
    /// Payload was not valid JSON; the handler was not invoked.
    DecodeError,
    /// Validator rejected the payload; the handler was not invoked.
    ValidationFailed(String),
    /// Handler returned an error or panicked.
    HandlerFailed(String),
    /// Handler exceeded the service's handler deadline.
    TimedOut,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Reply envelope for this result.
    pub fn into_envelope(self) -> ReplyEnvelope {
        match self {
            Self::Success(value) => ReplyEnvelope::Result(value),
            Self::DecodeError => ReplyEnvelope::error(INVALID_PAYLOAD),
            Self::ValidationFailed(message) => {
                ReplyEnvelope::error(format!("validation failed: {}", message))
            }
            Self::HandlerFailed(message) => ReplyEnvelope::Error(message),
            Self::TimedOut => ReplyEnvelope::error(HANDLER_TIMED_OUT),
        }
    }
}

/// Everything needed to run one action, shared by its in-flight jobs.
pub(crate) struct ActionBinding {
    pub(crate) service: String,
    pub(crate) subject: String,
    pub(crate) action: ActionSchema,
    pub(crate) broker: NatsBroker,
    pub(crate) handler_timeout: Option<Duration>,
}

impl ActionBinding {
    /// Decode, validate, and invoke the handler.
    pub(crate) async fn process(&self, message: InboundMessage) -> DispatchResult {
        let payload = match decode_json(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(subject = %message.subject, error = %e, "Payload decode failed");
                return DispatchResult::DecodeError;
            }
        };

        let payload = match &self.action.validate {
            Some(validator) => match validator.validate(payload) {
                Ok(validated) => validated,
                Err(message) => return DispatchResult::ValidationFailed(message),
            },
            None => payload,
        };

        let ctx = RequestContext::new(self.broker.clone(), message, payload);
        let invocation =
            handler_scope(AssertUnwindSafe(self.action.handle.handle(ctx)).catch_unwind());

        let outcome = match self.handler_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => return DispatchResult::TimedOut,
            },
            None => invocation.await,
        };

        match outcome {
            Ok(Ok(value)) => DispatchResult::Success(value),
            Ok(Err(e)) => DispatchResult::HandlerFailed(e.to_string()),
            Err(_) => DispatchResult::HandlerFailed(HANDLER_PANICKED.to_string()),
        }
    }

    /// Process a message and publish the reply, if one is expected.
    #[tracing::instrument(
        name = "action.dispatch",
        skip_all,
        fields(service = %self.service, action = %self.action.name)
    )]
    pub(crate) async fn handle_message(&self, message: InboundMessage) {
        let reply = message.reply.clone();
        let result = self.process(message).await;

        let Some(reply) = reply else {
            match result {
                DispatchResult::Success(_) => debug!(subject = %self.subject, "Action handled"),
                failure => error!(
                    subject = %self.subject,
                    result = ?failure,
                    "Action failed without reply address, message dropped"
                ),
            }
            return;
        };

        if !result.is_success() {
            warn!(subject = %self.subject, result = ?result, "Action failed, replying with error");
        }

        let payload = match result.into_envelope().encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(subject = %self.subject, error = %e, "Failed to encode reply");
                match ReplyEnvelope::error(e.to_string()).encode() {
                    Ok(payload) => payload,
                    Err(_) => return,
                }
            }
        };

        if let Err(e) = self.broker.send(OutboundMessage::new(reply, payload)).await {
            error!(subject = %self.subject, error = %e, "Failed to publish reply");
        }
    }
}

/// Subscription dispatcher for one action of one service.
pub(crate) struct ActionDispatcher {
    binding: Arc<ActionBinding>,
    pool: Arc<WorkerPool>,
}

impl ActionDispatcher {
    pub(crate) fn new(binding: ActionBinding, pool: Arc<WorkerPool>) -> Self {
        Self {
            binding: Arc::new(binding),
            pool,
        }
    }
}

impl Dispatch for ActionDispatcher {
    fn dispatch(&self, message: InboundMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let permit = match self.pool.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(subject = %self.binding.subject, error = %e, "Dropping message");
                    return;
                }
            };

            let binding = self.binding.clone();
            tokio::spawn(async move {
                binding.handle_message(message).await;
                drop(permit);
            });
        })
    }

    /// Only slot acquisition is awaited; handlers run in their own tasks.
    fn cancel_safe(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests;
