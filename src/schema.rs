//! Action registry entries.
//!
//! An `ActionSchema` describes one addressable operation of a service:
//! its name, its handler, an optional validator, and whether its
//! subscription joins the service's queue group.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::HandlerError;

/// Outcome of one handler invocation.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Handler for one action or subscription.
///
/// Return `Value::Null` when there is nothing to reply with.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

struct FnHandler<F>(F);

impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.0)(ctx))
    }
}

/// Wrap an async closure as a shared handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Payload validation hook.
///
/// Receives the decoded payload and returns the (possibly normalized)
/// payload the handler will see, or a descriptive failure message.
pub trait Validator: Send + Sync {
    fn validate(&self, payload: Value) -> std::result::Result<Value, String>;
}

struct FnValidator<F>(F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync,
{
    fn validate(&self, payload: Value) -> std::result::Result<Value, String> {
        (self.0)(payload)
    }
}

/// Validates by deserializing into `T` and serializing the result back.
///
/// Serde defaults, renames, and `deny_unknown_fields` on `T` all apply
/// before the handler sees the payload.
pub struct TypedValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedValidator<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Validator for TypedValidator<T>
where
    T: DeserializeOwned + Serialize,
{
    fn validate(&self, payload: Value) -> std::result::Result<Value, String> {
        let typed: T = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        serde_json::to_value(typed).map_err(|e| e.to_string())
    }
}

/// Describe an action that can be registered against the broker.
#[derive(Clone)]
pub struct ActionSchema {
    /// Action name, unique within a service.
    pub name: String,
    /// Handler invoked for each accepted message.
    pub handle: Arc<dyn ActionHandler>,
    /// Optional payload validator.
    pub validate: Option<Arc<dyn Validator>>,
    /// Join the service's queue group (load-balanced) instead of receiving
    /// every message (broadcast).
    pub queue: bool,
}

impl ActionSchema {
    /// Create a queue-grouped action from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, handle: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::with_handler(name, handler_fn(handle))
    }

    /// Create a queue-grouped action from a handler object.
    pub fn with_handler(name: impl Into<String>, handle: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            handle,
            validate: None,
            queue: true,
        }
    }

    /// Attach a validator closure.
    pub fn validate<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.validator(FnValidator(f))
    }

    /// Attach a validator object.
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validate = Some(Arc::new(validator));
        self
    }

    /// Validate the payload by round-tripping it through `T`.
    pub fn validate_as<T>(self) -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.validator(TypedValidator::<T>::new())
    }

    /// Set queue-group membership.
    pub fn with_queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }

    /// Deliver every message to every instance (no queue group).
    pub fn broadcast(self) -> Self {
        self.with_queue(false)
    }
}

impl fmt::Debug for ActionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSchema")
            .field("name", &self.name)
            .field("validate", &self.validate.is_some())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
        #[serde(default = "default_greeting")]
        greeting: String,
    }

    fn default_greeting() -> String {
        "Hello".to_string()
    }

    #[test]
    fn test_action_defaults_to_queue_group() {
        let action = ActionSchema::new("greet", |_ctx| async { Ok(Value::Null) });
        assert_eq!(action.name, "greet");
        assert!(action.queue);
        assert!(action.validate.is_none());
    }

    #[test]
    fn test_broadcast_clears_queue() {
        let action = ActionSchema::new("notify", |_ctx| async { Ok(Value::Null) }).broadcast();
        assert!(!action.queue);
    }

    #[test]
    fn test_typed_validator_normalizes() {
        let validator = TypedValidator::<Greet>::new();
        let value = validator.validate(json!({"name": "Ada"})).unwrap();
        assert_eq!(value, json!({"name": "Ada", "greeting": "Hello"}));
    }

    #[test]
    fn test_typed_validator_rejects() {
        let validator = TypedValidator::<Greet>::new();
        let err = validator.validate(json!({"nom": "Ada"})).unwrap_err();
        assert!(err.contains("name"));
    }

    #[test]
    fn test_closure_validator() {
        let action = ActionSchema::new("greet", |_ctx| async { Ok(Value::Null) }).validate(|v| {
            if v.get("name").is_some() {
                Ok(v)
            } else {
                Err("name is required".to_string())
            }
        });
        let validator = action.validate.unwrap();
        assert!(validator.validate(json!({"name": "Ada"})).is_ok());
        assert_eq!(
            validator.validate(json!({})).unwrap_err(),
            "name is required"
        );
    }
}
