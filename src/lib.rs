//! nats-service - request/reply microservices over NATS
//!
//! Declare named actions, group them into a versioned service, and expose
//! each action on `v{version}.{service}.{action}` with validation, a bounded
//! worker pool, and a uniform request context.
//!
//! ```no_run
//! use nats_service::{ActionSchema, BrokerOptions, CreateService, NatsBroker};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> nats_service::Result<()> {
//! let broker = NatsBroker::new(BrokerOptions::new(["nats://localhost:4222"]));
//! broker.connect().await?;
//!
//! let mut service = CreateService::new("1", "greeter", 4)?;
//! service.add([ActionSchema::new("greet", |ctx| async move {
//!     let name = ctx.payload["name"].as_str().unwrap_or("stranger").to_string();
//!     Ok(json!({ "message": format!("Hello {}!", name) }))
//! })])?;
//! service.register(&broker).await?;
//!
//! let reply = broker
//!     .call("v1.greeter.greet", &json!({"name": "Ada"}), Duration::from_secs(5))
//!     .await?;
//! assert_eq!(reply, json!({"message": "Hello Ada!"}));
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod schema;
pub mod service;
pub mod transport;
pub mod utils;

pub use broker::{
    BrokerState, CallOptions, DoneSignal, Emitter, NatsBroker, PublishOptions, SubscribeOptions,
    Subscription,
};
pub use codec::{action_subject, ReplyEnvelope};
pub use config::{BrokerOptions, Config, ServiceConfig};
pub use context::{RequestContext, CORRELATION_HEADER};
pub use dispatch::{DispatchResult, WorkerPool};
pub use error::{BrokerError, HandlerError, Result};
pub use schema::{handler_fn, ActionHandler, ActionSchema, HandlerResult, TypedValidator, Validator};
pub use service::CreateService;
