use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::BrokerOptions;
use crate::transport::channel::ChannelServer;
use crate::transport::Headers;

fn broker_on(server: &ChannelServer) -> NatsBroker {
    NatsBroker::with_connector(BrokerOptions::default(), Arc::new(server.connector()))
}

fn binding(broker: NatsBroker, action: ActionSchema) -> ActionBinding {
    ActionBinding {
        service: "greeter".to_string(),
        subject: format!("v1.greeter.{}", action.name),
        action,
        broker,
        handler_timeout: None,
    }
}

fn message(payload: &'static [u8], reply: Option<&str>) -> InboundMessage {
    InboundMessage {
        subject: "v1.greeter.greet".to_string(),
        reply: reply.map(str::to_string),
        payload: Bytes::from_static(payload),
        headers: Headers::new(),
    }
}

fn greet_action(calls: Arc<AtomicUsize>) -> ActionSchema {
    ActionSchema::new("greet", move |ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let name = ctx.payload["name"].as_str().unwrap_or("stranger").to_string();
            Ok(json!({ "message": format!("Hello {}!", name) }))
        }
    })
}

#[derive(Serialize, Deserialize)]
struct Greet {
    name: String,
}

#[tokio::test]
async fn test_process_success() {
    let server = ChannelServer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let binding = binding(broker_on(&server), greet_action(calls.clone()));

    let result = binding.process(message(br#"{"name":"Ada"}"#, None)).await;

    assert_eq!(result, DispatchResult::Success(json!({"message": "Hello Ada!"})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_process_invalid_json_skips_handler() {
    let server = ChannelServer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let binding = binding(broker_on(&server), greet_action(calls.clone()));

    let result = binding.process(message(b"{not json", None)).await;

    assert_eq!(result, DispatchResult::DecodeError);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_process_validation_failure_skips_handler() {
    let server = ChannelServer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let action = greet_action(calls.clone()).validate_as::<Greet>();
    let binding = binding(broker_on(&server), action);

    let result = binding.process(message(br#"{"nom":"Ada"}"#, None)).await;

    assert!(matches!(result, DispatchResult::ValidationFailed(ref m) if m.contains("name")));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_process_passes_validated_payload() {
    let server = ChannelServer::new();
    let action = ActionSchema::new("greet", |ctx| async move { Ok(ctx.payload) })
        .validate(|mut payload| {
            payload["checked"] = json!(true);
            Ok(payload)
        });
    let binding = binding(broker_on(&server), action);

    let result = binding.process(message(br#"{"name":"Ada"}"#, None)).await;

    assert_eq!(
        result,
        DispatchResult::Success(json!({"name": "Ada", "checked": true}))
    );
}

#[tokio::test]
async fn test_process_handler_error() {
    let server = ChannelServer::new();
    let action = ActionSchema::new("greet", |_ctx| async { Err("out of greetings".into()) });
    let binding = binding(broker_on(&server), action);

    let result = binding.process(message(b"{}", None)).await;

    assert_eq!(
        result,
        DispatchResult::HandlerFailed("out of greetings".to_string())
    );
}

#[tokio::test]
async fn test_process_handler_panic_is_contained() {
    let server = ChannelServer::new();
    let action = ActionSchema::new("greet", |ctx| async move {
        if ctx.payload.is_object() {
            panic!("boom");
        }
        Ok(Value::Null)
    });
    let binding = binding(broker_on(&server), action);

    let result = binding.process(message(b"{}", None)).await;

    assert_eq!(
        result,
        DispatchResult::HandlerFailed(HANDLER_PANICKED.to_string())
    );
}

#[tokio::test]
async fn test_process_handler_deadline() {
    let server = ChannelServer::new();
    let action = ActionSchema::new("greet", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });
    let mut binding = binding(broker_on(&server), action);
    binding.handler_timeout = Some(Duration::from_millis(20));

    let result = binding.process(message(b"{}", None)).await;

    assert_eq!(result, DispatchResult::TimedOut);
}

#[test]
fn test_envelopes_for_failures() {
    assert_eq!(
        DispatchResult::DecodeError.into_envelope(),
        ReplyEnvelope::error("invalid payload")
    );
    assert_eq!(
        DispatchResult::TimedOut.into_envelope(),
        ReplyEnvelope::error("handler timed out")
    );
    assert_eq!(
        DispatchResult::ValidationFailed("name is required".to_string()).into_envelope(),
        ReplyEnvelope::error("validation failed: name is required")
    );
    assert_eq!(
        DispatchResult::HandlerFailed("nope".to_string()).into_envelope(),
        ReplyEnvelope::error("nope")
    );
}

#[tokio::test]
async fn test_dispatch_replies_through_broker() {
    let server = ChannelServer::new();
    let broker = broker_on(&server);
    broker.connect().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(WorkerPool::new("greeter", 1).unwrap());
    let dispatcher = ActionDispatcher::new(
        binding(broker.clone(), greet_action(calls.clone())),
        pool.clone(),
    );
    broker
        .bind("v1.greeter.greet", Some("greeter"), Arc::new(dispatcher))
        .await
        .unwrap();

    let reply = broker
        .call("v1.greeter.greet", &json!({"name": "Ada"}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, json!({"message": "Hello Ada!"}));

    let reply = broker
        .call("v1.greeter.greet", "not an object", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, json!({"message": "Hello stranger!"}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dispatch_bounds_concurrency() {
    let server = ChannelServer::new();
    let broker = broker_on(&server);
    broker.connect().await.unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let action = {
        let running = running.clone();
        let peak = peak.clone();
        ActionSchema::new("slow", move |_ctx| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!("done"))
            }
        })
    };

    let pool = Arc::new(WorkerPool::new("greeter", 2).unwrap());
    let dispatcher = ActionDispatcher::new(binding(broker.clone(), action), pool.clone());
    broker
        .bind("v1.greeter.slow", Some("greeter"), Arc::new(dispatcher))
        .await
        .unwrap();

    let calls = (0..6).map(|_| {
        let broker = broker.clone();
        async move {
            broker
                .call("v1.greeter.slow", &json!({}), Duration::from_secs(5))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| matches!(r, Ok(v) if v == "done")));
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    // Slots are released just after the last reply goes out
    tokio::time::timeout(Duration::from_secs(1), async {
        while pool.available() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_failure_without_reply_releases_slot() {
    let server = ChannelServer::new();
    let broker = broker_on(&server);
    broker.connect().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let action = {
        let calls = calls.clone();
        ActionSchema::new("fail", move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nobody is listening".into())
            }
        })
    };
    let pool = Arc::new(WorkerPool::new("greeter", 1).unwrap());
    let dispatcher = ActionDispatcher::new(binding(broker.clone(), action), pool.clone());
    broker
        .bind("v1.greeter.fail", None, Arc::new(dispatcher))
        .await
        .unwrap();

    broker.publish("v1.greeter.fail", &json!({}), false).await.unwrap();
    broker.publish("v1.greeter.fail", &json!({}), false).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while calls.load(Ordering::SeqCst) < 2 || pool.available() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_closed_pool_drops_messages() {
    let server = ChannelServer::new();
    let broker = broker_on(&server);
    broker.connect().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(WorkerPool::new("greeter", 1).unwrap());
    pool.drain().await;
    let dispatcher = ActionDispatcher::new(
        binding(broker.clone(), greet_action(calls.clone())),
        pool,
    );
    broker
        .bind("v1.greeter.greet", None, Arc::new(dispatcher))
        .await
        .unwrap();

    let err = broker
        .call("v1.greeter.greet", &json!({"name": "Ada"}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
