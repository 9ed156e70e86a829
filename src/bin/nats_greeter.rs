//! nats-greeter: demo service
//!
//! Registers the `greeter` service and answers
//! `v{version}.greeter.greet` requests until Ctrl-C.
//!
//! ## Configuration
//! - NATS_SERVICE_CONFIG: Path to a YAML config file (optional)
//! - NATS_SERVICE__BROKER__SERVERS: Comma-separated server URLs
//! - NATS_SERVICE__SERVICE__WORKERS: Worker pool size
//! - NATS_SERVICE_LOG: Log filter (default: info)
//!
//! ```text
//! $ nats req v1.greeter.greet '{"name": "Ada"}'
//! {"result":{"message":"Hello Ada!"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use nats_service::utils::bootstrap::{init_tracing, wait_for_shutdown};
use nats_service::{ActionSchema, Config, CreateService, NatsBroker, ServiceConfig};

const SERVICE_NAME: &str = "greeter";

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GreetRequest {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let service_config = config.service.clone().unwrap_or_else(|| ServiceConfig {
        name: SERVICE_NAME.to_string(),
        ..Default::default()
    });

    let broker = NatsBroker::new(config.broker.clone());
    broker.connect().await?;

    let mut service = CreateService::from_config(&service_config)?;
    service.add([ActionSchema::new("greet", |ctx| async move {
        let request: GreetRequest = ctx.payload_as()?;
        Ok(json!({ "message": format!("Hello {}!", request.name) }))
    })
    .validate_as::<GreetRequest>()])?;
    service.register(&broker).await?;

    info!(
        service = %service.name(),
        subjects = ?service.subjects(),
        workers = service.workers(),
        "nats-greeter started"
    );

    if wait_for_shutdown(broker.done_signal()).await {
        info!("Shutting down");
        broker.shutdown().await?;
    }

    Ok(())
}
