//! Service aggregate.
//!
//! A `CreateService` owns a named, versioned set of actions and binds each
//! of them to `v{version}.{name}.{action}` on a broker. All actions of one
//! service share a single worker pool of `workers` slots.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::broker::{BrokerState, NatsBroker, Subscription};
use crate::codec::{action_subject, validate_token};
use crate::config::ServiceConfig;
use crate::dispatch::{ActionBinding, ActionDispatcher, WorkerPool};
use crate::error::{BrokerError, Result};
use crate::schema::ActionSchema;

/// Live binding of a service to one broker.
struct Registration {
    broker: NatsBroker,
    pool: Arc<WorkerPool>,
    subscriptions: Vec<Subscription>,
}

/// A named, versioned collection of actions.
pub struct CreateService {
    name: String,
    version: String,
    workers: usize,
    handler_timeout: Option<Duration>,
    actions: Vec<ActionSchema>,
    registration: Option<Registration>,
}

impl CreateService {
    /// Create an empty service.
    ///
    /// `name` and `version` must be valid subject tokens and `workers` must
    /// be at least one.
    pub fn new(version: impl Into<String>, name: impl Into<String>, workers: usize) -> Result<Self> {
        let version = version.into();
        let name = name.into();
        validate_token("service", &name)?;
        validate_token("version", &version)?;
        if workers == 0 {
            return Err(BrokerError::Configuration(format!(
                "service '{}' needs at least one worker",
                name
            )));
        }

        Ok(Self {
            name,
            version,
            workers,
            handler_timeout: None,
            actions: Vec::new(),
            registration: None,
        })
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let service = Self::new(&config.version, &config.name, config.workers)?;
        Ok(match config.handler_timeout() {
            Some(timeout) => service.with_handler_timeout(timeout),
            None => service,
        })
    }

    /// Bound every handler invocation by `timeout`.
    ///
    /// A handler that runs longer is abandoned, its slot is released, and
    /// the caller receives `{"error": "handler timed out"}`.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout
    }

    /// Actions in the order they were added.
    pub fn actions(&self) -> impl Iterator<Item = &ActionSchema> {
        self.actions.iter()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Handlers currently holding a worker slot; zero when not registered.
    pub fn in_flight(&self) -> usize {
        self.registration
            .as_ref()
            .map_or(0, |registration| registration.pool.in_flight())
    }

    /// Subject for an action of this service, if the action exists.
    pub fn subject_for(&self, action: &str) -> Option<String> {
        self.actions
            .iter()
            .any(|a| a.name == action)
            .then(|| action_subject(&self.version, &self.name, action))
    }

    /// Subjects of all actions, in registration order.
    pub fn subjects(&self) -> Vec<String> {
        self.actions
            .iter()
            .map(|a| action_subject(&self.version, &self.name, &a.name))
            .collect()
    }

    /// Add one or more actions.
    ///
    /// Fails without adding anything if any name is invalid, already
    /// present, or repeated within `actions`, or if the service is
    /// registered.
    pub fn add(&mut self, actions: impl IntoIterator<Item = ActionSchema>) -> Result<&mut Self> {
        if self.registration.is_some() {
            return Err(BrokerError::Configuration(format!(
                "service '{}' is registered; deregister before adding actions",
                self.name
            )));
        }

        let batch: Vec<ActionSchema> = actions.into_iter().collect();
        for (i, action) in batch.iter().enumerate() {
            validate_token("action", &action.name)?;
            let duplicate = self.actions.iter().any(|a| a.name == action.name)
                || batch[..i].iter().any(|a| a.name == action.name);
            if duplicate {
                return Err(BrokerError::Configuration(format!(
                    "action '{}' already exists in service '{}'",
                    action.name, self.name
                )));
            }
        }

        self.actions.extend(batch);
        Ok(self)
    }

    /// Add a single action.
    pub fn add_action(&mut self, action: ActionSchema) -> Result<&mut Self> {
        self.add(std::iter::once(action))
    }

    /// Bind every action to its subject on `broker`.
    ///
    /// Queue-grouped actions join the group named after the service. If any
    /// binding fails, the subscriptions created so far are released before
    /// the error is returned and the service stays unregistered.
    #[tracing::instrument(
        name = "service.register",
        skip_all,
        fields(service = %self.name, version = %self.version)
    )]
    pub async fn register(&mut self, broker: &NatsBroker) -> Result<()> {
        if self.registration.is_some() {
            return Err(BrokerError::Configuration(format!(
                "service '{}' is already registered",
                self.name
            )));
        }
        let state = broker.state();
        if state != BrokerState::Connected {
            return Err(BrokerError::Configuration(format!(
                "cannot register service '{}': broker is {}",
                self.name, state
            )));
        }

        let pool = Arc::new(WorkerPool::new(&self.name, self.workers)?);
        let mut subscriptions = Vec::with_capacity(self.actions.len());

        for action in &self.actions {
            let subject = action_subject(&self.version, &self.name, &action.name);
            let queue = action.queue.then_some(self.name.as_str());
            let dispatcher = ActionDispatcher::new(
                ActionBinding {
                    service: self.name.clone(),
                    subject: subject.clone(),
                    action: action.clone(),
                    broker: broker.clone(),
                    handler_timeout: self.handler_timeout,
                },
                pool.clone(),
            );

            match broker.bind(&subject, queue, Arc::new(dispatcher)).await {
                Ok(subscription) => {
                    info!(topic = %subject, queue = ?queue, "Registered topic");
                    subscriptions.push(subscription);
                }
                Err(e) => {
                    warn!(topic = %subject, error = %e, "Registration failed, rolling back");
                    for subscription in &subscriptions {
                        if let Err(e) = broker.unsubscribe(subscription).await {
                            warn!(topic = %subscription.subject(), error = %e, "Rollback unsubscribe failed");
                        }
                    }
                    pool.drain().await;
                    return Err(e);
                }
            }
        }

        broker.track_pool(&pool).await;
        info!(
            actions = subscriptions.len(),
            workers = self.workers,
            "Service registered"
        );
        self.registration = Some(Registration {
            broker: broker.clone(),
            pool,
            subscriptions,
        });
        Ok(())
    }

    /// Release every subscription of this service and wait for in-flight
    /// handlers to finish. The service can be registered again afterwards.
    #[tracing::instrument(name = "service.deregister", skip_all, fields(service = %self.name))]
    pub async fn deregister(&mut self) -> Result<()> {
        let Some(registration) = self.registration.take() else {
            return Err(BrokerError::Configuration(format!(
                "service '{}' is not registered",
                self.name
            )));
        };

        // A draining or closed broker has already stopped every loop.
        if registration.broker.state() == BrokerState::Connected {
            for subscription in &registration.subscriptions {
                if let Err(e) = registration.broker.unsubscribe(subscription).await {
                    warn!(topic = %subscription.subject(), error = %e, "Unsubscribe failed");
                }
            }
        }

        registration.pool.drain().await;
        info!("Service deregistered");
        Ok(())
    }
}

impl std::fmt::Debug for CreateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateService")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("workers", &self.workers)
            .field("actions", &self.actions)
            .field("registered", &self.is_registered())
            .finish()
    }
}
