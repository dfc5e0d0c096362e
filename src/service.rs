use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PushgError, Result};
use crate::router::Router;
use crate::store::MessageStore;

const DEFAULT_HEALTH_FREQUENCY: Duration = Duration::from_secs(60);

/// A service module with a lifecycle. `start` and `stop` must be idempotent;
/// modules are driven in the explicit order they were registered with.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Periodically polled health capability.
#[async_trait]
pub trait HealthChecker: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<()>;
}

struct Registered {
    start_order: i32,
    stop_order: i32,
    module: Arc<dyn Module>,
}

/// Orchestrates the broker's modules: ordered start, ordered stop with
/// error aggregation, and a background health loop.
pub struct Service {
    modules: Vec<Registered>,
    checkers: Vec<Arc<dyn HealthChecker>>,
    health_frequency: Duration,
    health: Arc<RwLock<HashMap<String, Option<String>>>>,
    cancel: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            modules: Vec::new(),
            checkers: Vec::new(),
            health_frequency: DEFAULT_HEALTH_FREQUENCY,
            health: Arc::new(RwLock::new(HashMap::new())),
            cancel,
            health_task: Mutex::new(None),
        }
    }

    pub fn with_health_frequency(mut self, frequency: Duration) -> Self {
        self.health_frequency = frequency;
        self
    }

    /// Registers a module with its start and stop ordering across all of
    /// the service's modules. Lower orders run first; registration order
    /// breaks ties.
    pub fn register_module(
        &mut self,
        start_order: i32,
        stop_order: i32,
        module: Arc<dyn Module>,
    ) -> &mut Self {
        debug!(module = module.name(), start_order, stop_order, "registered module");
        self.modules.push(Registered {
            start_order,
            stop_order,
            module,
        });
        self
    }

    pub fn register_checker(&mut self, checker: Arc<dyn HealthChecker>) -> &mut Self {
        self.checkers.push(checker);
        self
    }

    /// Starts all modules in ascending start order, collecting errors; a
    /// failing module does not keep later ones from starting. Also spawns
    /// the health loop.
    pub async fn start(&self) -> Result<()> {
        if !self.checkers.is_empty() {
            let task = spawn_health_loop(
                self.checkers.clone(),
                self.health.clone(),
                self.health_frequency,
                self.cancel.subscribe(),
            );
            *self.health_task.lock().unwrap() = Some(task);
        }

        let mut errors = Vec::new();
        for registered in self.ordered(|r| r.start_order) {
            info!(module = registered.module.name(), "starting module");
            if let Err(err) = registered.module.start().await {
                error!(module = registered.module.name(), error = %err, "error while starting module");
                errors.push(format!("{}: {}", registered.module.name(), err));
            }
        }
        aggregate(errors)
    }

    /// Stops all modules in ascending stop order, collecting every error
    /// into an aggregate.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.cancel.send(true);
        if let Some(task) = self.health_task.lock().unwrap().take() {
            task.abort();
        }

        let mut errors = Vec::new();
        for registered in self.ordered(|r| r.stop_order) {
            info!(module = registered.module.name(), "stopping module");
            if let Err(err) = registered.module.stop().await {
                error!(module = registered.module.name(), error = %err, "error while stopping module");
                errors.push(format!("{}: {}", registered.module.name(), err));
            }
        }
        aggregate(errors)
    }

    /// Latest health-check outcomes: checker name mapped to `"ok"` or the
    /// error text.
    pub fn health_status(&self) -> serde_json::Value {
        let health = self.health.read().unwrap();
        let map: serde_json::Map<String, serde_json::Value> = health
            .iter()
            .map(|(name, err)| {
                let status = match err {
                    None => serde_json::Value::String("ok".into()),
                    Some(text) => serde_json::Value::String(text.clone()),
                };
                (name.clone(), status)
            })
            .collect();
        serde_json::Value::Object(map)
    }

    fn ordered(&self, order: impl Fn(&Registered) -> i32) -> Vec<&Registered> {
        let mut list: Vec<&Registered> = self.modules.iter().collect();
        list.sort_by_key(|r| order(*r));
        list
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

fn aggregate(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(PushgError::Aggregate(errors))
    }
}

fn spawn_health_loop(
    checkers: Vec<Arc<dyn HealthChecker>>,
    health: Arc<RwLock<HashMap<String, Option<String>>>>,
    frequency: Duration,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frequency);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return,
            }
            for checker in &checkers {
                let outcome = checker.check().await;
                if let Err(err) = &outcome {
                    warn!(checker = checker.name(), error = %err, "health check failed");
                }
                health
                    .write()
                    .unwrap()
                    .insert(checker.name().to_owned(), outcome.err().map(|e| e.to_string()));
            }
        }
    })
}

#[async_trait]
impl Module for Router {
    fn name(&self) -> &str {
        "router"
    }

    async fn stop(&self) -> Result<()> {
        Router::stop(self).await
    }
}

/// Adapter registering a message store as a service module.
pub struct StoreModule {
    store: Arc<dyn MessageStore>,
}

impl StoreModule {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Module for StoreModule {
    fn name(&self) -> &str {
        "message-store"
    }

    async fn stop(&self) -> Result<()> {
        self.store.stop().await
    }
}

#[async_trait]
impl HealthChecker for StoreModule {
    fn name(&self) -> &str {
        "message-store"
    }

    async fn check(&self) -> Result<()> {
        self.store.check().await
    }
}
