//! Reusable scaffold for connectors that forward broker messages to an
//! external push service (APNs, FCM, an SMS gateway) with at-least-once
//! delivery and per-subscriber resume cursors.
//!
//! A connector owns a [`Manager`] of durable [`Subscriber`]s, a bounded
//! request queue served by a pool of workers, an injected [`Sender`]
//! capability doing the actual external call, and a [`ResponseHandler`]
//! deciding what a send outcome means: advance the cursor, retry, or drop
//! the subscriber.

mod manager;
mod subscriber;

pub use manager::Manager;
pub use subscriber::Subscriber;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{PushgError, Result};
use crate::protocol::{Message, Path};
use crate::router::Router;
use crate::service::Module;

pub const DEFAULT_WORKERS: usize = 1;
const DEFAULT_CHANNEL_SIZE: usize = 10;
const DEFAULT_QUEUE_SIZE: usize = 500;

/// Static configuration of a connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Human-readable connector name, used in logs
    pub name: String,
    /// Key/value schema holding this connector's subscribers
    pub schema: String,
    /// URL prefix under which a front-end mounts the connector's endpoints
    pub prefix: String,
    /// Route pattern of the subscription endpoints below the prefix
    pub url_pattern: String,
    /// Number of worker tasks draining the request queue
    pub workers: usize,
    /// Channel size of each subscriber's route
    pub channel_size: usize,
    /// Capacity of the request queue between subscribers and workers
    pub queue_size: usize,
}

impl ConnectorConfig {
    pub fn new(
        name: impl Into<String>,
        schema: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            prefix: prefix.into(),
            url_pattern: "/{device_id}/{user_id}/{topic:.*}".to_owned(),
            workers: DEFAULT_WORKERS,
            channel_size: DEFAULT_CHANNEL_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// One unit of work for a connector worker: a message to be delivered on
/// behalf of a subscriber.
#[derive(Debug, Clone)]
pub struct Request {
    subscriber: Arc<Subscriber>,
    message: Arc<Message>,
    correlation_id: String,
}

impl Request {
    pub fn new(subscriber: Arc<Subscriber>, message: Arc<Message>) -> Self {
        let correlation_id = message
            .correlation_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            subscriber,
            message,
            correlation_id,
        }
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Measurements captured around one external send.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub latency: Duration,
}

/// The injected external-delivery capability. The response type is opaque
/// to the connector; only the [`ResponseHandler`] interprets it.
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    type Response: Send + 'static;

    async fn send(&self, request: &Request) -> Result<Self::Response>;
}

/// Decides what to do with a send outcome: advance the subscriber's cursor,
/// remove the subscriber, or leave it for a retry. The returned error is
/// logged but not otherwise acted on.
#[async_trait]
pub trait ResponseHandler: Send + Sync + 'static {
    type Response: Send + 'static;

    async fn handle_response(
        &self,
        request: Request,
        response: Result<Self::Response>,
        metadata: Metadata,
    ) -> Result<()>;
}

/// The connector scaffold. Generic over its [`Sender`] so tests can plug in
/// mocks; the [`ResponseHandler`] is attached after construction (it usually
/// needs the connector's [`Manager`] to advance cursors).
pub struct Connector<S: Sender> {
    config: ConnectorConfig,
    router: Router,
    sender: Arc<S>,
    handler: Mutex<Option<Arc<dyn ResponseHandler<Response = S::Response>>>>,
    manager: Arc<Manager>,
    queue_tx: mpsc::Sender<Request>,
    queue_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    cancel: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Sender> Connector<S> {
    pub fn new(router: Router, sender: S, config: ConnectorConfig) -> Connector<S> {
        let manager = Arc::new(Manager::new(config.schema.clone(), router.kv_store()));
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let (cancel, _) = watch::channel(false);
        Connector {
            config,
            router,
            sender: Arc::new(sender),
            handler: Mutex::new(None),
            manager,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_response_handler(&self, handler: Arc<dyn ResponseHandler<Response = S::Response>>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.manager.clone()
    }

    /// Loads persisted subscribers, spawns the worker pool and one loop per
    /// subscriber. Starting an already started connector is a no-op.
    pub async fn start(&self) -> Result<()> {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PushgError::InvalidConfig("response handler not set".into()))?;
        let Some(queue_rx) = self.queue_rx.lock().unwrap().take() else {
            info!(name = %self.config.name, "connector was already started");
            return Ok(());
        };

        info!(name = %self.config.name, "starting connector");
        self.manager.load().await?;

        let shared_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let mut tasks = self.tasks.lock().unwrap();
        for index in 0..self.config.workers.max(1) {
            tasks.push(tokio::spawn(worker(
                index,
                shared_rx.clone(),
                self.sender.clone(),
                handler.clone(),
                self.manager.clone(),
                self.cancel.subscribe(),
            )));
        }
        drop(tasks);

        for subscriber in self.manager.list() {
            self.spawn_subscriber(subscriber);
        }
        Ok(())
    }

    /// Registers a new durable subscriber and starts its loop.
    pub async fn subscribe(
        &self,
        path: Path,
        params: BTreeMap<String, String>,
    ) -> Result<Arc<Subscriber>> {
        let subscriber = self.manager.add(Subscriber::new(path, params)).await?;
        self.spawn_subscriber(subscriber.clone());
        Ok(subscriber)
    }

    /// Cancels and deletes the subscriber with the given key.
    pub async fn unsubscribe(&self, key: &str) -> Result<()> {
        let Some(subscriber) = self.manager.find(key) else {
            return Err(PushgError::NotFound(key.to_owned()));
        };
        self.manager.remove(&subscriber).await
    }

    fn spawn_subscriber(&self, subscriber: Arc<Subscriber>) {
        debug!(name = %self.config.name, key = subscriber.key(), "starting subscriber loop");
        let handle = tokio::spawn(subscriber::subscriber_loop(
            subscriber,
            self.router.clone(),
            self.manager.clone(),
            self.queue_tx.clone(),
            self.config.channel_size,
            self.cancel.subscribe(),
        ));
        self.tasks.lock().unwrap().push(handle);
    }

    /// Cancels workers and subscriber loops and waits for them to exit.
    pub async fn stop(&self) -> Result<()> {
        info!(name = %self.config.name, "stopping connector");
        let _ = self.cancel.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        join_all(tasks).await;
        Ok(())
    }
}

#[async_trait]
impl<S: Sender> Module for Connector<S> {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&self) -> Result<()> {
        Connector::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        Connector::stop(self).await
    }
}

/// A worker: dequeues requests, calls the sender, measures latency and hands
/// the outcome to the response handler. Expired messages are never sent; the
/// cursor advances as if they were delivered.
async fn worker<S: Sender>(
    index: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Request>>>,
    sender: Arc<S>,
    handler: Arc<dyn ResponseHandler<Response = S::Response>>,
    manager: Arc<Manager>,
    mut cancel: watch::Receiver<bool>,
) {
    debug!(index, "connector worker started");
    loop {
        let request = tokio::select! {
            maybe = async { queue.lock().await.recv().await } => match maybe {
                Some(request) => request,
                None => break,
            },
            _ = cancel.changed() => break,
        };

        if request.message().expired() {
            info!(
                id = request.message().id,
                correlation_id = request.correlation_id(),
                "message expired, counting as processed"
            );
            request.subscriber().set_last_id(request.message().id);
            if let Err(err) = manager.update(request.subscriber()).await {
                error!(error = %err, "could not persist cursor of expired message");
            }
            continue;
        }

        let started = Instant::now();
        let response = sender.send(&request).await;
        let metadata = Metadata {
            latency: started.elapsed(),
        };
        if let Err(err) = handler.handle_response(request, response, metadata).await {
            error!(index, error = %err, "response handler failed");
        }
    }
    debug!(index, "connector worker stopped");
}
