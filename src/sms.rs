//! SMS gateway: a connector-shaped module with a single durable cursor for
//! the whole topic. Messages on the SMS topic are decoded into an
//! [`SmsPayload`] and submitted through an [`SmsProvider`]; the sender owns
//! retrying with jittered exponential backoff, and outcomes that can never
//! succeed advance the cursor so the gateway does not get stuck.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{PushgError, Result};
use crate::protocol::{Message, Path};
use crate::route::{Route, RouteConfig};
use crate::router::Router;
use crate::service::Module;
use crate::store::{FetchDirection, FetchRequest};

pub const SMS_SCHEMA: &str = "sms_notifications";
pub const SMS_DEFAULT_TOPIC: &str = "/sms";

const SMS_CHANNEL_SIZE: usize = 5000;
const RETRY_MAX_TRIES: u32 = 3;
const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(250);
const RESTART_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// The body of a message on the SMS topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsPayload {
    pub to: String,
    #[serde(default)]
    pub from: String,
    pub text: String,
}

/// Status codes a provider reports for a single submitted SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Success,
    Throttled,
    MissingParams,
    InvalidParams,
    InvalidCredentials,
    InternalError,
    InvalidMessage,
    NumberBarred,
    PartnerAccountBarred,
    PartnerQuotaExceeded,
    RestNotEnabled,
    MessageTooLong,
    CommunicationFailed,
    InvalidSignature,
    InvalidSenderAddress,
    InvalidTtl,
    FacilityNotAllowed,
    InvalidMessageClass,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeliveryStatus::Success => "Success",
            DeliveryStatus::Throttled => "Throttled",
            DeliveryStatus::MissingParams => "Missing params",
            DeliveryStatus::InvalidParams => "Invalid params",
            DeliveryStatus::InvalidCredentials => "Invalid credentials",
            DeliveryStatus::InternalError => "Internal error",
            DeliveryStatus::InvalidMessage => "Invalid message",
            DeliveryStatus::NumberBarred => "Number barred",
            DeliveryStatus::PartnerAccountBarred => "Partner account barred",
            DeliveryStatus::PartnerQuotaExceeded => "Partner quota exceeded",
            DeliveryStatus::RestNotEnabled => "Account not enabled for REST",
            DeliveryStatus::MessageTooLong => "Message too long",
            DeliveryStatus::CommunicationFailed => "Communication failed",
            DeliveryStatus::InvalidSignature => "Invalid signature",
            DeliveryStatus::InvalidSenderAddress => "Invalid sender address",
            DeliveryStatus::InvalidTtl => "Invalid TTL",
            DeliveryStatus::FacilityNotAllowed => "Facility not allowed",
            DeliveryStatus::InvalidMessageClass => "Invalid message class",
        };
        f.write_str(text)
    }
}

/// Report for one submitted message part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReport {
    pub status: DeliveryStatus,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub error_text: String,
}

/// A provider's response to one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub reports: Vec<MessageReport>,
}

impl DeliveryReport {
    pub fn success(message_id: impl Into<String>) -> Self {
        Self {
            reports: vec![MessageReport {
                status: DeliveryStatus::Success,
                message_id: message_id.into(),
                to: String::new(),
                error_text: String::new(),
            }],
        }
    }

    pub fn status(status: DeliveryStatus) -> Self {
        Self {
            reports: vec![MessageReport {
                status,
                message_id: String::new(),
                to: String::new(),
                error_text: String::new(),
            }],
        }
    }

    /// Classifies the report. A response that is not exactly one part means
    /// the message was split (or dropped): too long. An invalid sender
    /// address must not be retried.
    pub fn check(&self) -> Result<()> {
        if self.reports.len() != 1 {
            warn!(parts = self.reports.len(), "unexpected sms part count");
            return Err(PushgError::SmsTooLong);
        }
        let report = &self.reports[0];
        match report.status {
            DeliveryStatus::Success => Ok(()),
            DeliveryStatus::InvalidSenderAddress => {
                info!("invalid sender detected, no retries will be made");
                Err(PushgError::InvalidSender)
            }
            status => {
                warn!(status = %status, error_text = %report.error_text, "error received from sms provider");
                Err(PushgError::Provider(format!(
                    "{}: {}",
                    status, report.error_text
                )))
            }
        }
    }
}

/// The opaque transport to the external SMS service.
#[async_trait]
pub trait SmsProvider: Send + Sync + 'static {
    async fn submit(&self, sms: &SmsPayload) -> Result<DeliveryReport>;
}

/// Wraps a provider with capped, jittered exponential retry.
///
/// Transport failures and transient provider statuses are retried up to
/// [`RETRY_MAX_TRIES`] times. An invalid sender address stops retrying
/// immediately. Exhausted retries surface as [`PushgError::RetryFailed`],
/// which the gateway treats as permanently unacceptable.
pub struct RetryingSender<P: SmsProvider> {
    provider: P,
    max_tries: u32,
}

impl<P: SmsProvider> RetryingSender<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            max_tries: RETRY_MAX_TRIES,
        }
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let sms: SmsPayload = serde_json::from_slice(&message.body)
            .map_err(|e| PushgError::InvalidMessage(format!("sms payload: {}", e)))?;

        let mut backoff = Backoff::new(RETRY_BACKOFF_MIN, RETRY_BACKOFF_MAX, 2.0, true);
        let mut tries = 0;
        loop {
            tries += 1;
            match self.provider.submit(&sms).await {
                Ok(report) => match report.check() {
                    Ok(()) => return Ok(()),
                    Err(PushgError::InvalidSender) => return Err(PushgError::RetryFailed),
                    Err(PushgError::SmsTooLong) => return Err(PushgError::SmsTooLong),
                    Err(err) => {
                        warn!(tries, error = %err, "sms provider rejected the message")
                    }
                },
                Err(err) => warn!(tries, error = %err, "sms submission failed"),
            }
            if tries >= self.max_tries {
                return Err(PushgError::RetryFailed);
            }
            tokio::time::sleep(backoff.duration()).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmsGatewayConfig {
    pub name: String,
    pub schema: String,
    pub topic: Path,
    pub channel_size: usize,
}

impl Default for SmsGatewayConfig {
    fn default() -> Self {
        Self {
            name: "sms".to_owned(),
            schema: SMS_SCHEMA.to_owned(),
            topic: Path::new(SMS_DEFAULT_TOPIC).unwrap(),
            channel_size: SMS_CHANNEL_SIZE,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LastId {
    id: u64,
}

/// The gateway: one route on the SMS topic with an unbounded overflow
/// queue, a proxy loop feeding the retrying sender, and a persisted
/// topic-level cursor.
pub struct SmsGateway<P: SmsProvider> {
    inner: Arc<GatewayInner<P>>,
}

struct GatewayInner<P: SmsProvider> {
    config: SmsGatewayConfig,
    router: Router,
    sender: RetryingSender<P>,
    last_id: AtomicU64,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl<P: SmsProvider> SmsGateway<P> {
    pub fn new(router: Router, provider: P, config: SmsGatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config,
                router,
                sender: RetryingSender::new(provider),
                last_id: AtomicU64::new(0),
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn last_id(&self) -> u64 {
        self.inner.last_id.load(Ordering::SeqCst)
    }

    /// Starts the gateway; idempotent.
    pub async fn start(&self) -> Result<()> {
        {
            let mut cancel = self.inner.cancel.lock().unwrap();
            if cancel.is_some() {
                info!(name = %self.inner.config.name, "gateway was already started");
                return Ok(());
            }
            let (tx, _) = watch::channel(false);
            *cancel = Some(tx);
        }
        if let Err(err) = self.inner.read_last_id().await {
            *self.inner.cancel.lock().unwrap() = None;
            return Err(err);
        }
        tokio::spawn(run(self.inner.clone()));
        info!(name = %self.inner.config.name, "started gateway");
        Ok(())
    }

    /// Stops the gateway; idempotent.
    pub async fn stop(&self) -> Result<()> {
        let cancel = self.inner.cancel.lock().unwrap().take();
        match cancel {
            Some(tx) => {
                info!(name = %self.inner.config.name, "stopping gateway");
                let _ = tx.send(true);
                Ok(())
            }
            None => {
                info!(name = %self.inner.config.name, "gateway was already stopped");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<P: SmsProvider> Module for SmsGateway<P> {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn start(&self) -> Result<()> {
        SmsGateway::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        SmsGateway::stop(self).await
    }
}

impl<P: SmsProvider> GatewayInner<P> {
    fn route_config(&self) -> RouteConfig {
        let mut config = RouteConfig::new(self.config.topic.clone(), self.config.channel_size)
            .with_queue(-1, None);
        let last = self.last_id.load(Ordering::SeqCst);
        if last > 0 {
            config = config.with_fetch(FetchRequest::new(
                self.config.topic.partition(),
                last + 1,
                0,
                FetchDirection::Forward,
            ));
        }
        config
    }

    async fn read_last_id(&self) -> Result<()> {
        let kv = self.router.kv_store();
        match kv.get(&self.config.schema, self.config.topic.as_str()).await? {
            Some(blob) => {
                let last: LastId = serde_json::from_slice(&blob)
                    .map_err(|e| PushgError::Corrupt(format!("sms cursor: {}", e)))?;
                self.last_id.store(last.id, Ordering::SeqCst);
            }
            None => self.last_id.store(0, Ordering::SeqCst),
        }
        debug!(last_id = self.last_id.load(Ordering::SeqCst), "read sms cursor");
        Ok(())
    }

    async fn set_last_id(&self, id: u64) -> Result<()> {
        let blob = serde_json::to_vec(&LastId { id })
            .map_err(|e| PushgError::Corrupt(format!("sms cursor encode: {}", e)))?;
        self.router
            .kv_store()
            .put(&self.config.schema, self.config.topic.as_str(), &blob)
            .await?;
        self.last_id.store(id, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if message.id <= self.last_id.load(Ordering::SeqCst) {
            return Ok(());
        }
        if message.expired() {
            info!(id = message.id, "sms message expired, counting as processed");
            return self.set_last_id(message.id).await;
        }
        match self.sender.send(message).await {
            Ok(()) => self.set_last_id(message.id).await,
            // outcomes that can never succeed advance the cursor so the
            // gateway does not wedge on one message
            Err(
                err @ (PushgError::RetryFailed
                | PushgError::SmsTooLong
                | PushgError::InvalidMessage(_)),
            ) => {
                warn!(id = message.id, error = %err, "advancing cursor after unacceptable send outcome");
                self.set_last_id(message.id).await
            }
            Err(err) => Err(err),
        }
    }
}

async fn run<P: SmsProvider>(inner: Arc<GatewayInner<P>>) {
    let cancel_rx = inner
        .cancel
        .lock()
        .unwrap()
        .as_ref()
        .map(|tx| tx.subscribe());
    let Some(mut cancel_rx) = cancel_rx else { return };
    let mut router_done = inner.router.done();
    let mut backoff = Backoff::new(RESTART_BACKOFF_MIN, RESTART_BACKOFF_MAX, 2.0, true);

    loop {
        if *cancel_rx.borrow() || inner.router.is_stopping() {
            return;
        }
        if let Err(err) = inner.read_last_id().await {
            warn!(error = %err, "could not read sms cursor");
        }
        let route = Route::new(inner.route_config());
        let Some(mut rx) = route.take_channel() else {
            return;
        };
        let provide = tokio::spawn(route.clone().provide(inner.router.clone(), true));

        let mut restart = true;
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(message) => match inner.send(&message).await {
                        Ok(()) => backoff.reset(),
                        Err(err) => {
                            warn!(error = %err, "exiting sms proxy loop");
                            restart = false;
                            break;
                        }
                    },
                    // route closed: restart and resume from the cursor
                    None => break,
                },
                _ = cancel_rx.changed() => { restart = false; break; }
                _ = router_done.changed() => { restart = false; break; }
            }
        }

        route.close();
        // dropping the receiver unblocks a provide that is still pushing
        // history into the channel
        drop(rx);
        let _ = inner.router.unsubscribe(&route).await;
        match provide.await {
            Ok(Err(PushgError::ModuleStopping(_))) => return,
            Ok(Err(err)) => warn!(error = %err, "sms route provide error"),
            _ => {}
        }
        if !restart {
            return;
        }

        let delay = backoff.duration();
        info!(
            last_id = inner.last_id.load(Ordering::SeqCst),
            delay_ms = delay.as_millis() as u64,
            "restarting sms gateway"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel_rx.changed() => return,
        }
    }
}
