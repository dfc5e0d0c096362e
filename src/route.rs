use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::error::{PushgError, Result};
use crate::protocol::{parse_message, Message, Path};
use crate::router::Router;
use crate::store::{FetchRequest, FetchResult};

/// Configuration of a live subscription.
///
/// `queue_size` selects the backpressure policy applied when the delivery
/// channel is full: `0` means no overflow queue (a full channel closes the
/// route), a positive value bounds the queue, `-1` makes it unbounded.
/// `timeout` is how long a delivery may block on the channel before spilling
/// into the queue; `None` means deliveries never block (non-blocking send,
/// then queue).
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub path: Path,
    /// Tags identifying the subscriber; also matched against message filters
    pub route_params: BTreeMap<String, String>,
    pub channel_size: usize,
    pub queue_size: i64,
    pub timeout: Option<Duration>,
    /// Historical read drained to the channel before live delivery starts
    pub fetch_request: Option<FetchRequest>,
}

impl RouteConfig {
    pub fn new(path: Path, channel_size: usize) -> Self {
        Self {
            path,
            route_params: BTreeMap::new(),
            channel_size,
            queue_size: 0,
            timeout: None,
            fetch_request: None,
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.route_params = params;
        self
    }

    pub fn with_queue(mut self, queue_size: i64, timeout: Option<Duration>) -> Self {
        self.queue_size = queue_size;
        self.timeout = timeout;
        self
    }

    pub fn with_fetch(mut self, fetch_request: FetchRequest) -> Self {
        self.fetch_request = Some(fetch_request);
        self
    }
}

/// A live subscription: a bounded delivery channel, an optional overflow
/// queue with a single FIFO drain task, and a terminal close signal.
///
/// The consumer takes the channel's receiving side once via
/// [`Route::take_channel`]. After [`Route::close`] the receiver drains any
/// buffered messages and then ends; further deliveries fail with
/// [`PushgError::InvalidRoute`].
pub struct Route {
    config: RouteConfig,
    sender: Mutex<Option<mpsc::Sender<Arc<Message>>>>,
    receiver: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    queue: Mutex<VecDeque<Arc<Message>>>,
    queue_signal: Arc<Notify>,
    closed: watch::Sender<bool>,
    fetch_request: Mutex<Option<FetchRequest>>,
}

impl Route {
    pub fn new(mut config: RouteConfig) -> Arc<Route> {
        let (tx, rx) = mpsc::channel(config.channel_size.max(1));
        let fetch_request = config.fetch_request.take();
        let (closed, _) = watch::channel(false);
        let route = Arc::new(Route {
            config,
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            queue: Mutex::new(VecDeque::new()),
            queue_signal: Arc::new(Notify::new()),
            closed,
            fetch_request: Mutex::new(fetch_request),
        });
        if route.config.queue_size != 0 {
            Route::spawn_drain(&route);
        }
        route
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn route_params(&self) -> &BTreeMap<String, String> {
        &self.config.route_params
    }

    /// Stable identity of the subscription: the path followed by the sorted
    /// params, e.g. `/topic device_id:d1 user_id:u1`.
    pub fn key(&self) -> String {
        let mut key = self.config.path.to_string();
        for (k, v) in &self.config.route_params {
            key.push(' ');
            key.push_str(k);
            key.push(':');
            key.push_str(v);
        }
        key
    }

    /// Takes the consuming side of the delivery channel. Returns `None` if
    /// it was taken before.
    pub fn take_channel(&self) -> Option<mpsc::Receiver<Arc<Message>>> {
        self.receiver.lock().unwrap().take()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Whether the route's params accept the message: every param key that
    /// also appears in the message's filters must carry the same value.
    /// Keys absent from the message never exclude it.
    pub fn accepts(&self, message: &Message) -> bool {
        self.config
            .route_params
            .iter()
            .all(|(k, v)| message.filters.get(k).map_or(true, |mv| mv == v))
    }

    /// Delivers a message according to the route's backpressure policy.
    pub async fn deliver(&self, message: Arc<Message>) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(PushgError::InvalidRoute);
        };

        if self.config.queue_size == 0 {
            return match tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!(path = %self.config.path, "route channel is full, closing route");
                    self.close();
                    Err(PushgError::ChannelFull)
                }
                Err(TrySendError::Closed(_)) => {
                    self.close();
                    Err(PushgError::InvalidRoute)
                }
            };
        }

        // Once the overflow queue is in use every delivery goes through it,
        // otherwise queued messages would be overtaken.
        if !self.queue.lock().unwrap().is_empty() {
            return self.enqueue(message);
        }

        match self.config.timeout {
            None => match tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(m)) => self.enqueue(m),
                Err(TrySendError::Closed(_)) => {
                    self.close();
                    Err(PushgError::InvalidRoute)
                }
            },
            Some(timeout) => match tx.send_timeout(message, timeout).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(m)) => self.enqueue(m),
                Err(SendTimeoutError::Closed(_)) => {
                    self.close();
                    Err(PushgError::InvalidRoute)
                }
            },
        }
    }

    /// Closes the route exactly once: the delivery channel is shut, the
    /// drain task exits and pending queue content is discarded.
    pub fn close(&self) {
        let sender = self.sender.lock().unwrap().take();
        if sender.is_some() {
            debug!(path = %self.config.path, "closing route");
            let _ = self.closed.send(true);
            self.queue_signal.notify_waiters();
        }
    }

    /// Subscribes the route, first draining its historical fetch (when
    /// `fetch_first` is set and a fetch request is configured) into the
    /// delivery channel. Historical and live messages are never interleaved;
    /// live delivery starts only after the fetch has caught up with the
    /// store.
    pub async fn provide(self: Arc<Self>, router: Router, fetch_first: bool) -> Result<()> {
        if fetch_first {
            let request = self.fetch_request.lock().unwrap().take();
            if let Some(mut request) = request {
                let store = router.message_store();
                let bounded = request.count > 0;
                loop {
                    let result = store.fetch(request.clone()).await?;
                    let last = self.forward_fetched(result).await?;
                    let Some(last) = last else { break };
                    if bounded {
                        break;
                    }
                    // new messages may have been appended while we streamed;
                    // stay in the historical phase until caught up
                    let max = store.max_message_id(&request.partition).await?;
                    if max <= last {
                        break;
                    }
                    request.start_id = last + 1;
                }
            }
        }
        router.subscribe(self.clone()).await?;
        Ok(())
    }

    /// Streams one fetch result into the delivery channel, returning the
    /// last forwarded ID.
    async fn forward_fetched(&self, mut result: FetchResult) -> Result<Option<u64>> {
        let mut last = None;
        loop {
            match result.message_c.recv().await {
                Some(fetched) => {
                    let message = parse_message(&fetched.bytes)?;
                    let Some(tx) = self.sender() else {
                        return Err(PushgError::InvalidRoute);
                    };
                    if tx.send(Arc::new(message)).await.is_err() {
                        return Err(PushgError::InvalidRoute);
                    }
                    last = Some(fetched.id);
                }
                None => {
                    if let Ok(err) = result.error_c.try_recv() {
                        return Err(err);
                    }
                    return Ok(last);
                }
            }
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Arc<Message>>> {
        self.sender.lock().unwrap().clone()
    }

    fn enqueue(&self, message: Arc<Message>) -> Result<()> {
        {
            let mut queue = self.queue.lock().unwrap();
            if self.config.queue_size > 0 && queue.len() >= self.config.queue_size as usize {
                drop(queue);
                warn!(path = %self.config.path, "route queue is full, closing route");
                self.close();
                return Err(PushgError::QueueFull);
            }
            queue.push_back(message);
        }
        self.queue_signal.notify_one();
        Ok(())
    }

    /// The single task moving queued messages into the channel in FIFO
    /// order as space opens up. Holds only a weak reference so an abandoned
    /// route can be dropped.
    fn spawn_drain(route: &Arc<Route>) {
        let weak: Weak<Route> = Arc::downgrade(route);
        let signal = route.queue_signal.clone();
        let mut closed = route.closed.subscribe();
        tokio::spawn(async move {
            loop {
                let next = {
                    let Some(route) = weak.upgrade() else { return };
                    if route.is_closed() {
                        return;
                    }
                    let message = route.queue.lock().unwrap().pop_front();
                    message.map(|m| (m, route.sender()))
                };
                match next {
                    Some((message, Some(tx))) => {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Some((_, None)) => return,
                    None => {
                        tokio::select! {
                            _ = signal.notified() => {}
                            _ = closed.changed() => {}
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.config.path)
            .field("params", &self.config.route_params)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(path: &str) -> Arc<Message> {
        Arc::new(Message::new(Path::new(path).unwrap(), "m"))
    }

    fn plain_route(channel_size: usize) -> Arc<Route> {
        Route::new(RouteConfig::new(Path::new("/t").unwrap(), channel_size))
    }

    #[tokio::test]
    async fn delivers_into_the_channel() {
        let route = plain_route(2);
        let mut rx = route.take_channel().unwrap();

        route.deliver(message("/t")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().path.as_str(), "/t");
    }

    #[tokio::test]
    async fn full_channel_without_queue_closes_the_route() {
        let route = plain_route(1);
        let _rx = route.take_channel().unwrap();

        route.deliver(message("/t")).await.unwrap();
        let err = route.deliver(message("/t")).await.unwrap_err();
        assert!(matches!(err, PushgError::ChannelFull));
        assert!(route.is_closed());

        let err = route.deliver(message("/t")).await.unwrap_err();
        assert!(matches!(err, PushgError::InvalidRoute));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_the_receiver() {
        let route = plain_route(1);
        let mut rx = route.take_channel().unwrap();

        route.deliver(message("/t")).await.unwrap();
        route.close();
        route.close();

        // buffered message still drains, then the channel ends
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn overflow_spills_into_the_queue_and_drains_in_order() {
        let route = Route::new(
            RouteConfig::new(Path::new("/t").unwrap(), 1).with_queue(10, None),
        );
        let mut rx = route.take_channel().unwrap();

        for _ in 0..5 {
            route.deliver(message("/t")).await.unwrap();
        }
        let mut received = 0;
        while received < 5 {
            rx.recv().await.unwrap();
            received += 1;
        }
    }

    #[tokio::test]
    async fn bounded_queue_overflow_closes_the_route() {
        let route = Route::new(
            RouteConfig::new(Path::new("/t").unwrap(), 1).with_queue(1, None),
        );
        let _rx = route.take_channel().unwrap();

        route.deliver(message("/t")).await.unwrap(); // fills the channel
        route.deliver(message("/t")).await.unwrap(); // fills the queue
        let err = route.deliver(message("/t")).await.unwrap_err();
        assert!(matches!(err, PushgError::QueueFull));
        assert!(route.is_closed());
    }

    #[tokio::test]
    async fn timed_delivery_spills_after_the_timeout() {
        let route = Route::new(
            RouteConfig::new(Path::new("/t").unwrap(), 1)
                .with_queue(10, Some(Duration::from_millis(10))),
        );
        let mut rx = route.take_channel().unwrap();

        route.deliver(message("/t")).await.unwrap();
        // channel is full; this delivery times out and lands in the queue
        route.deliver(message("/t")).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn params_do_not_exclude_messages_without_the_key() {
        let mut params = BTreeMap::new();
        params.insert("user".to_owned(), "u1".to_owned());
        let route = Route::new(
            RouteConfig::new(Path::new("/t").unwrap(), 1).with_params(params),
        );

        let unfiltered = Message::new(Path::new("/t").unwrap(), "m");
        assert!(route.accepts(&unfiltered));

        let mut matching = Message::new(Path::new("/t").unwrap(), "m");
        matching.set_filter("user", "u1");
        assert!(route.accepts(&matching));

        let mut other = Message::new(Path::new("/t").unwrap(), "m");
        other.set_filter("user", "u2");
        assert!(!route.accepts(&other));
    }

    #[tokio::test]
    async fn key_is_path_plus_sorted_params() {
        let mut params = BTreeMap::new();
        params.insert("user_id".to_owned(), "u1".to_owned());
        params.insert("device_id".to_owned(), "d1".to_owned());
        let route = Route::new(
            RouteConfig::new(Path::new("/topic").unwrap(), 1).with_params(params),
        );
        assert_eq!(route.key(), "/topic device_id:d1 user_id:u1");
    }
}
