use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{PushgError, Result};
use crate::kvstore::KvStore;
use crate::protocol::{Message, Path};
use crate::route::Route;
use crate::store::MessageStore;

/// The router owns the subscription index and the fan-out of stored
/// messages to matching routes.
///
/// `Router` is a cheap handle; clones share the same state. Publishing goes
/// through [`Router::handle_message`], which persists the message (assigning
/// its ID) and enqueues it for the single dispatcher task.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    routes: RwLock<HashMap<Path, Vec<Arc<Route>>>>,
    handle_tx: mpsc::Sender<Arc<Message>>,
    store: Arc<dyn MessageStore>,
    kv: Arc<dyn KvStore>,
    node_id: u8,
    stopping: watch::Sender<bool>,
}

impl Router {
    /// Creates the router and spawns its dispatcher task.
    pub fn new(
        store: Arc<dyn MessageStore>,
        kv: Arc<dyn KvStore>,
        config: &BrokerConfig,
    ) -> Router {
        let (handle_tx, handle_rx) = mpsc::channel(config.handle_channel_size.max(1));
        let (stopping, _) = watch::channel(false);
        let inner = Arc::new(RouterInner {
            routes: RwLock::new(HashMap::new()),
            handle_tx,
            store,
            kv,
            node_id: config.node_id,
            stopping,
        });
        tokio::spawn(dispatch_loop(inner.clone(), handle_rx));
        Router { inner }
    }

    /// Adds a route to the subscription index. Subscribing twice with the
    /// same path and params is rejected; the same path with different params
    /// is always allowed.
    pub async fn subscribe(&self, route: Arc<Route>) -> Result<Arc<Route>> {
        if self.is_stopping() {
            return Err(PushgError::ModuleStopping("router".into()));
        }
        let key = route.key();
        let mut routes = self.inner.routes.write().unwrap();
        let list = routes.entry(route.path().clone()).or_default();
        if list.iter().any(|existing| existing.key() == key) {
            return Err(PushgError::DuplicateSubscription(key));
        }
        list.push(route.clone());
        debug!(key = %key, "subscribed route");
        Ok(route)
    }

    /// Removes the route from the index and closes it. Unknown routes are
    /// still closed, and reported as not found.
    pub async fn unsubscribe(&self, route: &Arc<Route>) -> Result<()> {
        let removed = remove_route(&self.inner, route);
        route.close();
        if removed {
            debug!(key = %route.key(), "unsubscribed route");
            Ok(())
        } else {
            Err(PushgError::NotFound(route.key()))
        }
    }

    /// Persists the message (which assigns its ID, timestamp and node) and
    /// hands it to the dispatcher. A full handle channel is logged as
    /// overload and then blocks, pushing backpressure onto the publisher.
    pub async fn handle_message(&self, mut message: Message) -> Result<()> {
        if self.is_stopping() {
            return Err(PushgError::ModuleStopping("router".into()));
        }
        self.inner
            .store
            .store_message(&mut message, self.inner.node_id)
            .await?;
        debug!(id = message.id, path = %message.path, "stored message");

        let message = Arc::new(message);
        match self.inner.handle_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(m)) => {
                warn!("router handle channel is overloaded, blocking");
                self.inner
                    .handle_tx
                    .send(m)
                    .await
                    .map_err(|_| PushgError::ChannelClosed)
            }
            Err(TrySendError::Closed(_)) => Err(PushgError::ModuleStopping("router".into())),
        }
    }

    /// Introspection: the current routes on a topic as a JSON array of
    /// their params.
    pub fn get_subscribers(&self, topic: &str) -> serde_json::Value {
        let Ok(path) = Path::new(topic) else {
            return serde_json::Value::Array(Vec::new());
        };
        let routes = self.inner.routes.read().unwrap();
        let params: Vec<serde_json::Value> = routes
            .get(&path)
            .map(|list| {
                list.iter()
                    .map(|route| {
                        serde_json::to_value(route.route_params())
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect()
            })
            .unwrap_or_default();
        serde_json::Value::Array(params)
    }

    pub fn kv_store(&self) -> Arc<dyn KvStore> {
        self.inner.kv.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.inner.store.clone()
    }

    /// Signal set once the router is stopping; consulted by subscribers
    /// deciding whether to restart.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.inner.stopping.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stopping.borrow()
    }

    /// Stops the router: no further subscriptions or messages are accepted
    /// and every route is closed.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping router");
        let _ = self.inner.stopping.send(true);
        let all: Vec<Arc<Route>> = {
            let mut routes = self.inner.routes.write().unwrap();
            routes.drain().flat_map(|(_, list)| list).collect()
        };
        for route in all {
            route.close();
        }
        Ok(())
    }
}

fn remove_route(inner: &RouterInner, route: &Arc<Route>) -> bool {
    let mut routes = inner.routes.write().unwrap();
    let Some(list) = routes.get_mut(route.path()) else {
        return false;
    };
    let before = list.len();
    list.retain(|existing| !Arc::ptr_eq(existing, route));
    let removed = list.len() != before;
    if list.is_empty() {
        routes.remove(route.path());
    }
    removed
}

async fn dispatch_loop(inner: Arc<RouterInner>, mut handle_rx: mpsc::Receiver<Arc<Message>>) {
    let mut stopping = inner.stopping.subscribe();
    debug!("router dispatcher started");
    loop {
        tokio::select! {
            maybe = handle_rx.recv() => match maybe {
                Some(message) => dispatch(&inner, message).await,
                None => break,
            },
            _ = stopping.changed() => break,
        }
    }
    debug!("router dispatcher stopped");
}

async fn dispatch(inner: &Arc<RouterInner>, message: Arc<Message>) {
    let matched: Vec<Arc<Route>> = {
        let routes = inner.routes.read().unwrap();
        routes
            .iter()
            .filter(|(path, _)| path.matches(&message.path))
            .flat_map(|(_, list)| list.iter().cloned())
            .collect()
    };

    let mut delivered = 0usize;
    let mut filtered = 0usize;
    for route in matched {
        if !route.accepts(&message) {
            filtered += 1;
            continue;
        }
        match route.deliver(message.clone()).await {
            Ok(()) => delivered += 1,
            Err(err) => {
                warn!(
                    key = %route.key(),
                    error = %err,
                    "could not deliver message, dropping route"
                );
                remove_route(inner, &route);
                route.close();
            }
        }
    }
    debug!(id = message.id, delivered, filtered, "dispatched message");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use crate::route::RouteConfig;
    use crate::store::FileMessageStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_router() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMessageStore::new(dir.path()));
        let kv = Arc::new(MemoryKvStore::new());
        let router = Router::new(store, kv, &BrokerConfig::default());
        (dir, router)
    }

    fn route_on(path: &str) -> Arc<Route> {
        Route::new(RouteConfig::new(Path::new(path).unwrap(), 10))
    }

    #[tokio::test]
    async fn subscribe_then_receive() {
        let (_dir, router) = test_router();
        let route = route_on("/t");
        let mut rx = route.take_channel().unwrap();
        router.subscribe(route).await.unwrap();

        router
            .handle_message(Message::new(Path::new("/t").unwrap(), "hi"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, 1);
        assert_eq!(received.body_as_string(), "hi");
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let (_dir, router) = test_router();
        router.subscribe(route_on("/t")).await.unwrap();
        let err = router.subscribe(route_on("/t")).await.unwrap_err();
        assert!(matches!(err, PushgError::DuplicateSubscription(_)));

        // same path, different params is fine
        let mut params = BTreeMap::new();
        params.insert("user_id".into(), "u1".into());
        let other = Route::new(
            RouteConfig::new(Path::new("/t").unwrap(), 10).with_params(params),
        );
        router.subscribe(other).await.unwrap();
    }

    #[tokio::test]
    async fn subtopic_messages_reach_parent_subscriptions() {
        let (_dir, router) = test_router();
        let route = route_on("/t");
        let mut rx = route.take_channel().unwrap();
        router.subscribe(route).await.unwrap();

        router
            .handle_message(Message::new(Path::new("/t/sub/topic").unwrap(), "m"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().path.as_str(), "/t/sub/topic");
    }

    #[tokio::test]
    async fn filtered_route_is_skipped() {
        let (_dir, router) = test_router();

        let all = route_on("/t");
        let mut all_rx = all.take_channel().unwrap();
        router.subscribe(all).await.unwrap();

        let mut params = BTreeMap::new();
        params.insert("user".into(), "u1".into());
        let filtered = Route::new(
            RouteConfig::new(Path::new("/t").unwrap(), 10).with_params(params),
        );
        let mut filtered_rx = filtered.take_channel().unwrap();
        router.subscribe(filtered).await.unwrap();

        let mut message = Message::new(Path::new("/t").unwrap(), "m");
        message.set_filter("user", "u2");
        router.handle_message(message).await.unwrap();

        assert!(all_rx.recv().await.is_some());
        // the filtered route must see nothing; publishing a matching message
        // afterwards proves the channel order
        let mut matching = Message::new(Path::new("/t").unwrap(), "m2");
        matching.set_filter("user", "u1");
        router.handle_message(matching).await.unwrap();

        let got = filtered_rx.recv().await.unwrap();
        assert_eq!(got.body_as_string(), "m2");
    }

    #[tokio::test]
    async fn slow_route_is_closed_and_removed() {
        let (_dir, router) = test_router();
        let route = Route::new(RouteConfig::new(Path::new("/t").unwrap(), 1));
        let _rx = route.take_channel().unwrap();
        router.subscribe(route.clone()).await.unwrap();

        router
            .handle_message(Message::new(Path::new("/t").unwrap(), "one"))
            .await
            .unwrap();
        router
            .handle_message(Message::new(Path::new("/t").unwrap(), "two"))
            .await
            .unwrap();

        // give the dispatcher a chance to process both
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(route.is_closed());
        assert_eq!(router.get_subscribers("/t"), serde_json::json!([]));
    }

    #[tokio::test]
    async fn subscribe_fails_while_stopping() {
        let (_dir, router) = test_router();
        router.stop().await.unwrap();
        let err = router.subscribe(route_on("/t")).await.unwrap_err();
        assert!(matches!(err, PushgError::ModuleStopping(_)));
    }

    #[tokio::test]
    async fn unsubscribe_closes_and_removes() {
        let (_dir, router) = test_router();
        let route = route_on("/t");
        router.subscribe(route.clone()).await.unwrap();

        router.unsubscribe(&route).await.unwrap();
        assert!(route.is_closed());
        assert!(matches!(
            router.unsubscribe(&route).await,
            Err(PushgError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_subscribers_reports_params() {
        let (_dir, router) = test_router();
        let mut params = BTreeMap::new();
        params.insert("device_id".into(), "d1".into());
        let route = Route::new(
            RouteConfig::new(Path::new("/t").unwrap(), 10).with_params(params),
        );
        router.subscribe(route).await.unwrap();

        assert_eq!(
            router.get_subscribers("/t"),
            serde_json::json!([{"device_id": "d1"}])
        );
    }
}
