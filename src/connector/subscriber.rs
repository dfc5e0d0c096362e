use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::connector::manager::Manager;
use crate::connector::Request;
use crate::error::{PushgError, Result};
use crate::protocol::Path;
use crate::route::{Route, RouteConfig};
use crate::router::Router;
use crate::store::{FetchDirection, FetchRequest};

const RESTART_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubscriberState {
    path: Path,
    params: BTreeMap<String, String>,
    last_id: u64,
}

/// A durable subscription of one device/registration.
///
/// The stable `key` is derived from the topic path and the sorted params and
/// doubles as the persistence key in the connector's schema. `last_id` is
/// the resume cursor: the highest message ID confirmed handed to the
/// external service.
pub struct Subscriber {
    key: String,
    state: RwLock<SubscriberState>,
    cancel: watch::Sender<bool>,
}

impl Subscriber {
    pub fn new(path: Path, params: BTreeMap<String, String>) -> Arc<Subscriber> {
        Self::with_last_id(path, params, 0)
    }

    pub fn with_last_id(
        path: Path,
        params: BTreeMap<String, String>,
        last_id: u64,
    ) -> Arc<Subscriber> {
        let key = derive_key(&path, &params);
        let (cancel, _) = watch::channel(false);
        Arc::new(Subscriber {
            key,
            state: RwLock::new(SubscriberState {
                path,
                params,
                last_id,
            }),
            cancel,
        })
    }

    /// Decodes a subscriber from its persisted JSON blob.
    pub fn from_blob(blob: &[u8]) -> Result<Arc<Subscriber>> {
        let state: SubscriberState = serde_json::from_slice(blob)
            .map_err(|e| PushgError::Corrupt(format!("subscriber blob: {}", e)))?;
        Ok(Self::with_last_id(state.path, state.params, state.last_id))
    }

    /// Encodes the subscriber for persistence.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let state = self.state.read().unwrap();
        serde_json::to_vec(&*state)
            .map_err(|e| PushgError::Corrupt(format!("subscriber encode: {}", e)))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> Path {
        self.state.read().unwrap().path.clone()
    }

    pub fn params(&self) -> BTreeMap<String, String> {
        self.state.read().unwrap().params.clone()
    }

    pub fn last_id(&self) -> u64 {
        self.state.read().unwrap().last_id
    }

    pub fn set_last_id(&self, id: u64) {
        self.state.write().unwrap().last_id = id;
    }

    /// Cancels the subscriber's loop; it exits cleanly at the next handoff.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// The route this subscriber materializes into: identified by its
    /// params, fetching history from `last_id + 1` when there is a cursor.
    pub(crate) fn route_config(&self, channel_size: usize) -> RouteConfig {
        let state = self.state.read().unwrap();
        let mut config = RouteConfig::new(state.path.clone(), channel_size)
            .with_params(state.params.clone());
        if state.last_id > 0 {
            config = config.with_fetch(FetchRequest::new(
                state.path.partition(),
                state.last_id + 1,
                0,
                FetchDirection::Forward,
            ));
        }
        config
    }
}

fn derive_key(path: &Path, params: &BTreeMap<String, String>) -> String {
    let mut key = path.to_string();
    for (k, v) in params {
        key.push(' ');
        key.push_str(k);
        key.push(':');
        key.push_str(v);
    }
    key
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("key", &self.key)
            .field("last_id", &self.last_id())
            .finish()
    }
}

/// The per-subscriber loop: materializes the route, feeds received messages
/// into the connector queue and restarts with bounded exponential backoff
/// when the router drops the route. Exits on subscriber or connector
/// cancellation and when the router stops.
pub(crate) async fn subscriber_loop(
    subscriber: Arc<Subscriber>,
    router: Router,
    manager: Arc<Manager>,
    queue: mpsc::Sender<Request>,
    channel_size: usize,
    mut connector_cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(RESTART_BACKOFF_MIN, RESTART_BACKOFF_MAX, 2.0, true);
    let mut sub_cancel = subscriber.cancel_signal();
    let mut router_done = router.done();

    loop {
        if subscriber.is_cancelled() || *connector_cancel.borrow() || router.is_stopping() {
            return;
        }
        // pick up the persisted cursor; after a restart it may be ahead of
        // our in-memory copy
        if let Err(err) = manager.refresh(&subscriber).await {
            warn!(key = subscriber.key(), error = %err, "could not refresh subscriber");
        }

        let route = Route::new(subscriber.route_config(channel_size));
        let Some(mut rx) = route.take_channel() else {
            return;
        };
        let provide = tokio::spawn(route.clone().provide(router.clone(), true));

        let mut restart = true;
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(message) => {
                        if message.id <= subscriber.last_id() {
                            continue;
                        }
                        let request = Request::new(subscriber.clone(), message);
                        // the queue send itself must stay cancellable, or a
                        // full queue would block shutdown
                        let sent = tokio::select! {
                            sent = queue.send(request) => sent.is_ok(),
                            _ = sub_cancel.changed() => { restart = false; break; }
                            _ = connector_cancel.changed() => { restart = false; break; }
                        };
                        if !sent {
                            restart = false;
                            break;
                        }
                        backoff.reset();
                    }
                    // route closed by the router: restart with backoff
                    None => break,
                },
                _ = sub_cancel.changed() => { restart = false; break; }
                _ = connector_cancel.changed() => { restart = false; break; }
                _ = router_done.changed() => { restart = false; break; }
            }
        }

        route.close();
        // dropping the receiver unblocks a provide that is still pushing
        // history into the channel
        drop(rx);
        let _ = router.unsubscribe(&route).await;
        match provide.await {
            Ok(Err(PushgError::ModuleStopping(_))) => return,
            Ok(Err(err)) => debug!(key = subscriber.key(), error = %err, "provide ended"),
            _ => {}
        }
        if !restart {
            return;
        }

        let delay = backoff.duration();
        debug!(key = subscriber.key(), delay_ms = delay.as_millis() as u64, "restarting subscriber");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = sub_cancel.changed() => return,
            _ = connector_cancel.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(user: &str, device: &str) -> BTreeMap<String, String> {
        let mut p = BTreeMap::new();
        p.insert("user_id".to_owned(), user.to_owned());
        p.insert("device_id".to_owned(), device.to_owned());
        p
    }

    #[test]
    fn key_is_stable_and_sorted() {
        let sub = Subscriber::new(Path::new("/topic").unwrap(), params("u1", "d1"));
        assert_eq!(sub.key(), "/topic device_id:d1 user_id:u1");
    }

    #[test]
    fn blob_round_trip_preserves_cursor() {
        let sub = Subscriber::with_last_id(Path::new("/topic").unwrap(), params("u1", "d1"), 99);
        let decoded = Subscriber::from_blob(&sub.encode().unwrap()).unwrap();
        assert_eq!(decoded.key(), sub.key());
        assert_eq!(decoded.last_id(), 99);
    }

    #[test]
    fn route_config_fetches_from_the_cursor() {
        let sub = Subscriber::with_last_id(Path::new("/topic/a").unwrap(), params("u", "d"), 5);
        let config = sub.route_config(10);
        let fetch = config.fetch_request.expect("fetch request");
        assert_eq!(fetch.partition, "topic");
        assert_eq!(fetch.start_id, 6);
        assert_eq!(fetch.count, 0);
        assert_eq!(fetch.direction, FetchDirection::Forward);

        let fresh = Subscriber::new(Path::new("/topic/a").unwrap(), params("u", "d"));
        assert!(fresh.route_config(10).fetch_request.is_none());
    }
}
