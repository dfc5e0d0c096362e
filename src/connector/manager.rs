use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::connector::subscriber::Subscriber;
use crate::error::{PushgError, Result};
use crate::kvstore::KvStore;

/// Registry of a connector's durable subscribers.
///
/// Every subscriber is persisted as `(schema, key, JSON blob)` in the
/// key/value store; the in-memory map is rebuilt from it by [`Manager::load`]
/// on connector start. `update` persists the current cursor and is
/// idempotent, so response handlers may call it after every send.
pub struct Manager {
    schema: String,
    kv: Arc<dyn KvStore>,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl Manager {
    pub fn new(schema: impl Into<String>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            schema: schema.into(),
            kv,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Rehydrates the in-memory map from the store. Undecodable blobs are
    /// skipped with a warning. Returns the number of loaded subscribers.
    pub async fn load(&self) -> Result<usize> {
        let entries = self.kv.iterate(&self.schema).await?;
        let mut map = HashMap::with_capacity(entries.len());
        for (key, blob) in entries {
            match Subscriber::from_blob(&blob) {
                Ok(subscriber) => {
                    map.insert(subscriber.key().to_owned(), subscriber);
                }
                Err(err) => {
                    warn!(schema = %self.schema, key = %key, error = %err, "skipping undecodable subscriber");
                }
            }
        }
        let loaded = map.len();
        *self.subscribers.write().unwrap() = map;
        info!(schema = %self.schema, loaded, "loaded subscribers");
        Ok(loaded)
    }

    /// Registers and persists a new subscriber. An existing subscriber with
    /// the same key is a duplicate.
    pub async fn add(&self, subscriber: Arc<Subscriber>) -> Result<Arc<Subscriber>> {
        {
            let mut subscribers = self.subscribers.write().unwrap();
            if subscribers.contains_key(subscriber.key()) {
                return Err(PushgError::DuplicateSubscription(
                    subscriber.key().to_owned(),
                ));
            }
            subscribers.insert(subscriber.key().to_owned(), subscriber.clone());
        }
        if let Err(err) = self.persist(&subscriber).await {
            self.subscribers.write().unwrap().remove(subscriber.key());
            return Err(err);
        }
        debug!(schema = %self.schema, key = subscriber.key(), "added subscriber");
        Ok(subscriber)
    }

    /// Persists the subscriber's current state (notably its cursor).
    pub async fn update(&self, subscriber: &Arc<Subscriber>) -> Result<()> {
        self.subscribers
            .write()
            .unwrap()
            .insert(subscriber.key().to_owned(), subscriber.clone());
        self.persist(subscriber).await
    }

    /// Cancels the subscriber's loop and deletes it from store and map.
    pub async fn remove(&self, subscriber: &Arc<Subscriber>) -> Result<()> {
        subscriber.cancel();
        self.subscribers.write().unwrap().remove(subscriber.key());
        self.kv.delete(&self.schema, subscriber.key()).await?;
        info!(schema = %self.schema, key = subscriber.key(), "removed subscriber");
        Ok(())
    }

    /// Re-reads the persisted state and refreshes the in-memory cursor.
    /// Used by the subscriber loop before a restart.
    pub async fn refresh(&self, subscriber: &Arc<Subscriber>) -> Result<()> {
        if let Some(blob) = self.kv.get(&self.schema, subscriber.key()).await? {
            let persisted = Subscriber::from_blob(&blob)?;
            subscriber.set_last_id(persisted.last_id());
        }
        Ok(())
    }

    pub fn find(&self, key: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.read().unwrap().get(key).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.subscribers.read().unwrap().contains_key(key)
    }

    /// Subscribers whose params contain every given tag with an equal value.
    pub fn filter(&self, tags: &HashMap<String, String>) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .unwrap()
            .values()
            .filter(|s| {
                let params = s.params();
                tags.iter().all(|(k, v)| params.get(k) == Some(v))
            })
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().unwrap().values().cloned().collect()
    }

    async fn persist(&self, subscriber: &Arc<Subscriber>) -> Result<()> {
        let blob = subscriber.encode()?;
        self.kv.put(&self.schema, subscriber.key(), &blob).await
    }
}
