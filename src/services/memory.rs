//! In-process implementations of the host capability traits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{CacheStore, EventBus, ObjectStore};

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// `HashMap`-backed cache with lazy expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("MemoryCache").field("entries", &len).finish()
    }
}

impl MemoryCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<T>(&self, f: impl FnOnce(&mut HashMap<String, CacheEntry>) -> T) -> T {
        let mut entries = self.entries.lock().expect("MemoryCache mutex poisoned");
        entries.retain(|_, e| e.is_live());
        f(&mut entries)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_live(|e| e.get(key).map(|v| v.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_live(|e| {
            e.insert(
                key.to_string(),
                CacheEntry {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_live(|e| e.remove(key));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.with_live(|e| e.contains_key(key)))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        self.with_live(|e| {
            let entry = e.entry(key.to_string()).or_insert_with(|| CacheEntry {
                value: "0".to_string(),
                expires_at: None,
            });
            let current: i64 = entry
                .value
                .parse()
                .map_err(|_| anyhow!("value at '{key}' is not an integer"))?;
            let next = current
                .checked_add(by)
                .ok_or_else(|| anyhow!("increment overflow at '{key}'"))?;
            entry.value = next.to_string();
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with_live(|e| match e.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }
}

/// Fan-out bus over unbounded tokio channels.
///
/// Subscribers whose receiver has been dropped are pruned on the next publish.
#[derive(Default)]
pub struct MemoryEventBus {
    subscribers: Mutex<HashMap<String, Vec<UnboundedSender<Value>>>>,
}

impl std::fmt::Debug for MemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.subscribers.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("MemoryEventBus").field("topics", &topics).finish()
    }
}

impl MemoryEventBus {
    /// Bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriber count for `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .expect("MemoryEventBus mutex poisoned")
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let mut subscribers = self.subscribers.lock().expect("MemoryEventBus mutex poisoned");
        if let Some(subs) = subscribers.get_mut(topic) {
            subs.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<UnboundedReceiver<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("MemoryEventBus mutex poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// `HashMap`-backed object store issuing `memory://` URLs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl std::fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.objects.lock().map(|o| o.len()).unwrap_or(0);
        f.debug_struct("MemoryObjectStore").field("objects", &len).finish()
    }
}

impl MemoryObjectStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn presign(bucket: &str, key: &str, op: &str, ttl: Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        format!("memory://{bucket}/{key}?op={op}&expires={expires}")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects
            .lock()
            .expect("MemoryObjectStore mutex poisoned")
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .expect("MemoryObjectStore mutex poisoned")
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .lock()
            .expect("MemoryObjectStore mutex poisoned")
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .expect("MemoryObjectStore mutex poisoned")
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        Ok(Self::presign(bucket, key, "put", ttl))
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        Ok(Self::presign(bucket, key, "get", ttl))
    }
}
