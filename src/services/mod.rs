//! Host capabilities exposed to scripts.
//!
//! The engine does not know which cache, message bus, or object store the
//! host runs; it only talks to these traits. Each capability is optional:
//! a script that calls into an unconfigured one gets a Lua error on first
//! use.
//!
//! In-process implementations live in [`memory`] and are handy for tests
//! and single-node deployments.

pub mod memory;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

pub use memory::{MemoryCache, MemoryEventBus, MemoryObjectStore};

/// Key/value cache (Redis-shaped).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write a key with an optional time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Delete a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Add `by` to an integer key (missing keys start at 0) and return the new value.
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;
    /// Set a time-to-live on an existing key. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Topic-based publish/subscribe bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
    /// Subscribe to `topic`. The stream ends when the bus drops the sender.
    async fn subscribe(&self, topic: &str) -> Result<UnboundedReceiver<Value>>;
}

/// Bucketed object storage (S3/MinIO-shaped).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object.
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;
    /// Fetch an object.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;
    /// Delete an object. Missing objects are not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
    /// Whether an object exists.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
    /// Pre-signed upload URL valid for `ttl`.
    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
    /// Pre-signed download URL valid for `ttl`.
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
}

/// Symmetric string encryptor used by the `crypto` module.
pub trait Encryptor: Send + Sync {
    /// Encrypt `plaintext` into a printable ciphertext.
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    /// Reverse [`encrypt`](Self::encrypt).
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Late-bound slots for the optional host capabilities.
///
/// Interpreters capture an `Arc<HostServices>` when they are created, so a
/// capability installed later (`Engine::set_cache` and friends) becomes
/// visible to every interpreter, pooled or dedicated.
#[derive(Default)]
pub struct HostServices {
    cache: RwLock<Option<Arc<dyn CacheStore>>>,
    event_bus: RwLock<Option<Arc<dyn EventBus>>>,
    object_store: RwLock<Option<Arc<dyn ObjectStore>>>,
    encryptor: RwLock<Option<Arc<dyn Encryptor>>>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("cache", &self.cache().is_some())
            .field("event_bus", &self.event_bus().is_some())
            .field("object_store", &self.object_store().is_some())
            .field("encryptor", &self.encryptor().is_some())
            .finish()
    }
}

impl HostServices {
    /// All capabilities unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the cache.
    pub fn set_cache(&self, cache: Arc<dyn CacheStore>) {
        *self.cache.write().expect("services lock poisoned") = Some(cache);
    }

    /// Install the event bus.
    pub fn set_event_bus(&self, bus: Arc<dyn EventBus>) {
        *self.event_bus.write().expect("services lock poisoned") = Some(bus);
    }

    /// Install the object store.
    pub fn set_object_store(&self, store: Arc<dyn ObjectStore>) {
        *self.object_store.write().expect("services lock poisoned") = Some(store);
    }

    /// Install the encryptor.
    pub fn set_encryptor(&self, encryptor: Arc<dyn Encryptor>) {
        *self.encryptor.write().expect("services lock poisoned") = Some(encryptor);
    }

    /// Configured cache, if any.
    #[must_use]
    pub fn cache(&self) -> Option<Arc<dyn CacheStore>> {
        self.cache.read().ok().and_then(|c| c.clone())
    }

    /// Configured event bus, if any.
    #[must_use]
    pub fn event_bus(&self) -> Option<Arc<dyn EventBus>> {
        self.event_bus.read().ok().and_then(|b| b.clone())
    }

    /// Configured object store, if any.
    #[must_use]
    pub fn object_store(&self) -> Option<Arc<dyn ObjectStore>> {
        self.object_store.read().ok().and_then(|s| s.clone())
    }

    /// Configured encryptor, if any.
    #[must_use]
    pub fn encryptor(&self) -> Option<Arc<dyn Encryptor>> {
        self.encryptor.read().ok().and_then(|e| e.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_start_empty() {
        let services = HostServices::new();
        assert!(services.cache().is_none());
        assert!(services.event_bus().is_none());
        assert!(services.object_store().is_none());
        assert!(services.encryptor().is_none());
    }

    #[test]
    fn test_services_late_binding() {
        let services = HostServices::new();
        services.set_cache(Arc::new(MemoryCache::new()));
        services.set_event_bus(Arc::new(MemoryEventBus::new()));
        assert!(services.cache().is_some());
        assert!(services.event_bus().is_some());
        assert!(services.object_store().is_none());
    }
}
