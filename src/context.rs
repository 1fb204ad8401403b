//! Execution context carried through one hook dispatch.
//!
//! The host creates an [`ExecutionContext`], fills in inputs, hands it to
//! [`Engine::execute_hook`](crate::Engine::execute_hook), and reads outputs
//! back once the dispatch returns. Every callback and script of that
//! dispatch sees the same instance, so a value written by an earlier entry
//! is visible to later ones.
//!
//! # Example
//!
//! ```ignore
//! let ctx = Arc::new(ExecutionContext::new("user.created"));
//! ctx.set("email", "test@example.com");
//! engine.execute_hook("user.created", &ctx).await?;
//! let processed = ctx.get("processed_email");
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;

/// Identity of the user that triggered the hook.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// User id.
    pub id: String,
    /// Login name.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Role names.
    pub roles: Vec<String>,
    /// Owning tenant.
    pub tenant_id: String,
}

/// Request metadata for hooks fired from a request handler.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// HTTP method or RPC verb.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Peer address.
    pub remote_addr: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Query parameters.
    pub query: HashMap<String, String>,
}

/// Per-dispatch data bag shared by every script and callback of one hook invocation.
///
/// All accessors take `&self`; the data mapping sits behind an internal lock.
pub struct ExecutionContext {
    id: Uuid,
    hook_name: String,
    data: RwLock<HashMap<String, Value>>,
    user: Option<Arc<UserInfo>>,
    request: Option<Arc<RequestInfo>>,
    cancel: Option<CancellationToken>,
    stop_reason: Mutex<Option<String>>,
    started_at: Instant,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key_count = self.data.read().map(|d| d.len()).unwrap_or(0);
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("hook_name", &self.hook_name)
            .field("key_count", &key_count)
            .field("has_user", &self.user.is_some())
            .field("has_request", &self.request.is_some())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Create an empty context for `hook_name` with a fresh UUIDv4.
    #[must_use]
    pub fn new(hook_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            hook_name: hook_name.into(),
            data: RwLock::new(HashMap::new()),
            user: None,
            request: None,
            cancel: None,
            stop_reason: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Attach the triggering user.
    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(Arc::new(user));
        self
    }

    /// Attach request metadata.
    pub fn with_request(mut self, request: RequestInfo) -> Self {
        self.request = Some(Arc::new(request));
        self
    }

    /// Attach a caller cancellation handle.
    ///
    /// Cancelling it aborts in-flight scripts (including `util.sleep`) before
    /// the engine's hard timeout.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Unique context id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Hook this context was created for.
    #[must_use]
    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    /// Triggering user, if any.
    #[must_use]
    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_deref()
    }

    /// Request metadata, if any.
    #[must_use]
    pub fn request(&self) -> Option<&RequestInfo> {
        self.request.as_deref()
    }

    /// Caller cancellation handle, if any.
    #[must_use]
    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data
            .write()
            .expect("context data lock poisoned")
            .insert(key.into(), value.into());
    }

    /// Read the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .expect("context data lock poisoned")
            .get(key)
            .cloned()
    }

    /// Read and deserialize the value under `key`.
    ///
    /// Returns `None` when the key is absent or the value does not fit `T`.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.data
            .read()
            .expect("context data lock poisoned")
            .contains_key(key)
    }

    /// Remove `key`, returning its previous value.
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.data
            .write()
            .expect("context data lock poisoned")
            .remove(key)
    }

    /// Snapshot of the data mapping.
    #[must_use]
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        self.data
            .read()
            .expect("context data lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Time elapsed since the context was created.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Mark the context stopped and return the matching error.
    ///
    /// The engine checks the flag after every callback and script, so a
    /// stop ends the dispatch.
    pub fn stop(&self, reason: impl Into<String>) -> EngineError {
        let reason = reason.into();
        *self.stop_reason.lock().expect("context stop lock poisoned") = Some(reason.clone());
        EngineError::Stopped {
            hook: self.hook_name.clone(),
            by: "context".to_string(),
            reason,
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop_reason
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Reason passed to [`stop`](Self::stop).
    #[must_use]
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason
            .lock()
            .expect("context stop lock poisoned")
            .clone()
    }
}

/// Deep-copies the data mapping under a fresh id and start time.
///
/// User, request, and cancellation handles are shared with the original;
/// the stop flag is not carried over.
impl Clone for ExecutionContext {
    fn clone(&self) -> Self {
        let data = self.data.read().expect("context data lock poisoned").clone();
        Self {
            id: Uuid::new_v4(),
            hook_name: self.hook_name.clone(),
            data: RwLock::new(data),
            user: self.user.clone(),
            request: self.request.clone(),
            cancel: self.cancel.clone(),
            stop_reason: Mutex::new(None),
            started_at: Instant::now(),
        }
    }
}
