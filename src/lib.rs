//! luahook - embeddable sandboxed Lua hook runtime.
//!
//! A host application names extension points ("hooks"), attaches Lua
//! scripts to them, and dispatches a hook with an [`ExecutionContext`].
//! Scripts run in sandboxed interpreters with a memory budget and a
//! per-script timeout, and reach host capabilities (cache, event bus,
//! object storage, crypto) through injected service traits.
//!
//! # Architecture
//!
//! - **Engine** - facade: registration, loading, dispatch, lifecycle
//! - **HookRegistry** - hooks and their priority-ordered scripts
//! - **VmPool** - reusable interpreters, reset between scripts
//! - **CallbackTable** - closures bound by scripts, each pinning the
//!   interpreter that created it
//! - **Host modules** - `log`, `hook`, `cache`, `eventbus`, `oss`,
//!   `crypto`, `task`, `util`, `json`
//!
//! # Modules
//!
//! - [`engine`] - the [`Engine`] facade
//! - [`config`] - [`EngineConfig`] loading and validation
//! - [`context`] - per-dispatch [`ExecutionContext`]
//! - [`registry`] - hook/script bookkeeping
//! - [`lua`] - interpreters, pooling, and host modules
//! - [`services`] - host capability traits and in-memory implementations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use luahook::{Engine, EngineConfig, ExecutionContext, Script};
//!
//! # async fn demo() -> luahook::EngineResult<()> {
//! let engine = Engine::new(EngineConfig::default()).await?;
//! engine.register_hook("order.created", "after an order is stored")?;
//! engine.add_script(
//!     "order.created",
//!     Script::new("audit", r#"function execute(ctx) ctx.set("audited", true) end"#),
//! )?;
//!
//! let ctx = Arc::new(ExecutionContext::new("order.created"));
//! engine.execute_hook("order.created", &ctx).await?;
//! assert_eq!(ctx.get("audited"), Some(serde_json::Value::Bool(true)));
//! # Ok(())
//! # }
//! ```

mod callbacks;

pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod lua;
pub mod registry;
pub mod script;
pub mod services;

pub use config::EngineConfig;
pub use context::{ExecutionContext, RequestInfo, UserInfo};
pub use crypto::AesGcmEncryptor;
pub use engine::{Engine, LoadReport};
pub use error::{EngineError, EngineResult};
pub use registry::HookRegistry;
pub use script::{Script, ScriptRecord};
pub use services::{
    CacheStore, Encryptor, EventBus, HostServices, MemoryCache, MemoryEventBus, MemoryObjectStore, ObjectStore,
};
