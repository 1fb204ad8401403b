//! Lua side of the engine: interpreters, pooling, and host modules.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!  ├── VmPool ──────────── LuaVm (pooled, reset between scripts)
//!  ├── CallbackTable ───── LuaVm (dedicated, owns bound closures)
//!  ├── staging (file registrations, committed after the file loads)
//!  └── HostApi (shared by every LuaVm)
//!       ├── HookRegistry
//!       ├── HostServices (cache, eventbus, oss, encryptor)
//!       └── runtime handle
//!
//! LuaVm
//!  ├── Lua state (mlua, sandboxed)
//!  ├── require (package.preload only)
//!  └── Modules
//!       ├── logger (global `log`)
//!       ├── hook (global `hook`)
//!       ├── cache, eventbus, oss
//!       ├── crypto, task, util, json
//!       └── ctx table (built per invocation)
//! ```
//!
//! # Threading
//!
//! Interpreters only run on blocking helper threads. Host modules that do
//! I/O drive their futures with `Handle::block_on` and abandon them when
//! the invocation is cancelled.

pub(crate) mod context_table;
pub(crate) mod host;
pub mod marshal;
pub(crate) mod pool;
pub mod primitives;
pub mod runtime;
pub(crate) mod staging;

pub use marshal::{from_lua, to_lua};
pub use runtime::LuaVm;
