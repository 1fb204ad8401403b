//! Host modules exposed to scripts.
//!
//! Every module is installed into `package.preload` under a canonical
//! `kratos_<name>` key and a short `<name>` alias; both load the same
//! table. Each module is also bound as a global so scripts can use it
//! without `require`.
//!
//! # Available Modules
//!
//! | Module | Global | Functions |
//! |--------|--------|-----------|
//! | `logger` | `log` | debug, info, warn, error, fatal |
//! | `hook` | `hook` | register, add_script, list |
//! | `cache` | `cache` | get, set, delete, exists, incr, expire |
//! | `eventbus` | `eventbus` | publish, subscribe |
//! | `oss` | `oss` | put, get, delete, exists, presign_put, presign_get |
//! | `crypto` | `crypto` | sha256, hmac_sha256, encrypt, decrypt, uuid, base64_encode, base64_decode |
//! | `task` | `task` | register, list |
//! | `util` | `util` | sleep, now, format_time |
//! | `json` | `json` | encode, decode, encode_pretty |
//!
//! # Adding New Modules
//!
//! 1. Create a new module (e.g., `foo.rs`) with a `register` function
//!    returning the module table
//! 2. Add `pub mod foo;` here
//! 3. Add it to the list in `register_all`

pub mod cache;
pub mod crypto;
pub mod eventbus;
pub mod hook;
pub mod json;
pub mod logger;
pub mod oss;
pub mod task;
pub mod util;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::Lua;

use super::host::HostApi;
use super::runtime::{self, VmSignals};

/// Prefix of every canonical module name.
pub const MODULE_PREFIX: &str = "kratos_";

/// Install every host module into `lua`.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register_all(lua: &Lua, api: &Arc<HostApi>, signals: &Arc<VmSignals>) -> Result<()> {
    let modules = [
        ("logger", "log", logger::register(lua)?),
        ("hook", "hook", hook::register(lua, api)?),
        ("cache", "cache", cache::register(lua, api, signals)?),
        ("eventbus", "eventbus", eventbus::register(lua, api, signals)?),
        ("oss", "oss", oss::register(lua, api, signals)?),
        ("crypto", "crypto", crypto::register(lua, api)?),
        ("task", "task", task::register(lua, api)?),
        ("util", "util", util::register(lua, api, signals)?),
        ("json", "json", json::register(lua)?),
    ];

    for (name, global, table) in modules {
        let canonical = format!("{MODULE_PREFIX}{name}");
        runtime::install_module(lua, &canonical, name, table.clone())
            .map_err(|e| anyhow!("Failed to install module {canonical}: {e}"))?;
        lua.globals()
            .raw_set(global, table)
            .map_err(|e| anyhow!("Failed to bind global {global}: {e}"))?;
    }
    Ok(())
}

/// Resolve an optional host capability or raise a Lua error.
fn require_service<T: ?Sized>(service: Option<Arc<T>>, name: &str) -> mlua::Result<Arc<T>> {
    service.ok_or_else(|| mlua::Error::runtime(format!("{name} is not configured")))
}

/// Turn a host-side failure into a Lua error prefixed with the operation.
fn host_error(op: &str) -> impl Fn(anyhow::Error) -> mlua::Error + '_ {
    move |e| mlua::Error::runtime(format!("{op}: {e:#}"))
}

/// Seconds argument to a `Duration`; negatives clamp to zero.
fn seconds(ttl: i64) -> std::time::Duration {
    std::time::Duration::from_secs(u64::try_from(ttl).unwrap_or(0))
}
