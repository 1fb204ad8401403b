//! Cache module backed by the host's [`CacheStore`](crate::services::CacheStore).
//!
//! # Usage in Lua
//!
//! ```lua
//! cache.set("session:" .. id, token, 3600)
//! local token = cache.get("session:" .. id)
//! local hits = cache.incr("hits")
//! cache.expire("hits", 60)
//! ```
//!
//! Values are stored as strings; numbers and booleans are stringified and
//! tables are stored as JSON. Calls fail with a Lua error when no cache is
//! configured.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{Lua, Table, Value};

use super::{host_error, require_service, seconds};
use crate::lua::host::HostApi;
use crate::lua::marshal;
use crate::lua::runtime::VmSignals;
use crate::services::CacheStore;

fn store(api: &HostApi) -> mlua::Result<Arc<dyn CacheStore>> {
    require_service(api.services.cache(), "cache")
}

/// Build the `cache` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register(lua: &Lua, api: &Arc<HostApi>, signals: &Arc<VmSignals>) -> Result<Table> {
    let cache = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create cache table: {e}"))?;

    // cache.get(key) -> string | nil
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let get_fn = lua
        .create_function(move |_, key: String| {
            let store = store(&host)?;
            host.block_on(&sig, store.get(&key))?
                .map_err(host_error("cache.get"))
        })
        .map_err(|e| anyhow!("Failed to create cache.get function: {e}"))?;
    cache
        .set("get", get_fn)
        .map_err(|e| anyhow!("Failed to set cache.get: {e}"))?;

    // cache.set(key, value [, ttl_seconds])
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let set_fn = lua
        .create_function(move |_, (key, value, ttl): (String, Value, Option<i64>)| {
            if value.is_nil() {
                return Err(mlua::Error::runtime("cache.set: value must not be nil"));
            }
            let value = marshal::display(&value);
            let ttl = ttl.filter(|t| *t > 0).map(seconds);
            let store = store(&host)?;
            host.block_on(&sig, store.set(&key, &value, ttl))?
                .map_err(host_error("cache.set"))
        })
        .map_err(|e| anyhow!("Failed to create cache.set function: {e}"))?;
    cache
        .set("set", set_fn)
        .map_err(|e| anyhow!("Failed to set cache.set: {e}"))?;

    // cache.delete(key)
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let delete_fn = lua
        .create_function(move |_, key: String| {
            let store = store(&host)?;
            host.block_on(&sig, store.delete(&key))?
                .map_err(host_error("cache.delete"))
        })
        .map_err(|e| anyhow!("Failed to create cache.delete function: {e}"))?;
    cache
        .set("delete", delete_fn)
        .map_err(|e| anyhow!("Failed to set cache.delete: {e}"))?;

    // cache.exists(key) -> bool
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let exists_fn = lua
        .create_function(move |_, key: String| {
            let store = store(&host)?;
            host.block_on(&sig, store.exists(&key))?
                .map_err(host_error("cache.exists"))
        })
        .map_err(|e| anyhow!("Failed to create cache.exists function: {e}"))?;
    cache
        .set("exists", exists_fn)
        .map_err(|e| anyhow!("Failed to set cache.exists: {e}"))?;

    // cache.incr(key [, by]) -> integer
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let incr_fn = lua
        .create_function(move |_, (key, by): (String, Option<i64>)| {
            let store = store(&host)?;
            host.block_on(&sig, store.incr(&key, by.unwrap_or(1)))?
                .map_err(host_error("cache.incr"))
        })
        .map_err(|e| anyhow!("Failed to create cache.incr function: {e}"))?;
    cache
        .set("incr", incr_fn)
        .map_err(|e| anyhow!("Failed to set cache.incr: {e}"))?;

    // cache.expire(key, ttl_seconds) -> bool
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let expire_fn = lua
        .create_function(move |_, (key, ttl): (String, i64)| {
            let store = store(&host)?;
            host.block_on(&sig, store.expire(&key, seconds(ttl)))?
                .map_err(host_error("cache.expire"))
        })
        .map_err(|e| anyhow!("Failed to create cache.expire function: {e}"))?;
    cache
        .set("expire", expire_fn)
        .map_err(|e| anyhow!("Failed to set cache.expire: {e}"))?;

    Ok(cache)
}
