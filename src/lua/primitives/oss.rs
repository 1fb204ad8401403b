//! Object storage module backed by the host's [`ObjectStore`](crate::services::ObjectStore).
//!
//! # Usage in Lua
//!
//! ```lua
//! oss.put("avatars", user_id .. ".png", bytes)
//! if oss.exists("avatars", user_id .. ".png") then
//!     ctx.set("avatar_url", oss.presign_get("avatars", user_id .. ".png", 300))
//! end
//! ```
//!
//! Object bodies are Lua strings and may hold arbitrary bytes.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{Lua, String as LuaString, Table};

use super::{host_error, require_service, seconds};
use crate::lua::host::HostApi;
use crate::lua::runtime::VmSignals;
use crate::services::ObjectStore;

fn store(api: &HostApi) -> mlua::Result<Arc<dyn ObjectStore>> {
    require_service(api.services.object_store(), "oss")
}

/// Build the `oss` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register(lua: &Lua, api: &Arc<HostApi>, signals: &Arc<VmSignals>) -> Result<Table> {
    let oss = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create oss table: {e}"))?;

    // oss.put(bucket, key, bytes)
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let put_fn = lua
        .create_function(move |_, (bucket, key, data): (String, String, LuaString)| {
            let store = store(&host)?;
            let data = data.as_bytes().to_vec();
            host.block_on(&sig, store.put(&bucket, &key, data))?
                .map_err(host_error("oss.put"))
        })
        .map_err(|e| anyhow!("Failed to create oss.put function: {e}"))?;
    oss.set("put", put_fn)
        .map_err(|e| anyhow!("Failed to set oss.put: {e}"))?;

    // oss.get(bucket, key) -> bytes | nil
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let get_fn = lua
        .create_function(move |lua, (bucket, key): (String, String)| {
            let store = store(&host)?;
            let object = host
                .block_on(&sig, store.get(&bucket, &key))?
                .map_err(host_error("oss.get"))?;
            object.map(|bytes| lua.create_string(bytes)).transpose()
        })
        .map_err(|e| anyhow!("Failed to create oss.get function: {e}"))?;
    oss.set("get", get_fn)
        .map_err(|e| anyhow!("Failed to set oss.get: {e}"))?;

    // oss.delete(bucket, key)
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let delete_fn = lua
        .create_function(move |_, (bucket, key): (String, String)| {
            let store = store(&host)?;
            host.block_on(&sig, store.delete(&bucket, &key))?
                .map_err(host_error("oss.delete"))
        })
        .map_err(|e| anyhow!("Failed to create oss.delete function: {e}"))?;
    oss.set("delete", delete_fn)
        .map_err(|e| anyhow!("Failed to set oss.delete: {e}"))?;

    // oss.exists(bucket, key) -> bool
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let exists_fn = lua
        .create_function(move |_, (bucket, key): (String, String)| {
            let store = store(&host)?;
            host.block_on(&sig, store.exists(&bucket, &key))?
                .map_err(host_error("oss.exists"))
        })
        .map_err(|e| anyhow!("Failed to create oss.exists function: {e}"))?;
    oss.set("exists", exists_fn)
        .map_err(|e| anyhow!("Failed to set oss.exists: {e}"))?;

    // oss.presign_put(bucket, key, ttl_seconds) -> url
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let presign_put_fn = lua
        .create_function(move |_, (bucket, key, ttl): (String, String, i64)| {
            let store = store(&host)?;
            host.block_on(&sig, store.presign_put(&bucket, &key, seconds(ttl)))?
                .map_err(host_error("oss.presign_put"))
        })
        .map_err(|e| anyhow!("Failed to create oss.presign_put function: {e}"))?;
    oss.set("presign_put", presign_put_fn)
        .map_err(|e| anyhow!("Failed to set oss.presign_put: {e}"))?;

    // oss.presign_get(bucket, key, ttl_seconds) -> url
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let presign_get_fn = lua
        .create_function(move |_, (bucket, key, ttl): (String, String, i64)| {
            let store = store(&host)?;
            host.block_on(&sig, store.presign_get(&bucket, &key, seconds(ttl)))?
                .map_err(host_error("oss.presign_get"))
        })
        .map_err(|e| anyhow!("Failed to create oss.presign_get function: {e}"))?;
    oss.set("presign_get", presign_get_fn)
        .map_err(|e| anyhow!("Failed to set oss.presign_get: {e}"))?;

    Ok(oss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::runtime::{Job, VmFactory};
    use crate::services::MemoryObjectStore;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_object_roundtrip_with_binary_body() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let api = HostApi::for_tests(rt.handle().clone());
        api.services.set_object_store(Arc::new(MemoryObjectStore::new()));
        let vm = VmFactory::new(Arc::clone(&api), 16 * 1024 * 1024)
            .create()
            .unwrap();

        vm.run(
            Job::Chunk {
                name: "oss_test".into(),
                source: r#"
                    local body = "PNG\0\1\2"
                    oss.put("avatars", "u1.png", body)
                    assert(oss.exists("avatars", "u1.png"))
                    assert(oss.get("avatars", "u1.png") == body)
                    assert(oss.get("avatars", "missing") == nil)
                    local url = oss.presign_get("avatars", "u1.png", 60)
                    assert(string.find(url, "memory://avatars/u1.png", 1, true) == 1)
                    assert(string.find(oss.presign_put("avatars", "u2.png", 60), "op=put", 1, true))
                    oss.delete("avatars", "u1.png")
                    assert(not oss.exists("avatars", "u1.png"))
                "#
                .into(),
            },
            CancellationToken::new(),
            false,
        )
        .unwrap();
    }

    #[test]
    fn test_unconfigured_store_errors() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let api = HostApi::for_tests(rt.handle().clone());
        let vm = VmFactory::new(api, 16 * 1024 * 1024).create().unwrap();

        let err = vm
            .run(
                Job::Chunk {
                    name: "oss_test".into(),
                    source: r#"oss.exists("b", "k")"#.into(),
                },
                CancellationToken::new(),
                false,
            )
            .unwrap_err();
        assert!(err.contains("oss is not configured"), "{err}");
    }
}
