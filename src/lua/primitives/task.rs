//! Task handler registration.
//!
//! # Usage in Lua
//!
//! ```lua
//! task.register("send_welcome", function(payload)
//!     log.info("sending welcome", "to", payload.email)
//!     return { queued = true }
//! end)
//! ```
//!
//! The host runs handlers through `Engine::run_task`. Registering a
//! handler dedicates the calling interpreter; a second registration for the
//! same type replaces the first.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, Table};

use crate::lua::host::HostApi;
use crate::lua::runtime;
use crate::lua::staging::{self, Staged};

/// Build the `task` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register(lua: &Lua, api: &Arc<HostApi>) -> Result<Table> {
    let task = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create task table: {e}"))?;

    // task.register(type_name, handler) -> true
    let host = Arc::clone(api);
    let register_fn = lua
        .create_function(move |lua, (type_name, handler): (String, Function)| {
            if type_name.trim().is_empty() {
                return Err(mlua::Error::runtime("task type must not be empty"));
            }
            let vm = runtime::current_vm(lua)?;
            let function = lua.create_registry_value(handler)?;
            staging::submit(
                &host,
                &vm,
                Staged::Task {
                    task_type: type_name,
                    function,
                },
            )?;
            Ok(true)
        })
        .map_err(|e| anyhow!("Failed to create task.register function: {e}"))?;
    task.set("register", register_fn)
        .map_err(|e| anyhow!("Failed to set task.register: {e}"))?;

    // task.list() -> {type_name, ...}
    let host = Arc::clone(api);
    let list_fn = lua
        .create_function(move |lua, ()| {
            let vm = runtime::current_vm(lua)?;
            Ok(staging::task_types(&host, &vm))
        })
        .map_err(|e| anyhow!("Failed to create task.list function: {e}"))?;
    task.set("list", list_fn)
        .map_err(|e| anyhow!("Failed to set task.list: {e}"))?;

    Ok(task)
}
