//! Hook self-registration module.
//!
//! Lets a script create hooks, attach script records, and bind closures
//! that run on every dispatch of a hook. Bound globally as `hook`.
//!
//! # Usage in Lua
//!
//! ```lua
//! hook.register("user.created", "fired after signup")
//!
//! hook.register("user.created", function(ctx)
//!     ctx.set("welcome_sent", true)
//!     return true
//! end)
//!
//! hook.add_script("user.created", {
//!     name = "normalize_email",
//!     priority = 10,
//!     source = [[
//!         function execute(ctx)
//!             ctx.set("email", string.lower(ctx.get("email")))
//!             return true
//!         end
//!     ]],
//! })
//!
//! for _, name in ipairs(hook.list()) do log.info(name) end
//! ```
//!
//! Binding a closure marks the calling interpreter dedicated: it is kept
//! alive for the closure and never returned to the pool, so its globals
//! persist between invocations. Calls made while a file loads take effect
//! only once the whole file has evaluated (see
//! [`staging`](crate::lua::staging)).

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, Table, Value};

use crate::lua::host::HostApi;
use crate::lua::runtime;
use crate::lua::staging::{self, Staged};
use crate::script::Script;

/// Build the `hook` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register(lua: &Lua, api: &Arc<HostApi>) -> Result<Table> {
    let hook = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create hook table: {e}"))?;

    // hook.register(name [, description] [, callback]) -> true
    let host = Arc::clone(api);
    let register_fn = lua
        .create_function(move |lua, (name, second, third): (String, Value, Value)| {
            let (description, callback) = split_register_args(second, third)?;
            let vm = runtime::current_vm(lua)?;
            staging::submit(
                &host,
                &vm,
                Staged::Hook {
                    name: name.clone(),
                    description,
                },
            )?;

            if let Some(callback) = callback {
                let function = lua.create_registry_value(callback)?;
                staging::submit(&host, &vm, Staged::Callback { hook: name, function })?;
            }
            Ok(true)
        })
        .map_err(|e| anyhow!("Failed to create hook.register function: {e}"))?;
    hook.set("register", register_fn)
        .map_err(|e| anyhow!("Failed to set hook.register: {e}"))?;

    // hook.add_script(hook_name, {name, source, ...}) -> true
    let host = Arc::clone(api);
    let add_script_fn = lua
        .create_function(move |lua, (hook_name, fields): (String, Table)| {
            let script = script_from_table(&fields)?;
            let vm = runtime::current_vm(lua)?;
            staging::submit(
                &host,
                &vm,
                Staged::Script {
                    hook: hook_name,
                    script,
                },
            )?;
            Ok(true)
        })
        .map_err(|e| anyhow!("Failed to create hook.add_script function: {e}"))?;
    hook.set("add_script", add_script_fn)
        .map_err(|e| anyhow!("Failed to set hook.add_script: {e}"))?;

    // hook.list() -> {name, ...}
    let host = Arc::clone(api);
    let list_fn = lua
        .create_function(move |lua, ()| {
            let vm = runtime::current_vm(lua)?;
            Ok(staging::hook_names(&host, &vm))
        })
        .map_err(|e| anyhow!("Failed to create hook.list function: {e}"))?;
    hook.set("list", list_fn)
        .map_err(|e| anyhow!("Failed to set hook.list: {e}"))?;

    Ok(hook)
}

/// The description and the callback are both optional and positional.
fn split_register_args(second: Value, third: Value) -> mlua::Result<(String, Option<Function>)> {
    match (second, third) {
        (Value::Nil, Value::Nil) => Ok((String::new(), None)),
        (Value::Function(f), Value::Nil) | (Value::Nil, Value::Function(f)) => Ok((String::new(), Some(f))),
        (Value::String(s), Value::Nil) => Ok((s.to_string_lossy(), None)),
        (Value::String(s), Value::Function(f)) => Ok((s.to_string_lossy(), Some(f))),
        (second, third) => Err(mlua::Error::runtime(format!(
            "hook.register expects (name [, description] [, callback]), got {} and {}",
            second.type_name(),
            third.type_name()
        ))),
    }
}

fn script_from_table(fields: &Table) -> mlua::Result<Script> {
    let name: Option<String> = fields.get("name")?;
    let source: Option<String> = fields.get("source")?;
    let priority: Option<i64> = fields.get("priority")?;

    let mut script = Script::new(name.unwrap_or_default(), source.unwrap_or_default());
    script.enabled = fields.get::<Option<bool>>("enabled")?.unwrap_or(true);
    script.priority = priority
        .map(|p| i32::try_from(p).map_err(|_| mlua::Error::runtime(format!("priority {p} is out of range"))))
        .transpose()?
        .unwrap_or(0);
    script.description = fields.get::<Option<String>>("description")?.unwrap_or_default();
    script.version = fields.get::<Option<String>>("version")?.unwrap_or_default();
    script.author = fields.get::<Option<String>>("author")?.unwrap_or_default();
    script.critical = fields.get::<Option<bool>>("critical")?.unwrap_or(false);
    Ok(script)
}
