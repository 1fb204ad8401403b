//! `json` module: text <-> Lua values through the engine's marshaller.
//!
//! ```lua
//! local body, err = json.encode({ order = ctx.get("order_id"), items = 3 })
//! local order, err = json.decode(body)
//! log.debug(json.encode_pretty(order))
//! ```
//!
//! Every function returns `value, nil` on success and `nil, message` on
//! failure instead of raising, except `json.array`, which tags a table (or
//! a fresh one) so it encodes as a JSON array even when empty or holding
//! `nil` gaps. JSON `null` decodes to `nil`, decoded arrays keep their
//! shape, and an untagged empty table encodes as `{}` (see
//! [`marshal`](crate::lua::marshal)).

use anyhow::{anyhow, Result};
use mlua::{IntoLuaMulti, Lua, Table, Value};

use crate::lua::marshal;

/// `(value, nil)` or `(nil, message)`.
fn outcome<T, E: std::fmt::Display>(result: std::result::Result<T, E>, what: &str) -> (Option<T>, Option<String>) {
    match result {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(format!("{what}: {e}"))),
    }
}

fn bind<F, R>(lua: &Lua, table: &Table, name: &str, f: F) -> Result<()>
where
    F: Fn(&Lua, Value) -> mlua::Result<R> + mlua::MaybeSend + 'static,
    R: IntoLuaMulti,
{
    let function = lua
        .create_function(f)
        .map_err(|e| anyhow!("Failed to create json.{name}: {e}"))?;
    table
        .set(name, function)
        .map_err(|e| anyhow!("Failed to set json.{name}: {e}"))
}

/// Build the `json` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua) -> Result<Table> {
    let json = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create json table: {e}"))?;

    bind(lua, &json, "encode", |_, value| {
        Ok(outcome(serde_json::to_string(&marshal::from_lua(&value)), "json.encode"))
    })?;

    bind(lua, &json, "encode_pretty", |_, value| {
        Ok(outcome(
            serde_json::to_string_pretty(&marshal::from_lua(&value)),
            "json.encode_pretty",
        ))
    })?;

    bind(lua, &json, "decode", |lua, text| {
        let text = match text {
            Value::String(s) => s,
            other => {
                return Ok((None, Some(format!("json.decode: expected a string, got {}", other.type_name()))));
            }
        };
        let parsed = match serde_json::from_slice::<serde_json::Value>(&text.as_bytes()) {
            Ok(parsed) => parsed,
            Err(e) => return Ok((None, Some(format!("json.decode: {e}")))),
        };
        Ok(outcome(marshal::to_lua(lua, &parsed), "json.decode"))
    })?;

    let array = lua
        .create_function(|lua, table: Option<Table>| {
            let table = match table {
                Some(table) => table,
                None => lua.create_table()?,
            };
            marshal::mark_array(lua, &table)?;
            Ok(table)
        })
        .map_err(|e| anyhow!("Failed to create json.array: {e}"))?;
    json.set("array", array)
        .map_err(|e| anyhow!("Failed to set json.array: {e}"))?;

    Ok(json)
}
