//! Logging module for Lua scripts.
//!
//! Exposes Rust's `log` crate to scripts. Bound globally as `log`.
//!
//! # Usage in Lua
//!
//! ```lua
//! log.info("user created")
//! log.warn("quota low", "tenant", ctx.get("tenant"), "left", 3)
//! log.error("lookup failed", { key = "user:1", attempt = 2 })
//! ```
//!
//! Extra arguments are rendered as `key=value` pairs, either as
//! alternating key/value arguments or as a single table. When the script
//! is serving a hook dispatch the line is prefixed with the context id.
//! `fatal` logs at error level and does not stop the script.

use anyhow::{anyhow, Result};
use log::Level;
use mlua::{Lua, Table, Value, Variadic};

use crate::lua::marshal;
use crate::lua::runtime::CTX_ID_GLOBAL;

/// Build the `logger` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua) -> Result<Table> {
    let logger = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create logger table: {e}"))?;

    let levels = [
        ("debug", Level::Debug, ""),
        ("info", Level::Info, ""),
        ("warn", Level::Warn, ""),
        ("error", Level::Error, ""),
        ("fatal", Level::Error, "FATAL "),
    ];

    for (name, level, marker) in levels {
        // log.<level>(msg, ...)
        let func = lua
            .create_function(move |lua, (msg, fields): (Value, Variadic<Value>)| {
                let line = render(lua, &msg, &fields);
                log::log!(target: "lua", level, "{}{}", marker, line);
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log.{name} function: {e}"))?;
        logger
            .set(name, func)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    Ok(logger)
}

fn render(lua: &Lua, msg: &Value, fields: &[Value]) -> String {
    let mut line = String::new();
    if let Ok(Some(ctx_id)) = lua.globals().raw_get::<Option<String>>(CTX_ID_GLOBAL) {
        line.push_str(&format!("[ctx={ctx_id}] "));
    }
    line.push_str(&marshal::display(msg));

    for (key, value) in pairs(fields) {
        line.push(' ');
        line.push_str(&key);
        line.push('=');
        line.push_str(&value);
    }
    line
}

fn pairs(fields: &[Value]) -> Vec<(String, String)> {
    if let [table @ Value::Table(_)] = fields {
        return match marshal::from_lua(table) {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect(),
            other => vec![("fields".to_string(), other.to_string())],
        };
    }

    fields
        .chunks(2)
        .map(|chunk| match chunk {
            [key, value] => (marshal::display(key), marshal::display(value)),
            [extra] => ("extra".to_string(), marshal::display(extra)),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}
