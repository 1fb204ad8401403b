//! The `ctx` table handed to `execute(ctx)` and hook callbacks.
//!
//! # Usage in Lua
//!
//! ```lua
//! function execute(ctx)
//!     local email = ctx.get("email")
//!     ctx.set("processed_email", string.lower(email))
//!     if ctx.user and ctx.user.tenant_id == "" then
//!         ctx.stop("no tenant")
//!     end
//!     return true
//! end
//! ```
//!
//! Both `ctx.get("k")` and `ctx:get("k")` work. Writes go straight to the
//! shared [`ExecutionContext`], so later scripts of the same dispatch see
//! them.

use std::sync::Arc;

use mlua::{Lua, MultiValue, Table, Value as LuaValue};

use crate::context::ExecutionContext;

use super::marshal;

/// Drop the receiver when a function is called with `:` syntax.
fn args_of(args: MultiValue) -> Vec<LuaValue> {
    let mut args: Vec<LuaValue> = args.into_iter().collect();
    if matches!(args.first(), Some(LuaValue::Table(_))) {
        args.remove(0);
    }
    args
}

fn key_arg(args: &[LuaValue], func: &str) -> mlua::Result<String> {
    match args.first() {
        Some(LuaValue::String(s)) => Ok(s.to_string_lossy()),
        Some(LuaValue::Integer(i)) => Ok(i.to_string()),
        _ => Err(mlua::Error::runtime(format!("ctx.{func}: key must be a string"))),
    }
}

/// Build a `ctx` table bound to `ctx`.
pub(crate) fn build(lua: &Lua, ctx: &Arc<ExecutionContext>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    table.raw_set("id", ctx.id().to_string())?;
    table.raw_set("hook", ctx.hook_name())?;

    if let Some(user) = ctx.user() {
        let value = serde_json::to_value(user).map_err(mlua::Error::external)?;
        table.raw_set("user", marshal::to_lua(lua, &value)?)?;
    }
    if let Some(request) = ctx.request() {
        let value = serde_json::to_value(request).map_err(mlua::Error::external)?;
        table.raw_set("request", marshal::to_lua(lua, &value)?)?;
    }

    // ctx.get(key) -> value | nil
    let c = Arc::clone(ctx);
    table.raw_set(
        "get",
        lua.create_function(move |lua, args: MultiValue| {
            let key = key_arg(&args_of(args), "get")?;
            match c.get(&key) {
                Some(value) => marshal::to_lua(lua, &value),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    // ctx.set(key, value)
    let c = Arc::clone(ctx);
    table.raw_set(
        "set",
        lua.create_function(move |_, args: MultiValue| {
            let args = args_of(args);
            let key = key_arg(&args, "set")?;
            let value = args.get(1).map_or(serde_json::Value::Null, marshal::from_lua);
            c.set(key, value);
            Ok(())
        })?,
    )?;

    // ctx.has(key) -> bool
    let c = Arc::clone(ctx);
    table.raw_set(
        "has",
        lua.create_function(move |_, args: MultiValue| {
            let key = key_arg(&args_of(args), "has")?;
            Ok(c.has(&key))
        })?,
    )?;

    // ctx.delete(key) -> previous value | nil
    let c = Arc::clone(ctx);
    table.raw_set(
        "delete",
        lua.create_function(move |lua, args: MultiValue| {
            let key = key_arg(&args_of(args), "delete")?;
            match c.delete(&key) {
                Some(value) => marshal::to_lua(lua, &value),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    // ctx.stop(reason)
    let c = Arc::clone(ctx);
    table.raw_set(
        "stop",
        lua.create_function(move |_, args: MultiValue| {
            let reason = args_of(args)
                .first()
                .map_or_else(|| "stopped".to_string(), marshal::display);
            log::debug!("Context {} stopped: {}", c.id(), reason);
            c.stop(reason);
            Ok(())
        })?,
    )?;

    // ctx.elapsed_ms() -> integer
    let c = Arc::clone(ctx);
    table.raw_set(
        "elapsed_ms",
        lua.create_function(move |_, _: MultiValue| {
            Ok(i64::try_from(c.duration().as_millis()).unwrap_or(i64::MAX))
        })?,
    )?;

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserInfo;
    use serde_json::json;

    fn bind(lua: &Lua, ctx: &Arc<ExecutionContext>) {
        let table = build(lua, ctx).expect("Should build ctx table");
        lua.globals().set("ctx", table).unwrap();
    }

    #[test]
    fn test_get_set_roundtrip() {
        let lua = Lua::new();
        let ctx = Arc::new(ExecutionContext::new("h"));
        ctx.set("email", "USER@EXAMPLE.COM");
        bind(&lua, &ctx);

        lua.load(
            r#"
            ctx.set("processed_email", string.lower(ctx.get("email")))
            ctx:set("tags", {"a", "b"})
            ctx.set("nested", {count = 2})
        "#,
        )
        .exec()
        .unwrap();

        assert_eq!(ctx.get("processed_email"), Some(json!("user@example.com")));
        assert_eq!(ctx.get("tags"), Some(json!(["a", "b"])));
        assert_eq!(ctx.get("nested"), Some(json!({"count": 2})));
    }

    #[test]
    fn test_has_delete_and_missing() {
        let lua = Lua::new();
        let ctx = Arc::new(ExecutionContext::new("h"));
        ctx.set("k", 1);
        bind(&lua, &ctx);

        let ok: bool = lua
            .load(
                r#"
                assert(ctx.has("k"))
                assert(ctx.get("missing") == nil)
                assert(ctx.delete("k") == 1)
                return not ctx:has("k")
            "#,
            )
            .eval()
            .unwrap();
        assert!(ok);
        assert!(!ctx.has("k"));
    }

    #[test]
    fn test_stop_sets_flag() {
        let lua = Lua::new();
        let ctx = Arc::new(ExecutionContext::new("h"));
        bind(&lua, &ctx);

        lua.load(r#"ctx.stop("blocked")"#).exec().unwrap();
        assert!(ctx.is_stopped());
        assert_eq!(ctx.stop_reason().as_deref(), Some("blocked"));
    }

    #[test]
    fn test_metadata_fields() {
        let lua = Lua::new();
        let ctx = Arc::new(ExecutionContext::new("user.created").with_user(UserInfo {
            id: "u1".into(),
            username: "ada".into(),
            ..UserInfo::default()
        }));
        bind(&lua, &ctx);

        let (hook, username, id, has_request): (String, String, String, bool) = lua
            .load("return ctx.hook, ctx.user.username, ctx.id, ctx.request ~= nil")
            .eval()
            .unwrap();
        assert_eq!(hook, "user.created");
        assert_eq!(username, "ada");
        assert_eq!(id, ctx.id().to_string());
        assert!(!has_request);
    }

    #[test]
    fn test_non_string_key_rejected() {
        let lua = Lua::new();
        let ctx = Arc::new(ExecutionContext::new("h"));
        bind(&lua, &ctx);

        let err = lua.load("ctx.get(true)").exec().unwrap_err();
        assert!(err.to_string().contains("key must be a string"));
    }
}
