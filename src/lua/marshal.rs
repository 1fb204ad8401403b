//! Conversion between host values (`serde_json::Value`) and Lua values.
//!
//! # Mapping
//!
//! | Host | Lua |
//! |------|-----|
//! | `Null` | `nil` |
//! | `Bool` | boolean |
//! | `Number` (i64) | integer |
//! | `Number` (f64) | number |
//! | `String` | string |
//! | `Array` | table with keys `1..=n`, tagged with the array metatable |
//! | `Object` | table with string keys |
//!
//! Going back, a table whose keys are exactly `1..=n` becomes an array and
//! anything else becomes an object (non-string keys are stringified). A
//! table carrying the array metatable (every host array, and anything passed
//! through `json.array`) stays an array even when empty or when it holds
//! `nil` gaps; gaps come back as `null`. An untagged empty table becomes an
//! empty object, and an untagged table with gaps becomes an object keyed by
//! the stringified indices.
//!
//! Functions, userdata, and threads become `Null`. Conversion to the host
//! never fails: structural problems (cycles, NaN, unsupported keys, nesting
//! deeper than [`MAX_DEPTH`]) degrade to a default and a debug log.

use std::collections::HashSet;

use mlua::{Lua, Table, Value as LuaValue};
use serde_json::{Map, Number, Value};

/// Placeholder emitted when a table contains itself.
pub const CYCLE_SENTINEL: &str = "<cycle>";

/// Deepest table nesting converted in either direction.
pub const MAX_DEPTH: usize = 128;

/// `__name` of the metatable that tags a table as an array.
const ARRAY_MARKER: &str = "luahook.array";

/// Registry slot holding the per-interpreter array metatable.
const ARRAY_MT_KEY: &str = "luahook.array_mt";

/// The array metatable for `lua`, created on first use.
pub(crate) fn array_metatable(lua: &Lua) -> mlua::Result<Table> {
    if let Some(mt) = lua.named_registry_value::<Option<Table>>(ARRAY_MT_KEY)? {
        return Ok(mt);
    }
    let mt = lua.create_table()?;
    mt.raw_set("__name", ARRAY_MARKER)?;
    // scripts cannot swap or edit it through getmetatable/setmetatable
    mt.raw_set("__metatable", ARRAY_MARKER)?;
    lua.set_named_registry_value(ARRAY_MT_KEY, mt.clone())?;
    Ok(mt)
}

/// Tag `table` so it converts to a host array.
pub(crate) fn mark_array(lua: &Lua, table: &Table) -> mlua::Result<()> {
    table.set_metatable(Some(array_metatable(lua)?));
    Ok(())
}

fn is_marked_array(table: &Table) -> bool {
    table
        .metatable()
        .and_then(|mt| mt.raw_get::<Option<String>>("__name").ok().flatten())
        .is_some_and(|name| name == ARRAY_MARKER)
}

/// Convert a host value into a Lua value.
///
/// Fails for unsigned integers above `i64::MAX`, which Lua cannot represent
/// exactly, for nesting deeper than [`MAX_DEPTH`], or when the interpreter
/// cannot allocate.
pub fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    build(lua, value, 0)
}

fn build(lua: &Lua, value: &Value, depth: usize) -> mlua::Result<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else if n.is_u64() {
                Err(mlua::Error::runtime(format!(
                    "integer {n} is out of range for a Lua integer"
                )))
            } else {
                Ok(n.as_f64().map_or(LuaValue::Nil, LuaValue::Number))
            }
        }
        Value::String(s) => lua.create_string(s).map(LuaValue::String),
        Value::Array(_) | Value::Object(_) if depth >= MAX_DEPTH => Err(mlua::Error::runtime(
            format!("value nests deeper than {MAX_DEPTH} levels"),
        )),
        Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, build(lua, item, depth + 1)?)?;
            }
            mark_array(lua, &table)?;
            Ok(LuaValue::Table(table))
        }
        Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, val) in map {
                table.raw_set(key.as_str(), build(lua, val, depth + 1)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value into a host value. Never fails.
#[must_use]
pub fn from_lua(value: &LuaValue) -> Value {
    let mut visiting = HashSet::new();
    convert(value, &mut visiting, 0)
}

fn convert(value: &LuaValue, visiting: &mut HashSet<usize>, depth: usize) -> Value {
    match value {
        LuaValue::Nil => Value::Null,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::from(*i),
        LuaValue::Number(n) => Number::from_f64(*n).map_or_else(
            || {
                log::debug!("Dropping non-finite Lua number {} (converted to null)", n);
                Value::Null
            },
            Value::Number,
        ),
        LuaValue::String(s) => Value::String(match s.to_str() {
            Ok(text) => text.to_string(),
            Err(_) => s.to_string_lossy(),
        }),
        LuaValue::Table(_) if depth >= MAX_DEPTH => {
            log::debug!("Lua table nests deeper than {} levels (converted to null)", MAX_DEPTH);
            Value::Null
        }
        LuaValue::Table(table) => convert_table(table, visiting, depth),
        LuaValue::Error(err) => Value::String(err.to_string()),
        other => {
            log::debug!("Lua {} has no host representation (converted to null)", other.type_name());
            Value::Null
        }
    }
}

fn convert_table(table: &Table, visiting: &mut HashSet<usize>, depth: usize) -> Value {
    let identity = table.to_pointer() as usize;
    if !visiting.insert(identity) {
        log::debug!("Cycle detected while converting Lua table");
        return Value::String(CYCLE_SENTINEL.to_string());
    }

    let mut entries = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        match pair {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                log::debug!("Skipping unreadable table entry: {}", e);
            }
        }
    }

    let array_len = if is_marked_array(table) {
        tagged_len(&entries)
    } else {
        sequence_len(&entries)
    };

    let result = if let Some(len) = array_len {
        let mut items = vec![Value::Null; len];
        for (key, val) in &entries {
            if let LuaValue::Integer(i) = key {
                items[(*i - 1) as usize] = convert(val, visiting, depth + 1);
            }
        }
        Value::Array(items)
    } else {
        let mut map = Map::with_capacity(entries.len());
        for (key, val) in &entries {
            match key_to_string(key) {
                Some(k) => {
                    map.insert(k, convert(val, visiting, depth + 1));
                }
                None => log::debug!("Skipping table key of type {}", key.type_name()),
            }
        }
        Value::Object(map)
    };

    visiting.remove(&identity);
    result
}

/// Keys are exactly the integers `1..=len` (pairs never repeats a key).
fn sequence_len(entries: &[(LuaValue, LuaValue)]) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let len = entries.len() as i64;
    entries
        .iter()
        .all(|(k, _)| matches!(k, LuaValue::Integer(i) if (1..=len).contains(i)))
        .then_some(entries.len())
}

/// Length of a tagged array: its highest index, as long as every key is a
/// positive integer and the gaps do not outnumber the entries.
fn tagged_len(entries: &[(LuaValue, LuaValue)]) -> Option<usize> {
    let mut max = 0i64;
    for (key, _) in entries {
        match key {
            LuaValue::Integer(i) if *i >= 1 => max = max.max(*i),
            _ => return None,
        }
    }
    let max = usize::try_from(max).ok()?;
    (max <= entries.len().saturating_mul(2).max(1)).then_some(max)
}

fn key_to_string(key: &LuaValue) -> Option<String> {
    match key {
        LuaValue::String(s) => Some(s.to_string_lossy()),
        LuaValue::Integer(i) => Some(i.to_string()),
        LuaValue::Number(n) => Some(n.to_string()),
        LuaValue::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Render a Lua value for log lines: strings verbatim, everything else as JSON.
#[must_use]
pub fn display(value: &LuaValue) -> String {
    match from_lua(value) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(lua: &Lua, value: &Value) -> Value {
        from_lua(&to_lua(lua, value).unwrap())
    }

    #[test]
    fn test_scalars_roundtrip() {
        let lua = Lua::new();
        for value in [
            json!(null),
            json!(true),
            json!(false),
            json!(42),
            json!(-7),
            json!(2.5),
            json!("hello"),
            json!(""),
        ] {
            assert_eq!(roundtrip(&lua, &value), value);
        }
    }

    #[test]
    fn test_sequence_and_map_roundtrip() {
        let lua = Lua::new();
        let seq = json!([1, "two", 3.5, true]);
        assert_eq!(roundtrip(&lua, &seq), seq);

        let map = json!({"a": 1, "b": "x", "c": false});
        assert_eq!(roundtrip(&lua, &map), map);
    }

    #[test]
    fn test_nested_roundtrip() {
        let lua = Lua::new();
        let nested = json!({
            "level1": {
                "level2": {
                    "ids": [1, 2, 3],
                    "more": [4, 5]
                },
                "other": [6]
            }
        });
        assert_eq!(roundtrip(&lua, &nested), nested);
    }

    #[test]
    fn test_u64_out_of_range_fails() {
        let lua = Lua::new();
        let err = to_lua(&lua, &json!(u64::MAX)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(to_lua(&lua, &json!(i64::MAX as u64)).is_ok());
    }

    #[test]
    fn test_untagged_sparse_table_becomes_map() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return {[1] = 'a', [3] = 'c'}").eval().unwrap();
        assert_eq!(from_lua(&value), json!({"1": "a", "3": "c"}));
    }

    #[test]
    fn test_mixed_keys_become_map() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return {10, 20, name = 'x'}").eval().unwrap();
        assert_eq!(from_lua(&value), json!({"1": 10, "2": 20, "name": "x"}));
    }

    #[test]
    fn test_untagged_empty_table_is_empty_object() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return {}").eval().unwrap();
        assert_eq!(from_lua(&value), json!({}));
    }

    #[test]
    fn test_host_arrays_keep_their_shape() {
        let lua = Lua::new();
        let value = json!({"tags": [], "slots": [1, null, 3], "pairs": [[], [null]]});
        assert_eq!(roundtrip(&lua, &value), value);
    }

    #[test]
    fn test_tagged_table_stays_array_after_script_edits() {
        let lua = Lua::new();
        let arr = to_lua(&lua, &json!(["a", "b", "c"])).unwrap();
        lua.globals().set("arr", arr).unwrap();
        let value: LuaValue = lua
            .load("arr[2] = nil; arr[5] = 'e'; return arr")
            .eval()
            .unwrap();
        assert_eq!(from_lua(&value), json!(["a", null, "c", null, "e"]));

        let emptied: LuaValue = lua
            .load("for i = 1, 5 do arr[i] = nil end; return arr")
            .eval()
            .unwrap();
        assert_eq!(from_lua(&emptied), json!([]));
    }

    #[test]
    fn test_array_metatable_is_protected() {
        let lua = Lua::new();
        lua.globals().set("arr", to_lua(&lua, &json!([1])).unwrap()).unwrap();
        let (mt, swapped): (String, bool) = lua
            .load("return getmetatable(arr), pcall(setmetatable, arr, nil)")
            .eval()
            .unwrap();
        assert_eq!(mt, "luahook.array");
        assert!(!swapped);
    }

    #[test]
    fn test_deep_nesting_is_capped() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load("local t = {} for i = 1, 10000 do t = {t} end return t")
            .eval()
            .unwrap();
        let mut node = &from_lua(&value);
        let mut depth = 0;
        while let Some(inner) = node.get(0) {
            node = inner;
            depth += 1;
        }
        assert_eq!(depth, MAX_DEPTH);
        assert_eq!(*node, Value::Null);
    }

    #[test]
    fn test_deep_host_value_is_rejected() {
        let lua = Lua::new();
        let mut value = json!(1);
        for _ in 0..10_000 {
            value = json!([value]);
        }
        let err = to_lua(&lua, &value).unwrap_err();
        assert!(err.to_string().contains("deeper than"), "{err}");
        // drop iteratively so the test itself does not overflow
        let mut stack = vec![value];
        while let Some(v) = stack.pop() {
            if let Value::Array(items) = v {
                stack.extend(items);
            }
        }
    }

    #[test]
    fn test_functions_become_null() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return {f = function() end, n = 1}").eval().unwrap();
        assert_eq!(from_lua(&value), json!({"f": null, "n": 1}));
    }

    #[test]
    fn test_nan_becomes_null() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return 0/0").eval().unwrap();
        assert_eq!(from_lua(&value), Value::Null);
    }

    #[test]
    fn test_cycle_yields_sentinel() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load("local t = {name = 'root'}; t.self = t; return t")
            .eval()
            .unwrap();
        assert_eq!(from_lua(&value), json!({"name": "root", "self": CYCLE_SENTINEL}));
    }

    #[test]
    fn test_shared_subtable_is_not_a_cycle() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load("local s = {1, 2}; return {a = s, b = s}")
            .eval()
            .unwrap();
        assert_eq!(from_lua(&value), json!({"a": [1, 2], "b": [1, 2]}));
    }

    #[test]
    fn test_display() {
        let lua = Lua::new();
        let s = LuaValue::String(lua.create_string("plain").unwrap());
        assert_eq!(display(&s), "plain");
        assert_eq!(display(&LuaValue::Integer(3)), "3");
        assert_eq!(display(&LuaValue::Nil), "null");
    }
}
