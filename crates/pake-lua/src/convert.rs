//! Conversions between Lua values and the engine's JSON result values.
//!
//! Tables with sequential integer keys become JSON arrays; other tables
//! become string-keyed objects. Functions, userdata, and threads have no
//! JSON representation and fail the conversion.

use mlua::prelude::*;
use serde_json::Value;

use pake_core::DepResults;

/// Metatable `__type` marker for the `pake.absent` sentinel.
pub const ABSENT_TYPE: &str = "Absent";

/// Whether a recipe returned the `pake.absent` marker.
pub fn is_absent_marker(value: &LuaValue) -> bool {
  let LuaValue::Table(table) = value else {
    return false;
  };
  let Some(mt) = table.metatable() else {
    return false;
  };
  matches!(mt.get::<String>("__type"), Ok(tag) if tag == ABSENT_TYPE)
}

/// Convert a Lua value to JSON. Errors carry a human-readable description of
/// what could not be represented.
pub fn lua_to_json(value: &LuaValue) -> Result<Value, String> {
  match value {
    LuaValue::Nil => Ok(Value::Null),
    LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
    LuaValue::Integer(i) => Ok(Value::from(*i)),
    LuaValue::Number(n) => serde_json::Number::from_f64(*n)
      .map(Value::Number)
      .ok_or_else(|| format!("number {n} has no JSON representation")),
    LuaValue::String(s) => Ok(Value::String(
      s.to_str().map_err(|e| e.to_string())?.to_string(),
    )),
    LuaValue::Table(table) => {
      let len = table.raw_len();
      if len > 0 {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
          let item: LuaValue = table.get(i).map_err(|e| e.to_string())?;
          items.push(lua_to_json(&item)?);
        }
        Ok(Value::Array(items))
      } else {
        let mut map = serde_json::Map::new();
        for pair in table.clone().pairs::<LuaValue, LuaValue>() {
          let (key, item) = pair.map_err(|e| e.to_string())?;
          let key = match key {
            LuaValue::String(s) => s.to_str().map_err(|e| e.to_string())?.to_string(),
            other => return Err(format!("table key must be a string, got {}", other.type_name())),
          };
          map.insert(key, lua_to_json(&item)?);
        }
        Ok(Value::Object(map))
      }
    }
    other => Err(format!("{} has no JSON representation", other.type_name())),
  }
}

/// Convert a JSON value back into Lua. Integers that fit stay integers.
pub fn json_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
  match value {
    Value::Null => Ok(LuaValue::Nil),
    Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => Ok(LuaValue::Integer(i)),
      None => Ok(LuaValue::Number(n.as_f64().unwrap_or(f64::NAN))),
    },
    Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
    Value::Array(items) => {
      let table = lua.create_table()?;
      for (i, item) in items.iter().enumerate() {
        table.set(i + 1, json_to_lua(lua, item)?)?;
      }
      Ok(LuaValue::Table(table))
    }
    Value::Object(map) => {
      let table = lua.create_table()?;
      for (key, item) in map {
        table.set(key.as_str(), json_to_lua(lua, item)?)?;
      }
      Ok(LuaValue::Table(table))
    }
  }
}

/// Dependency results as recipes see them: one table readable both by index
/// (declaration order) and by dep name. File digests arrive as hex strings.
pub fn dep_results_to_lua(lua: &Lua, deps: &DepResults) -> LuaResult<LuaTable> {
  let table = lua.create_table()?;
  for (index, (name, outcome)) in deps.iter().enumerate() {
    let value = json_to_lua(lua, &outcome.to_json())?;
    table.set(index + 1, value.clone())?;
    table.set(name, value)?;
  }
  Ok(table)
}
