//! The global `pake` table bound into the build script.
//!
//! Registration functions take a single spec table, in the style of
//! `pake.target{ path = ..., deps = {...}, recipe = function(...) end }`,
//! and return a rule ref (a metatable-tagged table) usable with
//! `pake.default`. Lua recipe functions are wrapped into the engine's boxed
//! callbacks; they run later, during `build`, when the engine decides a
//! target is out of date.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::prelude::*;

use pake_core::{
  BuildError, Engine, FileRecipe, PatternRecipe, RecipeError, VirtualOutput, VirtualRecipe,
};

use crate::convert;
use crate::helpers;

/// Metatable `__type` marker for rule refs returned by registration.
pub const RULE_REF_TYPE: &str = "RuleRef";

/// Register the global `pake` table.
pub fn register_pake(lua: &Lua, engine: Rc<RefCell<Engine>>) -> LuaResult<()> {
  let pake = lua.create_table()?;

  let (root, unique_token) = {
    let engine = engine.borrow();
    (engine.root().to_path_buf(), engine.unique())
  };

  pake.set("root", root.to_string_lossy().to_string())?;

  // pake.unique() - a sentinel distinct from every other invocation's.
  let unique = lua.create_function(move |lua, ()| convert::json_to_lua(lua, &unique_token))?;
  pake.set("unique", unique)?;

  // pake.absent - returned from a virtual recipe to record no comparable
  // result, keeping the target's dependents permanently dirty.
  let absent = lua.create_table()?;
  let mt = lua.create_table()?;
  mt.set("__type", convert::ABSENT_TYPE)?;
  absent.set_metatable(Some(mt));
  pake.set("absent", absent)?;

  register_target(lua, &pake, Rc::clone(&engine))?;
  register_pattern(lua, &pake, Rc::clone(&engine))?;
  register_virtual(lua, &pake, Rc::clone(&engine), "virtual")?;
  register_virtual(lua, &pake, Rc::clone(&engine), "always")?;
  register_alias(lua, &pake, Rc::clone(&engine))?;
  register_group(lua, &pake, Rc::clone(&engine))?;
  register_default(lua, &pake, engine)?;
  helpers::register_helpers(lua, &pake, &root)?;

  lua.globals().set("pake", pake)?;
  Ok(())
}

/// Mutate the engine's registry, translating a mid-build borrow into the
/// frozen-registry error a recipe would otherwise provoke.
fn with_engine<T>(
  engine: &Rc<RefCell<Engine>>,
  f: impl FnOnce(&mut Engine) -> Result<T, BuildError>,
) -> LuaResult<T> {
  let mut engine = engine
    .try_borrow_mut()
    .map_err(|_| LuaError::external(BuildError::RegistryFrozen))?;
  f(&mut engine).map_err(LuaError::external)
}

fn rule_ref(lua: &Lua, kind: &str, target: &str) -> LuaResult<LuaTable> {
  let table = lua.create_table()?;
  table.set("kind", kind)?;
  table.set("target", target)?;
  let mt = lua.create_table()?;
  mt.set("__type", RULE_REF_TYPE)?;
  table.set_metatable(Some(mt));
  Ok(table)
}

fn spec_field<T: FromLua>(spec: &LuaTable, key: &str, what: &str) -> LuaResult<T> {
  spec
    .get(key)
    .map_err(|_| LuaError::external(format!("{what} spec requires a {key:?} field")))
}

/// Dep lists flatten nested string arrays, so helper results like
/// `pake.match_files(...)` can be spliced in next to plain names.
fn parse_deps(spec: &LuaTable) -> LuaResult<Vec<String>> {
  match spec.get::<Option<LuaTable>>("deps")? {
    Some(table) => flatten_deps(&table),
    None => Ok(Vec::new()),
  }
}

fn flatten_deps(table: &LuaTable) -> LuaResult<Vec<String>> {
  let mut deps = Vec::new();
  for value in table.clone().sequence_values::<LuaValue>() {
    match value? {
      LuaValue::String(s) => deps.push(s.to_str()?.to_string()),
      LuaValue::Table(nested) => deps.extend(flatten_deps(&nested)?),
      other => {
        return Err(LuaError::external(format!(
          "dependency must be a string, got {}",
          other.type_name()
        )));
      }
    }
  }
  Ok(deps)
}

fn render_recipe_error(err: &LuaError) -> RecipeError {
  RecipeError(err.to_string())
}

fn register_target(lua: &Lua, pake: &LuaTable, engine: Rc<RefCell<Engine>>) -> LuaResult<()> {
  let target = lua.create_function(move |lua, spec: LuaTable| {
    let path: String = spec_field(&spec, "path", "target")?;
    let deps = parse_deps(&spec)?;
    let recipe_fn: LuaFunction = spec_field(&spec, "recipe", "target")?;

    let lua_handle = lua.clone();
    let recipe: FileRecipe = Box::new(move |target, deps| {
      let deps = convert::dep_results_to_lua(&lua_handle, deps).map_err(|e| render_recipe_error(&e))?;
      recipe_fn
        .call::<()>((target, deps))
        .map_err(|e| render_recipe_error(&e))
    });

    with_engine(&engine, |engine| engine.register_exact(&path, deps, recipe))?;
    rule_ref(lua, "target", &path)
  })?;
  pake.set("target", target)?;
  Ok(())
}

fn register_pattern(lua: &Lua, pake: &LuaTable, engine: Rc<RefCell<Engine>>) -> LuaResult<()> {
  let pattern = lua.create_function(move |lua, spec: LuaTable| {
    let source: String = spec_field(&spec, "match", "pattern")?;
    let deps = parse_deps(&spec)?;
    let recipe_fn: LuaFunction = spec_field(&spec, "recipe", "pattern")?;

    let lua_handle = lua.clone();
    let recipe: PatternRecipe = Box::new(move |target, deps, found| {
      let deps = convert::dep_results_to_lua(&lua_handle, deps).map_err(|e| render_recipe_error(&e))?;
      let captures = lua_handle.create_table().map_err(|e| render_recipe_error(&e))?;
      for index in 0..found.group_count() {
        if let Some(text) = found.group(index) {
          captures.set(index, text).map_err(|e| render_recipe_error(&e))?;
        }
      }
      recipe_fn
        .call::<()>((target, deps, captures))
        .map_err(|e| render_recipe_error(&e))
    });

    with_engine(&engine, |engine| engine.register_pattern(&source, deps, recipe))?;
    rule_ref(lua, "pattern", &source)
  })?;
  pake.set("pattern", pattern)?;
  Ok(())
}

/// `pake.virtual{}` and `pake.always{}` share a body; the latter prepends
/// the built-in `always` target to the rule's deps.
fn register_virtual(
  lua: &Lua,
  pake: &LuaTable,
  engine: Rc<RefCell<Engine>>,
  key: &'static str,
) -> LuaResult<()> {
  let register = lua.create_function(move |lua, spec: LuaTable| {
    let name: String = spec_field(&spec, "name", key)?;
    let mut deps = parse_deps(&spec)?;
    if key == "always" {
      deps.insert(0, pake_core::ALWAYS.to_string());
    }
    let recipe_fn: LuaFunction = spec_field(&spec, "recipe", key)?;

    let lua_handle = lua.clone();
    let recipe: VirtualRecipe = Box::new(move |deps| {
      let deps = convert::dep_results_to_lua(&lua_handle, deps).map_err(|e| render_recipe_error(&e))?;
      let value: LuaValue = recipe_fn.call(deps).map_err(|e| render_recipe_error(&e))?;
      if convert::is_absent_marker(&value) {
        return Ok(VirtualOutput::Absent);
      }
      let json = convert::lua_to_json(&value).map_err(pake_core::VirtualFailure::InvalidResult)?;
      Ok(VirtualOutput::Value(json))
    });

    with_engine(&engine, |engine| engine.register_virtual(&name, deps, recipe))?;
    rule_ref(lua, "virtual", &name)
  })?;
  pake.set(key, register)?;
  Ok(())
}

fn register_alias(lua: &Lua, pake: &LuaTable, engine: Rc<RefCell<Engine>>) -> LuaResult<()> {
  let alias = lua.create_function(move |lua, (name, target): (String, String)| {
    with_engine(&engine, |engine| engine.alias(&name, &target))?;
    rule_ref(lua, "virtual", &name)
  })?;
  pake.set("alias", alias)?;
  Ok(())
}

fn register_group(lua: &Lua, pake: &LuaTable, engine: Rc<RefCell<Engine>>) -> LuaResult<()> {
  let group = lua.create_function(move |lua, (name, targets): (String, LuaTable)| {
    let targets = flatten_deps(&targets)?;
    with_engine(&engine, |engine| engine.group(&name, targets))?;
    rule_ref(lua, "virtual", &name)
  })?;
  pake.set("group", group)?;
  Ok(())
}

fn register_default(lua: &Lua, pake: &LuaTable, engine: Rc<RefCell<Engine>>) -> LuaResult<()> {
  let default = lua.create_function(move |_, value: LuaValue| {
    let target = match &value {
      LuaValue::String(s) => s.to_str()?.to_string(),
      LuaValue::Table(table) => {
        let tagged = table
          .metatable()
          .and_then(|mt| mt.get::<String>("__type").ok())
          .is_some_and(|tag| tag == RULE_REF_TYPE);
        if !tagged {
          return Err(LuaError::external("default expects a target name or a rule"));
        }
        let kind: String = table.get("kind")?;
        if kind == "pattern" {
          return Err(LuaError::external("a pattern rule cannot be the default target"));
        }
        table.get::<String>("target")?
      }
      other => {
        return Err(LuaError::external(format!(
          "default expects a target name or a rule, got {}",
          other.type_name()
        )));
      }
    };
    with_engine(&engine, |engine| engine.default_target(&target))
  })?;
  pake.set("default", default)?;
  Ok(())
}
