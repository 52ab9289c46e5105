//! Build script evaluation.
//!
//! The host creates a Lua VM, binds the `pake` global, and executes the
//! `Pakefile` found in the engine root. Evaluation populates the engine's
//! rule registry; building happens afterwards, driven by the caller.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;
use thiserror::Error;
use tracing::debug;

use pake_core::Engine;

use crate::globals;

/// Pakefile names probed in the engine root, in order.
const PAKEFILE_CANDIDATES: &[&str] = &["Pakefile", "Pakefile.lua"];

#[derive(Debug, Error)]
pub enum HostError {
  #[error("could not find a Pakefile, are you in the right directory?")]
  PakefileNotFound,

  #[error("{0}")]
  Lua(#[from] LuaError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Keeps the Lua VM alive for as long as registered recipes may run.
#[derive(Debug)]
pub struct Host {
  _lua: Lua,
}

/// Locate the build script in `root`.
pub fn find_pakefile(root: &Path) -> Result<PathBuf, HostError> {
  for candidate in PAKEFILE_CANDIDATES {
    let path = root.join(candidate);
    if path.exists() {
      return Ok(path);
    }
  }
  Err(HostError::PakefileNotFound)
}

/// Evaluate the build script at `path`, registering its rules with the
/// engine. The returned [`Host`] must outlive the subsequent build.
pub fn evaluate_pakefile(engine: &Rc<RefCell<Engine>>, path: &Path) -> Result<Host, HostError> {
  debug!(path = %path.display(), "evaluating build script");
  let source = fs::read_to_string(path)?;
  evaluate_source(engine, &source, &path.display().to_string())
}

/// Evaluate build script source directly; `chunk_name` labels Lua errors.
pub fn evaluate_source(
  engine: &Rc<RefCell<Engine>>,
  source: &str,
  chunk_name: &str,
) -> Result<Host, HostError> {
  let lua = Lua::new();
  globals::register_pake(&lua, Rc::clone(engine))?;
  lua.load(source).set_name(chunk_name).exec()?;
  Ok(Host { _lua: lua })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn test_engine(dir: &TempDir) -> Rc<RefCell<Engine>> {
    Rc::new(RefCell::new(Engine::new(dir.path()).unwrap()))
  }

  #[test]
  fn minimal_script_registers_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    evaluate_source(&engine, "-- empty Pakefile", "test").unwrap();
  }

  #[test]
  fn target_rule_builds_a_file() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);

    let _host = evaluate_source(
      &engine,
      r#"
        pake.target {
          path = "hello.txt",
          recipe = function(target, deps)
            pake.write("hello.txt", "Hello")
          end,
        }
      "#,
      "test",
    )
    .unwrap();

    let rebuilt = engine.borrow_mut().build(&["hello.txt".into()]).unwrap();
    assert_eq!(rebuilt, 1);
    assert_eq!(
      std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
      "Hello"
    );
  }

  #[test]
  fn pattern_rule_receives_captures() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.c"), "source").unwrap();
    let engine = test_engine(&dir);

    let _host = evaluate_source(
      &engine,
      r#"
        pake.pattern {
          match = [[(.*)\.o]],
          deps = { [[\1.c]] },
          recipe = function(target, deps, captures)
            -- the canonical form keeps its ./ prefix in captures
            pake.write(captures[1] .. ".o", "obj for " .. captures[1])
          end,
        }
      "#,
      "test",
    )
    .unwrap();

    engine.borrow_mut().build(&["a.o".into()]).unwrap();
    assert_eq!(
      std::fs::read_to_string(dir.path().join("a.o")).unwrap(),
      "obj for ./a"
    );
  }

  #[test]
  fn virtual_rules_round_trip_json() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);

    let _host = evaluate_source(
      &engine,
      r#"
        pake.virtual {
          name = "config",
          recipe = function(deps)
            return { flavor = "debug", jobs = 4 }
          end,
        }
        pake.virtual {
          name = "summary",
          deps = { "config" },
          recipe = function(deps)
            return deps.config.flavor .. "/" .. deps.config.jobs
          end,
        }
      "#,
      "test",
    )
    .unwrap();

    engine.borrow_mut().build(&["summary".into()]).unwrap();
    let state: serde_json::Value = serde_json::from_str(
      &std::fs::read_to_string(dir.path().join(".pake-state")).unwrap(),
    )
    .unwrap();
    assert_eq!(state["summary"]["value"], "debug/4");
  }

  #[test]
  fn absent_marker_round_trips_without_self_rebuilding() {
    let dir = TempDir::new().unwrap();

    let script = r#"
      pake.virtual {
        name = "phony",
        recipe = function(deps)
          return pake.absent
        end,
      }
    "#;

    // Recorded on the first run; up to date on the second. Only dependents
    // of phony see its Absent result as dirty.
    for expected in [1, 0] {
      let engine = test_engine(&dir);
      let _host = evaluate_source(&engine, script, "test").unwrap();
      let rebuilt = engine.borrow_mut().build(&["phony".into()]).unwrap();
      assert_eq!(rebuilt, expected);
    }

    let state: serde_json::Value = serde_json::from_str(
      &std::fs::read_to_string(dir.path().join(".pake-state")).unwrap(),
    )
    .unwrap();
    assert_eq!(state["phony"]["kind"], "absent");
  }

  #[test]
  fn always_wrapper_prepends_the_builtin() {
    let dir = TempDir::new().unwrap();

    let script = r#"
      pake.always {
        name = "rev",
        recipe = function(deps)
          return "abc"
        end,
      }
    "#;

    for _ in 0..2 {
      let engine = test_engine(&dir);
      let _host = evaluate_source(&engine, script, "test").unwrap();
      let rebuilt = engine.borrow_mut().build(&["rev".into()]).unwrap();
      assert_eq!(rebuilt, 1);
    }
  }

  #[test]
  fn default_accepts_rule_refs_but_not_patterns() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);

    let _host = evaluate_source(
      &engine,
      r#"
        local rule = pake.target {
          path = "out",
          recipe = function(target, deps) pake.write("out", "o") end,
        }
        pake.default(rule)
      "#,
      "test",
    )
    .unwrap();
    assert_eq!(engine.borrow_mut().build(&[]).unwrap(), 2);

    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);
    let err = evaluate_source(
      &engine,
      r#"
        local rule = pake.pattern {
          match = [[(.*)\.o]],
          recipe = function(target, deps, captures) end,
        }
        pake.default(rule)
      "#,
      "test",
    )
    .unwrap_err();
    assert!(err.to_string().contains("pattern rule cannot be the default"));
  }

  #[test]
  fn nested_dep_lists_are_flattened() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("x.h"), "h1").unwrap();
    std::fs::write(dir.path().join("y.h"), "h2").unwrap();
    std::fs::write(dir.path().join("m.c"), "c").unwrap();
    let engine = test_engine(&dir);

    let _host = evaluate_source(
      &engine,
      r#"
        local headers = pake.match_files([[.*\.h]])
        pake.target {
          path = "m.o",
          deps = { "m.c", headers },
          recipe = function(target, deps)
            pake.write("m.o", "obj " .. deps["m.c"] .. #deps)
          end,
        }
      "#,
      "test",
    )
    .unwrap();

    engine.borrow_mut().build(&["m.o".into()]).unwrap();
    let tree = engine.borrow().dependency_tree("m.o").unwrap();
    let names: Vec<&str> = tree.deps.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["./m.c", "./x.h", "./y.h"]);
  }

  #[test]
  fn registration_fails_after_build() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);

    let _host = evaluate_source(&engine, "-- nothing", "test").unwrap();
    let _ = engine.borrow_mut().build(&["missing".into()]);

    let err = evaluate_source(
      &engine,
      r#"pake.virtual { name = "late", recipe = function(deps) end }"#,
      "test",
    )
    .unwrap_err();
    assert!(err.to_string().contains("registered"));
  }

  #[test]
  fn invalid_virtual_result_is_reported() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir);

    let _host = evaluate_source(
      &engine,
      r#"
        pake.virtual {
          name = "bad",
          recipe = function(deps)
            return function() end
          end,
        }
      "#,
      "test",
    )
    .unwrap();

    let err = engine.borrow_mut().build(&["bad".into()]).unwrap_err();
    assert!(matches!(err, pake_core::BuildError::InvalidResult { .. }));
  }

  #[test]
  fn find_pakefile_prefers_bare_name() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
      find_pakefile(dir.path()),
      Err(HostError::PakefileNotFound)
    ));

    std::fs::write(dir.path().join("Pakefile.lua"), "").unwrap();
    assert_eq!(
      find_pakefile(dir.path()).unwrap(),
      dir.path().join("Pakefile.lua")
    );

    std::fs::write(dir.path().join("Pakefile"), "").unwrap();
    assert_eq!(find_pakefile(dir.path()).unwrap(), dir.path().join("Pakefile"));
  }
}
