//! Command-execution and filesystem helpers exposed to the build script.
//!
//! Recipes do their own process spawning; the engine never shells out. These
//! helpers run synchronously (the engine is single-threaded by design),
//! capture trimmed stdout, and pass stderr through to the terminal.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use mlua::prelude::*;
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

pub fn register_helpers(lua: &Lua, pake: &LuaTable, root: &Path) -> LuaResult<()> {
  let base = root.to_path_buf();
  let cmd = lua.create_function(move |_, (program, args): (String, LuaMultiValue)| {
    let args = collect_args(args)?;
    run_command(&program, &args, &base)
  })?;
  pake.set("cmd", cmd)?;

  let base = root.to_path_buf();
  let shell = lua.create_function(move |_, script: String| {
    let (shell_cmd, shell_arg) = platform_shell();
    run_command(shell_cmd, &[shell_arg.to_string(), script], &base)
  })?;
  pake.set("shell", shell)?;

  let base = root.to_path_buf();
  let write = lua.create_function(move |_, (path, content): (String, LuaString)| {
    let path = base.join(&path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| LuaError::RuntimeError(format!("write failed: {e}")))?;
    }
    std::fs::write(&path, &*content.as_bytes())
      .map_err(|e| LuaError::RuntimeError(format!("write failed: {e}")))?;
    Ok(())
  })?;
  pake.set("write", write)?;

  let base = root.to_path_buf();
  let find = lua.create_function(move |_, dir: Option<String>| {
    let start = base.join(dir.as_deref().unwrap_or("."));
    Ok(list_files(&base, &start, None))
  })?;
  pake.set("find", find)?;

  let base = root.to_path_buf();
  let match_files = lua.create_function(move |_, pattern: String| {
    let regex = Regex::new(&format!("^(?:{pattern})$"))
      .map_err(|e| LuaError::RuntimeError(format!("invalid pattern {pattern:?}: {e}")))?;
    Ok(list_files(&base, &base, Some(&regex)))
  })?;
  pake.set("match_files", match_files)?;

  let log = lua.create_function(|_, message: String| {
    info!("{message}");
    Ok(())
  })?;
  pake.set("log", log)?;

  Ok(())
}

fn collect_args(args: LuaMultiValue) -> LuaResult<Vec<String>> {
  args
    .into_iter()
    .map(|value| match value {
      LuaValue::String(s) => Ok(s.to_str()?.to_string()),
      LuaValue::Integer(i) => Ok(i.to_string()),
      LuaValue::Number(n) => Ok(n.to_string()),
      other => Err(LuaError::external(format!(
        "command arguments must be strings or numbers, got {}",
        other.type_name()
      ))),
    })
    .collect()
}

fn run_command(program: &str, args: &[String], workdir: &Path) -> LuaResult<String> {
  debug!(program, ?args, "running command");
  let output = Command::new(program)
    .args(args)
    .current_dir(workdir)
    .stdin(Stdio::null())
    .stderr(Stdio::inherit())
    .output()
    .map_err(|e| LuaError::RuntimeError(format!("{program}: {e}")))?;

  if !output.status.success() {
    return Err(LuaError::RuntimeError(format!(
      "{program} exited with {}",
      output.status
    )));
  }
  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(unix)]
fn platform_shell() -> (&'static str, &'static str) {
  ("/bin/sh", "-c")
}

#[cfg(windows)]
fn platform_shell() -> (&'static str, &'static str) {
  ("cmd.exe", "/C")
}

/// Sorted root-relative paths of the files under `start`, optionally
/// filtered by a full-path regex. The engine's own state files are never
/// listed; they would otherwise make every run dirty.
fn list_files(root: &Path, start: &Path, filter: Option<&Regex>) -> Vec<String> {
  let mut files: Vec<String> = WalkDir::new(start)
    .into_iter()
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().is_file())
    .filter_map(|entry| relative_name(root, entry.path()))
    .filter(|name| !name.starts_with(".pake-state"))
    .filter(|name| filter.is_none_or(|regex| regex.is_match(name)))
    .collect();
  files.sort();
  files
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
  let rel: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
  let name = rel.to_string_lossy().replace('\\', "/");
  if name.is_empty() {
    None
  } else {
    Some(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn list_files_is_sorted_and_relative() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("b.txt"), "b").unwrap();
    std::fs::write(dir.path().join("sub/a.txt"), "a").unwrap();
    std::fs::write(dir.path().join(".pake-state"), "{}").unwrap();

    let files = list_files(dir.path(), dir.path(), None);
    assert_eq!(files, ["b.txt", "sub/a.txt"]);
  }

  #[test]
  fn match_files_filters_by_full_match() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.c"), "").unwrap();
    std::fs::write(dir.path().join("a.h"), "").unwrap();
    std::fs::write(dir.path().join("ac"), "").unwrap();

    let regex = Regex::new(r"^(?:.*\.c)$").unwrap();
    let files = list_files(dir.path(), dir.path(), Some(&regex));
    assert_eq!(files, ["a.c"]);
  }

  #[cfg(unix)]
  #[test]
  fn run_command_captures_trimmed_stdout() {
    let dir = TempDir::new().unwrap();
    let out = run_command("/bin/echo", &["hello".to_string()], dir.path()).unwrap();
    assert_eq!(out, "hello");
  }

  #[cfg(unix)]
  #[test]
  fn run_command_reports_failure() {
    let dir = TempDir::new().unwrap();
    let err = run_command("/bin/sh", &["-c".into(), "exit 3".into()], dir.path()).unwrap_err();
    assert!(err.to_string().contains("exited with"));
  }
}
