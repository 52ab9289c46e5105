//! Persistent result state between runs.
//!
//! The state file is a JSON object mapping canonical target names to the
//! outcome recorded at each target's last successful build, plus the input
//! signature that produced it:
//!
//! ```text
//! { "./hello.txt": { "kind": "file", "value": "ab12...", "input_sig": "9f..." } }
//! ```
//!
//! The format is private to the engine; unknown fields are tolerated and a
//! corrupt file is treated as empty state. Saves are atomic
//! (write-temp-then-rename). An exclusive lock on a sibling `.lock` file is
//! held for the store's lifetime so two pake processes cannot interleave
//! writes against the same root.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::BuildError;
use crate::outcome::Outcome;

/// One recorded result: the outcome plus the input signature of the build
/// that produced it.
#[derive(Debug, Clone)]
pub struct Entry {
  pub outcome: Outcome,
  pub input_sig: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoredKind {
  File,
  Json,
  Absent,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
  kind: StoredKind,
  #[serde(default)]
  value: Value,
  #[serde(default)]
  input_sig: String,
}

impl From<&Entry> for StoredEntry {
  fn from(entry: &Entry) -> Self {
    let (kind, value) = match &entry.outcome {
      Outcome::File(digest) => (StoredKind::File, Value::String(digest.clone())),
      Outcome::Json(value) => (StoredKind::Json, value.clone()),
      // Volatility is recomputed each run through the live `always` chain,
      // so the persisted form keeps only the value.
      Outcome::Volatile(value) => (StoredKind::Json, value.clone()),
      Outcome::Absent => (StoredKind::Absent, Value::Null),
    };
    StoredEntry {
      kind,
      value,
      input_sig: entry.input_sig.clone(),
    }
  }
}

impl StoredEntry {
  fn into_entry(self) -> Option<Entry> {
    let outcome = match self.kind {
      StoredKind::File => Outcome::File(self.value.as_str()?.to_string()),
      StoredKind::Json => Outcome::Json(self.value),
      StoredKind::Absent => Outcome::Absent,
    };
    Some(Entry {
      outcome,
      input_sig: self.input_sig,
    })
  }
}

/// The persisted target → result map.
pub struct StateStore {
  path: PathBuf,
  entries: HashMap<String, Entry>,
  // Held open for the store's lifetime; the flock is released on drop.
  _lock: File,
}

impl StateStore {
  /// Open (or create) the state file at `path`, taking the exclusive lock.
  ///
  /// Missing state is empty state. Corrupt state is logged and discarded
  /// rather than failing the run. Fails with [`BuildError::Locked`] when
  /// another process holds the lock.
  pub fn open(path: &Path) -> Result<Self, BuildError> {
    let lock = acquire_lock(path)?;

    let entries = match fs::read_to_string(path) {
      Ok(content) => match serde_json::from_str::<HashMap<String, StoredEntry>>(&content) {
        Ok(stored) => {
          let mut entries = HashMap::new();
          for (target, stored_entry) in stored {
            match stored_entry.into_entry() {
              Some(entry) => {
                entries.insert(target, entry);
              }
              None => warn!(%target, "discarding malformed state entry"),
            }
          }
          entries
        }
        Err(err) => {
          warn!(path = %path.display(), %err, "state file is corrupt, starting from empty state");
          HashMap::new()
        }
      },
      Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
      Err(err) => {
        return Err(BuildError::Io {
          target: path.display().to_string(),
          source: err,
        });
      }
    };

    debug!(path = %path.display(), entries = entries.len(), "loaded state");
    Ok(StateStore {
      path: path.to_path_buf(),
      entries,
      _lock: lock,
    })
  }

  pub fn get(&self, target: &str) -> Option<&Entry> {
    self.entries.get(target)
  }

  /// Record a result. Only the named target's entry is replaced; entries for
  /// targets not referenced this run survive untouched.
  pub fn record(&mut self, target: String, entry: Entry) {
    self.entries.insert(target, entry);
  }

  /// Write the map atomically: serialize to a temp file next to the state
  /// file, then rename over it.
  pub fn save(&self) -> io::Result<()> {
    let stored: HashMap<&str, StoredEntry> = self
      .entries
      .iter()
      .map(|(target, entry)| (target.as_str(), StoredEntry::from(entry)))
      .collect();

    let mut temp_path = self.path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let content = serde_json::to_string(&stored).map_err(io::Error::other)?;
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, &self.path)?;
    debug!(path = %self.path.display(), entries = self.entries.len(), "saved state");
    Ok(())
  }
}

fn lock_path(state_path: &Path) -> PathBuf {
  let mut path = state_path.as_os_str().to_owned();
  path.push(".lock");
  PathBuf::from(path)
}

fn acquire_lock(state_path: &Path) -> Result<File, BuildError> {
  let lock_path = lock_path(state_path);
  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(&lock_path)
    .map_err(|source| BuildError::Io {
      target: lock_path.display().to_string(),
      source,
    })?;

  match try_lock(&file) {
    Ok(()) => Ok(file),
    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(BuildError::Locked {
      path: state_path.to_path_buf(),
    }),
    Err(source) => Err(BuildError::Io {
      target: lock_path.display().to_string(),
      source,
    }),
  }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{flock, FlockOperation};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{
    LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
  };

  let handle = file.as_raw_handle() as HANDLE;
  let flags = LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when
  // zero-initialized, and the file handle is valid for the call.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::new(io::ErrorKind::WouldBlock, "state file locked"))
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn entry(outcome: Outcome, sig: &str) -> Entry {
    Entry {
      outcome,
      input_sig: sig.to_string(),
    }
  }

  #[test]
  fn round_trips_entries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".pake-state");

    {
      let mut store = StateStore::open(&path).unwrap();
      store.record("./hello.txt".into(), entry(Outcome::File("d1".into()), "s1"));
      store.record("cfg".into(), entry(Outcome::Json(json!({"k": [1, 2]})), "s2"));
      store.record("phony".into(), entry(Outcome::Absent, "s3"));
      store.save().unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    assert_eq!(
      store.get("./hello.txt").unwrap().outcome,
      Outcome::File("d1".into())
    );
    assert_eq!(
      store.get("cfg").unwrap().outcome,
      Outcome::Json(json!({"k": [1, 2]}))
    );
    assert!(store.get("phony").unwrap().outcome.is_absent());
    assert_eq!(store.get("phony").unwrap().input_sig, "s3");
  }

  #[test]
  fn wire_format_shape() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".pake-state");

    let mut store = StateStore::open(&path).unwrap();
    store.record("./a".into(), entry(Outcome::File("abc".into()), "ff"));
    store.save().unwrap();
    drop(store);

    let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["./a"]["kind"], "file");
    assert_eq!(raw["./a"]["value"], "abc");
    assert_eq!(raw["./a"]["input_sig"], "ff");
  }

  #[test]
  fn tolerates_unknown_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".pake-state");
    fs::write(
      &path,
      r#"{"./a": {"kind": "file", "value": "abc", "input_sig": "ff", "mtime": 12}}"#,
    )
    .unwrap();

    let store = StateStore::open(&path).unwrap();
    assert_eq!(store.get("./a").unwrap().outcome, Outcome::File("abc".into()));
  }

  #[test]
  fn corrupt_state_is_empty_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".pake-state");
    fs::write(&path, "not json {{{").unwrap();

    let store = StateStore::open(&path).unwrap();
    assert!(store.get("./a").is_none());
  }

  #[test]
  fn missing_state_is_empty_state() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(&dir.path().join(".pake-state")).unwrap();
    assert!(store.get("anything").is_none());
  }

  #[test]
  fn second_open_fails_while_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".pake-state");

    let _held = StateStore::open(&path).unwrap();
    assert!(matches!(
      StateStore::open(&path),
      Err(BuildError::Locked { .. })
    ));
  }

  #[test]
  fn unrelated_entries_survive_a_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".pake-state");

    {
      let mut store = StateStore::open(&path).unwrap();
      store.record("./old".into(), entry(Outcome::File("d0".into()), "s0"));
      store.save().unwrap();
    }
    {
      let mut store = StateStore::open(&path).unwrap();
      store.record("./new".into(), entry(Outcome::File("d1".into()), "s1"));
      store.save().unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    assert!(store.get("./old").is_some());
    assert!(store.get("./new").is_some());
  }
}
