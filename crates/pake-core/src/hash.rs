//! Content digests and input signatures.
//!
//! Two digests drive invalidation: the content digest of a target path
//! (file bytes, or a directory's sorted entry names) and the input signature
//! of a rule (its kind, identity, and ordered dependency results). Both are
//! SHA-256 rendered as lowercase hex and must be stable across runs and
//! platforms.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::outcome::{DepResults, Outcome};

/// Field separator inside signature input, so adjacent fields can't collide.
const UNIT_SEPARATOR: u8 = 0x1f;

/// Compute the content digest of a path, following symlinks.
///
/// Regular files digest their bytes. Directories digest their sorted
/// immediate entry names, one per line, without recursing: a directory's
/// digest changes when an entry is added or removed, not when an entry's
/// contents change. Returns `Ok(None)` when the path (or a broken symlink's
/// referent) does not exist.
pub fn digest_path(path: &Path) -> io::Result<Option<String>> {
  let meta = match std::fs::metadata(path) {
    Ok(meta) => meta,
    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(err) => return Err(err),
  };
  if meta.is_dir() {
    digest_dir(path).map(Some)
  } else {
    digest_file(path).map(Some)
  }
}

fn digest_file(path: &Path) -> io::Result<String> {
  let file = File::open(path)?;
  let mut reader = BufReader::new(file);
  let mut hasher = Sha256::new();

  let mut buffer = [0u8; 8192];
  loop {
    let n = reader.read(&mut buffer)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(hex::encode(hasher.finalize()))
}

fn digest_dir(path: &Path) -> io::Result<String> {
  let mut names: Vec<String> = Vec::new();
  for entry in std::fs::read_dir(path)? {
    let entry = entry?;
    names.push(entry.file_name().to_string_lossy().into_owned());
  }
  names.sort();

  let mut hasher = Sha256::new();
  for name in &names {
    hasher.update(name.as_bytes());
    hasher.update([b'\n']);
  }
  Ok(hex::encode(hasher.finalize()))
}

/// Digest a rule's inputs: kind tag, rule identity, and the ordered
/// (dep name, outcome) pairs. The second return value reports whether any
/// dependency outcome never compares equal (`Absent` or `Volatile`); the
/// caller must then treat the target as dirty regardless of digest equality,
/// since equal digests would claim an equality the outcomes don't have.
pub fn input_signature(kind: &str, identity: &str, deps: &DepResults) -> (String, bool) {
  let mut hasher = Sha256::new();
  let mut always_dirty = false;

  hasher.update(kind.as_bytes());
  hasher.update([UNIT_SEPARATOR]);
  hasher.update(identity.as_bytes());
  hasher.update([UNIT_SEPARATOR]);

  for (name, outcome) in deps.iter() {
    hasher.update(name.as_bytes());
    hasher.update([UNIT_SEPARATOR]);
    match outcome {
      Outcome::File(digest) => {
        hasher.update(b"file");
        hasher.update([UNIT_SEPARATOR]);
        hasher.update(digest.as_bytes());
      }
      Outcome::Json(value) => {
        hasher.update(b"json");
        hasher.update([UNIT_SEPARATOR]);
        // serde_json keeps object keys sorted, so this rendering is
        // canonical: semantically equal JSON hashes equal.
        hasher.update(value.to_string().as_bytes());
      }
      Outcome::Volatile(value) => {
        always_dirty = true;
        hasher.update(b"volatile");
        hasher.update([UNIT_SEPARATOR]);
        hasher.update(value.to_string().as_bytes());
      }
      Outcome::Absent => {
        always_dirty = true;
        hasher.update(b"absent");
      }
    }
    hasher.update([UNIT_SEPARATOR]);
  }

  (hex::encode(hasher.finalize()), always_dirty)
}
