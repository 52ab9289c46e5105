//! Target name canonicalization.
//!
//! File targets are identified by a lexically normalized, root-relative path
//! with a `./` prefix. The prefix disambiguates file targets from virtual
//! target names: `foo` may name a virtual rule while `./foo` always names
//! the file. Normalization never touches the filesystem.

use std::path::Path;

use crate::error::BuildError;

/// Normalize a raw target string to its canonical `./`-prefixed form.
///
/// `.` and `..` segments are resolved lexically. Absolute paths are accepted
/// when they point inside `root` and are made root-relative. A path whose
/// resolved form would leave the root fails with [`BuildError::OutOfRoot`];
/// the empty string and the root itself cannot be file targets and fail with
/// [`BuildError::NoRule`].
pub fn normalize(raw: &str, root: &Path) -> Result<String, BuildError> {
  let rel = if Path::new(raw).is_absolute() {
    match Path::new(raw).strip_prefix(root) {
      Ok(stripped) => stripped.to_string_lossy().into_owned(),
      Err(_) => {
        return Err(BuildError::OutOfRoot { target: raw.to_string() });
      }
    }
  } else {
    raw.to_string()
  };

  let mut segments: Vec<&str> = Vec::new();
  for segment in rel.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        if segments.pop().is_none() {
          return Err(BuildError::OutOfRoot { target: raw.to_string() });
        }
      }
      other => segments.push(other),
    }
  }

  if segments.is_empty() {
    return Err(BuildError::NoRule { target: raw.to_string() });
  }

  Ok(format!("./{}", segments.join("/")))
}

/// Strip the canonical `./` prefix, yielding the form used for on-disk joins
/// and for the prefix-less pattern match attempt.
pub fn strip_dot(canonical: &str) -> &str {
  canonical.strip_prefix("./").unwrap_or(canonical)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  fn root() -> PathBuf {
    PathBuf::from("/work")
  }

  #[track_caller]
  fn assert_canon(raw: &str, expected: &str) {
    assert_eq!(normalize(raw, &root()).unwrap(), expected);
  }

  #[test]
  fn plain() {
    assert_canon("foo", "./foo");
    assert_canon("foo/bar", "./foo/bar");
  }

  #[test]
  fn dot_segments() {
    assert_canon("./foo", "./foo");
    assert_canon("foo/./bar", "./foo/bar");
    assert_canon("foo//bar", "./foo/bar");
    assert_canon("foo/.", "./foo");
  }

  #[test]
  fn parent_segments() {
    assert_canon("foo/../bar", "./bar");
    assert_canon("foo/bar/..", "./foo");
    assert_canon("a/b/../../c", "./c");
  }

  #[test]
  fn not_a_parent_segment() {
    assert_canon("t/.hidden", "./t/.hidden");
    assert_canon("t/..hidden", "./t/..hidden");
  }

  #[test]
  fn escapes_root() {
    assert!(matches!(
      normalize("../foo", &root()),
      Err(BuildError::OutOfRoot { .. })
    ));
    assert!(matches!(
      normalize("a/../../foo", &root()),
      Err(BuildError::OutOfRoot { .. })
    ));
    assert!(matches!(
      normalize("/elsewhere/foo", &root()),
      Err(BuildError::OutOfRoot { .. })
    ));
  }

  #[test]
  fn absolute_inside_root() {
    assert_canon("/work/foo/bar", "./foo/bar");
  }

  #[test]
  fn degenerate_names() {
    assert!(matches!(normalize("", &root()), Err(BuildError::NoRule { .. })));
    assert!(matches!(normalize(".", &root()), Err(BuildError::NoRule { .. })));
    assert!(matches!(normalize("./", &root()), Err(BuildError::NoRule { .. })));
  }

  #[test]
  fn strip_dot_prefix() {
    assert_eq!(strip_dot("./foo/bar"), "foo/bar");
    assert_eq!(strip_dot("foo"), "foo");
  }
}
