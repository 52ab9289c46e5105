//! Error types for the build engine.
//!
//! Every failure the engine can surface is a [`BuildError`]. The CLI maps
//! errors onto exit codes via [`BuildError::exit_code`]: 1 for build/recipe
//! failures, 2 for usage and registry errors, 3 for interruption.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the engine to the host.
#[derive(Debug, Error)]
pub enum BuildError {
  /// A target that cannot be a file target has no rule.
  #[error("{target}: no rule to build target")]
  NoRule { target: String },

  /// The fallback rule was selected but the source file is absent.
  #[error("{target}: does not exist and there is no rule to create it")]
  MissingSource { target: String },

  /// The canonical form of a target escapes the engine root.
  #[error("{target}: target is outside the build root")]
  OutOfRoot { target: String },

  /// A dependency cycle, reported as the chain of in-progress targets.
  #[error("dependency cycle detected: {}", path.join(" -> "))]
  Cycle { path: Vec<String> },

  /// A recipe raised an error. The message carries the host's rendering of
  /// the underlying failure.
  #[error("{target}: recipe failed: {message}")]
  RecipeFailed { target: String, message: String },

  /// A file rule's recipe returned successfully but the target file is
  /// missing from disk.
  #[error("{target}: recipe ran successfully but did not create the file")]
  TargetNotProduced { target: String },

  /// A virtual recipe returned a value that cannot be represented as JSON.
  #[error("{target}: recipe returned a value that is not representable as JSON: {message}")]
  InvalidResult { target: String, message: String },

  /// Rule registration was attempted after the first build started.
  #[error("rules cannot be registered after the build has started")]
  RegistryFrozen,

  /// Two exact or two virtual rules were registered for the same name.
  #[error("{target}: a rule for this target is already registered")]
  DuplicateRule { target: String },

  /// A pattern rule's regex failed to compile.
  #[error("invalid pattern {pattern:?}: {source}")]
  BadPattern {
    pattern: String,
    #[source]
    source: regex::Error,
  },

  /// The state file is locked by another pake process.
  #[error("the state file {path:?} is locked - is another instance of pake running?")]
  Locked { path: PathBuf },

  /// The host requested cancellation; the run was aborted between recipes.
  #[error("interrupted")]
  Interrupted,

  /// An I/O failure while hashing, reading, or writing engine data.
  #[error("{target}: {source}")]
  Io {
    target: String,
    #[source]
    source: io::Error,
  },
}

impl BuildError {
  /// Exit-code category for the command-line front-end.
  pub fn exit_code(&self) -> i32 {
    match self {
      BuildError::MissingSource { .. }
      | BuildError::RecipeFailed { .. }
      | BuildError::TargetNotProduced { .. }
      | BuildError::InvalidResult { .. }
      | BuildError::Io { .. } => 1,
      BuildError::NoRule { .. }
      | BuildError::OutOfRoot { .. }
      | BuildError::Cycle { .. }
      | BuildError::RegistryFrozen
      | BuildError::DuplicateRule { .. }
      | BuildError::BadPattern { .. }
      | BuildError::Locked { .. } => 2,
      BuildError::Interrupted => 3,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cycle_message_shows_chain() {
    let err = BuildError::Cycle {
      path: vec!["./a".into(), "b".into(), "./a".into()],
    };
    assert_eq!(err.to_string(), "dependency cycle detected: ./a -> b -> ./a");
  }

  #[test]
  fn exit_codes_by_category() {
    let recipe = BuildError::RecipeFailed {
      target: "./x".into(),
      message: "boom".into(),
    };
    assert_eq!(recipe.exit_code(), 1);
    assert_eq!(BuildError::RegistryFrozen.exit_code(), 2);
    assert_eq!(BuildError::Interrupted.exit_code(), 3);
  }
}
