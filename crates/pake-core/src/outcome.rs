//! The result value recorded for each target.
//!
//! Outcomes are what invalidation compares: a dependent rebuilds when a
//! dependency's outcome differs from the one recorded at its last build.

use serde_json::Value;

/// The tagged result value produced by building a target.
#[derive(Debug, Clone)]
pub enum Outcome {
  /// Content digest of a file, or of a directory's entry listing.
  File(String),
  /// A JSON value returned by a virtual rule's recipe (null permitted).
  Json(Value),
  /// The rule ran but declined to produce a comparable result. Never equal
  /// to anything, including itself, so dependents always rebuild.
  Absent,
  /// A JSON value that never compares equal. Produced by `always` and
  /// propagated through every virtual rule downstream of it: recipes can
  /// still read the value, but comparison is poisoned, so the whole chain
  /// rebuilds on each invocation.
  Volatile(Value),
}

impl Outcome {
  pub fn is_absent(&self) -> bool {
    matches!(self, Outcome::Absent)
  }

  /// Whether this outcome is dirty by construction: it can never equal a
  /// previously recorded result, so anything depending on it must rebuild.
  pub fn is_never_equal(&self) -> bool {
    matches!(self, Outcome::Absent | Outcome::Volatile(_))
  }

  /// The JSON rendering used by alias/group recipes and the scripting host:
  /// file digests become strings, `Absent` becomes null.
  pub fn to_json(&self) -> Value {
    match self {
      Outcome::File(digest) => Value::String(digest.clone()),
      Outcome::Json(value) | Outcome::Volatile(value) => value.clone(),
      Outcome::Absent => Value::Null,
    }
  }
}

impl PartialEq for Outcome {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Outcome::File(a), Outcome::File(b)) => a == b,
      (Outcome::Json(a), Outcome::Json(b)) => a == b,
      // Absent and Volatile compare unequal even to themselves.
      _ => false,
    }
  }
}

/// Dependency results in declaration order, addressable by dep name.
///
/// Dep names are the strings as declared in the rule (after pattern
/// substitution), not canonical target names: respelling a dependency is a
/// change to the rule's inputs.
#[derive(Debug, Clone, Default)]
pub struct DepResults {
  entries: Vec<(String, Outcome)>,
}

impl DepResults {
  pub fn push(&mut self, name: String, outcome: Outcome) {
    self.entries.push((name, outcome));
  }

  pub fn get(&self, name: &str) -> Option<&Outcome> {
    self
      .entries
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, outcome)| outcome)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
    self.entries.iter().map(|(n, o)| (n.as_str(), o))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// A JSON object mapping dep name to its JSON-rendered outcome. This is
  /// what alias and group rules return, so their own outcome changes exactly
  /// when a dependency's does.
  pub fn to_json(&self) -> Value {
    let map: serde_json::Map<String, Value> = self
      .entries
      .iter()
      .map(|(name, outcome)| (name.clone(), outcome.to_json()))
      .collect();
    Value::Object(map)
  }
}
