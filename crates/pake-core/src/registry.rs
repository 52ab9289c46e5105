//! The rule registry: what the build script declares, and how a target name
//! is matched to the unique rule that builds it.
//!
//! Precedence is virtual-by-raw-name, then exact-by-canonical-path, then
//! patterns in registration order, then the implicit fallback. A raw target
//! string is probed against the virtual map verbatim before any path
//! normalization, so `foo` can name a virtual rule while `./foo` names the
//! file.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

use crate::canon;
use crate::error::BuildError;
use crate::outcome::DepResults;

/// Name of the built-in virtual rule whose result is fresh every run.
pub const ALWAYS: &str = "always";

/// Failure raised by a recipe callback, carrying the host's rendering of the
/// underlying error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RecipeError(pub String);

/// Failure from a virtual recipe: either the recipe itself failed, or it
/// completed but handed back something that has no JSON representation.
#[derive(Debug, Error)]
pub enum VirtualFailure {
  #[error(transparent)]
  Recipe(#[from] RecipeError),
  #[error("{0}")]
  InvalidResult(String),
}

/// What a virtual recipe hands back to the engine.
pub enum VirtualOutput {
  /// A JSON value; null is a normal, comparable result.
  Value(serde_json::Value),
  /// Deliberately no comparable result; dependents always rebuild.
  Absent,
}

/// Recipe for an exact file rule: (canonical target, dep results). The
/// return value is ignored; the engine digests the produced file.
pub type FileRecipe = Box<dyn Fn(&str, &DepResults) -> Result<(), RecipeError>>;

/// Recipe for a pattern rule: (canonical target, dep results, match).
pub type PatternRecipe = Box<dyn Fn(&str, &DepResults, &PatternMatch) -> Result<(), RecipeError>>;

/// Recipe for a virtual rule: (dep results) → JSON value or absent.
pub type VirtualRecipe = Box<dyn Fn(&DepResults) -> Result<VirtualOutput, VirtualFailure>>;

pub struct ExactRule {
  /// Canonical `./`-prefixed target path.
  pub target: String,
  pub deps: Vec<String>,
  pub recipe: FileRecipe,
}

pub struct PatternRule {
  /// The regex as written in the build script; identifies the rule in input
  /// signatures.
  pub source: String,
  regex: Regex,
  /// Dependency templates; `\1`…`\9` substitute match groups.
  pub deps: Vec<String>,
  pub recipe: PatternRecipe,
}

pub struct VirtualRule {
  pub name: String,
  pub deps: Vec<String>,
  pub recipe: VirtualRecipe,
}

/// Captured groups from matching a pattern rule against a canonical target.
/// Group 0 is the whole match; user groups start at 1.
#[derive(Debug, Clone)]
pub struct PatternMatch {
  groups: Vec<Option<String>>,
}

impl PatternMatch {
  fn from_captures(caps: &regex::Captures<'_>) -> Self {
    PatternMatch {
      groups: caps
        .iter()
        .map(|g| g.map(|m| m.as_str().to_string()))
        .collect(),
    }
  }

  pub fn group(&self, index: usize) -> Option<&str> {
    self.groups.get(index).and_then(|g| g.as_deref())
  }

  pub fn group_count(&self) -> usize {
    self.groups.len()
  }

  /// Substitute `\1`…`\9` backreferences in a dependency template.
  /// `\\` yields a literal backslash; an out-of-range or unmatched group
  /// substitutes the empty string.
  pub fn expand(&self, template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
      if c != '\\' {
        out.push(c);
        continue;
      }
      match chars.next() {
        Some(d) if d.is_ascii_digit() => {
          let index = d.to_digit(10).unwrap() as usize;
          if let Some(text) = self.group(index) {
            out.push_str(text);
          }
        }
        Some(other) => {
          out.push(other);
        }
        None => out.push('\\'),
      }
    }
    out
  }
}

impl PatternRule {
  /// Match against the canonical target, first with its `./` prefix and
  /// then without. Both forms agree on groups when both match; the prefixed
  /// (longer) form is preferred.
  fn match_target(&self, canonical: &str) -> Option<PatternMatch> {
    if let Some(caps) = self.regex.captures(canonical) {
      return Some(PatternMatch::from_captures(&caps));
    }
    self
      .regex
      .captures(canon::strip_dot(canonical))
      .map(|caps| PatternMatch::from_captures(&caps))
  }
}

/// The rule selected for a target, together with its canonical name.
pub struct Resolved<'r> {
  pub name: String,
  pub rule: RuleMatch<'r>,
}

pub enum RuleMatch<'r> {
  /// The built-in `always` rule: a fresh result on every invocation.
  Always,
  Virtual(&'r VirtualRule),
  Exact(&'r ExactRule),
  Pattern(&'r PatternRule, PatternMatch),
  /// No declared rule; the engine hashes the existing source file.
  Fallback,
}

/// Rules registered by the build script, in registration order for patterns.
#[derive(Default)]
pub struct Registry {
  exact: HashMap<String, ExactRule>,
  virtuals: HashMap<String, VirtualRule>,
  patterns: Vec<PatternRule>,
}

impl Registry {
  pub fn new() -> Self {
    Registry::default()
  }

  /// Register an exact rule. `target` is canonicalized here; registering two
  /// exact rules for the same canonical path is an error.
  pub fn add_exact(
    &mut self,
    target: &str,
    deps: Vec<String>,
    recipe: FileRecipe,
    root: &Path,
  ) -> Result<(), BuildError> {
    let canonical = canon::normalize(target, root)?;
    if self.exact.contains_key(&canonical) {
      return Err(BuildError::DuplicateRule { target: canonical });
    }
    self.exact.insert(
      canonical.clone(),
      ExactRule {
        target: canonical,
        deps,
        recipe,
      },
    );
    Ok(())
  }

  /// Register a virtual rule. The name is kept verbatim; `always` is
  /// reserved for the built-in.
  pub fn add_virtual(
    &mut self,
    name: &str,
    deps: Vec<String>,
    recipe: VirtualRecipe,
  ) -> Result<(), BuildError> {
    if name == ALWAYS || self.virtuals.contains_key(name) {
      return Err(BuildError::DuplicateRule {
        target: name.to_string(),
      });
    }
    self.virtuals.insert(
      name.to_string(),
      VirtualRule {
        name: name.to_string(),
        deps,
        recipe,
      },
    );
    Ok(())
  }

  /// Register a pattern rule. The regex must match the full canonical form;
  /// it is anchored with a non-capturing group so user group numbers are
  /// preserved.
  pub fn add_pattern(
    &mut self,
    pattern: &str,
    deps: Vec<String>,
    recipe: PatternRecipe,
  ) -> Result<(), BuildError> {
    let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| BuildError::BadPattern {
      pattern: pattern.to_string(),
      source,
    })?;
    self.patterns.push(PatternRule {
      source: pattern.to_string(),
      regex,
      deps,
      recipe,
    });
    Ok(())
  }

  pub fn has_virtual(&self, name: &str) -> bool {
    name == ALWAYS || self.virtuals.contains_key(name)
  }

  /// Resolve a raw target string to its rule.
  pub fn find(&self, raw: &str, root: &Path) -> Result<Resolved<'_>, BuildError> {
    if raw == ALWAYS {
      return Ok(Resolved {
        name: ALWAYS.to_string(),
        rule: RuleMatch::Always,
      });
    }
    if let Some(rule) = self.virtuals.get(raw) {
      return Ok(Resolved {
        name: raw.to_string(),
        rule: RuleMatch::Virtual(rule),
      });
    }

    let canonical = canon::normalize(raw, root)?;
    if let Some(rule) = self.exact.get(&canonical) {
      return Ok(Resolved {
        name: canonical,
        rule: RuleMatch::Exact(rule),
      });
    }
    for rule in &self.patterns {
      if let Some(found) = rule.match_target(&canonical) {
        return Ok(Resolved {
          name: canonical,
          rule: RuleMatch::Pattern(rule, found),
        });
      }
    }
    Ok(Resolved {
      name: canonical,
      rule: RuleMatch::Fallback,
    })
  }
}
