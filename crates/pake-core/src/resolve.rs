//! Per-run target resolution: dependency traversal, the content-based
//! rebuild decision, recipe invocation, and result recording.
//!
//! A `Run` is created for each `Engine::build` call. Resolution is
//! single-threaded and recursive: dependencies resolve strictly
//! left-to-right, results are memoized so every target builds at most once
//! per run, and a stack of in-progress targets catches cycles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::canon;
use crate::engine::Force;
use crate::error::BuildError;
use crate::hash;
use crate::outcome::{DepResults, Outcome};
use crate::registry::{
  RecipeError, Registry, Resolved, RuleMatch, VirtualFailure, VirtualOutput, VirtualRule, ALWAYS,
};
use crate::state::{Entry, StateStore};

pub(crate) struct Run<'a> {
  registry: &'a Registry,
  state: &'a mut StateStore,
  root: &'a Path,
  run_token: &'a str,
  interrupt: &'a AtomicBool,
  force: Force,
  memo: HashMap<String, Outcome>,
  stack: Vec<String>,
  rebuilt: usize,
}

impl<'a> Run<'a> {
  pub(crate) fn new(
    registry: &'a Registry,
    state: &'a mut StateStore,
    root: &'a Path,
    run_token: &'a str,
    interrupt: &'a AtomicBool,
    force: Force,
  ) -> Self {
    Run {
      registry,
      state,
      root,
      run_token,
      interrupt,
      force,
      memo: HashMap::new(),
      stack: Vec::new(),
      rebuilt: 0,
    }
  }

  /// Number of recipes invoked so far this run. The built-in `always` and
  /// fallback rules have no recipe and do not count.
  pub(crate) fn rebuilt(&self) -> usize {
    self.rebuilt
  }

  /// Resolve a target named on the command line.
  pub(crate) fn resolve_requested(&mut self, raw: &str) -> Result<Outcome, BuildError> {
    let forced = !matches!(self.force, Force::None);
    self.resolve(raw, forced)
  }

  fn resolve(&mut self, raw: &str, forced: bool) -> Result<Outcome, BuildError> {
    let registry: &'a Registry = self.registry;
    let Resolved { name, rule } = registry.find(raw, self.root)?;

    if let Some(cached) = self.memo.get(&name) {
      return Ok(cached.clone());
    }
    if let Some(position) = self.stack.iter().position(|t| t == &name) {
      let mut path: Vec<String> = self.stack[position..].to_vec();
      path.push(name);
      return Err(BuildError::Cycle { path });
    }

    self.stack.push(name.clone());
    let result = match rule {
      RuleMatch::Always => self.resolve_always(),
      RuleMatch::Virtual(rule) => self.resolve_virtual(&name, rule, forced),
      RuleMatch::Exact(rule) => self.resolve_file(
        &name,
        "exact",
        &rule.target,
        rule.deps.clone(),
        |target, deps| (rule.recipe)(target, deps),
        forced,
      ),
      RuleMatch::Pattern(rule, found) => {
        let deps = rule.deps.iter().map(|t| found.expand(t)).collect();
        self.resolve_file(
          &name,
          "pattern",
          &rule.source,
          deps,
          |target, deps| (rule.recipe)(target, deps, &found),
          forced,
        )
      }
      RuleMatch::Fallback => self.resolve_fallback(&name),
    };
    self.stack.pop();

    let outcome = result?;
    self.memo.insert(name, outcome.clone());
    Ok(outcome)
  }

  fn resolve_deps(&mut self, deps: Vec<String>) -> Result<DepResults, BuildError> {
    let forced = matches!(self.force, Force::All);
    let mut results = DepResults::default();
    for dep in deps {
      let outcome = self.resolve(&dep, forced)?;
      results.push(dep, outcome);
    }
    Ok(results)
  }

  /// The built-in `always` rule produces a never-equal result carrying the
  /// per-invocation token. The volatility propagates through every virtual
  /// rule downstream, so transitive dependents rebuild on each invocation.
  fn resolve_always(&mut self) -> Result<Outcome, BuildError> {
    let outcome = Outcome::Volatile(serde_json::Value::String(self.run_token.to_string()));
    let (input_sig, _) = hash::input_signature("always", ALWAYS, &DepResults::default());
    self.state.record(
      ALWAYS.to_string(),
      Entry {
        outcome: outcome.clone(),
        input_sig,
      },
    );
    Ok(outcome)
  }

  fn resolve_virtual(
    &mut self,
    name: &str,
    rule: &VirtualRule,
    forced: bool,
  ) -> Result<Outcome, BuildError> {
    let dep_results = self.resolve_deps(rule.deps.clone())?;
    let (input_sig, always_dirty) = hash::input_signature("virtual", &rule.name, &dep_results);

    let prior = self.state.get(name);
    let reason = if forced {
      Some("rebuild was forced")
    } else if prior.is_none() {
      Some("it has not been built before")
    } else if always_dirty {
      Some("a dependency has no comparable result")
    } else if prior.map(|e| e.input_sig.as_str()) != Some(input_sig.as_str()) {
      Some("its inputs changed")
    } else {
      None
    };

    let reason = match reason {
      None => {
        debug!(target = %name, "up to date");
        // The cached outcome may itself be Absent; that keeps dependents
        // dirty without ever re-running this rule.
        return Ok(prior.map(|e| e.outcome.clone()).unwrap_or(Outcome::Absent));
      }
      Some(reason) => reason,
    };

    self.check_interrupt()?;
    info!(target = %name, reason, "building");
    let output = (rule.recipe)(&dep_results).map_err(|err| match err {
      VirtualFailure::Recipe(err) => BuildError::RecipeFailed {
        target: name.to_string(),
        message: err.0,
      },
      VirtualFailure::InvalidResult(message) => BuildError::InvalidResult {
        target: name.to_string(),
        message,
      },
    })?;
    let volatile_dep = dep_results
      .iter()
      .any(|(_, outcome)| matches!(outcome, Outcome::Volatile(_)));
    let outcome = match output {
      // A volatile dependency makes this result volatile too, so `always`
      // forces rebuilds transitively, not just one level deep. An Absent
      // dep re-dirties this rule each run without poisoning its result.
      VirtualOutput::Value(value) if volatile_dep => Outcome::Volatile(value),
      VirtualOutput::Value(value) => Outcome::Json(value),
      VirtualOutput::Absent => Outcome::Absent,
    };
    self.record(name, outcome.clone(), input_sig);
    Ok(outcome)
  }

  /// Shared build path for exact and pattern rules. The recipe's return
  /// value is ignored; the target file's digest is the result.
  fn resolve_file(
    &mut self,
    name: &str,
    kind: &str,
    identity: &str,
    deps: Vec<String>,
    recipe: impl Fn(&str, &DepResults) -> Result<(), RecipeError>,
    forced: bool,
  ) -> Result<Outcome, BuildError> {
    let dep_results = self.resolve_deps(deps)?;
    let (input_sig, always_dirty) = hash::input_signature(kind, identity, &dep_results);

    let path = self.target_path(name);
    // An unreadable target counts as missing here: the recipe gets a chance
    // to replace it. After the recipe it is an error instead.
    let on_disk = match hash::digest_path(&path) {
      Ok(digest) => digest,
      Err(err) => {
        debug!(target = %name, %err, "target unreadable");
        None
      }
    };

    let prior = self.state.get(name);
    let prior_digest = prior.and_then(|entry| match &entry.outcome {
      Outcome::File(digest) => Some(digest.as_str()),
      _ => None,
    });

    let reason = if forced {
      Some("rebuild was forced")
    } else if prior.is_none() {
      Some("it has not been built before")
    } else if always_dirty {
      Some("a dependency has no comparable result")
    } else if prior.map(|e| e.input_sig.as_str()) != Some(input_sig.as_str()) {
      Some("its inputs changed")
    } else if on_disk.is_none() {
      Some("the file is missing from disk")
    } else if prior_digest != on_disk.as_deref() {
      Some("the file changed on disk")
    } else {
      None
    };

    let reason = match reason {
      None => {
        debug!(target = %name, "up to date");
        // Reuse: the on-disk digest equals the recorded one.
        return Ok(Outcome::File(on_disk.unwrap()));
      }
      Some(reason) => reason,
    };

    self.check_interrupt()?;
    info!(target = %name, reason, "building");
    recipe(name, &dep_results).map_err(|err| BuildError::RecipeFailed {
      target: name.to_string(),
      message: err.0,
    })?;

    let digest = hash::digest_path(&path)
      .map_err(|source| BuildError::Io {
        target: name.to_string(),
        source,
      })?
      .ok_or_else(|| BuildError::TargetNotProduced {
        target: name.to_string(),
      })?;

    let outcome = Outcome::File(digest);
    self.record(name, outcome.clone(), input_sig);
    Ok(outcome)
  }

  /// The fallback "build" is a re-hash of the existing source file.
  fn resolve_fallback(&mut self, name: &str) -> Result<Outcome, BuildError> {
    let path = self.target_path(name);
    let digest = hash::digest_path(&path)
      .map_err(|source| BuildError::Io {
        target: name.to_string(),
        source,
      })?
      .ok_or_else(|| BuildError::MissingSource {
        target: name.to_string(),
      })?;

    debug!(target = %name, "hashed source");
    let outcome = Outcome::File(digest);
    let (input_sig, _) = hash::input_signature("fallback", name, &DepResults::default());
    self.state.record(
      name.to_string(),
      Entry {
        outcome: outcome.clone(),
        input_sig,
      },
    );
    Ok(outcome)
  }

  fn record(&mut self, name: &str, outcome: Outcome, input_sig: String) {
    self.state.record(name.to_string(), Entry { outcome, input_sig });
    self.rebuilt += 1;
  }

  fn check_interrupt(&self) -> Result<(), BuildError> {
    if self.interrupt.load(Ordering::Relaxed) {
      return Err(BuildError::Interrupted);
    }
    Ok(())
  }

  fn target_path(&self, canonical: &str) -> PathBuf {
    self.root.join(canon::strip_dot(canonical))
  }
}
