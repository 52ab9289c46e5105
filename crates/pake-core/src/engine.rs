//! The public engine: rule registration, the build entry point, and the
//! helpers the build script binds (`alias`, `group`, `unique`, the default
//! target, dependency trees).

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BuildError;
use crate::outcome::Outcome;
use crate::registry::{
  FileRecipe, PatternRecipe, Registry, Resolved, RuleMatch, VirtualOutput, VirtualRecipe,
};
use crate::resolve::Run;
use crate::state::StateStore;

/// Default state file name under the engine root.
pub const STATE_FILE: &str = ".pake-state";

/// Name of the alias rule built when no targets are requested.
pub const DEFAULT_TARGET: &str = "default";

/// How much of the graph to rebuild regardless of up-to-date checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Force {
  /// Rebuild only what the content checks say is out of date.
  #[default]
  None,
  /// Force the explicitly requested targets; dependencies still use the
  /// content checks.
  Listed,
  /// Force every target visited.
  All,
}

/// A node in the dependency tree reported by [`Engine::dependency_tree`].
#[derive(Debug, Clone)]
pub struct DepTree {
  pub name: String,
  pub deps: Vec<DepTree>,
}

/// The build engine: a rule registry, the persistent state for one root
/// directory, and the per-invocation sentinels.
pub struct Engine {
  root: PathBuf,
  registry: Registry,
  state: StateStore,
  frozen: bool,
  run_token: String,
  interrupt: Arc<AtomicBool>,
}

impl Engine {
  /// Open an engine rooted at `root` with the default state file location.
  pub fn new(root: impl Into<PathBuf>) -> Result<Self, BuildError> {
    let root = root.into();
    let state_path = root.join(STATE_FILE);
    Engine::with_state_path(root, &state_path)
  }

  /// Open an engine with an explicit state file location.
  pub fn with_state_path(root: impl Into<PathBuf>, state_path: &Path) -> Result<Self, BuildError> {
    let root = root.into();
    let root = std::fs::canonicalize(&root).map_err(|source| BuildError::Io {
      target: root.display().to_string(),
      source,
    })?;
    let state = StateStore::open(state_path)?;
    debug!(root = %root.display(), "engine ready");
    Ok(Engine {
      root,
      registry: Registry::new(),
      state,
      frozen: false,
      run_token: format!("unique:{}", Uuid::new_v4()),
      interrupt: Arc::new(AtomicBool::new(false)),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Flag the host sets (typically from SIGINT) to abort between recipes.
  pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.interrupt)
  }

  /// A sentinel value distinct from every other invocation's. Virtual
  /// recipes return it to force dependents to rebuild whenever they do.
  pub fn unique(&self) -> serde_json::Value {
    serde_json::Value::String(self.run_token.clone())
  }

  fn check_open(&self) -> Result<(), BuildError> {
    if self.frozen {
      return Err(BuildError::RegistryFrozen);
    }
    Ok(())
  }

  /// Register a rule for exactly one file target.
  pub fn register_exact(
    &mut self,
    target: &str,
    deps: Vec<String>,
    recipe: FileRecipe,
  ) -> Result<(), BuildError> {
    self.check_open()?;
    self.registry.add_exact(target, deps, recipe, &self.root)
  }

  /// Register a rule for any file target matching a regex. Dependency
  /// templates may reference match groups with `\1`…`\9`.
  pub fn register_pattern(
    &mut self,
    pattern: &str,
    deps: Vec<String>,
    recipe: PatternRecipe,
  ) -> Result<(), BuildError> {
    self.check_open()?;
    self.registry.add_pattern(pattern, deps, recipe)
  }

  /// Register a rule for a non-file target name.
  pub fn register_virtual(
    &mut self,
    name: &str,
    deps: Vec<String>,
    recipe: VirtualRecipe,
  ) -> Result<(), BuildError> {
    self.check_open()?;
    self.registry.add_virtual(name, deps, recipe)
  }

  /// Register a virtual rule that simply re-exposes the results of its
  /// targets, so dependents of the group rebuild exactly when a member does.
  pub fn group(&mut self, name: &str, targets: Vec<String>) -> Result<(), BuildError> {
    self.register_virtual(
      name,
      targets,
      Box::new(|deps| Ok(VirtualOutput::Value(deps.to_json()))),
    )
  }

  /// `alias(name, target)` is a one-member group.
  pub fn alias(&mut self, name: &str, target: &str) -> Result<(), BuildError> {
    self.group(name, vec![target.to_string()])
  }

  /// Mark `target` as what gets built when the caller requests nothing.
  pub fn default_target(&mut self, target: &str) -> Result<(), BuildError> {
    self.alias(DEFAULT_TARGET, target)
  }

  /// Resolve each target in order, returning the number of recipes invoked.
  ///
  /// The registry freezes on the first call. On error the run aborts, but
  /// the state store is still flushed with every result recorded so far.
  pub fn build(&mut self, targets: &[String]) -> Result<usize, BuildError> {
    self.build_with(targets, Force::None)
  }

  pub fn build_with(&mut self, targets: &[String], force: Force) -> Result<usize, BuildError> {
    self.frozen = true;

    let requested: Vec<String> = if targets.is_empty() {
      if !self.registry.has_virtual(DEFAULT_TARGET) {
        return Err(BuildError::NoRule {
          target: DEFAULT_TARGET.to_string(),
        });
      }
      vec![DEFAULT_TARGET.to_string()]
    } else {
      targets.to_vec()
    };

    let mut run = Run::new(
      &self.registry,
      &mut self.state,
      &self.root,
      &self.run_token,
      &self.interrupt,
      force,
    );

    let mut failure = None;
    for target in &requested {
      if let Err(err) = run.resolve_requested(target) {
        failure = Some(err);
        break;
      }
    }
    let rebuilt = run.rebuilt();
    drop(run);

    // Flush even on failure, preserving everything recorded this run.
    if let Err(err) = self.state.save() {
      match failure {
        Some(build_err) => {
          warn!(%err, "failed to save state after build error");
          return Err(build_err);
        }
        None => {
          return Err(BuildError::Io {
            target: STATE_FILE.to_string(),
            source: err,
          });
        }
      }
    }

    match failure {
      Some(err) => Err(err),
      None => Ok(rebuilt),
    }
  }

  /// The dependency tree of a target: rule matching and pattern template
  /// expansion only, no recipes run and no state consulted.
  pub fn dependency_tree(&self, target: &str) -> Result<DepTree, BuildError> {
    let mut stack = Vec::new();
    self.tree_node(target, &mut stack)
  }

  fn tree_node(&self, raw: &str, stack: &mut Vec<String>) -> Result<DepTree, BuildError> {
    let Resolved { name, rule } = self.registry.find(raw, &self.root)?;

    if stack.contains(&name) {
      let mut path = stack.clone();
      path.push(name);
      return Err(BuildError::Cycle { path });
    }

    let deps: Vec<String> = match rule {
      RuleMatch::Always | RuleMatch::Fallback => Vec::new(),
      RuleMatch::Virtual(rule) => rule.deps.clone(),
      RuleMatch::Exact(rule) => rule.deps.clone(),
      RuleMatch::Pattern(rule, found) => rule.deps.iter().map(|t| found.expand(t)).collect(),
    };

    stack.push(name.clone());
    let mut children = Vec::with_capacity(deps.len());
    for dep in &deps {
      children.push(self.tree_node(dep, stack)?);
    }
    stack.pop();

    Ok(DepTree {
      name,
      deps: children,
    })
  }
}
