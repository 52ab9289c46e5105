//! pake-core: the dependency and invalidation engine for pake.
//!
//! Invalidation is content-addressed: a target is up to date when the input
//! signature of its rule (kind, identity, ordered dependency results) and
//! the digest of its on-disk result both match what the state store recorded
//! at its last build. No timestamps are consulted.
//!
//! The crate is scripting-host agnostic: a host (see `pake-lua`) populates
//! the [`Engine`]'s rule registry with opaque recipe callbacks before the
//! first [`Engine::build`] call.

pub mod canon;
pub mod engine;
pub mod error;
pub mod hash;
pub mod outcome;
pub mod registry;
mod resolve;
pub mod state;

pub use engine::{DepTree, Engine, Force, DEFAULT_TARGET, STATE_FILE};
pub use error::BuildError;
pub use outcome::{DepResults, Outcome};
pub use registry::{
  FileRecipe, PatternMatch, PatternRecipe, RecipeError, VirtualFailure, VirtualOutput,
  VirtualRecipe, ALWAYS,
};
