//! pake-lua: the embedded Lua host for pake build scripts.
//!
//! A `Pakefile` is an ordinary Lua chunk evaluated with a global `pake`
//! table in scope. Registration calls (`pake.target{}`, `pake.pattern{}`,
//! `pake.virtual{}`, …) populate the engine's rule registry; recipe
//! functions are captured and invoked later, when the engine decides the
//! matching target is out of date.

pub mod convert;
pub mod globals;
pub mod helpers;
pub mod runtime;

pub use runtime::{evaluate_pakefile, evaluate_source, find_pakefile, Host, HostError};
