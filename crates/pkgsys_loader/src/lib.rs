//! # pkgsys_loader
//!
//! Turns a verified artifact into a [`ModuleHandle`].
//!
//! ## Architecture
//!
//! The entry point is compiled and instantiated with wasmi, a pure Rust
//! interpreter. The linker is empty, so a unit has no imports and no access
//! to host state. Execution is fuel-metered and memory is capped by
//! [`SandboxLimits`], both during start-up and on every call.
//!
//! Only the symbols the manifest declares are exposed, as typed
//! [`Symbol`]s: globals become [`Value`]s and functions become
//! [`Callable`]s.

mod error;
mod loader;
mod symbol;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{CallError, LoadError};
pub use loader::{ModuleHandle, ModuleLoader, SandboxLimits};
pub use symbol::{Callable, Symbol, Value};
