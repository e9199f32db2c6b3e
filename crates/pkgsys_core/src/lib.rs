//! # pkgsys_core
//!
//! Resolution engine for provider units.
//!
//! This crate provides:
//! - The [`ResolutionEngine`] state machine
//! - Configuration loading
//! - Metrics and the audit log
//! - The [`ProviderImportHook`] adapter for host symbol lookup
//!
//! ## Example
//!
//! ```rust,ignore
//! use pkgsys_core::{EngineConfig, ResolutionEngine};
//!
//! let config = EngineConfig::from_file("pkgsys.json")?;
//! let engine = ResolutionEngine::with_http(&config)?;
//! engine.register_provider("acme", base, key, TrustTier::High, ProviderPolicy::default())?;
//!
//! let tools = engine.resolve_str("acme.tools").await?;
//! let add = tools.function("add").unwrap();
//! println!("{:?}", add.call(&[Value::I32(1), Value::I32(2)])?);
//! ```

mod config;
mod engine;
mod error;
pub mod hook;
pub mod metrics;
mod request;

pub use config::{EngineConfig, LatestPolicy};
pub use engine::ResolutionEngine;
pub use error::{EngineError, ResolveError};
pub use hook::{ImportHook, ProviderImportHook};
pub use metrics::{AuditEvent, MetricsSnapshot, Outcome};
pub use request::ResolutionRequest;

pub use pkgsys_loader::{Callable, ModuleHandle, SandboxLimits, Symbol, Value};
pub use pkgsys_registry::{
    HostScope, HttpTransport, PolicyFlag, ProviderDescriptor, ProviderPolicy, RetryPolicy,
    Transport, TransportError, TrustTier,
};
