//! Loader error types.

use thiserror::Error;

/// Errors raised while turning an artifact into a module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Entry point '{0}' is not in the payload")]
    MissingEntryPoint(String),

    #[error("Failed to compile entry point: {0}")]
    Compile(String),

    /// Instantiation failed: unresolved imports, memory over the limit, or a
    /// trap in the start function.
    #[error("Failed to instantiate entry point: {0}")]
    Instantiate(String),

    /// The entry point trapped or ran out of fuel while initializing.
    #[error("Entry point trapped: {0}")]
    Trap(String),

    /// A declared export is missing or has no typed representation.
    #[error("Declared symbol '{symbol}' {reason}")]
    ManifestMismatch { symbol: String, reason: String },

    #[error("Loader failed: {0}")]
    Internal(String),
}

impl LoadError {
    pub fn mismatch(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ManifestMismatch {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Errors raised when calling an exposed function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("'{name}' takes {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("'{name}' argument {index} must be {expected}")]
    ArgumentType {
        name: String,
        index: usize,
        expected: &'static str,
    },

    #[error("'{name}' trapped: {message}")]
    Trap { name: String, message: String },
}
