//! Error types for registration and fetching.

use thiserror::Error;

use crate::security::LocationError;
use crate::transport::TransportError;

/// Error type for provider registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The name is registered with a different descriptor.
    #[error("Provider '{name}' is already registered with a different {field}")]
    Conflict { name: String, field: &'static str },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid provider name: {0:?}")]
    InvalidName(String),

    #[error("Invalid base location for provider '{name}': {source}")]
    InvalidLocation {
        name: String,
        #[source]
        source: LocationError,
    },
}

impl RegistryError {
    pub fn conflict(name: impl Into<String>, field: &'static str) -> Self {
        Self::Conflict {
            name: name.into(),
            field,
        }
    }

    pub fn unknown(name: impl Into<String>) -> Self {
        Self::UnknownProvider(name.into())
    }
}

/// Error type for fetch operations.
///
/// Cloneable so that every waiter on a shared fetch receives the same value.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Retrieval failed permanently or exhausted its retries.
    #[error("Fetching {location} failed after {attempts} attempt(s): {source}")]
    Transport {
        location: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The retrieved bytes are not a valid container.
    #[error("Malformed artifact from {location}: {message}")]
    Malformed { location: String, message: String },

    #[error("Cannot build artifact location: {0}")]
    InvalidLocation(String),

    /// The fetch task ended without producing a result.
    #[error("Fetch aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    pub fn malformed(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Whether the location had nothing published.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_not_found())
    }

    /// Whether a later, fresh request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_transient(),
            Self::Aborted(_) => true,
            Self::Malformed { .. } | Self::InvalidLocation(_) => false,
        }
    }
}
