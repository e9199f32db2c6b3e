//! Resolution and engine error types.

use miette::Diagnostic;
use pkgsys_cache::CacheError;
use pkgsys_loader::LoadError;
use pkgsys_registry::{FetchError, RegistryError, SecurityError};
use thiserror::Error;

/// Outcome of a failed resolution.
///
/// Every lower-layer failure is mapped into one of these at the stage where
/// it happened. Cache corruption never appears here: it is repaired by
/// fetching again.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ResolveError {
    #[error("Invalid request '{request}': {reason}")]
    #[diagnostic(
        code(pkgsys::invalid_request),
        help("Use `provider.unit` or `provider.unit@version`")
    )]
    InvalidRequest { request: String, reason: String },

    #[error("Unknown provider: {0}")]
    #[diagnostic(
        code(pkgsys::unknown_provider),
        help("Register the provider before resolving its units")
    )]
    UnknownProvider(String),

    #[error("Could not fetch {provider}.{unit}: {source}")]
    #[diagnostic(code(pkgsys::fetch))]
    Fetch {
        provider: String,
        unit: String,
        #[source]
        source: FetchError,
    },

    /// The artifact is actively untrusted. Distinct from "not found".
    #[error("Security rejection for {provider}.{unit}: {source}")]
    #[diagnostic(
        code(pkgsys::security_rejection),
        severity(Error),
        help("The artifact was discarded and nothing was cached or executed")
    )]
    Security {
        provider: String,
        unit: String,
        #[source]
        source: SecurityError,
    },

    #[error("Manifest of {provider}.{unit} does not match its entry point: {source}")]
    #[diagnostic(code(pkgsys::manifest_mismatch))]
    ManifestMismatch {
        provider: String,
        unit: String,
        #[source]
        source: LoadError,
    },

    #[error("Failed to load {provider}.{unit}: {source}")]
    #[diagnostic(code(pkgsys::load))]
    Load {
        provider: String,
        unit: String,
        #[source]
        source: LoadError,
    },
}

impl ResolveError {
    pub fn invalid_request(request: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            request: request.into(),
            reason: reason.into(),
        }
    }

    /// Map a loader failure, separating manifest mismatches.
    pub(crate) fn from_load(provider: &str, unit: &str, source: LoadError) -> Self {
        let (provider, unit) = (provider.to_string(), unit.to_string());
        match source {
            LoadError::ManifestMismatch { .. } => Self::ManifestMismatch {
                provider,
                unit,
                source,
            },
            _ => Self::Load {
                provider,
                unit,
                source,
            },
        }
    }

    /// Whether the artifact failed verification.
    pub fn is_security_rejection(&self) -> bool {
        matches!(self, Self::Security { .. })
    }

    /// Whether reissuing the same request may succeed.
    ///
    /// Security rejections and invalid requests never do. Load failures may,
    /// since the artifact stays cached.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { source, .. } => source.is_transient(),
            Self::Load { .. } => true,
            Self::InvalidRequest { .. }
            | Self::UnknownProvider(_)
            | Self::Security { .. }
            | Self::ManifestMismatch { .. } => false,
        }
    }
}

/// Errors setting up or administering the engine.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(pkgsys::config))]
    Config(String),

    #[error("Cache error: {0}")]
    #[diagnostic(code(pkgsys::cache))]
    Cache(#[from] CacheError),

    #[error("Registry error: {0}")]
    #[diagnostic(code(pkgsys::registry))]
    Registry(#[from] RegistryError),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
