//! The retrieval capability the coordinator fetches through.

use std::fmt;
use std::future::Future;

use thiserror::Error;
use url::Url;

use crate::provider::ProviderDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Worth retrying: timeouts, 5xx, dropped connections.
    Transient,
    /// Retrying cannot help: forbidden, refused by policy.
    Permanent,
    /// Nothing is published at the location.
    NotFound,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::NotFound => "not found",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} transport error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == TransportErrorKind::NotFound
    }
}

/// Which hosts a retrieval may contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostScope {
    /// Public hosts only.
    #[default]
    Public,
    /// Loopback, private and link-local hosts as well.
    Local,
}

impl HostScope {
    /// The scope a provider's policy grants its fetches.
    pub fn for_provider(provider: &ProviderDescriptor) -> Self {
        if provider.policy.allow_local() {
            Self::Local
        } else {
            Self::Public
        }
    }

    pub fn allows_local(self) -> bool {
        self == Self::Local
    }
}

/// Raw byte retrieval from a location.
///
/// Implementations classify their failures; the coordinator only retries
/// transient ones. `scope` comes from the provider being fetched and must be
/// honored for the location and every redirect.
pub trait Transport: Send + Sync + 'static {
    fn retrieve(
        &self,
        location: &Url,
        scope: HostScope,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}
