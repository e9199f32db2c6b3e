//! # pkgsys_registry
//!
//! Everything between a provider name and a verified artifact:
//! - [`ProviderRegistry`]: the registered providers and their keys
//! - [`Verifier`]: digest, signature and trust-tier policy checks
//! - [`Transport`] / [`HttpTransport`]: raw retrieval of container bytes
//! - [`FetchCoordinator`]: retries and single-flight deduplication

pub mod coordinator;
pub mod error;
pub mod http_client;
pub mod provider;
pub mod registry;
pub mod security;
pub mod transport;
pub mod verifier;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use pkgsys_manifest as manifest;

pub use coordinator::{FetchCoordinator, RetryPolicy, artifact_location, artifact_locations};
pub use error::{FetchError, RegistryError};
pub use http_client::{HttpTransport, HttpTransportBuilder};
pub use provider::{PolicyFlag, ProviderDescriptor, ProviderPolicy, TrustTier};
pub use registry::ProviderRegistry;
pub use security::{LocationError, validate_url};
pub use transport::{HostScope, Transport, TransportError, TransportErrorKind};
pub use verifier::{SecurityError, Verifier};
