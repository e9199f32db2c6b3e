//! Artifact verification.
//!
//! Checks run in a fixed order and stop at the first failure:
//! 1. the digest recomputed from the artifact content equals the declared digest
//! 2. the signature over the digest verifies under the provider's key
//! 3. the manifest names the provider it was fetched from
//! 4. Enterprise providers: the version satisfies the policy minimum

use ed25519_dalek::Signature;
use pkgsys_manifest::{Artifact, IntegrityError, SIGNATURE_LEN};
use thiserror::Error;
use tracing::{debug, error};

use crate::provider::{ProviderDescriptor, TrustTier};

/// An actively untrusted artifact. Never cached, never executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Signature check failed: {0}")]
    Signature(String),

    #[error("Policy check failed: {0}")]
    Policy(String),
}

impl SecurityError {
    pub fn signature(message: impl Into<String>) -> Self {
        Self::Signature(message.into())
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::Policy(message.into())
    }

    /// Short label for audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integrity(_) => "integrity",
            Self::Signature(_) => "signature",
            Self::Policy(_) => "policy",
        }
    }
}

pub struct Verifier;

impl Verifier {
    /// Verify an artifact against the provider it claims to come from.
    pub fn verify(artifact: &Artifact, provider: &ProviderDescriptor) -> Result<(), SecurityError> {
        let result = Self::check(artifact, provider);
        match &result {
            Ok(()) => debug!(
                provider = %provider.name,
                unit = %artifact.manifest.name,
                digest = %artifact.digest,
                "Artifact verified"
            ),
            Err(e) => error!(
                provider = %provider.name,
                unit = %artifact.manifest.name,
                digest = %artifact.digest,
                check = e.kind(),
                "Artifact rejected: {}",
                e
            ),
        }
        result
    }

    /// [`Verifier::verify`], then check the artifact is the unit that was
    /// asked for: same name, and same version when one was pinned.
    pub fn verify_unit(
        artifact: &Artifact,
        provider: &ProviderDescriptor,
        unit: &str,
        version: Option<&str>,
    ) -> Result<(), SecurityError> {
        Self::verify(artifact, provider)?;

        let manifest = &artifact.manifest;
        if manifest.name != unit {
            return Err(SecurityError::policy(format!(
                "requested unit '{unit}' but artifact is '{}'",
                manifest.name
            )));
        }
        if let Some(version) = version
            && manifest.version != version
        {
            return Err(SecurityError::policy(format!(
                "requested version {version} but artifact is {}",
                manifest.version
            )));
        }
        Ok(())
    }

    fn check(artifact: &Artifact, provider: &ProviderDescriptor) -> Result<(), SecurityError> {
        artifact.digest.verify(&artifact.raw_bytes())?;

        if artifact.signature.len() != SIGNATURE_LEN {
            return Err(SecurityError::signature(format!(
                "expected {SIGNATURE_LEN} bytes, found {}",
                artifact.signature.len()
            )));
        }
        let signature = Signature::from_slice(&artifact.signature)
            .map_err(|e| SecurityError::signature(e.to_string()))?;
        provider
            .public_key
            .verify_strict(artifact.digest.as_bytes(), &signature)
            .map_err(|_| {
                SecurityError::signature(format!(
                    "signature does not verify under the key of provider '{}'",
                    provider.name
                ))
            })?;

        if artifact.manifest.provider != provider.name {
            return Err(SecurityError::policy(format!(
                "artifact claims provider '{}' but was fetched from '{}'",
                artifact.manifest.provider, provider.name
            )));
        }

        if provider.trust_tier == TrustTier::Enterprise {
            if let Some(min_version) = &provider.policy.min_version {
                let version = semver::Version::parse(&artifact.manifest.version).map_err(|e| {
                    SecurityError::policy(format!(
                        "version '{}' is not semver: {e}",
                        artifact.manifest.version
                    ))
                })?;
                if version < *min_version {
                    return Err(SecurityError::policy(format!(
                        "version {version} is below the required minimum {min_version}"
                    )));
                }
            }
        }

        Ok(())
    }
}
