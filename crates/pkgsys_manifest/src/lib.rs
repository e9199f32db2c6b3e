//! # pkgsys_manifest
//!
//! Shared types for pkgsys units:
//! - [`UnitManifest`]: the declared name, version, entry point and exports
//! - [`Artifact`]: manifest + payload + signature, identified by its digest
//! - [`container`]: the `.pkg` zip container codec
//! - [`integrity`]: SHA-256 content digests

pub mod artifact;
pub mod container;
pub mod integrity;

pub use artifact::Artifact;
pub use integrity::{ContentDigest, DIGEST_LEN, IntegrityError};

use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

/// Maximum length for provider and unit names.
pub const MAX_NAME_LENGTH: usize = 64;

/// Maximum length for version strings.
pub const MAX_VERSION_LENGTH: usize = 64;

/// Length in bytes of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// File name of the manifest inside a container.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Error type for manifest and container operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Manifest validation failed: {0}")]
    ValidationError(String),
    #[error("Invalid container: {0}")]
    Container(String),
    #[error("Path traversal detected: {path}")]
    PathTraversal { path: String },
    #[error("Container is missing {0}")]
    MissingEntry(String),
    #[error("Container entry {name} too large: {size} bytes exceeds maximum of {max} bytes")]
    TooLarge { name: String, size: u64, max: u64 },
}

impl ManifestError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    pub fn container(message: impl Into<String>) -> Self {
        Self::Container(message.into())
    }
}

/// Declared contents of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitManifest {
    pub name: String,
    pub provider: String,
    pub version: String,
    /// Payload file holding the module to instantiate.
    pub entry_point: String,
    /// Symbols the unit exposes, in declaration order.
    pub exports: Vec<String>,
}

/// The `manifest.json` record as stored inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub provider: String,
    pub version: String,
    pub entry_point: String,
    pub exports: Vec<String>,
    pub digest: ContentDigest,
    /// Hex-encoded Ed25519 signature over the digest.
    pub signature: String,
}

impl ManifestFile {
    pub fn from_artifact(artifact: &Artifact) -> Self {
        let manifest = &artifact.manifest;
        Self {
            name: manifest.name.clone(),
            provider: manifest.provider.clone(),
            version: manifest.version.clone(),
            entry_point: manifest.entry_point.clone(),
            exports: manifest.exports.clone(),
            digest: artifact.digest,
            signature: hex::encode(&artifact.signature),
        }
    }

    /// Split into the manifest proper, the declared digest and the raw signature.
    pub fn into_parts(self) -> Result<(UnitManifest, ContentDigest, Vec<u8>), ManifestError> {
        let signature = hex::decode(&self.signature)
            .map_err(|e| ManifestError::validation(format!("signature is not hex: {e}")))?;
        let manifest = UnitManifest {
            name: self.name,
            provider: self.provider,
            version: self.version,
            entry_point: self.entry_point,
            exports: self.exports,
        };
        Ok((manifest, self.digest, signature))
    }
}

// Path is relative to this file: ../../../schemas/v1/unit.json
const UNIT_SCHEMA_JSON: &str = include_str!("../../../schemas/v1/unit.json");

static SCHEMA: OnceLock<Result<Validator, String>> = OnceLock::new();

fn schema() -> Result<&'static Validator, ManifestError> {
    SCHEMA
        .get_or_init(|| {
            let schema_json: Value =
                serde_json::from_str(UNIT_SCHEMA_JSON).map_err(|e| e.to_string())?;
            Validator::new(&schema_json).map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| ManifestError::validation(format!("embedded schema is invalid: {e}")))
}

/// Validates a provider or unit name.
///
/// A valid name:
/// - Is 1-64 characters long
/// - Contains no whitespace or ASCII control characters
/// - Contains no path separators, `.` or `@` (both are request syntax)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
        return false;
    }

    !name.chars().any(|c| {
        c.is_whitespace()
            || (c as u32) <= 0x1F
            || ((c as u32) >= 0x7F && (c as u32) <= 0x9F)
            || c == '/'
            || c == '\\'
            || c == '.'
            || c == '@'
    })
}

/// Validates a version string: 1-64 characters from `[0-9A-Za-z.+_-]`.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= MAX_VERSION_LENGTH
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '_' | '-'))
}

/// Validates a `manifest.json` string against the schema.
pub fn validate_manifest(json_str: &str) -> Result<ManifestFile, ManifestError> {
    let instance: Value = serde_json::from_str(json_str)?;

    if let Err(e) = schema()?.validate(&instance) {
        let error_msg = format!("{} at {}", e, e.instance_path());
        return Err(ManifestError::ValidationError(error_msg));
    }

    let manifest: ManifestFile = serde_json::from_value(instance)?;
    Ok(manifest)
}
