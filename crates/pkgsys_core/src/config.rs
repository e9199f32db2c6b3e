//! Engine configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use jsonschema::Validator;
use pkgsys_loader::SandboxLimits;
use pkgsys_registry::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::EngineError;

// Embed the schema
const SCHEMA_JSON: &str = include_str!("../../../schemas/v1/config.json");
static CONFIG_SCHEMA: OnceLock<Result<Validator, String>> = OnceLock::new();

/// Default cache budget (256 MB).
const DEFAULT_CACHE_BUDGET: u64 = 256 * 1024 * 1024;

/// Default number of audit events kept.
const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// How an unpinned request is matched against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LatestPolicy {
    /// Always ask the provider. Identical bytes are still not stored twice.
    #[default]
    AlwaysRefresh,
    /// Reuse the last unpinned resolution if it is younger than the window.
    ReuseWithin { grace_secs: u64 },
}

impl LatestPolicy {
    /// How long a previous resolution may be reused, if at all.
    pub fn grace(&self) -> Option<Duration> {
        match self {
            Self::AlwaysRefresh => None,
            Self::ReuseWithin { grace_secs } => Some(Duration::from_secs(*grace_secs)),
        }
    }
}

/// Configuration for the resolution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding cached containers.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Byte budget for the cache.
    #[serde(default = "default_cache_budget")]
    pub cache_budget_bytes: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub latest: LatestPolicy,

    #[serde(default)]
    pub sandbox: SandboxLimits,

    /// Capacity of the audit event ring.
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("pkgsys")
        .join("units")
}

fn default_cache_budget() -> u64 {
    DEFAULT_CACHE_BUDGET
}

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_budget_bytes: DEFAULT_CACHE_BUDGET,
            retry: RetryPolicy::default(),
            latest: LatestPolicy::default(),
            sandbox: SandboxLimits::default(),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Defaults, with the cache rooted at `dir`.
    pub fn with_cache_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from a file.
    ///
    /// A relative `cache_dir` is resolved against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("Failed to read config: {}", e)))?;

        let mut config = Self::from_json(&content)?;

        if config.cache_dir.is_relative()
            && let Some(parent) = path.parent()
        {
            config.cache_dir = parent.join(&config.cache_dir);
        }

        Ok(config)
    }

    /// Parses configuration from JSON string with schema validation.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("Invalid JSON: {}", e)))?;

        let schema = CONFIG_SCHEMA
            .get_or_init(|| {
                let schema_json: serde_json::Value = serde_json::from_str(SCHEMA_JSON)
                    .map_err(|e| format!("Invalid embedded config schema: {e}"))?;
                Validator::new(&schema_json)
                    .map_err(|e| format!("Invalid config schema compilation: {e}"))
            })
            .as_ref()
            .map_err(|e| EngineError::config(e.clone()))?;

        if let Err(e) = schema.validate(&value) {
            return Err(EngineError::config(format!(
                "Config validation failed: {} at {}",
                e,
                e.instance_path()
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| EngineError::config(format!("Invalid config: {}", e)))
    }
}
