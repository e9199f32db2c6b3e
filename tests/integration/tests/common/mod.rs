//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use pkgsys_core::{EngineConfig, LatestPolicy, ResolutionEngine, RetryPolicy, TrustTier};
use pkgsys_manifest::Artifact;
use pkgsys_registry::artifact_location;
use pkgsys_registry::test_utils::{MockTransport, Publisher, container_bytes};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const BASE: &str = "https://units.example.com/acme";

/// The `acme.tools` unit: one constant and one function.
pub const TOOLS_WAT: &str = r#"
(module
    (global (export "answer") i32 (i32.const 42))
    (func (export "add") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.add)
    (func (export "internal") (result i32)
        i32.const 7)
)
"#;

pub const TOOLS_EXPORTS: &[&str] = &["add", "answer"];

/// Install a fmt subscriber once; `RUST_LOG` selects what is shown.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<ResolutionEngine<MockTransport>>,
    pub publisher: Publisher,
}

impl Harness {
    pub fn new(latest: LatestPolicy) -> Self {
        Self::with(latest, MockTransport::new(), 256 * 1024 * 1024)
    }

    pub fn with(latest: LatestPolicy, transport: MockTransport, budget: u64) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            cache_budget_bytes: budget,
            retry: RetryPolicy::none(),
            latest,
            ..EngineConfig::with_cache_dir(dir.path().join("units"))
        };
        let engine = ResolutionEngine::new(&config, transport).unwrap();
        let publisher = Publisher::new("acme", 42);
        engine
            .register(publisher.descriptor(BASE, TrustTier::High))
            .unwrap();

        Self {
            dir,
            engine: Arc::new(engine),
            publisher,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        self.engine.cache().dir()
    }

    pub fn transport(&self) -> &MockTransport {
        self.engine.transport()
    }

    /// Serve `artifact` where `acme.{unit}` is fetched from and return the
    /// location.
    pub fn serve(&self, unit: &str, version: Option<&str>, artifact: &Artifact) -> String {
        let provider = self.engine.registry().lookup("acme").unwrap();
        let location = artifact_location(&provider, unit, version)
            .unwrap()
            .to_string();
        self.transport().serve(&location, container_bytes(artifact));
        location
    }

    pub fn publish_tools(&self, version: &str) -> Artifact {
        self.publisher
            .publish_wat("tools", version, TOOLS_EXPORTS, TOOLS_WAT)
    }
}
