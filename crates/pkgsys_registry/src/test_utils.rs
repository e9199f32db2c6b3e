//! Test utilities for pkgsys_registry.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use parking_lot::Mutex;
use pkgsys_manifest::{Artifact, UnitManifest, container};
use tokio::sync::watch;
use url::Url;

use crate::provider::{ProviderDescriptor, ProviderPolicy, TrustTier};
use crate::transport::{HostScope, Transport, TransportError};

/// Helper to compile WAT to WASM bytes
pub fn wat_to_wasm(wat_source: &str) -> Vec<u8> {
    wat::parse_str(wat_source).expect("Invalid WAT")
}

/// Signs and packages units on behalf of one provider.
pub struct Publisher {
    provider: String,
    key: SigningKey,
}

impl Publisher {
    /// A publisher with a deterministic key derived from `seed`.
    pub fn new(provider: &str, seed: u8) -> Self {
        Self {
            provider: provider.to_string(),
            key: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn descriptor(&self, base_location: &str, trust_tier: TrustTier) -> ProviderDescriptor {
        self.descriptor_with(base_location, trust_tier, ProviderPolicy::default())
    }

    pub fn descriptor_with(
        &self,
        base_location: &str,
        trust_tier: TrustTier,
        policy: ProviderPolicy,
    ) -> ProviderDescriptor {
        ProviderDescriptor::new(
            self.provider.clone(),
            Url::parse(base_location).expect("Invalid base location"),
            self.verifying_key(),
            trust_tier,
            policy,
        )
    }

    /// Sign the artifact's digest, replacing any existing signature.
    pub fn sign(&self, artifact: Artifact) -> Artifact {
        let signature = self.key.sign(artifact.digest.as_bytes());
        artifact.with_signature(signature.to_bytes().to_vec())
    }

    /// Seal and sign a unit whose entry point is `{unit}.wasm`.
    pub fn publish(&self, unit: &str, version: &str, exports: &[&str], wasm: Vec<u8>) -> Artifact {
        let entry_point = format!("{unit}.wasm");
        let manifest = UnitManifest {
            name: unit.to_string(),
            provider: self.provider.clone(),
            version: version.to_string(),
            entry_point: entry_point.clone(),
            exports: exports.iter().map(|s| s.to_string()).collect(),
        };
        let payload = BTreeMap::from([(entry_point, wasm)]);
        self.sign(Artifact::seal(manifest, payload))
    }

    pub fn publish_wat(&self, unit: &str, version: &str, exports: &[&str], wat: &str) -> Artifact {
        self.publish(unit, version, exports, wat_to_wasm(wat))
    }
}

/// Container bytes for an artifact.
pub fn container_bytes(artifact: &Artifact) -> Vec<u8> {
    container::encode(artifact).expect("Failed to encode container")
}

/// A scripted in-memory [`Transport`].
///
/// Serves fixed bytes per location, optionally failing first with queued
/// errors, and records every call with its scope. Unserved locations are
/// not found. A closed gate holds all retrievals until
/// [`MockTransport::open_gate`] is called.
pub struct MockTransport {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, VecDeque<TransportError>>>,
    calls: Mutex<Vec<(String, HostScope)>>,
    latency: Mutex<Duration>,
    gate: watch::Sender<bool>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            gate: watch::Sender::new(true),
        }
    }

    /// A transport whose retrievals wait until the gate is opened.
    pub fn gated() -> Self {
        let transport = Self::new();
        transport.gate.send_replace(false);
        transport
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn serve(&self, location: &str, bytes: Vec<u8>) {
        self.responses.lock().insert(location.to_string(), bytes);
    }

    /// Fail the next retrieval of `location` with `error`. Queued errors are
    /// returned in order before any served bytes.
    pub fn fail_next(&self, location: &str, error: TransportError) {
        self.failures
            .lock()
            .entry(location.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, location: &str) -> usize {
        self.calls.lock().iter().filter(|(l, _)| l == location).count()
    }

    /// Scopes of every retrieval of `location`, in call order.
    pub fn scopes_for(&self, location: &str) -> Vec<HostScope> {
        self.calls
            .lock()
            .iter()
            .filter(|(l, _)| l == location)
            .map(|(_, scope)| *scope)
            .collect()
    }

    fn respond(&self, location: &str) -> Result<Vec<u8>, TransportError> {
        if let Some(error) = self
            .failures
            .lock()
            .get_mut(location)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        self.responses
            .lock()
            .get(location)
            .cloned()
            .ok_or_else(|| TransportError::not_found(format!("HTTP 404 Not Found: {location}")))
    }
}

impl Transport for MockTransport {
    async fn retrieve(&self, location: &Url, scope: HostScope) -> Result<Vec<u8>, TransportError> {
        let location = location.as_str().to_string();
        self.calls.lock().push((location.clone(), scope));

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(TransportError::transient("gate dropped"));
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.respond(&location)
    }
}
