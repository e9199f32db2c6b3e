//! The resolution state machine.
//!
//! ```text
//! Received -> CacheCheck -> CacheHit -> Loading
//!                        -> CacheMiss -> Fetching -> Verifying -> CacheStore -> Loading
//!                                                              -> Rejected
//! Loading -> Loaded | LoadFailed
//! ```

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use ed25519_dalek::VerifyingKey;
use pkgsys_cache::{CacheKey, CacheLease, CacheStore};
use pkgsys_loader::{LoadError, ModuleHandle, ModuleLoader};
use pkgsys_manifest::{Artifact, ContentDigest};
use pkgsys_registry::{
    FetchCoordinator, HostScope, HttpTransport, ProviderDescriptor, ProviderPolicy,
    ProviderRegistry, Transport, TransportError, TrustTier, Verifier,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{EngineConfig, LatestPolicy};
use crate::metrics::{AuditEvent, MetricsSink, MetricsSnapshot, Outcome};
use crate::request::ResolutionRequest;
use crate::{EngineError, ResolveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    CacheCheck,
    CacheHit,
    CacheMiss,
    Fetching,
    Verifying,
    CacheStore,
    Loading,
    Loaded,
    Rejected,
    LoadFailed,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::CacheCheck => "cache_check",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::CacheStore => "cache_store",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Rejected => "rejected",
            Self::LoadFailed => "load_failed",
        }
    }
}

/// Counts successful retrievals for the download metric.
struct MeteredTransport<T> {
    inner: T,
    metrics: Arc<MetricsSink>,
}

impl<T: Transport> Transport for MeteredTransport<T> {
    async fn retrieve(&self, location: &Url, scope: HostScope) -> Result<Vec<u8>, TransportError> {
        let bytes = self.inner.retrieve(location, scope).await?;
        self.metrics.record_download();
        Ok(bytes)
    }
}

/// Resolves `provider.unit` requests to loaded modules.
///
/// Shared by reference across tasks; there is no lock around a resolution,
/// only the per-unit single-flight in the fetch coordinator and the cache's
/// internal lock.
pub struct ResolutionEngine<T: Transport = HttpTransport> {
    registry: ProviderRegistry,
    cache: CacheStore,
    coordinator: FetchCoordinator<MeteredTransport<T>>,
    loader: Arc<ModuleLoader>,
    metrics: Arc<MetricsSink>,
    latest: LatestPolicy,
}

impl ResolutionEngine<HttpTransport> {
    /// Engine backed by the default HTTP transport.
    ///
    /// Local hosts are refused except for providers registered with
    /// `AllowLocal`.
    pub fn with_http(config: &EngineConfig) -> Result<Self, EngineError> {
        let transport = HttpTransport::builder()
            .timeout(config.retry.attempt_timeout())
            .build()
            .map_err(|e| EngineError::config(format!("Failed to build HTTP transport: {e}")))?;
        Self::new(config, transport)
    }
}

impl<T: Transport> ResolutionEngine<T> {
    pub fn new(config: &EngineConfig, transport: T) -> Result<Self, EngineError> {
        let cache = CacheStore::open(&config.cache_dir, config.cache_budget_bytes)?;
        let metrics = Arc::new(MetricsSink::new(config.audit_capacity));
        let transport = MeteredTransport {
            inner: transport,
            metrics: Arc::clone(&metrics),
        };

        info!(
            cache_dir = %config.cache_dir.display(),
            cached = cache.len(),
            "Resolution engine ready"
        );

        Ok(Self {
            registry: ProviderRegistry::new(),
            cache,
            coordinator: FetchCoordinator::new(Arc::new(transport), config.retry),
            loader: Arc::new(ModuleLoader::new(config.sandbox)),
            metrics,
            latest: config.latest,
        })
    }

    pub fn register_provider(
        &self,
        name: impl Into<String>,
        base_location: Url,
        public_key: VerifyingKey,
        trust_tier: TrustTier,
        policy: ProviderPolicy,
    ) -> Result<Arc<ProviderDescriptor>, EngineError> {
        self.register(ProviderDescriptor::new(
            name,
            base_location,
            public_key,
            trust_tier,
            policy,
        ))
    }

    pub fn register(
        &self,
        descriptor: ProviderDescriptor,
    ) -> Result<Arc<ProviderDescriptor>, EngineError> {
        Ok(self.registry.register(descriptor)?)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn transport(&self) -> &T {
        &self.coordinator.transport().inner
    }

    /// Fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.metrics.audit_log()
    }

    /// Drop every cached artifact. Running fetches and loads are unaffected.
    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    /// Parse and resolve `provider.unit[@version]`.
    pub async fn resolve_str(&self, name: &str) -> Result<ModuleHandle, ResolveError> {
        match ResolutionRequest::parse(name) {
            Ok(request) => self.resolve(&request).await,
            Err(e) => {
                self.metrics.record(AuditEvent {
                    timestamp: SystemTime::now(),
                    request: name.to_string(),
                    outcome: Outcome::InvalidRequest,
                    digest: None,
                    detail: Some(e.to_string()),
                    duration: Default::default(),
                });
                Err(e)
            }
        }
    }

    /// Resolve a request to a loaded module.
    ///
    /// Records exactly one audit event unless the future is dropped first.
    pub async fn resolve(&self, request: &ResolutionRequest) -> Result<ModuleHandle, ResolveError> {
        let started = Instant::now();
        let mut digest = None;
        let result = self.run(request, &mut digest).await;

        let (outcome, detail) = match &result {
            Ok((_, true)) => (Outcome::CacheHit, None),
            Ok((_, false)) => (Outcome::Loaded, None),
            Err(e) => (outcome_of(e), Some(e.to_string())),
        };
        self.metrics.record(AuditEvent {
            timestamp: SystemTime::now(),
            request: request.to_string(),
            outcome,
            digest: digest.map(|d: ContentDigest| d.to_hex()),
            detail,
            duration: started.elapsed(),
        });

        result.map(|(handle, _)| handle)
    }

    /// Returns the handle and whether it came from the cache.
    async fn run(
        &self,
        request: &ResolutionRequest,
        digest: &mut Option<ContentDigest>,
    ) -> Result<(ModuleHandle, bool), ResolveError> {
        self.enter(request, Stage::Received);
        let provider = self
            .registry
            .lookup(&request.provider)
            .map_err(|_| ResolveError::UnknownProvider(request.provider.clone()))?;

        self.enter(request, Stage::CacheCheck);
        if let Some(lease) = self.cache_check(request) {
            self.enter(request, Stage::CacheHit);
            let artifact = Arc::clone(lease.artifact());
            *digest = Some(artifact.digest);
            // Entries are verified before they are stored. Verify again since
            // the files can be replaced behind our back.
            self.verify(request, &provider, &artifact)?;
            let handle = self.load(request, artifact, Some(lease)).await?;
            return Ok((handle, true));
        }

        self.enter(request, Stage::CacheMiss);
        self.enter(request, Stage::Fetching);
        let artifact = self
            .coordinator
            .fetch(&provider, &request.unit, request.version.as_deref())
            .await
            .map_err(|source| ResolveError::Fetch {
                provider: request.provider.clone(),
                unit: request.unit.clone(),
                source,
            })?;
        *digest = Some(artifact.digest);

        self.enter(request, Stage::Verifying);
        self.verify(request, &provider, &artifact)?;

        self.enter(request, Stage::CacheStore);
        let lease = self.store(request, &artifact);

        let handle = self.load(request, artifact, lease).await?;
        Ok((handle, false))
    }

    fn enter(&self, request: &ResolutionRequest, stage: Stage) {
        debug!(request = %request, stage = stage.as_str(), "Resolution stage");
    }

    fn cache_check(&self, request: &ResolutionRequest) -> Option<CacheLease> {
        let key = match &request.version {
            Some(version) => self
                .cache
                .lookup_version(&request.provider, &request.unit, version),
            None => self
                .latest
                .grace()
                .and_then(|grace| self.cache.lookup_latest(&request.provider, &request.unit, grace)),
        }?;

        match self.cache.get(&key) {
            Ok(lease) => lease,
            Err(e) => {
                if e.is_corruption() {
                    self.metrics.record_cache_corruption();
                }
                warn!(request = %request, "Cache read failed, fetching again: {}", e);
                None
            }
        }
    }

    fn verify(
        &self,
        request: &ResolutionRequest,
        provider: &ProviderDescriptor,
        artifact: &Artifact,
    ) -> Result<(), ResolveError> {
        Verifier::verify_unit(
            artifact,
            provider,
            &request.unit,
            request.version.as_deref(),
        )
        .map_err(|source| {
            self.enter(request, Stage::Rejected);
            ResolveError::Security {
                provider: request.provider.clone(),
                unit: request.unit.clone(),
                source,
            }
        })
    }

    /// Persist a verified artifact. Failure to persist does not stop the load.
    fn store(&self, request: &ResolutionRequest, artifact: &Arc<Artifact>) -> Option<CacheLease> {
        let key = CacheKey::new(&request.provider, &request.unit, &artifact.digest);
        match self.cache.put(key, Arc::clone(artifact)) {
            Ok(lease) => {
                if request.version.is_none() {
                    self.cache
                        .record_latest(&request.provider, &request.unit, key);
                }
                Some(lease)
            }
            Err(e) => {
                warn!(request = %request, "Failed to cache artifact: {}", e);
                None
            }
        }
    }

    /// Load on the blocking pool. The lease keeps the entry pinned until the
    /// load finishes, even if this future is dropped.
    async fn load(
        &self,
        request: &ResolutionRequest,
        artifact: Arc<Artifact>,
        lease: Option<CacheLease>,
    ) -> Result<ModuleHandle, ResolveError> {
        self.enter(request, Stage::Loading);
        let loader = Arc::clone(&self.loader);
        let joined = tokio::task::spawn_blocking(move || {
            let _lease = lease;
            loader.load(&artifact)
        })
        .await;

        let result = joined
            .unwrap_or_else(|e| Err(LoadError::internal(format!("Loader task failed: {e}"))));
        match result {
            Ok(handle) => {
                self.enter(request, Stage::Loaded);
                info!(
                    request = %request,
                    version = handle.version(),
                    symbols = handle.symbols().len(),
                    "Resolved"
                );
                Ok(handle)
            }
            Err(e) => {
                self.enter(request, Stage::LoadFailed);
                error!(request = %request, "Load failed: {}", e);
                Err(ResolveError::from_load(&request.provider, &request.unit, e))
            }
        }
    }
}

fn outcome_of(error: &ResolveError) -> Outcome {
    match error {
        ResolveError::InvalidRequest { .. } | ResolveError::UnknownProvider(_) => {
            Outcome::InvalidRequest
        }
        ResolveError::Fetch { .. } => Outcome::FetchFailure,
        ResolveError::Security { .. } => Outcome::SecurityRejection,
        ResolveError::ManifestMismatch { .. } | ResolveError::Load { .. } => Outcome::LoadFailure,
    }
}
