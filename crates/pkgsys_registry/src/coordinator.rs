//! Fetching artifacts: location building, retries and single-flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use pkgsys_manifest::{Artifact, container};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FetchError;
use crate::provider::ProviderDescriptor;
use crate::transport::{HostScope, Transport, TransportError};

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Deadline for a single attempt; exceeding it is a transient failure.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// No retries and no delay.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Directories tried, in order, for the latest release of a unit.
const LATEST_DIRS: [&str; 3] = ["releases/latest/download", "raw/main", "raw/master"];

/// Where a unit's container may be published, in the order to try them.
///
/// Pinned: `{base}/{unit}/releases/download/v{version}/{unit}.pkg` only.
/// Latest: `{base}/{unit}/releases/latest/download/{unit}.pkg`, then the
/// `raw/main` and `raw/master` branches.
pub fn artifact_locations(
    provider: &ProviderDescriptor,
    unit: &str,
    version: Option<&str>,
) -> Result<Vec<Url>, FetchError> {
    let base = provider.base_location.as_str().trim_end_matches('/');
    let dirs = match version {
        Some(version) => vec![format!(
            "releases/download/v{}",
            version.trim_start_matches('v')
        )],
        None => LATEST_DIRS.iter().map(|dir| dir.to_string()).collect(),
    };

    dirs.iter()
        .map(|dir| {
            let location = format!("{base}/{unit}/{dir}/{unit}.pkg");
            Url::parse(&location)
                .map_err(|e| FetchError::InvalidLocation(format!("{location}: {e}")))
        })
        .collect()
}

/// The first location tried for a unit.
pub fn artifact_location(
    provider: &ProviderDescriptor,
    unit: &str,
    version: Option<&str>,
) -> Result<Url, FetchError> {
    artifact_locations(provider, unit, version)?
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::InvalidLocation(format!("no location for {unit}")))
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Artifact>, FetchError>>>;

struct Flight {
    id: u64,
    version: Option<String>,
    shared: SharedFetch,
}

type FlightMap = Arc<Mutex<HashMap<(String, String), Flight>>>;

/// Removes its flight from the map when the fetch task ends, including by
/// panic.
struct FlightGuard {
    flights: FlightMap,
    key: (String, String),
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if flights.get(&self.key).is_some_and(|f| f.id == self.id) {
            flights.remove(&self.key);
        }
    }
}

enum Attach {
    /// Same request in flight: share its outcome.
    Join(SharedFetch),
    /// Another version in flight: wait for it, then try again.
    Wait(SharedFetch),
}

/// Retrieves and decodes artifacts, one fetch per `(provider, unit)` at a time.
///
/// Each fetch runs in its own task. Concurrent callers for the same provider,
/// unit and version attach to the running fetch and all receive its outcome;
/// dropping a caller never cancels the fetch. Candidate locations are tried in
/// order, moving on only when one is not found.
pub struct FetchCoordinator<T> {
    transport: Arc<T>,
    retry: RetryPolicy,
    flights: FlightMap,
    next_id: AtomicU64,
}

impl<T: Transport> FetchCoordinator<T> {
    pub fn new(transport: Arc<T>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Number of fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    /// Fetch and decode the unit's container. The result is not verified.
    pub async fn fetch(
        &self,
        provider: &ProviderDescriptor,
        unit: &str,
        version: Option<&str>,
    ) -> Result<Arc<Artifact>, FetchError> {
        let key = (provider.name.clone(), unit.to_string());
        loop {
            let attach = {
                let mut flights = self.flights.lock();
                match flights.get(&key) {
                    Some(flight) if flight.version.as_deref() == version => {
                        Attach::Join(flight.shared.clone())
                    }
                    Some(flight) => Attach::Wait(flight.shared.clone()),
                    None => {
                        let locations = artifact_locations(provider, unit, version)?;
                        let scope = HostScope::for_provider(provider);
                        let shared =
                            self.launch(&mut flights, key.clone(), version, locations, scope);
                        Attach::Join(shared)
                    }
                }
            };

            match attach {
                Attach::Join(shared) => return shared.await,
                Attach::Wait(shared) => {
                    debug!(
                        provider = %key.0,
                        unit = %key.1,
                        "Waiting for fetch of another version to finish"
                    );
                    let _ = shared.await;
                }
            }
        }
    }

    fn launch(
        &self,
        flights: &mut HashMap<(String, String), Flight>,
        key: (String, String),
        version: Option<&str>,
        locations: Vec<Url>,
        scope: HostScope,
    ) -> SharedFetch {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::clone(&self.transport);
        let retry = self.retry;
        let guard = FlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.clone(),
            id,
        };

        info!(provider = %key.0, unit = %key.1, candidates = locations.len(), "Fetching");
        let handle = tokio::spawn(async move {
            let _guard = guard;
            retrieve_first(transport.as_ref(), &locations, scope, &retry).await
        });

        let shared = handle
            .map(|joined| joined.unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string()))))
            .boxed()
            .shared();

        flights.insert(
            key,
            Flight {
                id,
                version: version.map(str::to_string),
                shared: shared.clone(),
            },
        );
        shared
    }
}

/// Try each location in turn. Only a not-found moves on to the next; the
/// primary location's error is reported when none has the unit.
async fn retrieve_first<T: Transport>(
    transport: &T,
    locations: &[Url],
    scope: HostScope,
    retry: &RetryPolicy,
) -> Result<Arc<Artifact>, FetchError> {
    let mut missing = None;
    for location in locations {
        match retrieve_with_retry(transport, location, scope, retry).await {
            Ok(bytes) => return decode(location, &bytes),
            Err(e) if e.is_not_found() => {
                debug!(location = %location, "Not found, trying next location");
                missing.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(missing.unwrap_or_else(|| FetchError::InvalidLocation("no candidate locations".into())))
}

async fn retrieve_with_retry<T: Transport>(
    transport: &T,
    location: &Url,
    scope: HostScope,
    retry: &RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let retrieval = transport.retrieve(location, scope);
        let result = match tokio::time::timeout(retry.attempt_timeout(), retrieval).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::transient(format!(
                "attempt timed out after {:?}",
                retry.attempt_timeout()
            ))),
        };

        match result {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    location = %location,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient transport failure, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(FetchError::Transport {
                    location: location.to_string(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

fn decode(location: &Url, bytes: &[u8]) -> Result<Arc<Artifact>, FetchError> {
    container::decode(bytes)
        .map(Arc::new)
        .map_err(|e| FetchError::malformed(location.as_str(), e.to_string()))
}
