//! The on-disk artifact store.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use pkgsys_manifest::{Artifact, ContentDigest, container};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{CacheEntry, CacheError, CacheKey};

const EXTENSION: &str = "pkg";

/// Thread-safe handle to a cache directory. Clones share state.
#[derive(Clone)]
pub struct CacheStore {
    shared: Arc<Shared>,
}

struct Shared {
    dir: PathBuf,
    budget: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// (provider, unit, version) -> key
    versions: HashMap<(String, String, String), CacheKey>,
    /// (provider, unit) -> key of the last unpinned resolution
    latest: HashMap<(String, String), (CacheKey, Instant)>,
    total_bytes: u64,
    clock: u64,
    next_serial: u64,
}

/// A pin on a cache entry, holding its artifact in memory.
///
/// A pinned entry is never evicted. Dropping the lease unpins it and gives
/// eviction another chance to bring the store under budget.
pub struct CacheLease {
    shared: Arc<Shared>,
    key: CacheKey,
    serial: u64,
    artifact: Arc<Artifact>,
}

impl CacheLease {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn artifact(&self) -> &Arc<Artifact> {
        &self.artifact
    }
}

impl fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLease")
            .field("key", &self.key)
            .field("digest", &self.artifact.digest)
            .finish()
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.shared.release(self.key, self.serial);
    }
}

impl CacheStore {
    /// Open (or create) a cache directory, adopting entries written earlier.
    ///
    /// Files that fail to decode or verify are deleted.
    pub fn open(dir: impl Into<PathBuf>, budget: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::write(&dir, e))?;

        let mut found = Vec::new();
        for dir_entry in fs::read_dir(&dir).map_err(|e| CacheError::read(&dir, e))? {
            let dir_entry = dir_entry.map_err(|e| CacheError::read(&dir, e))?;
            let path = dir_entry.path();
            if path.extension() != Some(OsStr::new(EXTENSION)) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(OsStr::to_str)
                .and_then(|stem| stem.parse::<CacheKey>().ok())
            else {
                continue;
            };

            match read_artifact(&path) {
                Ok((artifact, size)) => {
                    let modified = dir_entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((modified, key, artifact, size));
                }
                Err(reason) => {
                    warn!(path = %path.display(), "Discarding unreadable cache file: {}", reason);
                    remove_file(&path);
                }
            }
        }
        // Oldest first, so the logical clock reflects file age.
        found.sort_by_key(|(modified, ..)| *modified);

        let shared = Arc::new(Shared {
            dir,
            budget,
            inner: Mutex::new(Inner::default()),
        });
        {
            let mut inner = shared.inner.lock();
            for (_, key, artifact, size) in found {
                inner.insert(key, &artifact, size, 0);
            }
            let victims = inner.evict(budget);
            shared.remove_files(&victims);
            info!(
                "Opened cache at {} with {} entries ({} bytes)",
                shared.dir.display(),
                inner.entries.len(),
                inner.total_bytes
            );
        }

        Ok(Self { shared })
    }

    /// Look up and pin an entry, re-verifying its digest.
    ///
    /// Returns `Ok(None)` on a miss. A corrupted entry is evicted and reported
    /// once as [`CacheError::Corrupted`]; the next `get` is a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheLease>, CacheError> {
        let (serial, digest) = {
            let mut inner = self.shared.inner.lock();
            let tick = inner.tick();
            let Some(entry) = inner.entries.get_mut(key) else {
                debug!(key = %key, "Cache miss");
                return Ok(None);
            };
            entry.pins += 1;
            entry.last_access = tick;
            (entry.serial, entry.digest)
        };

        let path = self.shared.path_for(key);
        let checked = read_artifact(&path).and_then(|(artifact, _)| {
            if artifact.digest == digest {
                Ok(artifact)
            } else {
                Err(format!(
                    "stored digest {} differs from indexed digest {digest}",
                    artifact.digest
                ))
            }
        });

        match checked {
            Ok(artifact) => {
                debug!(key = %key, digest = %digest, "Cache hit");
                Ok(Some(CacheLease {
                    shared: Arc::clone(&self.shared),
                    key: *key,
                    serial,
                    artifact: Arc::new(artifact),
                }))
            }
            Err(reason) => {
                let mut inner = self.shared.inner.lock();
                if inner.entries.get(key).is_some_and(|e| e.serial == serial) {
                    inner.remove(key);
                    remove_file(&path);
                    warn!(key = %key, "Evicted corrupted cache entry: {}", reason);
                    Err(CacheError::corrupted(key.to_hex(), reason))
                } else {
                    // Cleared or replaced while we were reading.
                    Ok(None)
                }
            }
        }
    }

    /// Store a verified artifact and pin it.
    ///
    /// Idempotent: keys are derived from the digest, so an existing entry
    /// under `key` already holds identical content and is pinned as is.
    pub fn put(&self, key: CacheKey, artifact: Arc<Artifact>) -> Result<CacheLease, CacheError> {
        if let Some(lease) = self.pin_existing(key, &artifact) {
            debug!(key = %key, "Artifact already cached");
            return Ok(lease);
        }

        let bytes = container::encode(&artifact).map_err(|e| CacheError::Encode(e.to_string()))?;
        let path = self.shared.path_for(&key);
        self.shared.write_atomic(&path, &bytes)?;

        let mut inner = self.shared.inner.lock();
        let tick = inner.tick();
        if let Some(entry) = inner.entries.get_mut(&key) {
            // A concurrent put of the same key won the race.
            entry.pins += 1;
            entry.last_access = tick;
            return Ok(CacheLease {
                shared: Arc::clone(&self.shared),
                key,
                serial: entry.serial,
                artifact,
            });
        }

        let serial = inner.insert(key, &artifact, bytes.len() as u64, 1);
        let victims = inner.evict(self.shared.budget);
        self.shared.remove_files(&victims);
        info!(
            key = %key,
            provider = %artifact.manifest.provider,
            unit = %artifact.manifest.name,
            version = %artifact.manifest.version,
            bytes = bytes.len(),
            "Cached artifact"
        );

        Ok(CacheLease {
            shared: Arc::clone(&self.shared),
            key,
            serial,
            artifact,
        })
    }

    fn pin_existing(&self, key: CacheKey, artifact: &Arc<Artifact>) -> Option<CacheLease> {
        let mut inner = self.shared.inner.lock();
        let tick = inner.tick();
        let entry = inner.entries.get_mut(&key)?;
        entry.pins += 1;
        entry.last_access = tick;
        Some(CacheLease {
            shared: Arc::clone(&self.shared),
            key,
            serial: entry.serial,
            artifact: Arc::clone(artifact),
        })
    }

    /// Remove every entry. Outstanding leases keep their artifacts; releasing
    /// them afterwards has no effect.
    pub fn clear(&self) -> usize {
        let mut inner = self.shared.inner.lock();
        let keys: Vec<CacheKey> = inner.entries.keys().copied().collect();
        let (clock, next_serial) = (inner.clock, inner.next_serial);
        *inner = Inner {
            clock,
            next_serial,
            ..Inner::default()
        };
        self.shared.remove_files(&keys);
        info!("Cleared {} cache entries", keys.len());
        keys.len()
    }

    /// Key of a cached artifact for a pinned version.
    pub fn lookup_version(&self, provider: &str, unit: &str, version: &str) -> Option<CacheKey> {
        self.shared
            .inner
            .lock()
            .versions
            .get(&(provider.to_string(), unit.to_string(), version.to_string()))
            .copied()
    }

    /// Remember `key` as the most recent unpinned resolution of a unit.
    pub fn record_latest(&self, provider: &str, unit: &str, key: CacheKey) {
        let mut inner = self.shared.inner.lock();
        if inner.entries.contains_key(&key) {
            inner
                .latest
                .insert((provider.to_string(), unit.to_string()), (key, Instant::now()));
        }
    }

    /// The last unpinned resolution of a unit, if recorded within `max_age`
    /// and still cached.
    pub fn lookup_latest(&self, provider: &str, unit: &str, max_age: Duration) -> Option<CacheKey> {
        let inner = self.shared.inner.lock();
        let (key, recorded) = inner
            .latest
            .get(&(provider.to_string(), unit.to_string()))?;
        (recorded.elapsed() <= max_age && inner.entries.contains_key(key)).then_some(*key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shared.inner.lock().entries.contains_key(key)
    }

    /// Snapshot of an entry's bookkeeping.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.shared.inner.lock().entries.get(key).cloned()
    }

    pub fn pin_count(&self, key: &CacheKey) -> usize {
        self.shared
            .inner
            .lock()
            .entries
            .get(key)
            .map_or(0, |e| e.pins)
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.shared.inner.lock().total_bytes
    }

    pub fn budget(&self) -> u64 {
        self.shared.budget
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Location of an entry's container file.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.shared.path_for(key)
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("dir", &self.shared.dir)
            .field("budget", &self.shared.budget)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{EXTENSION}"))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| CacheError::write(path, e))?;
        tmp.write_all(bytes)
            .and_then(|()| tmp.flush())
            .map_err(|e| CacheError::write(path, e))?;
        tmp.persist(path)
            .map_err(|e| CacheError::write(path, e.error))?;
        Ok(())
    }

    fn remove_files(&self, keys: &[CacheKey]) {
        for key in keys {
            remove_file(&self.path_for(key));
        }
    }

    fn release(&self, key: CacheKey, serial: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&key) else {
            return;
        };
        if entry.serial != serial {
            return;
        }
        entry.pins = entry.pins.saturating_sub(1);
        if entry.pins == 0 {
            let victims = inner.evict(self.budget);
            self.remove_files(&victims);
        }
    }
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, key: CacheKey, artifact: &Artifact, size: u64, pins: usize) -> u64 {
        let tick = self.tick();
        let serial = self.next_serial;
        self.next_serial += 1;

        let manifest = &artifact.manifest;
        self.versions.insert(
            (
                manifest.provider.clone(),
                manifest.name.clone(),
                manifest.version.clone(),
            ),
            key,
        );
        self.total_bytes += size;
        self.entries.insert(
            key,
            CacheEntry {
                key,
                digest: artifact.digest,
                provider: manifest.provider.clone(),
                unit: manifest.name.clone(),
                version: manifest.version.clone(),
                size,
                last_access: tick,
                pins,
                serial,
            },
        );
        serial
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        self.versions.retain(|_, k| k != key);
        self.latest.retain(|_, (k, _)| k != key);
        Some(entry)
    }

    /// Evict least recently used, unpinned entries until under `budget`.
    fn evict(&mut self, budget: u64) -> Vec<CacheKey> {
        let mut victims = Vec::new();
        while self.total_bytes > budget {
            let Some(key) = self
                .entries
                .values()
                .filter(|e| !e.is_pinned())
                .min_by_key(|e| e.last_access)
                .map(|e| e.key)
            else {
                break;
            };
            if let Some(entry) = self.remove(&key) {
                debug!(key = %key, unit = %entry.unit, bytes = entry.size, "Evicted cache entry");
            }
            victims.push(key);
        }
        victims
    }
}

/// Read, decode and self-check a container file.
fn read_artifact(path: &Path) -> Result<(Artifact, u64), String> {
    let bytes = fs::read(path).map_err(|e| format!("read failed: {e}"))?;
    let artifact = container::decode(&bytes).map_err(|e| e.to_string())?;
    let actual: ContentDigest = artifact.computed_digest();
    if actual != artifact.digest {
        return Err(format!(
            "digest mismatch: expected {}, actual {actual}",
            artifact.digest
        ));
    }
    Ok((artifact, bytes.len() as u64))
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to remove cache file: {}", e);
        }
    }
}
