//! Cache entry metadata.

use pkgsys_manifest::ContentDigest;

use crate::CacheKey;

/// Bookkeeping for one stored artifact. The artifact itself lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub digest: ContentDigest,
    pub provider: String,
    pub unit: String,
    pub version: String,
    /// Size of the stored container in bytes.
    pub size: u64,
    /// Logical clock value of the last access; larger is more recent.
    pub last_access: u64,
    /// Outstanding leases.
    pub pins: usize,
    /// Unique per insertion, so leases from a replaced entry cannot unpin
    /// its successor.
    pub(crate) serial: u64,
}

impl CacheEntry {
    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}
