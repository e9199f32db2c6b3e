//! Counters and audit log for resolutions.
//!
//! Append-only: components record into the sink, nothing reads back from it
//! except snapshots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;

/// Terminal outcome of one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Loaded from a freshly fetched artifact.
    Loaded,
    /// Loaded from the cache without contacting the provider.
    CacheHit,
    SecurityRejection,
    FetchFailure,
    /// Verified artifact failed to load, including manifest mismatches.
    LoadFailure,
    InvalidRequest,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Loaded | Self::CacheHit)
    }
}

/// One audit record, written for every terminal transition.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: SystemTime,
    /// The request as the caller wrote it.
    pub request: String,
    pub outcome: Outcome,
    /// Digest of the artifact involved, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Error message for failed outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration: Duration,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub resolutions_total: u64,
    pub successes: u64,
    pub cache_hits: u64,
    pub downloads: u64,
    pub fetch_failures: u64,
    pub security_rejections: u64,
    pub load_failures: u64,
    pub cache_corruptions: u64,
    pub invalid_requests: u64,
    /// Audit events dropped because the log was full.
    pub audit_dropped: u64,
    pub total_resolution_time: Duration,
    pub uptime: Duration,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl MetricsSnapshot {
    /// Cache hits as a percentage of hits plus downloads.
    pub fn cache_hit_rate(&self) -> f64 {
        percent(self.cache_hits, self.cache_hits + self.downloads)
    }

    pub fn success_rate(&self) -> f64 {
        percent(self.successes, self.resolutions_total)
    }

    pub fn security_rejection_rate(&self) -> f64 {
        percent(self.security_rejections, self.resolutions_total)
    }

    pub fn average_resolution_ms(&self) -> f64 {
        if self.resolutions_total == 0 {
            0.0
        } else {
            self.total_resolution_time.as_secs_f64() * 1000.0 / self.resolutions_total as f64
        }
    }
}

/// Thread-safe metrics and audit sink.
#[derive(Debug)]
pub struct MetricsSink {
    resolutions_total: AtomicU64,
    successes: AtomicU64,
    cache_hits: AtomicU64,
    downloads: AtomicU64,
    fetch_failures: AtomicU64,
    security_rejections: AtomicU64,
    load_failures: AtomicU64,
    cache_corruptions: AtomicU64,
    invalid_requests: AtomicU64,
    total_nanos: AtomicU64,
    audit: Mutex<VecDeque<AuditEvent>>,
    audit_capacity: usize,
    audit_dropped: AtomicU64,
    started: Instant,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MetricsSink {
    pub fn new(audit_capacity: usize) -> Self {
        Self {
            resolutions_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            security_rejections: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            cache_corruptions: AtomicU64::new(0),
            invalid_requests: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            audit: Mutex::new(VecDeque::with_capacity(audit_capacity.min(1024))),
            audit_capacity,
            audit_dropped: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record a terminal transition. Call exactly once per resolution.
    pub fn record(&self, event: AuditEvent) {
        self.resolutions_total.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(event.duration.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);

        let counter = match event.outcome {
            Outcome::Loaded => None,
            Outcome::CacheHit => Some(&self.cache_hits),
            Outcome::SecurityRejection => Some(&self.security_rejections),
            Outcome::FetchFailure => Some(&self.fetch_failures),
            Outcome::LoadFailure => Some(&self.load_failures),
            Outcome::InvalidRequest => Some(&self.invalid_requests),
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if event.outcome.is_success() {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }

        if self.audit_capacity == 0 {
            self.audit_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut audit = self.audit.lock();
        if audit.len() >= self.audit_capacity {
            audit.pop_front();
            self.audit_dropped.fetch_add(1, Ordering::Relaxed);
        }
        audit.push_back(event);
    }

    /// Count a completed transport download.
    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a cache entry found corrupted and evicted.
    pub fn record_cache_corruption(&self) {
        self.cache_corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            resolutions_total: self.resolutions_total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            security_rejections: self.security_rejections.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            cache_corruptions: self.cache_corruptions.load(Ordering::Relaxed),
            invalid_requests: self.invalid_requests.load(Ordering::Relaxed),
            audit_dropped: self.audit_dropped.load(Ordering::Relaxed),
            total_resolution_time: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
            uptime: self.started.elapsed(),
        }
    }

    /// Audit events, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.audit.lock().iter().cloned().collect()
    }
}
