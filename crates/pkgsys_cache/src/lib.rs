//! # pkgsys_cache
//!
//! Content-addressed, persistent cache of verified artifacts.
//!
//! Entries live in one directory as `<key>.pkg` container files. Every read
//! decodes the file and recomputes the digest; a mismatch evicts the entry and
//! reports [`CacheError::Corrupted`]. Total size is bounded by a byte budget
//! enforced with LRU eviction that never touches entries pinned by a
//! [`CacheLease`].

mod entry;
mod error;
mod key;
mod store;

pub use entry::CacheEntry;
pub use error::CacheError;
pub use key::CacheKey;
pub use store::{CacheLease, CacheStore};
