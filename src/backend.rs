//! The segment-addressed cache backend contract (`spec.md` §6).
//!
//! This is the engine's sole external collaborator: storage, wire encoding
//! and liveness are all the embedding application's concern. The engine
//! only ever calls through this trait.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::BackendError;

/// A value as returned by a backend `get`.
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    /// The cached value.
    pub item: V,
    /// Epoch-ms timestamp the entry was written.
    pub stored: i64,
    /// Remaining lifetime of the entry, in milliseconds, as of this read.
    pub ttl: u64,
}

/// Segment-addressed cache storage.
///
/// Implementations must serialize their own per-key operations; the engine
/// assumes at most one outstanding `get` per id (`spec.md` §3 invariant 1)
/// but does not itself lock across backend calls.
#[async_trait]
pub trait CacheBackend<V>: Send + Sync {
    /// Reads the entry stored for `id` within `segment`, if any.
    async fn get(&self, segment: &str, id: &str) -> Result<Option<CachedEntry<V>>, BackendError>;

    /// Writes `value` for `id` within `segment` with the given ttl.
    async fn set(&self, segment: &str, id: &str, value: V, ttl: Duration) -> Result<(), BackendError>;

    /// Removes the entry for `id` within `segment`, if any.
    async fn drop(&self, segment: &str, id: &str) -> Result<(), BackendError>;

    /// Validates a segment name, called once at [`crate::policy::Policy`]
    /// construction.
    fn validate_segment_name(&self, name: &str) -> Result<(), BackendError>;

    /// Liveness probe backing [`crate::policy::Policy::is_ready`].
    async fn is_ready(&self) -> bool;
}
