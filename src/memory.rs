//! A reference in-memory [`CacheBackend`] implementation, used by the
//! demo binary and the integration tests. Storage itself is out of scope
//! for the policy engine (`spec.md` §1); this is the minimal concrete
//! implementation needed to run and test the engine standalone, the way
//! the teacher crate ships its own file-backed `Cache`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{CacheBackend, CachedEntry};
use crate::error::BackendError;
use crate::ttl::epoch_ms_now;

struct Slot<V> {
    item: V,
    stored: i64,
    ttl_ms: u64,
}

/// A process-local, segment-namespaced in-memory cache.
///
/// TTL-aware on read: an entry whose `ttl_ms` has elapsed since `stored` is
/// treated as absent and evicted, matching what a real backend would do.
#[derive(Default)]
pub struct InMemoryBackend<V> {
    segments: Mutex<HashMap<(String, String), Slot<V>>>,
}

impl<V> InMemoryBackend<V> {
    pub fn new() -> Self {
        Self { segments: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl<V> CacheBackend<V> for InMemoryBackend<V>
where
    V: Clone + Send + Sync,
{
    async fn get(&self, segment: &str, id: &str) -> Result<Option<CachedEntry<V>>, BackendError> {
        let mut map = self.segments.lock().expect("in-memory backend mutex poisoned");
        let key = (segment.to_string(), id.to_string());
        let Some(slot) = map.get(&key) else { return Ok(None) };

        let now = epoch_ms_now();
        let elapsed = (now - slot.stored).max(0) as u64;
        if elapsed >= slot.ttl_ms {
            map.remove(&key);
            return Ok(None);
        }

        Ok(Some(CachedEntry {
            item: slot.item.clone(),
            stored: slot.stored,
            ttl: slot.ttl_ms - elapsed,
        }))
    }

    async fn set(&self, segment: &str, id: &str, value: V, ttl: Duration) -> Result<(), BackendError> {
        let mut map = self.segments.lock().expect("in-memory backend mutex poisoned");
        map.insert(
            (segment.to_string(), id.to_string()),
            Slot { item: value, stored: epoch_ms_now(), ttl_ms: ttl.as_millis() as u64 },
        );
        Ok(())
    }

    async fn drop(&self, segment: &str, id: &str) -> Result<(), BackendError> {
        let mut map = self.segments.lock().expect("in-memory backend mutex poisoned");
        map.remove(&(segment.to_string(), id.to_string()));
        Ok(())
    }

    fn validate_segment_name(&self, name: &str) -> Result<(), BackendError> {
        if name.is_empty() || name.contains('\0') {
            return Err(BackendError::new(format!("invalid segment name: {name:?}")));
        }
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }
}
