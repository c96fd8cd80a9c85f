//! Statistics counters and the per-`get` diagnostic report.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters tracked by a [`crate::policy::Policy`].
///
/// See `spec.md` §3 ("Stats") and the invariants in §3/§8 that pin down
/// exactly when each counter increments.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) sets: AtomicU64,
    pub(crate) gets: AtomicU64,
    pub(crate) hits: AtomicU64,
    pub(crate) stales: AtomicU64,
    pub(crate) generates: AtomicU64,
    pub(crate) errors: AtomicU64,
}

impl Stats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sets: self.sets.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            stales: self.stales.load(Ordering::Relaxed),
            generates: self.generates.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr_sets(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_gets(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn add_hits(&self, n: u64) {
        if n > 0 {
            self.hits.fetch_add(n, Ordering::Relaxed);
        }
    }
    pub(crate) fn incr_stales(&self) {
        self.stales.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_generates(&self) {
        self.generates.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// A read-only, point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sets: u64,
    pub gets: u64,
    pub hits: u64,
    pub stales: u64,
    pub generates: u64,
    pub errors: u64,
}

/// Diagnostic record delivered alongside every `get` resolution.
///
/// Mirrors `spec.md` §6's report shape exactly: `{msec, error, stored?,
/// ttl?, isStale?}`.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Wall-clock time spent on the backend `get` that started this
    /// resolution, in milliseconds.
    pub msec: f64,
    /// Stringified backend read error, if the backend `get` failed.
    pub error: Option<String>,
    /// Epoch-ms timestamp the observed entry was stored, if one existed.
    pub stored: Option<i64>,
    /// Remaining ttl of the observed entry at read time, if one existed.
    pub ttl: Option<u64>,
    /// Whether the observed entry was stale, if one existed.
    pub is_stale: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = Stats::default();
        stats.incr_gets();
        stats.incr_gets();
        stats.add_hits(3);
        stats.incr_stales();
        stats.incr_generates();
        stats.incr_errors();
        stats.incr_sets();

        let snap = stats.snapshot();
        assert_eq!(snap.gets, 2);
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.stales, 1);
        assert_eq!(snap.generates, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.sets, 1);
    }

    #[test]
    fn add_hits_zero_is_noop() {
        let stats = Stats::default();
        stats.add_hits(0);
        assert_eq!(stats.snapshot().hits, 0);
    }
}
