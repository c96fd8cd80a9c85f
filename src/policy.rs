//! The `Policy` type: request coalescer + generation coordinator
//! (`spec.md` §4.3/§4.4) wired up behind the public surface from §6.
//!
//! Concurrency model: a single `tokio::sync::Mutex<PolicyState<V>>` plays
//! the role of the per-Policy serializing primitive called for in `spec.md`
//! §5 ("an actor loop or a mutex held across table mutations ... but
//! released across backend/producer calls and timer waits"). The Rule
//! itself lives in an `ArcSwap` so `rules()` can replace it without taking
//! that lock at all.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::FutureExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::backend::{CacheBackend, CachedEntry};
use crate::error::PolicyError;
use crate::key::Key;
use crate::rule::{self, GenerateOutcome, GenerateTimeout, Rule, RuleOptions};
use crate::stats::{Report, Stats, StatsSnapshot};
use crate::ttl::{epoch_ms_now, is_stale, ttl_for_rule};

/// The four-way result delivered to every `get` caller: value, the cached
/// entry backing it (if any survives), and the diagnostic [`Report`] —
/// matching `spec.md` §6's `(err, value, cached, report)` callback shape,
/// with `err` folded in as a field since several paths deliver both a value
/// *and* an error (e.g. a surfaced generator error alongside a served-stale
/// value).
pub struct GetOutcome<V> {
    pub error: Option<PolicyError>,
    pub value: Option<V>,
    pub cached: Option<CachedEntry<V>>,
    pub report: Report,
}

impl<V: Clone> Clone for GetOutcome<V> {
    fn clone(&self) -> Self {
        Self {
            error: self.error.clone(),
            value: self.value.clone(),
            cached: self.cached.clone(),
            report: self.report.clone(),
        }
    }
}

impl<V> fmt::Debug for GetOutcome<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOutcome")
            .field("error", &self.error)
            .field("has_value", &self.value.is_some())
            .field("has_cached", &self.cached.is_some())
            .field("report", &self.report)
            .finish()
    }
}

struct PendingEntry<V> {
    waiters: Vec<oneshot::Sender<GetOutcome<V>>>,
    resolved: Arc<AtomicBool>,
}

#[derive(Default)]
struct PolicyState<V> {
    pendings: HashMap<String, PendingEntry<V>>,
    pending_generate: HashMap<String, ()>,
}

struct Inner<V, C> {
    rule: ArcSwap<Rule<V, C>>,
    backend: Option<Arc<dyn CacheBackend<V>>>,
    segment: String,
    state: Mutex<PolicyState<V>>,
    stats: Stats,
}

/// Coordination layer between callers and a pluggable cache backend.
///
/// Cheaply cloneable (`Arc`-backed); clones share the same Pendings table,
/// PendingGenerate table, Rule, and Stats.
pub struct Policy<V, C = ()> {
    inner: Arc<Inner<V, C>>,
}

impl<V, C> Clone for Policy<V, C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V, C> Policy<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    /// Constructs a new Policy over `options`, an optional cache backend,
    /// and a segment name that namespaces this policy's ids inside it.
    ///
    /// The backend's `validateSegmentName` probe is consulted once here,
    /// per `spec.md` §6.
    pub fn new(
        options: RuleOptions<V, C>,
        backend: Option<Arc<dyn CacheBackend<V>>>,
        segment: impl Into<String>,
    ) -> Result<Self, PolicyError> {
        let segment = segment.into();
        if let Some(backend) = &backend {
            backend.validate_segment_name(&segment)?;
        }
        let compiled = rule::compile(options, backend.is_some())?;
        Ok(Self {
            inner: Arc::new(Inner {
                rule: ArcSwap::from_pointee(compiled),
                backend,
                segment,
                state: Mutex::new(PolicyState::default()),
                stats: Stats::default(),
            }),
        })
    }

    /// Atomically replaces the compiled Rule (`spec.md` §3 invariant 6).
    pub fn rules(&self, options: RuleOptions<V, C>) -> Result<(), PolicyError> {
        let compiled = rule::compile(options, self.inner.backend.is_some())?;
        self.inner.rule.store(Arc::new(compiled));
        Ok(())
    }

    /// A read-only snapshot of the six counters in `spec.md` §3.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Public wrapper over the TTL calculator (`spec.md` §4.5).
    pub fn ttl(&self, created: i64) -> u64 {
        let rule = self.inner.rule.load();
        ttl_for_rule(&rule, created, epoch_ms_now())
    }

    /// `false` if no backend is configured; otherwise delegates to the
    /// backend's liveness probe.
    pub async fn is_ready(&self) -> bool {
        match &self.inner.backend {
            Some(backend) => backend.is_ready().await,
            None => false,
        }
    }

    /// `spec.md` §4.5: increments `stats.sets`; substitutes the Rule's
    /// default ttl when `ttl` is absent or zero.
    pub async fn set(&self, key: Key<C>, value: V, ttl: Option<Duration>) -> Result<(), PolicyError> {
        self.inner.stats.incr_sets();
        let Some(backend) = &self.inner.backend else { return Ok(()) };

        let ttl = match ttl {
            Some(t) if !t.is_zero() => t,
            _ => {
                let rule = self.inner.rule.load();
                let now = epoch_ms_now();
                Duration::from_millis(ttl_for_rule(&rule, now, now))
            }
        };

        backend.set(&self.inner.segment, key.id(), value, ttl).await.map_err(|e| {
            self.inner.stats.incr_errors();
            PolicyError::from(e)
        })
    }

    /// `spec.md` §4.5: fails with [`PolicyError::InvalidKey`] for an empty
    /// id, otherwise passes through to the backend.
    pub async fn drop(&self, key: Key<C>) -> Result<(), PolicyError> {
        if key.id().is_empty() {
            return Err(PolicyError::InvalidKey);
        }
        let Some(backend) = &self.inner.backend else { return Ok(()) };
        backend.drop(&self.inner.segment, key.id()).await.map_err(|e| {
            self.inner.stats.incr_errors();
            PolicyError::from(e)
        })
    }

    /// `spec.md` §4.3/§4.4: the single-flight, stale-while-revalidate get.
    ///
    /// The first caller for an id starts a generation cycle in the
    /// background (a deferred tick, matching "delivery occurs on a
    /// deferred tick, not inline with get"); every caller, first or not,
    /// awaits its own oneshot slot in FIFO attachment order.
    pub async fn get(&self, key: Key<C>) -> GetOutcome<V> {
        self.inner.stats.incr_gets();
        let id = key.id().to_string();
        let (tx, rx) = oneshot::channel();

        // `token` identifies this particular generation cycle: it is the
        // `resolved` flag of the `PendingEntry` this caller just created (or
        // `None` if it attached to one already in flight). Threading it
        // through to `deliver_final` lets that function tell "my cycle's
        // entry is still the one in the table" apart from "a newer cycle for
        // this id has already replaced it" (spec.md §9's per-get
        // coordination record, scoped to the cycle rather than re-looked-up
        // by id).
        let token = {
            let mut state = self.inner.state.lock().await;
            match state.pendings.get_mut(&id) {
                Some(entry) => {
                    entry.waiters.push(tx);
                    None
                }
                None => {
                    let resolved = Arc::new(AtomicBool::new(false));
                    state
                        .pendings
                        .insert(id.clone(), PendingEntry { waiters: vec![tx], resolved: Arc::clone(&resolved) });
                    Some(resolved)
                }
            }
        };

        if let Some(token) = token {
            let policy = self.clone();
            let cycle_key = key.clone();
            tokio::spawn(async move {
                policy.run_generation_cycle(id, cycle_key, token).await;
            });
        }

        rx.await.unwrap_or_else(|_| GetOutcome {
            error: Some(PolicyError::Generate("waiter channel dropped before resolution".into())),
            value: None,
            cached: None,
            report: Report::default(),
        })
    }

    async fn run_generation_cycle(&self, id: String, key: Key<C>, token: Arc<AtomicBool>) {
        let rule = self.inner.rule.load_full();
        let started = Instant::now();

        let backend_result = match &self.inner.backend {
            Some(backend) => backend.get(&self.inner.segment, &id).await,
            None => Ok(None),
        };
        let msec = started.elapsed().as_secs_f64() * 1000.0;

        match backend_result {
            Err(err) => {
                self.inner.stats.incr_errors();
                warn!(id = %id, error = %err, "cache backend read failed");
                let report = Report { msec, error: Some(err.to_string()), stored: None, ttl: None, is_stale: None };
                if rule.generate_func.is_none() || !rule.generate_on_read_error {
                    self.deliver_final(
                        &id,
                        &token,
                        false,
                        GetOutcome { error: Some(PolicyError::from(err)), value: None, cached: None, report },
                    )
                    .await;
                    return;
                }
                self.enter_generation(id, key, rule, None, report, token).await;
            }
            Ok(Some(entry)) => {
                let now = epoch_ms_now();
                let stale = is_stale(&rule, entry.stored, entry.ttl, now);
                let report =
                    Report { msec, error: None, stored: Some(entry.stored), ttl: Some(entry.ttl), is_stale: Some(stale) };

                if !stale {
                    debug!(id = %id, "fresh cache hit");
                    self.deliver_final(
                        &id,
                        &token,
                        true,
                        GetOutcome { error: None, value: Some(entry.item.clone()), cached: Some(entry), report },
                    )
                    .await;
                    return;
                }

                self.inner.stats.incr_stales();
                debug!(id = %id, "stale cache hit, starting stale-while-revalidate");
                self.enter_generation(id, key, rule, Some(entry), report, token).await;
            }
            Ok(None) => {
                let report = Report { msec, error: None, stored: None, ttl: None, is_stale: None };
                self.enter_generation(id, key, rule, None, report, token).await;
            }
        }
    }

    /// `spec.md` §4.4: the miss/stale generation path — stale fallback or
    /// miss timeout, single-flight generator invocation, and handoff to
    /// [`Self::finalize_generation`].
    async fn enter_generation(
        &self,
        id: String,
        key: Key<C>,
        rule: Arc<Rule<V, C>>,
        cached: Option<CachedEntry<V>>,
        report: Report,
        token: Arc<AtomicBool>,
    ) {
        let observed_entry = cached.is_some();

        let Some(generate_func) = rule.generate_func.clone() else {
            let value = cached.as_ref().map(|c| c.item.clone());
            self.deliver_final(&id, &token, observed_entry, GetOutcome { error: None, value, cached, report }).await;
            return;
        };

        if let Some(entry) = &cached {
            if let Some(stale_timeout) = rule.stale_timeout {
                let remaining_after = entry.ttl.saturating_sub(stale_timeout.as_millis() as u64);
                if remaining_after > 0 {
                    let policy = self.clone();
                    let fallback_id = id.clone();
                    let fallback_entry = entry.clone();
                    let fallback_report = report.clone();
                    let fallback_token = Arc::clone(&token);
                    tokio::spawn(async move {
                        tokio::time::sleep(stale_timeout).await;
                        policy
                            .deliver_final(
                                &fallback_id,
                                &fallback_token,
                                true,
                                GetOutcome {
                                    error: None,
                                    value: Some(fallback_entry.item.clone()),
                                    cached: Some(fallback_entry),
                                    report: fallback_report,
                                },
                            )
                            .await;
                    });
                }
            }
        } else if let Some(GenerateTimeout::Millis(generate_timeout)) = rule.generate_timeout {
            let policy = self.clone();
            let timeout_id = id.clone();
            let timeout_report = report.clone();
            let timeout_token = Arc::clone(&token);
            tokio::spawn(async move {
                tokio::time::sleep(generate_timeout).await;
                policy
                    .deliver_final(
                        &timeout_id,
                        &timeout_token,
                        false,
                        GetOutcome {
                            error: Some(PolicyError::ServerTimeout),
                            value: None,
                            cached: None,
                            report: timeout_report,
                        },
                    )
                    .await;
            });
        }

        let already_pending = {
            let mut state = self.inner.state.lock().await;
            if state.pending_generate.contains_key(&id) {
                true
            } else {
                if !rule.pending_generate_timeout.is_zero() {
                    state.pending_generate.insert(id.clone(), ());
                }
                false
            }
        };

        if already_pending {
            debug!(id = %id, "generation already pending, relying on fallback timer");
            return;
        }

        if !rule.pending_generate_timeout.is_zero() {
            let policy = self.clone();
            let unmark_id = id.clone();
            let pending_generate_timeout = rule.pending_generate_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(pending_generate_timeout).await;
                let mut state = policy.inner.state.lock().await;
                state.pending_generate.remove(&unmark_id);
            });
        }

        self.inner.stats.incr_generates();
        info!(id = %id, "invoking generator");

        let outcome = match AssertUnwindSafe(generate_func(key)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(id = %id, "generator panicked");
                GenerateOutcome::err(PolicyError::Generate("generator panicked".into()))
            }
        };

        {
            let mut state = self.inner.state.lock().await;
            state.pending_generate.remove(&id);
        }

        self.finalize_generation(id, rule, cached, report, outcome, token).await;
    }

    /// `spec.md` §4.4 producer callback semantics: writeback (`set` or
    /// `drop`) then finalization, which may still surface a stale value
    /// alongside a generator error.
    async fn finalize_generation(
        &self,
        id: String,
        rule: Arc<Rule<V, C>>,
        cached: Option<CachedEntry<V>>,
        report: Report,
        outcome: GenerateOutcome<V>,
        token: Arc<AtomicBool>,
    ) {
        let GenerateOutcome { error: generate_error, value, ttl } = outcome;
        let observed_entry = cached.is_some();
        let ttl_is_zero = matches!(ttl, Some(d) if d.is_zero());
        let mut effective_error = generate_error.clone();

        if (generate_error.is_some() && rule.drop_on_error) || ttl_is_zero {
            if let Some(backend) = &self.inner.backend {
                if let Err(e) = backend.drop(&self.inner.segment, &id).await {
                    self.inner.stats.incr_errors();
                    warn!(id = %id, error = %e, "generation writeback drop failed");
                }
            }
        } else if generate_error.is_none() {
            if let (Some(backend), Some(value_ref)) = (&self.inner.backend, &value) {
                let set_ttl = ttl.unwrap_or_else(|| {
                    let now = epoch_ms_now();
                    Duration::from_millis(ttl_for_rule(&rule, now, now))
                });
                if let Err(e) = backend.set(&self.inner.segment, &id, value_ref.clone(), set_ttl).await {
                    self.inner.stats.incr_errors();
                    warn!(id = %id, error = %e, "generation writeback set failed");
                    if !rule.generate_ignore_write_error {
                        effective_error = Some(PolicyError::from(e));
                    }
                }
            }
        }

        let final_outcome = if cached.is_some() && effective_error.is_some() && !rule.drop_on_error {
            let entry = cached.unwrap();
            GetOutcome {
                error: effective_error,
                value: Some(entry.item.clone()),
                cached: Some(entry),
                report,
            }
        } else {
            GetOutcome { error: effective_error, value, cached: None, report }
        };

        self.deliver_final(&id, &token, observed_entry, final_outcome).await;
    }

    /// The once-guarded drain that §4.4 calls for: "the first of
    /// {stale-fallback, generator-success, generator-error, miss-timeout}
    /// wins and subsequent resolutions are silently dropped."
    ///
    /// `token` identifies the specific generation cycle this resolution
    /// belongs to (the `resolved` flag of the `PendingEntry` that cycle's
    /// first caller created). A resolution only ever acts on the table
    /// entry that is still *that same* cycle's entry: if a newer cycle for
    /// `id` has since replaced it in the table, this call is a late
    /// straggler from a cycle that already resolved (or was itself
    /// abandoned by a stale-fallback) and must not reach into — let alone
    /// remove — the newer cycle's waiters.
    async fn deliver_final(&self, id: &str, token: &Arc<AtomicBool>, observed_entry: bool, outcome: GetOutcome<V>) {
        let waiters = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.pendings.get(id) else { return };
            if !Arc::ptr_eq(&entry.resolved, token) {
                return;
            }
            if entry.resolved.swap(true, Ordering::AcqRel) {
                return;
            }
            state.pendings.remove(id).expect("entry observed present under the same lock").waiters
        };

        if observed_entry {
            self.inner.stats.add_hits(waiters.len() as u64);
        }

        let mut waiters = waiters.into_iter().peekable();
        while let Some(sender) = waiters.next() {
            if waiters.peek().is_some() {
                let _ = sender.send(outcome.clone());
            } else {
                let _ = sender.send(outcome);
                break;
            }
        }
    }
}
