//! Rule compiler: validates a [`RuleOptions`] map and produces an immutable
//! [`Rule`].
//!
//! See `spec.md` §4.1 for the full validation checklist; every branch below
//! is numbered to match it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::key::Key;

/// A boxed future returned by a generator function.
pub type GenerateFuture<V> = Pin<Box<dyn Future<Output = GenerateOutcome<V>> + Send>>;

/// `(key) -> future of GenerateOutcome`, the Rust shape of `spec.md`'s
/// opaque `generateFunc(key, callback(err, value, ttl))`.
pub type GenerateFn<V, C> = Arc<dyn Fn(Key<C>) -> GenerateFuture<V> + Send + Sync>;

/// The result handed back by a generator invocation.
///
/// `ttl` follows `spec.md` §4.4 step 3/4 precisely: `None` means "omitted"
/// (use the policy's own TTL default), `Some(Duration::ZERO)` means the
/// generator explicitly reported a zero ttl (which triggers a `drop`
/// instead of a `set`), and any other `Some(d)` is the entry's ttl.
pub struct GenerateOutcome<V> {
    pub error: Option<PolicyError>,
    pub value: Option<V>,
    pub ttl: Option<Duration>,
}

impl<V> GenerateOutcome<V> {
    pub fn ok(value: V, ttl: Option<Duration>) -> Self {
        Self { error: None, value: Some(value), ttl }
    }

    pub fn err(error: PolicyError) -> Self {
        Self { error: Some(error), value: None, ttl: None }
    }
}

/// `staleIn`: either a fixed millisecond budget, or a function of
/// `(stored, ttl) -> ms` (`spec.md` §3).
#[derive(Clone)]
pub enum StaleIn {
    Millis(Duration),
    Func(Arc<dyn Fn(i64, u64) -> u64 + Send + Sync>),
}

impl fmt::Debug for StaleIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleIn::Millis(d) => f.debug_tuple("Millis").field(d).finish(),
            StaleIn::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// `generateTimeout`: either a millisecond timeout, or the "disabled"
/// sentinel (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateTimeout {
    Disabled,
    Millis(Duration),
}

/// A compiled `expiresAt` daily clock (`HH:MM`, local civil time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiresAt {
    pub hour: u32,
    pub minute: u32,
}

impl ExpiresAt {
    /// Parses `"HH:MM"` — 1 or 2 digit hour (0-23), 2 digit minute (0-59).
    pub fn parse(s: &str) -> Result<Self, PolicyError> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| PolicyError::InvalidConfig(format!("expiresAt must be HH:MM, got {s:?}")))?;

        if h.is_empty() || h.len() > 2 || !h.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PolicyError::InvalidConfig(format!("invalid expiresAt hour: {h:?}")));
        }
        if m.len() != 2 || !m.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PolicyError::InvalidConfig(format!("invalid expiresAt minute: {m:?}")));
        }

        let hour: u32 = h.parse().expect("validated digits");
        let minute: u32 = m.parse().expect("validated digits");
        if hour > 23 || minute > 59 {
            return Err(PolicyError::InvalidConfig(format!("expiresAt out of range: {s:?}")));
        }
        Ok(Self { hour, minute })
    }
}

/// Raw, free-form rule configuration, as accepted by [`compile`].
///
/// Scalar fields derive `Serialize`/`Deserialize` so a rule can be described
/// by a config file; `generate_func` and a function-valued `stale_in` are
/// wired up in code and are skipped by serde.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RuleOptions<V, C = ()> {
    pub expires_in: Option<Duration>,
    pub expires_at: Option<String>,
    #[serde(skip)]
    pub stale_in: Option<StaleIn>,
    pub stale_timeout: Option<Duration>,
    #[serde(skip)]
    pub generate_func: Option<GenerateFn<V, C>>,
    pub generate_timeout: Option<GenerateTimeout>,
    pub generate_on_read_error: Option<bool>,
    pub generate_ignore_write_error: Option<bool>,
    pub drop_on_error: Option<bool>,
    pub pending_generate_timeout: Option<Duration>,
}

impl<V, C> Default for RuleOptions<V, C> {
    fn default() -> Self {
        Self {
            expires_in: None,
            expires_at: None,
            stale_in: None,
            stale_timeout: None,
            generate_func: None,
            generate_timeout: None,
            generate_on_read_error: None,
            generate_ignore_write_error: None,
            drop_on_error: None,
            pending_generate_timeout: None,
        }
    }
}

impl<V, C> Clone for RuleOptions<V, C> {
    fn clone(&self) -> Self {
        Self {
            expires_in: self.expires_in,
            expires_at: self.expires_at.clone(),
            stale_in: self.stale_in.clone(),
            stale_timeout: self.stale_timeout,
            generate_func: self.generate_func.clone(),
            generate_timeout: self.generate_timeout,
            generate_on_read_error: self.generate_on_read_error,
            generate_ignore_write_error: self.generate_ignore_write_error,
            drop_on_error: self.drop_on_error,
            pending_generate_timeout: self.pending_generate_timeout,
        }
    }
}

impl<V, C> fmt::Debug for RuleOptions<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleOptions")
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("stale_in", &self.stale_in)
            .field("stale_timeout", &self.stale_timeout)
            .field("has_generate_func", &self.generate_func.is_some())
            .field("generate_timeout", &self.generate_timeout)
            .field("generate_on_read_error", &self.generate_on_read_error)
            .field("generate_ignore_write_error", &self.generate_ignore_write_error)
            .field("drop_on_error", &self.drop_on_error)
            .field("pending_generate_timeout", &self.pending_generate_timeout)
            .finish()
    }
}

/// The compiled, immutable rule a [`crate::policy::Policy`] runs against.
///
/// Never mutated after [`compile`]; `Policy::rules()` swaps the whole value
/// atomically (`spec.md` §3 invariant 6).
pub struct Rule<V, C = ()> {
    pub expires_in: Option<Duration>,
    pub expires_at: Option<ExpiresAt>,
    pub stale_in: Option<StaleIn>,
    pub stale_timeout: Option<Duration>,
    pub generate_func: Option<GenerateFn<V, C>>,
    pub generate_timeout: Option<GenerateTimeout>,
    pub generate_on_read_error: bool,
    pub generate_ignore_write_error: bool,
    pub drop_on_error: bool,
    pub pending_generate_timeout: Duration,
}

impl<V, C> Clone for Rule<V, C> {
    fn clone(&self) -> Self {
        Self {
            expires_in: self.expires_in,
            expires_at: self.expires_at,
            stale_in: self.stale_in.clone(),
            stale_timeout: self.stale_timeout,
            generate_func: self.generate_func.clone(),
            generate_timeout: self.generate_timeout,
            generate_on_read_error: self.generate_on_read_error,
            generate_ignore_write_error: self.generate_ignore_write_error,
            drop_on_error: self.drop_on_error,
            pending_generate_timeout: self.pending_generate_timeout,
        }
    }
}

impl<V, C> fmt::Debug for Rule<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("stale_in", &self.stale_in)
            .field("stale_timeout", &self.stale_timeout)
            .field("has_generate_func", &self.generate_func.is_some())
            .field("generate_timeout", &self.generate_timeout)
            .field("generate_on_read_error", &self.generate_on_read_error)
            .field("generate_ignore_write_error", &self.generate_ignore_write_error)
            .field("drop_on_error", &self.drop_on_error)
            .field("pending_generate_timeout", &self.pending_generate_timeout)
            .finish()
    }
}

/// Validates and normalizes `options` into a [`Rule`].
///
/// `has_backend` reflects whether the owning [`crate::policy::Policy`] was
/// constructed with a cache backend — required because stale options are
/// only meaningful server-side (`spec.md` §4.1: "`staleIn` requires ...  a
/// backend").
pub fn compile<V, C>(options: RuleOptions<V, C>, has_backend: bool) -> Result<Rule<V, C>, PolicyError> {
    if options.expires_in.is_some() && options.expires_at.is_some() {
        return Err(PolicyError::InvalidConfig(
            "expiresIn and expiresAt are mutually exclusive".into(),
        ));
    }

    let expires_at = options.expires_at.as_deref().map(ExpiresAt::parse).transpose()?;

    if let Some(expires_in) = options.expires_in {
        if expires_in.is_zero() {
            return Err(PolicyError::InvalidConfig("expiresIn must be a positive integer".into()));
        }
    }

    if let Some(stale_in) = &options.stale_in {
        if let StaleIn::Millis(stale_in_ms) = stale_in {
            if let Some(expires_in) = options.expires_in {
                if *stale_in_ms >= expires_in {
                    return Err(PolicyError::InvalidConfig(
                        "staleIn must be less than expiresIn".into(),
                    ));
                }
            }
        }
        if options.generate_func.is_none() {
            return Err(PolicyError::InvalidConfig("staleIn requires generateFunc".into()));
        }
        if options.stale_timeout.is_none() {
            return Err(PolicyError::InvalidConfig("staleIn requires staleTimeout".into()));
        }
        if !has_backend {
            return Err(PolicyError::InvalidConfig("staleIn requires a cache backend".into()));
        }
    }

    if let Some(stale_timeout) = options.stale_timeout {
        if let Some(expires_in) = options.expires_in {
            if stale_timeout >= expires_in {
                return Err(PolicyError::InvalidConfig(
                    "staleTimeout must be less than expiresIn".into(),
                ));
            }
            if let Some(StaleIn::Millis(stale_in_ms)) = &options.stale_in {
                if expires_in > *stale_in_ms {
                    let budget = expires_in - *stale_in_ms;
                    if stale_timeout >= budget {
                        return Err(PolicyError::InvalidConfig(
                            "staleTimeout must be less than expiresIn - staleIn".into(),
                        ));
                    }
                }
            }
        }
        if let Some(pending_generate_timeout) = options.pending_generate_timeout {
            if !pending_generate_timeout.is_zero() && stale_timeout >= pending_generate_timeout {
                return Err(PolicyError::InvalidConfig(
                    "staleTimeout must be less than pendingGenerateTimeout".into(),
                ));
            }
        }
    }

    if options.generate_func.is_some() && options.generate_timeout.is_none() {
        return Err(PolicyError::InvalidConfig("generateFunc requires generateTimeout".into()));
    }

    if options.generate_func.is_none() {
        if options.drop_on_error.is_some() {
            return Err(PolicyError::InvalidConfig("dropOnError requires generateFunc".into()));
        }
        if options.generate_on_read_error.is_some() {
            return Err(PolicyError::InvalidConfig("generateOnReadError requires generateFunc".into()));
        }
        if options.generate_ignore_write_error.is_some() {
            return Err(PolicyError::InvalidConfig(
                "generateIgnoreWriteError requires generateFunc".into(),
            ));
        }
    }

    let generate_on_read_error = options.generate_on_read_error.unwrap_or(true);
    let generate_ignore_write_error = options.generate_ignore_write_error.unwrap_or(true);
    let drop_on_error = if options.generate_func.is_some() {
        options.drop_on_error.unwrap_or(true)
    } else {
        false
    };
    let pending_generate_timeout = options.pending_generate_timeout.unwrap_or(Duration::ZERO);

    Ok(Rule {
        expires_in: options.expires_in,
        expires_at,
        stale_in: options.stale_in,
        stale_timeout: options.stale_timeout,
        generate_func: options.generate_func,
        generate_timeout: options.generate_timeout,
        generate_on_read_error,
        generate_ignore_write_error,
        drop_on_error,
        pending_generate_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RuleOptions<String, ()> {
        RuleOptions::default()
    }

    #[test]
    fn empty_options_yield_empty_rule() {
        let rule = compile(opts(), false).unwrap();
        assert!(rule.expires_in.is_none());
        assert!(rule.expires_at.is_none());
        assert!(rule.generate_func.is_none());
        assert!(rule.generate_on_read_error);
        assert!(rule.generate_ignore_write_error);
        assert!(!rule.drop_on_error);
    }

    #[test]
    fn expires_in_and_expires_at_are_mutually_exclusive() {
        let mut o = opts();
        o.expires_in = Some(Duration::from_millis(1000));
        o.expires_at = Some("03:00".into());
        assert!(compile(o, false).is_err());
    }

    #[test]
    fn expires_in_must_be_positive() {
        let mut o = opts();
        o.expires_in = Some(Duration::ZERO);
        assert!(compile(o, false).is_err());
    }

    #[test]
    fn expires_at_parses_valid_hhmm() {
        let at = ExpiresAt::parse("3:05").unwrap();
        assert_eq!(at, ExpiresAt { hour: 3, minute: 5 });
        let at = ExpiresAt::parse("23:59").unwrap();
        assert_eq!(at, ExpiresAt { hour: 23, minute: 59 });
    }

    #[test]
    fn expires_at_rejects_out_of_range() {
        assert!(ExpiresAt::parse("24:00").is_err());
        assert!(ExpiresAt::parse("12:60").is_err());
        assert!(ExpiresAt::parse("123:00").is_err());
        assert!(ExpiresAt::parse("12:5").is_err());
        assert!(ExpiresAt::parse("garbage").is_err());
    }

    #[test]
    fn stale_in_requires_generate_func_and_backend() {
        let mut o = opts();
        o.expires_in = Some(Duration::from_millis(1000));
        o.stale_in = Some(StaleIn::Millis(Duration::from_millis(500)));
        o.stale_timeout = Some(Duration::from_millis(100));
        // no generate_func set -> error
        assert!(compile(o.clone(), true).is_err());

        o.generate_func = Some(Arc::new(|_key| {
            Box::pin(async { GenerateOutcome::ok("v".to_string(), None) }) as GenerateFuture<String>
        }));
        o.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_millis(50)));
        // generate_func set but no backend -> error
        assert!(compile(o.clone(), false).is_err());
        // everything present -> ok
        assert!(compile(o, true).is_ok());
    }

    #[test]
    fn stale_timeout_must_fit_inside_expires_in_minus_stale_in() {
        let mut o = opts();
        o.expires_in = Some(Duration::from_millis(1000));
        o.stale_in = Some(StaleIn::Millis(Duration::from_millis(900)));
        o.stale_timeout = Some(Duration::from_millis(150)); // budget is only 100ms
        o.generate_func = Some(Arc::new(|_key| {
            Box::pin(async { GenerateOutcome::ok("v".to_string(), None) }) as GenerateFuture<String>
        }));
        o.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_millis(50)));
        assert!(compile(o, true).is_err());
    }

    #[test]
    fn flags_require_generate_func() {
        let mut o: RuleOptions<String, ()> = opts();
        o.drop_on_error = Some(false);
        assert!(compile(o, false).is_err());
    }

    #[test]
    fn compile_is_idempotent_on_scalar_fields() {
        let mut o = opts();
        o.expires_in = Some(Duration::from_millis(1000));
        let a = compile(o.clone(), false).unwrap();
        let b = compile(o, false).unwrap();
        assert_eq!(a.expires_in, b.expires_in);
        assert_eq!(a.generate_on_read_error, b.generate_on_read_error);
        assert_eq!(a.generate_ignore_write_error, b.generate_ignore_write_error);
        assert_eq!(a.drop_on_error, b.drop_on_error);
        assert_eq!(a.pending_generate_timeout, b.pending_generate_timeout);
    }
}
