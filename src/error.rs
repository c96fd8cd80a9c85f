//! Error types for the cache policy engine.

/// Error returned by a [`crate::backend::CacheBackend`] implementation.
///
/// Kept deliberately opaque (a message plus an optional source) since the
/// engine only ever needs to count, log, and forward backend failures — it
/// never inspects their structure.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Error surfaced by [`crate::policy::Policy`] operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum PolicyError {
    /// The rule options passed to [`crate::rule::compile`] violate a
    /// cross-field constraint (see `spec.md` §4.1).
    #[error("invalid policy configuration: {0}")]
    InvalidConfig(String),

    /// `drop`/`set` was called with a key that has no id.
    #[error("invalid key")]
    InvalidKey,

    /// The underlying cache backend returned an error.
    #[error("cache backend error: {0}")]
    Backend(#[from] BackendError),

    /// The `generateTimeout` fallback fired before the generator completed.
    #[error("server timeout waiting for value generation")]
    ServerTimeout,

    /// The generator function returned an error (or panicked).
    #[error("value generation failed: {0}")]
    Generate(String),
}
