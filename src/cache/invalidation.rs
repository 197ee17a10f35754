//! Invalidation rules.
//!
//! A pattern pairs a key matcher with an action and the event that triggers
//! it. [`KeyMatcher::Exact`] is the baseline; `Prefix` and `Glob` widen a
//! single rule to a family of keys (e.g. everything under one repository).

use futures_util::future::BoxFuture;
use globset::{Glob, GlobMatcher};
use std::future::Future;
use std::sync::Arc;

use super::{CacheError, CacheResult};

/// Callback computing the value for a key on demand.
pub type Producer = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>;

/// Wrap an async closure as a [`Producer`].
pub fn producer_fn<F, Fut>(f: F) -> Producer
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    Arc::new(move |key| Box::pin(f(key)))
}

/// Which keys a pattern applies to.
#[derive(Debug, Clone)]
pub enum KeyMatcher {
    /// Identical key only
    Exact(String),
    /// Any key starting with the prefix
    Prefix(String),
    /// Shell-style glob (`*`, `?`, `[..]`, `{a,b}`)
    Glob(GlobMatcher),
}

impl KeyMatcher {
    /// Exact key match.
    pub fn exact(key: impl Into<String>) -> Self {
        KeyMatcher::Exact(key.into())
    }

    /// Prefix match.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyMatcher::Prefix(prefix.into())
    }

    /// Compile a glob.
    ///
    /// # Errors
    /// Returns [`CacheError::InvalidPattern`] if the glob does not parse.
    pub fn glob(pattern: &str) -> CacheResult<Self> {
        let glob = Glob::new(pattern).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(KeyMatcher::Glob(glob.compile_matcher()))
    }

    /// Whether `key` matches.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Exact(k) => k == key,
            KeyMatcher::Prefix(p) => key.starts_with(p.as_str()),
            KeyMatcher::Glob(g) => g.is_match(key),
        }
    }

    /// The literal key, for exact matchers.
    pub fn literal(&self) -> Option<&str> {
        match self {
            KeyMatcher::Exact(k) => Some(k),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMatcher::Exact(k) => write!(f, "{k}"),
            KeyMatcher::Prefix(p) => write!(f, "{p}*"),
            KeyMatcher::Glob(g) => write!(f, "{}", g.glob()),
        }
    }
}

/// What to do with a matched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationAction {
    /// Remove the entry
    Delete,
    /// Recompute through the pattern's producer (Delete when none is set)
    Refresh,
    /// Force the entry's TTL to zero
    Expire,
}

/// When a pattern is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationCondition {
    /// After every `set`
    OnWrite,
    /// After every `get`
    OnRead,
    /// On the periodic sweep
    OnTime,
}

/// A registered invalidation rule.
#[derive(Clone)]
pub struct InvalidationPattern {
    /// Key matcher
    pub matcher: KeyMatcher,
    /// Action applied on match
    pub action: InvalidationAction,
    /// Triggering event
    pub condition: InvalidationCondition,
    /// Producer used by `Refresh`
    pub producer: Option<Producer>,
}

impl std::fmt::Debug for InvalidationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationPattern")
            .field("matcher", &self.matcher)
            .field("action", &self.action)
            .field("condition", &self.condition)
            .field("producer", &self.producer.is_some())
            .finish()
    }
}

impl InvalidationPattern {
    /// Pattern without a producer.
    pub fn new(matcher: KeyMatcher, action: InvalidationAction, condition: InvalidationCondition) -> Self {
        Self {
            matcher,
            action,
            condition,
            producer: None,
        }
    }

    /// Attach the producer used by [`InvalidationAction::Refresh`].
    pub fn with_producer(mut self, producer: Producer) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Whether this pattern fires for `key` on `condition`.
    pub fn applies(&self, key: &str, condition: InvalidationCondition) -> bool {
        self.condition == condition && self.matcher.matches(key)
    }
}
