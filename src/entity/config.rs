//! Entity Type Configuration
//!
//! Built once per entity type and immutable afterwards: the expiry of each
//! bucket, the bucket descriptors (hash or counter, seed, guard, fallback)
//! and optionally a pinned backend.

use crate::backend::{BackendRef, Expiry};
use crate::config::Config;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Expiry Setting
// =============================================================================

/// Configured expiry of a bucket, kept as given
///
/// Text is only parsed when a write needs it, so a malformed setting fails
/// on the write path rather than at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpiresIn {
    #[default]
    Never,
    Seconds(i64),
    /// `"600"`, `"90s"`, `"10m"`, `"2h"` or `"1d"`
    Text(String),
}

impl ExpiresIn {
    pub fn is_never(&self) -> bool {
        matches!(self, ExpiresIn::Never)
    }

    /// Resolve to a concrete expiry
    pub fn resolve(&self) -> Result<Expiry> {
        match self {
            ExpiresIn::Never => Ok(Expiry::Never),
            ExpiresIn::Seconds(s) if *s > 0 => Ok(Expiry::Seconds(*s)),
            ExpiresIn::Seconds(s) => Err(Error::Configuration(format!(
                "expiry must be positive, got {}",
                s
            ))),
            ExpiresIn::Text(text) => parse_duration(text).map(Expiry::Seconds),
        }
    }
}

fn parse_duration(text: &str) -> Result<i64> {
    let invalid = || Error::Configuration(format!("invalid expiry {:?}", text));
    let text = text.trim();
    let (digits, unit) = match text.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&text[..idx], Some(c)),
        _ => (text, None),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: i64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        None | Some('s') => 1,
        Some('m') => 60,
        Some('h') => 3_600,
        Some('d') => 86_400,
        Some(_) => return Err(invalid()),
    };
    match value.checked_mul(multiplier) {
        Some(seconds) if seconds > 0 => Ok(seconds),
        _ => Err(invalid()),
    }
}

impl From<i64> for ExpiresIn {
    fn from(seconds: i64) -> Self {
        ExpiresIn::Seconds(seconds)
    }
}

impl From<&str> for ExpiresIn {
    fn from(text: &str) -> Self {
        ExpiresIn::Text(text.to_string())
    }
}

impl From<String> for ExpiresIn {
    fn from(text: String) -> Self {
        ExpiresIn::Text(text)
    }
}

impl From<Expiry> for ExpiresIn {
    fn from(expiry: Expiry) -> Self {
        match expiry {
            Expiry::Never => ExpiresIn::Never,
            Expiry::Seconds(s) => ExpiresIn::Seconds(s),
            Expiry::Millis(ms) => ExpiresIn::Seconds(ms / 1000),
        }
    }
}

// =============================================================================
// Guard & Fallback
// =============================================================================

/// A bucket operation about to run, as seen by guards and fallbacks
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCall {
    /// e.g. `store_stats`, `increment_views_by`
    pub name: String,
    pub args: Vec<Value>,
}

impl OperationCall {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

type PredicateFn<E> = dyn Fn(&E, &OperationCall) -> bool + Send + Sync;
type FallbackFn<E> = dyn for<'a> Fn(&'a E, &'a OperationCall) -> BoxFuture<'a, Result<()>> + Send + Sync;
type SeedFn<E> = dyn Fn(&E) -> i64 + Send + Sync;

/// Decides whether a bucket operation runs
pub enum Guard<E> {
    AlwaysAllow,
    Deny,
    Predicate(Arc<PredicateFn<E>>),
}

impl<E> Guard<E> {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&E, &OperationCall) -> bool + Send + Sync + 'static,
    {
        Guard::Predicate(Arc::new(f))
    }

    pub fn allows(&self, entity: &E, call: &OperationCall) -> bool {
        match self {
            Guard::AlwaysAllow => true,
            Guard::Deny => false,
            Guard::Predicate(f) => f(entity, call),
        }
    }
}

impl<E> Default for Guard<E> {
    fn default() -> Self {
        Guard::AlwaysAllow
    }
}

impl<E> Clone for Guard<E> {
    fn clone(&self) -> Self {
        match self {
            Guard::AlwaysAllow => Guard::AlwaysAllow,
            Guard::Deny => Guard::Deny,
            Guard::Predicate(f) => Guard::Predicate(f.clone()),
        }
    }
}

impl<E> fmt::Debug for Guard<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::AlwaysAllow => write!(f, "AlwaysAllow"),
            Guard::Deny => write!(f, "Deny"),
            Guard::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Runs when a guard denies an operation
pub enum Fallback<E> {
    NoOp,
    Invoke(Arc<FallbackFn<E>>),
}

impl<E> Fallback<E> {
    pub fn invoke<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a E, &'a OperationCall) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        Fallback::Invoke(Arc::new(f))
    }

    pub async fn run(&self, entity: &E, call: &OperationCall) -> Result<()> {
        match self {
            Fallback::NoOp => Ok(()),
            Fallback::Invoke(f) => f(entity, call).await,
        }
    }
}

impl<E> Default for Fallback<E> {
    fn default() -> Self {
        Fallback::NoOp
    }
}

impl<E> Clone for Fallback<E> {
    fn clone(&self) -> Self {
        match self {
            Fallback::NoOp => Fallback::NoOp,
            Fallback::Invoke(f) => Fallback::Invoke(f.clone()),
        }
    }
}

impl<E> fmt::Debug for Fallback<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::NoOp => write!(f, "NoOp"),
            Fallback::Invoke(_) => write!(f, "Invoke(..)"),
        }
    }
}

// =============================================================================
// Bucket Options & Descriptor
// =============================================================================

/// Options for declaring a bucket
pub struct BucketOptions<E> {
    expires_in: Option<ExpiresIn>,
    counter: bool,
    seed: Option<Arc<SeedFn<E>>>,
    condition: Guard<E>,
    otherwise: Fallback<E>,
}

impl<E> BucketOptions<E> {
    /// Hash bucket
    pub fn hash() -> Self {
        Self {
            expires_in: None,
            counter: false,
            seed: None,
            condition: Guard::AlwaysAllow,
            otherwise: Fallback::NoOp,
        }
    }

    /// Counter bucket
    pub fn counter() -> Self {
        Self {
            counter: true,
            ..Self::hash()
        }
    }

    pub fn expires_in(mut self, expires_in: impl Into<ExpiresIn>) -> Self {
        self.expires_in = Some(expires_in.into());
        self
    }

    /// Starting value for a counter that does not exist yet
    pub fn seed<F>(mut self, f: F) -> Self
    where
        F: Fn(&E) -> i64 + Send + Sync + 'static,
    {
        self.seed = Some(Arc::new(f));
        self
    }

    pub fn condition(mut self, guard: Guard<E>) -> Self {
        self.condition = guard;
        self
    }

    /// Action taken when the condition denies an operation
    pub fn otherwise(mut self, fallback: Fallback<E>) -> Self {
        self.otherwise = fallback;
        self
    }
}

/// Immutable description of one named bucket
pub struct BucketDescriptor<E> {
    pub name: String,
    pub is_counter: bool,
    pub(crate) seed: Option<Arc<SeedFn<E>>>,
    pub guard: Guard<E>,
    pub fallback: Fallback<E>,
}

impl<E> BucketDescriptor<E> {
    pub fn has_seed(&self) -> bool {
        self.seed.is_some()
    }

    pub(crate) fn seed_value(&self, entity: &E) -> Option<i64> {
        self.seed.as_ref().map(|f| f(entity))
    }
}

impl<E> fmt::Debug for BucketDescriptor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketDescriptor")
            .field("name", &self.name)
            .field("is_counter", &self.is_counter)
            .field("seed", &self.seed.is_some())
            .field("guard", &self.guard)
            .field("fallback", &self.fallback)
            .finish()
    }
}

// =============================================================================
// Entity Type Configuration
// =============================================================================

/// Storage configuration shared by every instance of an entity type
pub struct EntityTypeConfig<E> {
    /// Keyed by bucket name, `None` is the default bucket
    expiries: HashMap<Option<String>, ExpiresIn>,
    buckets: IndexMap<String, BucketDescriptor<E>>,
    backend: Option<BackendRef>,
}

impl<E> EntityTypeConfig<E> {
    pub fn builder() -> EntityTypeConfigBuilder<E> {
        EntityTypeConfigBuilder {
            expiries: HashMap::new(),
            buckets: IndexMap::new(),
            backend: None,
        }
    }

    /// Configured expiry of a bucket (`None` = default bucket)
    pub fn storage_expiry(&self, bucket: Option<&str>) -> ExpiresIn {
        self.expiries
            .get(&bucket.map(str::to_string))
            .cloned()
            .unwrap_or_default()
    }

    /// Look up a named bucket
    pub fn bucket(&self, name: &str) -> Result<&BucketDescriptor<E>> {
        self.buckets
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown bucket {:?}", name)))
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Pinned backend, or the global one
    pub fn backend(&self) -> Result<BackendRef> {
        match &self.backend {
            Some(backend) => Ok(backend.clone()),
            None => Config::backend(),
        }
    }
}

impl<E> fmt::Debug for EntityTypeConfig<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityTypeConfig")
            .field("expiries", &self.expiries)
            .field("buckets", &self.buckets)
            .field("backend", &self.backend.as_ref().map(|b| b.fingerprint()))
            .finish()
    }
}

/// Builder for [`EntityTypeConfig`]
pub struct EntityTypeConfigBuilder<E> {
    expiries: HashMap<Option<String>, ExpiresIn>,
    buckets: IndexMap<String, BucketDescriptor<E>>,
    backend: Option<BackendRef>,
}

impl<E> EntityTypeConfigBuilder<E> {
    /// Expiry of the default bucket
    pub fn expires_in(mut self, expires_in: impl Into<ExpiresIn>) -> Self {
        self.expiries.insert(None, expires_in.into());
        self
    }

    /// Declare a named bucket
    pub fn bucket(mut self, name: &str, options: BucketOptions<E>) -> Self {
        if let Some(expires_in) = options.expires_in {
            self.expiries.insert(Some(name.to_string()), expires_in);
        }
        self.buckets.insert(
            name.to_string(),
            BucketDescriptor {
                name: name.to_string(),
                is_counter: options.counter,
                seed: options.seed,
                guard: options.condition,
                fallback: options.otherwise,
            },
        );
        self
    }

    /// Pin a backend instead of using the global one
    pub fn backend(mut self, backend: BackendRef) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<Arc<EntityTypeConfig<E>>> {
        // The empty name addresses the default bucket
        if self.buckets.contains_key("") {
            return Err(Error::Configuration(
                "bucket name must not be empty".to_string(),
            ));
        }
        if let Some(bucket) = self.buckets.values().find(|b| b.seed.is_some() && !b.is_counter) {
            return Err(Error::Configuration(format!(
                "bucket {:?} has a seed but is not a counter",
                bucket.name
            )));
        }
        Ok(Arc::new(EntityTypeConfig {
            expiries: self.expiries,
            buckets: self.buckets,
            backend: self.backend,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Dummy;

    #[test]
    fn test_expires_in_resolution() {
        assert_eq!(ExpiresIn::Never.resolve().unwrap(), Expiry::Never);
        assert_eq!(ExpiresIn::from(600).resolve().unwrap(), Expiry::Seconds(600));
        assert_eq!(ExpiresIn::from("600").resolve().unwrap(), Expiry::Seconds(600));
        assert_eq!(ExpiresIn::from("90s").resolve().unwrap(), Expiry::Seconds(90));
        assert_eq!(ExpiresIn::from("10m").resolve().unwrap(), Expiry::Seconds(600));
        assert_eq!(ExpiresIn::from("2h").resolve().unwrap(), Expiry::Seconds(7_200));
        assert_eq!(ExpiresIn::from(" 1d ").resolve().unwrap(), Expiry::Seconds(86_400));
    }

    #[test]
    fn test_invalid_expiry_fails_at_resolution() {
        for bad in ["soon", "", "10x", "-5", "m", "1.5h"] {
            assert_matches!(
                ExpiresIn::from(bad).resolve(),
                Err(Error::Configuration(_)),
                "{:?} should be rejected",
                bad
            );
        }
        assert_matches!(ExpiresIn::Seconds(0).resolve(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_builder_records_expiries() {
        let config = EntityTypeConfig::<Dummy>::builder()
            .expires_in(600)
            .bucket("stats", BucketOptions::hash().expires_in("2h"))
            .bucket("views", BucketOptions::counter())
            .build()
            .unwrap();

        assert_eq!(config.storage_expiry(None), ExpiresIn::Seconds(600));
        assert_eq!(config.storage_expiry(Some("stats")), ExpiresIn::Text("2h".into()));
        assert_eq!(config.storage_expiry(Some("views")), ExpiresIn::Never);
        assert!(config.bucket("views").unwrap().is_counter);
        assert_matches!(config.bucket("missing"), Err(Error::Configuration(_)));
        assert_eq!(config.bucket_names().collect::<Vec<_>>(), vec!["stats", "views"]);
    }

    #[test]
    fn test_seed_requires_counter() {
        let result = EntityTypeConfig::<Dummy>::builder()
            .bucket("stats", BucketOptions::hash().seed(|_| 10))
            .build();
        assert_matches!(result, Err(Error::Configuration(_)));

        let config = EntityTypeConfig::<Dummy>::builder()
            .bucket("views", BucketOptions::counter().seed(|_| 10))
            .build()
            .unwrap();
        assert_eq!(config.bucket("views").unwrap().seed_value(&Dummy), Some(10));
    }

    #[test]
    fn test_empty_bucket_name_is_rejected() {
        let result = EntityTypeConfig::<Dummy>::builder()
            .expires_in(600)
            .bucket("", BucketOptions::hash().expires_in(60))
            .build();
        assert_matches!(result, Err(Error::Configuration(msg)) if msg.contains("empty"));

        let result = EntityTypeConfig::<Dummy>::builder()
            .bucket("", BucketOptions::counter())
            .build();
        assert_matches!(result, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_guard_evaluation() {
        let call = OperationCall::new("store_stats", vec![]);
        assert!(Guard::<Dummy>::AlwaysAllow.allows(&Dummy, &call));
        assert!(!Guard::<Dummy>::Deny.allows(&Dummy, &call));
        let guard = Guard::<Dummy>::predicate(|_, call| call.name.starts_with("retrieve_"));
        assert!(!guard.allows(&Dummy, &call));
    }
}
