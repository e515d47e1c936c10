//! Entity Storage
//!
//! Lets any type with an identity keep a small hash of attributes, or
//! integer counters, in the configured backend.
//!
//! - Hash buckets are loaded once per entity instance and cached; a store
//!   merges into what is already there.
//! - Counter buckets are never cached. Every call goes to the backend so
//!   concurrent increments from independent instances stay correct.
//! - A bucket's expiry is applied when its key is created. Later writes
//!   carry the remaining TTL over instead of restarting the clock.
//!
//! ```ignore
//! static POST_STORAGE: Lazy<Arc<EntityTypeConfig<Post>>> = Lazy::new(|| {
//!     EntityTypeConfig::builder()
//!         .expires_in(600)
//!         .bucket("views", BucketOptions::counter())
//!         .build()
//!         .expect("valid storage config")
//! });
//!
//! post.store(attrs([("title", "Hello")])).await?;
//! post.counter("views")?.increment().await?;
//! ```

pub mod bucket;
pub mod cache;
pub mod config;
pub mod counter;

pub use bucket::HashBucket;
pub use cache::EntityCache;
pub use config::{
    BucketDescriptor, BucketOptions, EntityTypeConfig, EntityTypeConfigBuilder, ExpiresIn,
    Fallback, Guard, OperationCall,
};
pub use counter::CounterBucket;

use crate::backend::{Backend, Expiry};
use crate::codec::{AttrValue, Attrs};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Entity Trait
// =============================================================================

/// A type whose instances own storage
pub trait Entity: Send + Sync + Sized + 'static {
    /// Identity of this instance within its type
    fn storage_id(&self) -> String;

    fn storage_state(&self) -> &StorageState<Self>;

    /// Type part of the storage key
    fn storage_type_name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Backend key of a bucket (`None` = default bucket)
    ///
    /// `"<Type>-<id>"` and `"<Type>-<id>-<bucket>"` by default; the base
    /// is computed once per instance.
    fn storage_key(&self, bucket: Option<&str>) -> String {
        let base = self
            .storage_state()
            .base_key
            .get_or_init(|| format!("{}-{}", self.storage_type_name(), self.storage_id()));
        match bucket {
            None => base.clone(),
            Some(bucket) => format!("{}-{}", base, bucket),
        }
    }

    /// Value of a symbolic default, if this type provides one
    fn method_default(&self, _name: &str) -> Option<AttrValue> {
        None
    }
}

/// Storage state embedded in every entity instance
pub struct StorageState<E> {
    config: Arc<EntityTypeConfig<E>>,
    cache: Mutex<EntityCache>,
    base_key: OnceCell<String>,
}

impl<E> StorageState<E> {
    pub fn new(config: Arc<EntityTypeConfig<E>>) -> Self {
        Self {
            config,
            cache: Mutex::new(EntityCache::new()),
            base_key: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Arc<EntityTypeConfig<E>> {
        &self.config
    }

    /// Never hold the guard across an await
    pub fn cache(&self) -> MutexGuard<'_, EntityCache> {
        self.cache.lock()
    }
}

// =============================================================================
// Retrieve Defaults
// =============================================================================

/// Default used when a stored value is missing or falsy
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(AttrValue),
    /// Computed by [`Entity::method_default`]; the name itself is used
    /// when the entity has no such default
    Method(String),
}

impl DefaultValue {
    pub fn method(name: impl Into<String>) -> Self {
        DefaultValue::Method(name.into())
    }

    fn resolve<E: Entity>(&self, entity: &E) -> AttrValue {
        match self {
            DefaultValue::Literal(value) => value.clone(),
            DefaultValue::Method(name) => entity
                .method_default(name)
                .filter(AttrValue::is_truthy)
                .unwrap_or_else(|| AttrValue::from(name.as_str())),
        }
    }
}

impl From<AttrValue> for DefaultValue {
    fn from(value: AttrValue) -> Self {
        DefaultValue::Literal(value)
    }
}

macro_rules! literal_default {
    ($($t:ty),*) => {
        $(impl From<$t> for DefaultValue {
            fn from(value: $t) -> Self {
                DefaultValue::Literal(value.into())
            }
        })*
    };
}

literal_default!(serde_json::Value, &str, String, i64, i32, f64, bool, DateTime<Utc>);

/// Keys to retrieve, with their defaults, in order
pub type Defaults = IndexMap<String, DefaultValue>;

/// Build [`Attrs`] from pairs
pub fn attrs<I, K, V>(pairs: I) -> Attrs
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<AttrValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Build [`Defaults`] from pairs
pub fn defaults<I, K, D>(pairs: I) -> Defaults
where
    I: IntoIterator<Item = (K, D)>,
    K: Into<String>,
    D: Into<DefaultValue>,
{
    pairs
        .into_iter()
        .map(|(k, d)| (k.into(), d.into()))
        .collect()
}

/// Result of a retrieve: one value for one key, else a list in key order
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieved {
    One(AttrValue),
    Many(Vec<AttrValue>),
}

impl Retrieved {
    pub fn into_vec(self) -> Vec<AttrValue> {
        match self {
            Retrieved::One(value) => vec![value],
            Retrieved::Many(values) => values,
        }
    }

    pub fn one(self) -> Option<AttrValue> {
        match self {
            Retrieved::One(value) => Some(value),
            Retrieved::Many(_) => None,
        }
    }
}

pub(crate) fn pick<E: Entity>(entity: &E, hash: &Attrs, defaults: &Defaults) -> Retrieved {
    let mut values: Vec<AttrValue> = defaults
        .iter()
        .map(|(key, default)| match hash.get(key) {
            Some(value) if value.is_truthy() => value.clone(),
            _ => default.resolve(entity),
        })
        .collect();
    if values.len() == 1 {
        Retrieved::One(values.remove(0))
    } else {
        Retrieved::Many(values)
    }
}

// =============================================================================
// Expiry Rule
// =============================================================================

/// Expiry for a write: configured on create, remaining TTL on update
///
/// The remaining TTL is carried in milliseconds so repeated updates keep
/// the original deadline. An existing key without a TTL is written without
/// one. A key that vanished since it was loaded gets the configured expiry
/// again.
pub(crate) async fn write_expiry(
    backend: &dyn Backend,
    key: &str,
    configured: Expiry,
    is_new: bool,
) -> Result<Expiry> {
    if configured.is_never() || is_new {
        return Ok(configured);
    }
    let expiry = match backend.pttl(key).await? {
        Some(remaining) => Expiry::Millis(remaining),
        None if backend.exists(key).await? => Expiry::Never,
        None => configured,
    };
    debug!(key, configured = %configured, applied = %expiry, "Preserving TTL on update");
    Ok(expiry)
}

// =============================================================================
// Entity-Facing API
// =============================================================================

/// Storage operations available on every [`Entity`]
#[async_trait]
pub trait EntityStorageExt: Entity {
    /// Merge attributes into the default bucket
    async fn store(&self, updates: Attrs) -> Result<()> {
        bucket::store_hash(self, updates, None).await
    }

    /// Stored values of the default bucket, or their defaults
    async fn retrieve(&self, defaults: Defaults) -> Result<Retrieved> {
        let hash = bucket::retrieve_hash(self, None).await?;
        Ok(pick(self, &hash, &defaults))
    }

    async fn retrieve_value(&self, key: &str, default: DefaultValue) -> Result<AttrValue> {
        let hash = bucket::retrieve_hash(self, None).await?;
        let mut single = Defaults::new();
        single.insert(key.to_string(), default);
        Ok(pick(self, &hash, &single).into_vec().remove(0))
    }

    /// Delete the default bucket from the backend and the cache
    async fn delete_storage(&self) -> Result<()> {
        bucket::delete_hash(self, None).await
    }

    /// Forget the cached default bucket; the next retrieve re-reads it
    fn clear_storage(&self) {
        bucket::clear_hash(self, None);
    }

    /// Set the TTL of a bucket's key; `Never` is a no-op
    async fn expire_storage(&self, expiry: Expiry, bucket: Option<&str>) -> Result<()> {
        let key = self.storage_key(bucket);
        let backend = self.storage_state().config().backend()?;
        match expiry {
            Expiry::Never => Ok(()),
            Expiry::Seconds(seconds) => backend.expire(&key, seconds).await,
            Expiry::Millis(millis) => backend.pexpire(&key, millis).await,
        }
    }

    /// Configured expiry of a bucket
    fn storage_expiry(&self, bucket: Option<&str>) -> ExpiresIn {
        self.storage_state().config().storage_expiry(bucket)
    }

    /// Handle on a named hash bucket
    fn bucket(&self, name: &str) -> Result<HashBucket<'_, Self>> {
        let descriptor = self.storage_state().config().bucket(name)?;
        if descriptor.is_counter {
            return Err(Error::Configuration(format!(
                "bucket {:?} is a counter",
                name
            )));
        }
        Ok(HashBucket::new(self, descriptor))
    }

    /// Handle on a named counter bucket
    fn counter(&self, name: &str) -> Result<CounterBucket<'_, Self>> {
        let descriptor = self.storage_state().config().bucket(name)?;
        if !descriptor.is_counter {
            return Err(Error::Configuration(format!(
                "bucket {:?} is not a counter",
                name
            )));
        }
        Ok(CounterBucket::new(self, descriptor))
    }
}

impl<E: Entity> EntityStorageExt for E {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::clock::ManualClock;
    use crate::backend::memory::{MemoryConnector, MemoryStore};
    use crate::backend::pool::ConnectionPool;
    use crate::backend::{BackendRef, StoreBackend};
    use assert_matches::assert_matches;

    pub(crate) struct Post {
        pub id: u64,
        pub storage: StorageState<Post>,
    }

    impl Post {
        pub fn new(id: u64, config: &Arc<EntityTypeConfig<Post>>) -> Self {
            Self {
                id,
                storage: StorageState::new(config.clone()),
            }
        }
    }

    impl Entity for Post {
        fn storage_id(&self) -> String {
            self.id.to_string()
        }

        fn storage_state(&self) -> &StorageState<Self> {
            &self.storage
        }

        fn method_default(&self, name: &str) -> Option<AttrValue> {
            match name {
                "default_title" => Some(format!("Post #{}", self.id).into()),
                _ => None,
            }
        }
    }

    pub(crate) struct Fixture {
        pub store: Arc<StoreBackend>,
        pub clock: Arc<ManualClock>,
    }

    impl Fixture {
        pub fn new(name: &str) -> Self {
            let clock = ManualClock::new();
            let memory = MemoryStore::with_clock(&format!("entity-tests-{}", name), clock.clone());
            let pool = ConnectionPool::new(Arc::new(MemoryConnector::for_store(memory)), true, 8);
            Self {
                store: Arc::new(StoreBackend::with_pool(pool)),
                clock,
            }
        }

        pub fn backend(&self) -> BackendRef {
            self.store.clone()
        }

        pub fn config(
            &self,
            build: impl FnOnce(EntityTypeConfigBuilder<Post>) -> EntityTypeConfigBuilder<Post>,
        ) -> Arc<EntityTypeConfig<Post>> {
            build(EntityTypeConfig::builder().backend(self.backend()))
                .build()
                .unwrap()
        }
    }

    #[test]
    fn test_storage_key() {
        let fx = Fixture::new("keys");
        let config = fx.config(|b| b);
        let post = Post::new(7, &config);
        assert_eq!(post.storage_key(None), "Post-7");
        assert_eq!(post.storage_key(Some("stats")), "Post-7-stats");
        assert_ne!(post.storage_key(Some("a")), post.storage_key(Some("b")));
    }

    #[tokio::test]
    async fn test_store_merges() {
        let fx = Fixture::new("merge");
        let config = fx.config(|b| b);
        let post = Post::new(1, &config);

        post.store(attrs([("a", 1)])).await.unwrap();
        post.store(attrs([("b", 2)])).await.unwrap();
        let values = post
            .retrieve(defaults([("a", 0), ("b", 0)]))
            .await
            .unwrap();
        assert_eq!(values, Retrieved::Many(vec![1.into(), 2.into()]));

        // A fresh instance reads the merged hash from the backend
        let other = Post::new(1, &config);
        assert_eq!(
            other.retrieve_value("a", 0.into()).await.unwrap(),
            AttrValue::from(1)
        );
    }

    #[tokio::test]
    async fn test_retrieve_defaults() {
        let fx = Fixture::new("defaults");
        let config = fx.config(|b| b);
        let post = Post::new(3, &config);

        post.store(attrs([("hidden", false)])).await.unwrap();
        let values = post
            .retrieve(defaults([
                ("missing", DefaultValue::from("fallback")),
                ("hidden", DefaultValue::from(true)),
                ("title", DefaultValue::method("default_title")),
                ("other", DefaultValue::method("no_such_method")),
            ]))
            .await
            .unwrap();
        assert_eq!(
            values.into_vec(),
            vec![
                AttrValue::from("fallback"),
                AttrValue::from(true),
                AttrValue::from("Post #3"),
                AttrValue::from("no_such_method"),
            ]
        );

        let one = post.retrieve(defaults([("missing", 5)])).await.unwrap();
        assert_eq!(one, Retrieved::One(5.into()));
    }

    #[tokio::test]
    async fn test_expiry_set_on_create_preserved_on_update() {
        let fx = Fixture::new("ttl");
        let config = fx.config(|b| b.expires_in(60));
        let post = Post::new(1, &config);

        post.store(attrs([("a", 1)])).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), Some(60));

        fx.clock.advance_secs(5);
        post.store(attrs([("b", 2)])).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), Some(55));

        // Same rule for an instance that loads an existing key
        fx.clock.advance_secs(5);
        let other = Post::new(1, &config);
        other.store(attrs([("c", 3)])).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_frequent_updates_keep_original_deadline() {
        let fx = Fixture::new("ttl-frequent");
        let config = fx.config(|b| b.expires_in(10));
        let post = Post::new(1, &config);

        post.store(attrs([("n", 0)])).await.unwrap();
        for n in 1..25 {
            fx.clock.advance_ms(400);
            post.store(attrs([("n", n)])).await.unwrap();
            assert_eq!(
                fx.store.pttl("Post-1").await.unwrap(),
                Some(10_000 - 400 * n)
            );
        }

        // 9.6s in: still live with 400ms left, gone at the 10s mark
        assert!(fx.store.exists("Post-1").await.unwrap());
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), Some(0));
        fx.clock.advance_ms(400);
        assert!(!fx.store.exists("Post-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_without_ttl_stays_persistent() {
        let fx = Fixture::new("ttl-persistent");
        let config = fx.config(|b| b.expires_in(60));
        let post = Post::new(1, &config);

        fx.store
            .set("Post-1", r#"{"a":1}"#, Expiry::Never)
            .await
            .unwrap();
        post.store(attrs([("b", 2)])).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), None);
        assert!(fx.store.exists("Post-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_vanished_key_gets_configured_expiry() {
        let fx = Fixture::new("ttl-vanished");
        let config = fx.config(|b| b.expires_in(60));
        let post = Post::new(1, &config);

        post.store(attrs([("a", 1)])).await.unwrap();
        fx.store.del("Post-1").await.unwrap();
        fx.clock.advance_secs(10);
        post.store(attrs([("b", 2)])).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), Some(60));
    }

    #[tokio::test]
    async fn test_invalid_expiry_fails_on_write() {
        let fx = Fixture::new("ttl-invalid");
        let config = fx.config(|b| b.expires_in("soon"));
        let post = Post::new(1, &config);
        assert_matches!(
            post.store(attrs([("a", 1)])).await,
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_clear_refetches_delete_removes() {
        let fx = Fixture::new("clear-delete");
        let config = fx.config(|b| b);
        let post = Post::new(1, &config);

        post.store(attrs([("a", 1)])).await.unwrap();
        post.clear_storage();
        assert!(!post.storage_state().cache().is_loaded(None));
        assert_eq!(post.retrieve_value("a", 0.into()).await.unwrap(), 1.into());

        post.delete_storage().await.unwrap();
        assert_eq!(post.retrieve_value("a", 0.into()).await.unwrap(), 0.into());
        assert!(!fx.store.exists("Post-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_retrieve_after_store_hits_cache() {
        let fx = Fixture::new("cache-hit");
        let config = fx.config(|b| b);
        let post = Post::new(1, &config);

        post.store(attrs([("a", 1)])).await.unwrap();
        let reads_after_store = fx.store.metrics().total_reads();
        post.retrieve_value("a", 0.into()).await.unwrap();
        post.retrieve(defaults([("a", 0), ("b", 0)])).await.unwrap();
        assert_eq!(fx.store.metrics().total_reads(), reads_after_store);
    }

    #[tokio::test]
    async fn test_time_roundtrip_through_storage() {
        let fx = Fixture::new("time");
        let config = fx.config(|b| b);
        let now = Utc::now();

        Post::new(1, &config)
            .store(attrs([("last", now)]))
            .await
            .unwrap();
        let loaded = Post::new(1, &config)
            .retrieve_value("last", DefaultValue::from(AttrValue::null()))
            .await
            .unwrap();
        assert_eq!(loaded.as_time().unwrap().timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn test_expire_storage() {
        let fx = Fixture::new("expire-storage");
        let config = fx.config(|b| b);
        let post = Post::new(1, &config);

        post.store(attrs([("a", 1)])).await.unwrap();
        post.expire_storage(Expiry::Never, None).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), None);
        post.expire_storage(Expiry::Seconds(30), None).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1").await.unwrap(), Some(30));
        assert_eq!(post.storage_expiry(None), ExpiresIn::Never);
    }

    #[tokio::test]
    async fn test_global_backend_is_used_when_not_pinned() {
        let fx = Fixture::new("global");
        let config = EntityTypeConfig::<Post>::builder().build().unwrap();
        crate::config::Config::set_backend(fx.backend());

        let post = Post::new(42, &config);
        post.store(attrs([("a", 1)])).await.unwrap();
        assert!(fx.store.exists("Post-42").await.unwrap());
    }

    #[test]
    fn test_bucket_kind_checks() {
        let fx = Fixture::new("kinds");
        let config = fx.config(|b| {
            b.bucket("stats", BucketOptions::hash())
                .bucket("views", BucketOptions::counter())
        });
        let post = Post::new(1, &config);

        assert!(post.bucket("stats").is_ok());
        assert!(post.counter("views").is_ok());
        assert_matches!(post.bucket("views").err(), Some(Error::Configuration(_)));
        assert_matches!(post.counter("stats").err(), Some(Error::Configuration(_)));
        assert_matches!(post.bucket("nope").err(), Some(Error::Configuration(_)));
    }
}
