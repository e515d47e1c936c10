//! Counter buckets
//!
//! Integer counters kept directly in the backend. Nothing is cached, so
//! every read and increment sees what other instances have done.

use super::bucket::admit;
use super::config::{BucketDescriptor, OperationCall};
use super::{write_expiry, Entity};
use crate::backend::{Backend, BackendRef, Expiry};
use crate::error::{Error, Result};
use serde_json::Value;
use tracing::debug;

// =============================================================================
// Operations
// =============================================================================

struct CounterTarget {
    backend: BackendRef,
    key: String,
    configured: Expiry,
}

fn target<E: Entity>(entity: &E, bucket: &str) -> Result<CounterTarget> {
    let config = entity.storage_state().config();
    Ok(CounterTarget {
        configured: config.storage_expiry(Some(bucket)).resolve()?,
        backend: config.backend()?,
        key: entity.storage_key(Some(bucket)),
    })
}

/// Overwrite a counter, carrying over its TTL if it already exists
pub(crate) async fn store_counter<E: Entity>(entity: &E, bucket: &str, value: i64) -> Result<()> {
    let t = target(entity, bucket)?;
    let exists = t.backend.existsc(&t.key).await?;
    let expiry = write_expiry(t.backend.as_ref(), &t.key, t.configured, !exists).await?;
    t.backend.setc(&t.key, value, expiry).await
}

pub(crate) async fn retrieve_counter<E: Entity>(
    entity: &E,
    bucket: &str,
    default: i64,
) -> Result<i64> {
    let t = target(entity, bucket)?;
    Ok(t.backend.getc(&t.key, t.configured).await?.unwrap_or(default))
}

/// Add `delta` (negative to decrement) to a counter
///
/// A missing counter is first seeded when the bucket has a seed. The
/// configured expiry only applies when the increment creates the key.
pub(crate) async fn adjust_counter<E: Entity>(
    entity: &E,
    descriptor: &BucketDescriptor<E>,
    delta: i64,
) -> Result<i64> {
    let bucket = descriptor.name.as_str();
    let t = target(entity, bucket)?;

    if let Some(seed) = descriptor.seed_value(entity) {
        if !t.backend.existsc(&t.key).await? {
            debug!(key = %t.key, seed, "Seeding counter");
            store_counter(entity, bucket, seed).await?;
        }
    }

    let expiry = if t.backend.existsc(&t.key).await? {
        Expiry::Never
    } else {
        t.configured
    };
    match delta.checked_neg() {
        Some(amount) if delta < 0 => t.backend.decrby(&t.key, amount, expiry).await,
        _ => t.backend.incrby(&t.key, delta, expiry).await,
    }
}

pub(crate) async fn delete_counter<E: Entity>(entity: &E, bucket: &str) -> Result<()> {
    let t = target(entity, bucket)?;
    t.backend.delc(&t.key).await?;
    entity.storage_state().cache().clear(Some(bucket));
    Ok(())
}

// =============================================================================
// Named Counter Bucket
// =============================================================================

/// A counter bucket of one entity instance
///
/// Operations denied by the bucket's condition return the default (for
/// reads) or `None` (for increments) without touching the backend.
pub struct CounterBucket<'a, E: Entity> {
    entity: &'a E,
    descriptor: &'a BucketDescriptor<E>,
}

impl<'a, E: Entity> CounterBucket<'a, E> {
    pub(crate) fn new(entity: &'a E, descriptor: &'a BucketDescriptor<E>) -> Self {
        Self { entity, descriptor }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn key(&self) -> String {
        self.entity.storage_key(Some(self.name()))
    }

    async fn admit(&self, operation: String, args: Vec<Value>) -> Result<bool> {
        admit(
            self.entity,
            self.descriptor,
            OperationCall::new(operation, args),
        )
        .await
    }

    pub async fn store(&self, value: i64) -> Result<()> {
        if !self
            .admit(format!("store_{}", self.name()), vec![value.into()])
            .await?
        {
            return Ok(());
        }
        store_counter(self.entity, self.name(), value).await
    }

    pub async fn retrieve(&self, default: i64) -> Result<i64> {
        if !self
            .admit(format!("retrieve_{}", self.name()), vec![default.into()])
            .await?
        {
            return Ok(default);
        }
        retrieve_counter(self.entity, self.name(), default).await
    }

    pub async fn increment(&self) -> Result<Option<i64>> {
        self.adjust(format!("increment_{}", self.name()), vec![], 1)
            .await
    }

    pub async fn increment_by(&self, amount: i64) -> Result<Option<i64>> {
        self.adjust(
            format!("increment_{}_by", self.name()),
            vec![amount.into()],
            amount,
        )
        .await
    }

    pub async fn decrement(&self) -> Result<Option<i64>> {
        self.adjust(format!("decrement_{}", self.name()), vec![], -1)
            .await
    }

    pub async fn decrement_by(&self, amount: i64) -> Result<Option<i64>> {
        let delta = amount.checked_neg().ok_or_else(|| {
            Error::Configuration(format!("cannot decrement by {}", amount))
        })?;
        self.adjust(
            format!("decrement_{}_by", self.name()),
            vec![amount.into()],
            delta,
        )
        .await
    }

    async fn adjust(&self, operation: String, args: Vec<Value>, delta: i64) -> Result<Option<i64>> {
        if !self.admit(operation, args).await? {
            return Ok(None);
        }
        adjust_counter(self.entity, self.descriptor, delta)
            .await
            .map(Some)
    }

    pub async fn delete(&self) -> Result<()> {
        if !self
            .admit(format!("delete_{}", self.name()), vec![])
            .await?
        {
            return Ok(());
        }
        delete_counter(self.entity, self.name()).await
    }

    /// Counters are never cached; only runs the condition
    pub async fn clear(&self) -> Result<()> {
        if self
            .admit(format!("clear_{}", self.name()), vec![])
            .await?
        {
            self.entity.storage_state().cache().clear(Some(self.name()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MultiBackend;
    use crate::entity::tests::{Fixture, Post};
    use crate::entity::{BucketOptions, EntityStorageExt, EntityTypeConfig, Guard};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_increment_and_retrieve() {
        let fx = Fixture::new("counter-basic");
        let config = fx.config(|b| b.bucket("views", BucketOptions::counter()));
        let post = Post::new(1, &config);
        let views = post.counter("views").unwrap();

        assert_eq!(views.retrieve(0).await.unwrap(), 0);
        assert_eq!(views.increment().await.unwrap(), Some(1));
        assert_eq!(views.increment_by(4).await.unwrap(), Some(5));
        assert_eq!(views.decrement().await.unwrap(), Some(4));
        assert_eq!(views.decrement_by(2).await.unwrap(), Some(2));

        // Independent instances share the counter
        let other = Post::new(1, &config);
        assert_eq!(other.counter("views").unwrap().retrieve(0).await.unwrap(), 2);

        views.store(10).await.unwrap();
        assert_eq!(views.retrieve(0).await.unwrap(), 10);
        views.delete().await.unwrap();
        assert_eq!(views.retrieve(-1).await.unwrap(), -1);
        assert!(!fx.store.existsc("Post-1-views").await.unwrap());
    }

    #[tokio::test]
    async fn test_seed_applies_once() {
        let fx = Fixture::new("counter-seed");
        let config = fx.config(|b| {
            b.bucket(
                "views",
                BucketOptions::counter().seed(|post: &Post| post.id as i64 * 100),
            )
        });
        let post = Post::new(3, &config);
        let views = post.counter("views").unwrap();

        assert_eq!(views.increment().await.unwrap(), Some(301));
        assert_eq!(views.increment().await.unwrap(), Some(302));
        assert_eq!(views.decrement_by(2).await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_expiry_set_on_create_only() {
        let fx = Fixture::new("counter-ttl");
        let config = fx.config(|b| b.bucket("views", BucketOptions::counter().expires_in(60)));
        let post = Post::new(1, &config);
        let views = post.counter("views").unwrap();

        views.increment().await.unwrap();
        assert_eq!(fx.store.ttl("Post-1-views").await.unwrap(), Some(60));

        fx.clock.advance_secs(10);
        views.increment().await.unwrap();
        assert_eq!(fx.store.ttl("Post-1-views").await.unwrap(), Some(50));

        // Overwriting keeps the remaining TTL
        fx.clock.advance_secs(10);
        views.store(7).await.unwrap();
        assert_eq!(fx.store.ttl("Post-1-views").await.unwrap(), Some(40));
        assert_eq!(views.retrieve(0).await.unwrap(), 7);

        // And expiry is honoured
        fx.clock.advance_secs(41);
        assert_eq!(views.retrieve(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_frequent_overwrites_keep_deadline() {
        let fx = Fixture::new("counter-ttl-frequent");
        let config = fx.config(|b| b.bucket("views", BucketOptions::counter().expires_in(5)));
        let post = Post::new(1, &config);
        let views = post.counter("views").unwrap();

        views.store(0).await.unwrap();
        for n in 1..10 {
            fx.clock.advance_ms(450);
            views.store(n).await.unwrap();
        }
        assert_eq!(fx.store.pttl("Post-1-views").await.unwrap(), Some(950));

        fx.clock.advance_ms(950);
        assert_eq!(views.retrieve(-1).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_denied_counter_ops() {
        let fx = Fixture::new("counter-guard");
        let config = fx.config(|b| {
            b.bucket(
                "views",
                BucketOptions::counter().condition(Guard::predicate(|post: &Post, call| {
                    post.id == 1 || call.name == "retrieve_views"
                })),
            )
        });

        let allowed = Post::new(1, &config);
        allowed.counter("views").unwrap().increment().await.unwrap();

        let denied = Post::new(2, &config);
        let views = denied.counter("views").unwrap();
        assert_eq!(views.increment().await.unwrap(), None);
        assert_eq!(views.decrement_by(3).await.unwrap(), None);
        views.store(5).await.unwrap();
        assert_eq!(views.retrieve(9).await.unwrap(), 9);
        assert!(!fx.store.existsc("Post-2-views").await.unwrap());
    }

    #[tokio::test]
    async fn test_non_integer_counter_fails() {
        let fx = Fixture::new("counter-invalid");
        let config = fx.config(|b| b.bucket("views", BucketOptions::counter()));
        let post = Post::new(1, &config);

        fx.store.set("Post-1-views", "abc", Expiry::Never).await.unwrap();
        assert_matches!(
            post.counter("views").unwrap().retrieve(0).await,
            Err(Error::InvalidCounter { .. })
        );
    }

    #[tokio::test]
    async fn test_counter_migrates_through_chain() {
        let newer = Fixture::new("counter-multi-new");
        let older = Fixture::new("counter-multi-old");
        let multi: BackendRef =
            Arc::new(MultiBackend::new(vec![newer.backend(), older.backend()]).unwrap());
        let config = EntityTypeConfig::<Post>::builder()
            .bucket("views", BucketOptions::counter())
            .backend(multi)
            .build()
            .unwrap();

        older.store.setc("Post-1-views", 5, Expiry::Never).await.unwrap();
        let post = Post::new(1, &config);
        let views = post.counter("views").unwrap();

        assert_eq!(views.retrieve(0).await.unwrap(), 5);
        assert_eq!(views.increment_by(3).await.unwrap(), Some(8));
        assert!(!older.store.existsc("Post-1-views").await.unwrap());
        assert_eq!(newer.store.getc("Post-1-views", Expiry::Never).await.unwrap(), Some(8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_exact() {
        let fx = Fixture::new("counter-concurrent");
        let config = fx.config(|b| b.bucket("views", BucketOptions::counter().expires_in(600)));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let config = config.clone();
                tokio::spawn(async move {
                    let post = Post::new(1, &config);
                    for _ in 0..25 {
                        post.counter("views").unwrap().increment().await.unwrap();
                    }
                })
            })
            .collect();
        futures::future::try_join_all(tasks).await.unwrap();

        let post = Post::new(1, &config);
        assert_eq!(post.counter("views").unwrap().retrieve(0).await.unwrap(), 400);
        assert_eq!(fx.store.ttl("Post-1-views").await.unwrap(), Some(600));
    }
}
