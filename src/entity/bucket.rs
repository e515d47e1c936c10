//! Hash buckets
//!
//! Load-once, merge-on-store attribute hashes. The default bucket and every
//! named hash bucket go through the same four operations here.

use super::config::{BucketDescriptor, OperationCall};
use super::{pick, write_expiry, DefaultValue, Defaults, Entity, Retrieved};
use crate::codec::{dump_hash, load_hash, AttrValue, Attrs};
use crate::config::Config;
use crate::error::Result;
use serde_json::Value;
use tracing::debug;

// =============================================================================
// Operations
// =============================================================================

/// Current hash of a bucket, loading it once per instance
pub(crate) async fn retrieve_hash<E: Entity>(entity: &E, bucket: Option<&str>) -> Result<Attrs> {
    let state = entity.storage_state();
    let cached = state.cache().loaded(bucket).cloned();
    if let Some(hash) = cached {
        return Ok(hash);
    }

    let expiry = state.config().storage_expiry(bucket).resolve()?;
    let backend = state.config().backend()?;
    let key = entity.storage_key(bucket);
    let raw = backend.get(&key, expiry).await?;

    let (hash, is_new) = match raw {
        Some(raw) => (load_hash(&raw, &Config::type_registry())?, false),
        None => (Attrs::new(), true),
    };
    debug!(key = %key, is_new, fields = hash.len(), "Loaded hash bucket");
    state.cache().insert(bucket, hash.clone(), is_new);
    Ok(hash)
}

/// Merge `updates` into a bucket and write it back
pub(crate) async fn store_hash<E: Entity>(
    entity: &E,
    updates: Attrs,
    bucket: Option<&str>,
) -> Result<()> {
    let mut hash = retrieve_hash(entity, bucket).await?;
    hash.extend(updates);

    let state = entity.storage_state();
    let configured = state.config().storage_expiry(bucket).resolve()?;
    let backend = state.config().backend()?;
    let key = entity.storage_key(bucket);
    let is_new = state.cache().is_new(bucket);

    let expiry = write_expiry(backend.as_ref(), &key, configured, is_new).await?;
    backend.set(&key, &dump_hash(&hash)?, expiry).await?;
    state.cache().insert(bucket, hash, false);
    Ok(())
}

pub(crate) async fn delete_hash<E: Entity>(entity: &E, bucket: Option<&str>) -> Result<()> {
    let state = entity.storage_state();
    let backend = state.config().backend()?;
    backend.del(&entity.storage_key(bucket)).await?;
    clear_hash(entity, bucket);
    Ok(())
}

pub(crate) fn clear_hash<E: Entity>(entity: &E, bucket: Option<&str>) {
    entity.storage_state().cache().clear(bucket);
}

/// Check a bucket's guard, running its fallback on denial
///
/// `Ok(false)` means the operation must not run.
pub(crate) async fn admit<E: Entity>(
    entity: &E,
    descriptor: &BucketDescriptor<E>,
    call: OperationCall,
) -> Result<bool> {
    if descriptor.guard.allows(entity, &call) {
        return Ok(true);
    }
    descriptor.fallback.run(entity, &call).await?;
    debug!(
        key = %entity.storage_key(Some(descriptor.name.as_str())),
        operation = %call.name,
        "Bucket operation denied by condition"
    );
    Ok(false)
}

fn attrs_arg(attrs: &Attrs) -> Value {
    Value::Object(
        attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

fn defaults_arg(defaults: &Defaults) -> Value {
    Value::Array(defaults.keys().map(|k| Value::String(k.clone())).collect())
}

// =============================================================================
// Named Hash Bucket
// =============================================================================

/// A named hash bucket of one entity instance
pub struct HashBucket<'a, E: Entity> {
    entity: &'a E,
    descriptor: &'a BucketDescriptor<E>,
}

impl<'a, E: Entity> HashBucket<'a, E> {
    pub(crate) fn new(entity: &'a E, descriptor: &'a BucketDescriptor<E>) -> Self {
        Self { entity, descriptor }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn key(&self) -> String {
        self.entity.storage_key(Some(self.name()))
    }

    fn call(&self, verb: &str, args: Vec<Value>) -> OperationCall {
        OperationCall::new(format!("{}_{}", verb, self.name()), args)
    }

    pub async fn store(&self, updates: Attrs) -> Result<()> {
        let call = self.call("store", vec![attrs_arg(&updates)]);
        if !admit(self.entity, self.descriptor, call).await? {
            return Ok(());
        }
        store_hash(self.entity, updates, Some(self.name())).await
    }

    /// Stored values, or their defaults
    ///
    /// A denied retrieve yields the defaults without touching the backend.
    pub async fn retrieve(&self, defaults: Defaults) -> Result<Retrieved> {
        let call = self.call("retrieve", vec![defaults_arg(&defaults)]);
        let hash = if admit(self.entity, self.descriptor, call).await? {
            retrieve_hash(self.entity, Some(self.name())).await?
        } else {
            Attrs::new()
        };
        Ok(pick(self.entity, &hash, &defaults))
    }

    pub async fn retrieve_value(&self, key: &str, default: DefaultValue) -> Result<AttrValue> {
        let mut single = Defaults::new();
        single.insert(key.to_string(), default);
        Ok(self.retrieve(single).await?.into_vec().remove(0))
    }

    pub async fn delete(&self) -> Result<()> {
        let call = self.call("delete", vec![]);
        if !admit(self.entity, self.descriptor, call).await? {
            return Ok(());
        }
        delete_hash(self.entity, Some(self.name())).await
    }

    /// Forget the cached copy
    pub async fn clear(&self) -> Result<()> {
        let call = self.call("clear", vec![]);
        if !admit(self.entity, self.descriptor, call).await? {
            return Ok(());
        }
        clear_hash(self.entity, Some(self.name()));
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.entity
            .storage_state()
            .cache()
            .is_loaded(Some(self.name()))
    }
}
