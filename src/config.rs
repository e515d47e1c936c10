//! Configuration
//!
//! - [`Config`]: the process-wide backend and type registry, swappable at
//!   runtime
//! - [`StoreSpec`]: a store address (`memory://name`, `file:///path`)
//! - [`BackendSettings`]: a declarative backend chain, loadable from YAML

use crate::backend::{
    BackendRef, Connector, FileConnector, MemoryConnector, MultiBackend, StoreBackend, StoreOptions,
};
use crate::backend::pool::DEFAULT_POOL_SIZE;
use crate::codec::{JsonTypeAdapter, TypeRegistry};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Global Configuration
// =============================================================================

struct GlobalState {
    backend: Option<BackendRef>,
    registry: TypeRegistry,
}

static GLOBAL: Lazy<RwLock<GlobalState>> = Lazy::new(|| {
    RwLock::new(GlobalState {
        backend: None,
        registry: TypeRegistry::with_defaults(),
    })
});

/// Process-wide configuration
pub struct Config;

impl Config {
    /// Install the active backend
    pub fn set_backend(backend: BackendRef) {
        info!(backend = %backend.fingerprint(), "Configured global backend");
        GLOBAL.write().backend = Some(backend);
    }

    /// Active backend
    pub fn backend() -> Result<BackendRef> {
        GLOBAL
            .read()
            .backend
            .clone()
            .ok_or_else(|| Error::Configuration("no backend configured".to_string()))
    }

    pub fn clear_backend() {
        GLOBAL.write().backend = None;
    }

    /// Snapshot of the registered type adapters
    pub fn type_registry() -> TypeRegistry {
        GLOBAL.read().registry.clone()
    }

    /// Allow a tagged JSON type to be decoded on retrieve
    pub fn allow_json_create(adapter: Arc<dyn JsonTypeAdapter>) {
        GLOBAL.write().registry.register(adapter);
    }
}

// =============================================================================
// Store Address
// =============================================================================

/// Address of one key-value store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StoreSpec {
    Memory(String),
    File(PathBuf),
}

impl StoreSpec {
    /// Open a connector for this store
    pub fn connector(&self) -> Result<Arc<dyn Connector>> {
        match self {
            StoreSpec::Memory(name) => Ok(Arc::new(MemoryConnector::named(name))),
            StoreSpec::File(path) => Ok(Arc::new(FileConnector::open(path)?)),
        }
    }
}

impl FromStr for StoreSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix("memory://") {
            if name.is_empty() {
                return Err(Error::Configuration(format!("missing store name in {:?}", s)));
            }
            return Ok(StoreSpec::Memory(name.to_string()));
        }
        if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(Error::Configuration(format!("missing path in {:?}", s)));
            }
            return Ok(StoreSpec::File(PathBuf::from(path)));
        }
        Err(Error::Configuration(format!(
            "unsupported store address {:?} (expected memory://<name> or file://<path>)",
            s
        )))
    }
}

impl TryFrom<String> for StoreSpec {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<StoreSpec> for String {
    fn from(spec: StoreSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for StoreSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSpec::Memory(name) => write!(f, "memory://{}", name),
            StoreSpec::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

// =============================================================================
// Backend Settings
// =============================================================================

/// Declarative backend description
///
/// ```yaml
/// stores:            # newest first
///   - memory://cache
///   - file:///var/lib/ephemeral
/// thread_safe: true
/// pool_size: 8
/// ```
///
/// One store builds a [`StoreBackend`]; several build a [`MultiBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub stores: Vec<StoreSpec>,
    #[serde(default)]
    pub thread_safe: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl BackendSettings {
    pub fn new(stores: Vec<StoreSpec>) -> Self {
        Self {
            stores,
            thread_safe: false,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    fn options(&self) -> StoreOptions {
        StoreOptions {
            thread_safe: self.thread_safe,
            pool_size: self.pool_size,
        }
    }

    /// Build the backend this describes
    pub fn build(&self) -> Result<BackendRef> {
        let mut backends = self
            .stores
            .iter()
            .map(|spec| {
                let backend: BackendRef =
                    Arc::new(StoreBackend::new(spec.connector()?, self.options()));
                Ok(backend)
            })
            .collect::<Result<Vec<_>>>()?;

        match backends.len() {
            0 => Err(Error::Configuration("no stores configured".to_string())),
            1 => Ok(backends.remove(0)),
            _ => Ok(Arc::new(MultiBackend::new(backends)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Expiry};
    use assert_matches::assert_matches;

    #[test]
    fn test_store_spec_parsing() {
        assert_eq!(
            "memory://main".parse::<StoreSpec>().unwrap(),
            StoreSpec::Memory("main".into())
        );
        assert_eq!(
            "file:///tmp/store".parse::<StoreSpec>().unwrap(),
            StoreSpec::File(PathBuf::from("/tmp/store"))
        );
        assert_eq!(StoreSpec::Memory("a".into()).to_string(), "memory://a");
        assert_matches!("redis://localhost".parse::<StoreSpec>(), Err(Error::Configuration(_)));
        assert_matches!("memory://".parse::<StoreSpec>(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_settings_from_yaml() {
        let yaml = r#"
stores:
  - memory://config-tests-new
  - memory://config-tests-old
thread_safe: true
"#;
        let settings = BackendSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.stores.len(), 2);
        assert!(settings.thread_safe);
        assert_eq!(settings.pool_size, DEFAULT_POOL_SIZE);

        assert_matches!(
            BackendSettings::from_yaml_str("stores: [\"ftp://x\"]"),
            Err(Error::YamlParse(_))
        );
    }

    #[tokio::test]
    async fn test_build_multi_migrates() {
        let settings = BackendSettings::new(vec![
            StoreSpec::Memory("config-tests-build-new".into()),
            StoreSpec::Memory("config-tests-build-old".into()),
        ]);
        let backend = settings.build().unwrap();
        assert!(backend.fingerprint().starts_with("multi("));

        let old = StoreBackend::memory("config-tests-build-old");
        old.set("k", "v", Expiry::Never).await.unwrap();
        assert_eq!(backend.get("k", Expiry::Never).await.unwrap().as_deref(), Some("v"));
        assert!(!old.exists("k").await.unwrap());
    }

    #[test]
    fn test_build_rejects_bad_chains() {
        assert_matches!(BackendSettings::new(vec![]).build().err(), Some(Error::Configuration(_)));

        let dup = BackendSettings::new(vec![
            StoreSpec::Memory("config-tests-dup".into()),
            StoreSpec::Memory("config-tests-dup".into()),
        ]);
        assert_matches!(dup.build().err(), Some(Error::DuplicateBackend { .. }));
    }

    #[test]
    fn test_global_registry_has_time() {
        let registry = Config::type_registry();
        assert!(registry.is_enabled());
        assert!(registry.resolve("Time").is_some());
    }
}
