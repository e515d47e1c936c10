//! Directory Store
//!
//! Key-value store kept in a directory: one JSON record per key, placed in
//! hash-sharded subdirectories. Records are replaced by writing a temp file
//! and renaming it over the old one. An advisory lock file serialises
//! read-modify-write across threads and processes; readers take it shared.

use crate::backend::clock::{system_clock, ClockRef};
use crate::backend::store::{Command, Connector, KeyTtl, KvConnection, Reply};
use crate::error::{Error, Result};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const LOCK_FILE: &str = ".lock";
const RECORD_EXTENSION: &str = "json";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Record
// =============================================================================

/// On-disk record for one key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    key: String,
    value: String,
    /// Absolute expiry (Unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl Record {
    fn persistent(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
            expires_at_ms: None,
        }
    }
}

/// Held advisory lock; released on drop
struct StoreLock(File);

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

// =============================================================================
// File Store
// =============================================================================

/// Directory-backed key-value store
pub struct FileStore {
    root: PathBuf,
    clock: ClockRef,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_clock(root, system_clock())
    }

    pub fn with_clock(root: impl AsRef<Path>, clock: ClockRef) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        let root = fs::canonicalize(root.as_ref())?;
        debug!(root = %root.display(), "Opened directory store");
        Ok(Self { root, clock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store address
    pub fn url(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();
        self.root
            .join(format!("{:02x}", hash & 0xff))
            .join(format!("{:016x}.{}", hash, RECORD_EXTENSION))
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE))?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(StoreLock(file))
    }

    // -------------------------------------------------------------------------
    // Record IO (caller holds the lock)
    // -------------------------------------------------------------------------

    fn read_record(&self, key: &str) -> Result<Option<Record>> {
        let path = self.record_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: Record = serde_json::from_str(&raw)?;
        if record.key != key {
            return Ok(None);
        }
        if let Some(at) = record.expires_at_ms {
            if at <= self.clock.now_ms() {
                debug!(key, "Reaping expired record");
                remove_if_present(&path)?;
                return Ok(None);
            }
        }
        Ok(Some(record))
    }

    fn write_record(&self, record: &Record) -> Result<()> {
        let path = self.record_path(&record.key);
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }
        let tmp = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(record)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_record(&self, key: &str) -> Result<bool> {
        let existed = self.read_record(key)?.is_some();
        if existed {
            remove_if_present(&self.record_path(key))?;
        }
        Ok(existed)
    }

    fn incr_record(&self, key: &str, delta: i64) -> Result<i64> {
        let mut record = self
            .read_record(key)?
            .unwrap_or_else(|| Record::persistent(key, "0"));
        let current: i64 = record
            .value
            .trim()
            .parse()
            .map_err(|_| Error::backend(self.url(), "incr_by", "value is not an integer"))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::backend(self.url(), "incr_by", "increment would overflow"))?;
        record.value = next.to_string();
        self.write_record(&record)?;
        Ok(next)
    }

    fn expire_record(&self, key: &str, millis: i64) -> Result<bool> {
        let Some(mut record) = self.read_record(key)? else {
            return Ok(false);
        };
        if millis <= 0 {
            remove_if_present(&self.record_path(key))?;
            return Ok(true);
        }
        record.expires_at_ms = Some(self.clock.now_ms().saturating_add(millis));
        self.write_record(&record)?;
        Ok(true)
    }

    fn apply(&self, command: Command) -> Result<Reply> {
        match command {
            Command::Set { key, value } => {
                self.write_record(&Record::persistent(&key, value))?;
                Ok(Reply::Ok)
            }
            Command::IncrBy { key, delta } => self.incr_record(&key, delta).map(Reply::Int),
            Command::Expire { key, seconds } => self
                .expire_record(&key, seconds.saturating_mul(1000))
                .map(Reply::Bool),
            Command::PExpire { key, millis } => self.expire_record(&key, millis).map(Reply::Bool),
        }
    }

    // -------------------------------------------------------------------------
    // Locked operations (blocking)
    // -------------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let _lock = self.lock(false)?;
        Ok(self.read_record(key)?.map(|r| r.value))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let _lock = self.lock(true)?;
        self.write_record(&Record::persistent(key, value))
    }

    pub fn del(&self, key: &str) -> Result<bool> {
        let _lock = self.lock(true)?;
        self.remove_record(key)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let _lock = self.lock(false)?;
        Ok(self.read_record(key)?.is_some())
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let _lock = self.lock(true)?;
        self.incr_record(key, delta)
    }

    pub fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        let _lock = self.lock(true)?;
        self.expire_record(key, seconds.saturating_mul(1000))
    }

    pub fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let _lock = self.lock(false)?;
        Ok(match self.read_record(key)? {
            None => KeyTtl::Missing,
            Some(Record {
                expires_at_ms: None,
                ..
            }) => KeyTtl::Persistent,
            Some(Record {
                expires_at_ms: Some(at),
                ..
            }) => {
                KeyTtl::Expires((at - self.clock.now_ms()).max(0))
            }
        })
    }

    /// Remove every record, keeping the root and lock file
    pub fn flush(&self) -> Result<()> {
        let _lock = self.lock(true)?;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }

    /// Apply a batch under one exclusive lock
    pub fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let _lock = self.lock(true)?;
        commands.into_iter().map(|c| self.apply(c)).collect()
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("directory store task failed: {}", e)))?
}

// =============================================================================
// Connection & Connector
// =============================================================================

/// Connection to a directory store
pub struct FileConnection {
    store: Arc<FileStore>,
    id: u64,
}

#[async_trait]
impl KvConnection for FileConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let (store, key) = (self.store.clone(), key.to_string());
        blocking(move || store.get(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let (store, key, value) = (self.store.clone(), key.to_string(), value.to_string());
        blocking(move || store.set(&key, &value)).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let (store, key) = (self.store.clone(), key.to_string());
        blocking(move || store.del(&key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let (store, key) = (self.store.clone(), key.to_string());
        blocking(move || store.exists(&key)).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let (store, key) = (self.store.clone(), key.to_string());
        blocking(move || store.incr_by(&key, delta)).await
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        let (store, key) = (self.store.clone(), key.to_string());
        blocking(move || store.expire(&key, seconds)).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let (store, key) = (self.store.clone(), key.to_string());
        blocking(move || store.ttl(&key)).await
    }

    async fn flush(&self) -> Result<()> {
        let store = self.store.clone();
        blocking(move || store.flush()).await
    }

    async fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let store = self.store.clone();
        blocking(move || store.atomic(commands)).await
    }
}

/// Connector for `file://<path>`
#[derive(Clone)]
pub struct FileConnector {
    store: Arc<FileStore>,
}

impl FileConnector {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: Arc::new(FileStore::open(root)?),
        })
    }

    pub fn for_store(store: Arc<FileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn fingerprint(&self) -> String {
        self.store.url()
    }

    async fn connect(&self) -> Result<Box<dyn KvConnection>> {
        Ok(Box::new(FileConnection {
            store: self.store.clone(),
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::clock::ManualClock;
    use tempfile::TempDir;

    fn test_store() -> (FileStore, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = FileStore::with_clock(temp_dir.path(), clock.clone()).unwrap();
        (store, clock, temp_dir)
    }

    #[test]
    fn test_basic_operations() {
        let (store, _clock, _dir) = test_store();

        store.set("Post-1", "{\"title\":\"hello\"}").unwrap();
        assert_eq!(
            store.get("Post-1").unwrap().as_deref(),
            Some("{\"title\":\"hello\"}")
        );
        assert!(store.exists("Post-1").unwrap());
        assert_eq!(store.ttl("Post-1").unwrap(), KeyTtl::Persistent);

        assert!(store.del("Post-1").unwrap());
        assert!(!store.del("Post-1").unwrap());
        assert_eq!(store.get("Post-1").unwrap(), None);
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        FileStore::open(temp_dir.path())
            .unwrap()
            .set("k", "v")
            .unwrap();

        let reopened = FileStore::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_expiry_reaps_record() {
        let (store, clock, _dir) = test_store();

        store.set("k", "v").unwrap();
        assert!(store.expire("k", 10).unwrap());
        clock.advance_secs(3);
        assert_eq!(store.ttl("k").unwrap(), KeyTtl::Expires(7_000));

        clock.advance_secs(7);
        assert!(!store.exists("k").unwrap());
        assert!(!store.record_path("k").exists());
    }

    #[test]
    fn test_millisecond_expiry() {
        let (store, clock, _dir) = test_store();

        store.set("k", "v").unwrap();
        store
            .atomic(vec![Command::PExpire {
                key: "k".into(),
                millis: 2_500,
            }])
            .unwrap();
        clock.advance_ms(600);
        assert_eq!(store.ttl("k").unwrap(), KeyTtl::Expires(1_900));
        assert_eq!(store.ttl("k").unwrap().remaining(), Some(1));

        clock.advance_ms(1_900);
        assert!(!store.exists("k").unwrap());
    }

    #[test]
    fn test_counters() {
        let (store, _clock, _dir) = test_store();

        assert_eq!(store.incr_by("c", 5).unwrap(), 5);
        store.expire("c", 60).unwrap();
        assert_eq!(store.incr_by("c", -2).unwrap(), 3);
        assert_eq!(store.ttl("c").unwrap(), KeyTtl::Expires(60_000));

        store.set("h", "{}").unwrap();
        assert!(store.incr_by("h", 1).is_err());
    }

    #[test]
    fn test_atomic_and_flush() {
        let (store, _clock, _dir) = test_store();
        let replies = store
            .atomic(vec![
                Command::Set {
                    key: "k".into(),
                    value: "v".into(),
                },
                Command::Expire {
                    key: "k".into(),
                    seconds: 30,
                },
            ])
            .unwrap();
        assert_eq!(replies, vec![Reply::Ok, Reply::Bool(true)]);
        assert_eq!(store.ttl("k").unwrap(), KeyTtl::Expires(30_000));

        store.flush().unwrap();
        assert!(!store.exists("k").unwrap());
        assert!(store.root().join(LOCK_FILE).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments() {
        let temp_dir = TempDir::new().unwrap();
        let connector = FileConnector::open(temp_dir.path()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let connector = connector.clone();
            handles.push(tokio::spawn(async move {
                let conn = connector.connect().await.unwrap();
                for _ in 0..10 {
                    conn.incr_by("hits", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let conn = connector.connect().await.unwrap();
        assert_eq!(conn.get("hits").await.unwrap().as_deref(), Some("80"));
        assert!(connector.fingerprint().starts_with("file://"));
    }
}
