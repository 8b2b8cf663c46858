//! Collaborator seams for the analysis core: atomic fingerprint registration,
//! get/put snapshot storage, deadlines, and content hashing.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gjd_core::{AnalysisError, ClusterId, Fingerprint};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gjd-storage";

const FIELD_SEPARATOR: u8 = 0x1f;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable hash over ordered identity fields. Fields are separated by the
/// ASCII unit separator so `("ab", "c")` and `("a", "bc")` never collide.
pub fn content_hash<'a>(fields: impl IntoIterator<Item = &'a str>) -> Fingerprint {
    let mut hasher = Sha256::new();
    for (idx, field) in fields.into_iter().enumerate() {
        if idx > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(field.as_bytes());
    }
    Fingerprint::from_hex(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} exceeded deadline of {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store payload could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Recoverable failure of the named collaborator, as seen by callers of the core.
    pub fn unavailable(self, dependency: &str) -> AnalysisError {
        AnalysisError::dependency(dependency, self)
    }
}

/// Runs a collaborator call under a caller-supplied deadline.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    deadline: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            after: deadline,
        }),
    }
}

/// Outcome of an atomic check-and-register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub existing: bool,
    pub cluster: ClusterId,
}

/// Fingerprint index backing store. `get_or_create` must be atomic per
/// fingerprint: concurrent callers observe exactly one winner.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ClusterId>, StoreError>;

    async fn get_or_create(
        &self,
        fingerprint: &Fingerprint,
        candidate: ClusterId,
    ) -> Result<Registration, StoreError>;
}

/// Plain get/put-by-key store for registry and weight snapshots.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(key, bytes).await
}

#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    entries: DashMap<Fingerprint, ClusterId>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ClusterId>, StoreError> {
        Ok(self.entries.get(fingerprint).map(|entry| *entry.value()))
    }

    async fn get_or_create(
        &self,
        fingerprint: &Fingerprint,
        candidate: ClusterId,
    ) -> Result<Registration, StoreError> {
        // The shard lock is held for the whole entry call, which makes the
        // check and the insert one step for this key.
        let registration = match self.entries.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => Registration {
                existing: true,
                cluster: *entry.get(),
            },
            Entry::Vacant(entry) => {
                entry.insert(candidate);
                Registration {
                    existing: false,
                    cluster: candidate,
                }
            }
        };
        Ok(registration)
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Directory-backed snapshot store. Each key lives in a hash-addressed file
/// that is replaced through a temp file and an atomic rename, so readers
/// never see a half-written snapshot.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path_for(key: &str) -> PathBuf {
        let digest = sha256_hex(key.as_bytes());
        PathBuf::from(&digest[..2]).join(format!("{digest}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.root.join(Self::relative_path_for(key));
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let absolute_path = self.root.join(Self::relative_path_for(key));
        let parent = absolute_path
            .parent()
            .ok_or_else(|| {
                StoreError::Backend(format!("no parent for {}", absolute_path.display()))
            })?
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), value.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&value).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(err));
        }
        debug!(key, path = %absolute_path.display(), bytes = value.len(), "snapshot stored");
        Ok(())
    }
}
