//! File Disk Cache - Local Overflow Tier
//!
//! A conforming disk auxiliary. Each element is one file in a directory,
//! encoded as a JSON document and LZ4-compressed above a size threshold.
//! An in-memory index maps keys to file ids; it is rebuilt from the
//! directory on open so spooled elements survive a restart.
//!
//! # Design
//!
//! - Writes go to a temp file and are renamed into place, so a crash never
//!   leaves a half-written element behind
//! - One header byte records whether the payload is compressed
//! - Encode failures surface as `Error::Serialization` (not transient: the
//!   handle drops the write instead of buffering it)

use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auxiliary::{AuxiliaryCache, AuxiliaryStatus};
use super::element::CacheElement;
use super::matcher::KeyMatcher;
use super::stats::StatElement;
use crate::error::{Error, Result};

const HEADER_RAW: u8 = 0;
const HEADER_LZ4: u8 = 1;
const FILE_EXTENSION: &str = "elem";

const STATUS_ALIVE: u8 = 0;
const STATUS_DISPOSED: u8 = 2;

/// Disk tier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDiskCacheConfig {
    /// Auxiliary name
    pub name: String,
    /// Directory holding element files
    pub directory: PathBuf,
    /// LZ4 high-compression level
    pub compression_level: i32,
    /// Payloads smaller than this are stored uncompressed
    pub min_compress_bytes: usize,
}

impl Default for FileDiskCacheConfig {
    fn default() -> Self {
        Self {
            name: "disk".to_string(),
            directory: std::env::temp_dir().join("stratacache"),
            compression_level: 4,
            min_compress_bytes: 256,
        }
    }
}

/// Directory-backed overflow tier
pub struct FileDiskCache<K: Hash + Eq, V> {
    config: FileDiskCacheConfig,
    index: DashMap<K, Uuid>,
    status: AtomicU8,
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    bytes_written: AtomicU64,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<K, V> FileDiskCache<K, V>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (or create) the directory and index any elements already on disk
    pub async fn open(config: FileDiskCacheConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory).await?;

        let cache = Self {
            config,
            index: DashMap::new(),
            status: AtomicU8::new(STATUS_ALIVE),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            _value: std::marker::PhantomData,
        };
        let recovered = cache.rebuild_index().await?;
        info!(
            auxiliary = %cache.config.name,
            directory = %cache.config.directory.display(),
            recovered,
            "Disk cache opened"
        );
        Ok(cache)
    }

    async fn rebuild_index(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.config.directory).await?;
        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match self.read_element(&path).await {
                Ok(element) => {
                    self.index.insert(element.key().clone(), id);
                    recovered += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable disk element");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        Ok(recovered)
    }

    /// Move a staged write into place. Returns false when the key was
    /// removed (or re-keyed) while the write was in flight; the file is
    /// deleted again so a reopen cannot resurrect it.
    async fn publish(&self, key: &K, id: Uuid, staging: &Path) -> Result<bool> {
        let target = self.path_for(&id);
        tokio::fs::rename(staging, &target).await?;

        if self.index.get(key).map(|entry| *entry.value()) == Some(id) {
            return Ok(true);
        }
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(auxiliary = %self.config.name, file = %id, "Discarded write for removed key");
        Ok(false)
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.config.directory.join(format!("{}.{}", id, FILE_EXTENSION))
    }

    fn encode(&self, element: &CacheElement<K, V>) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(element)?;
        if json.len() < self.config.min_compress_bytes {
            let mut out = Vec::with_capacity(json.len() + 1);
            out.push(HEADER_RAW);
            out.extend_from_slice(&json);
            return Ok(out);
        }

        let compressed = lz4::block::compress(
            &json,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.compression_level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?;
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(HEADER_LZ4);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn decode(data: &[u8]) -> Result<CacheElement<K, V>> {
        let Some((&header, payload)) = data.split_first() else {
            return Err(Error::Serialization("empty element file".into()));
        };
        match header {
            HEADER_RAW => Ok(serde_json::from_slice(payload)?),
            HEADER_LZ4 => {
                let json = lz4::block::decompress(payload, None).map_err(|e| Error::DecompressionFailed {
                    algorithm: "LZ4".into(),
                    reason: e.to_string(),
                })?;
                Ok(serde_json::from_slice(&json)?)
            }
            other => Err(Error::Serialization(format!("unknown element header {}", other))),
        }
    }

    async fn read_element(&self, path: &Path) -> Result<CacheElement<K, V>> {
        let data = tokio::fs::read(path).await?;
        Self::decode(&data)
    }

    fn check_alive(&self) -> Result<()> {
        if self.status.load(Ordering::Acquire) != STATUS_ALIVE {
            return Err(Error::AuxiliaryUnavailable {
                name: self.config.name.clone(),
                reason: "disposed".into(),
            });
        }
        Ok(())
    }

    /// Number of indexed elements
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Backing directory
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }
}

#[async_trait]
impl<K, V> AuxiliaryCache<K, V> for FileDiskCache<K, V>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn get(&self, key: &K) -> Result<Option<CacheElement<K, V>>> {
        self.check_alive()?;
        let Some(id) = self.index.get(key).map(|e| *e.value()) else {
            return Ok(None);
        };
        self.reads.fetch_add(1, Ordering::Relaxed);

        match self.read_element(&self.path_for(&id)).await {
            Ok(element) => Ok(Some(element)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.remove(key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, element: &CacheElement<K, V>) -> Result<()> {
        self.check_alive()?;
        let data = self.encode(element)?;

        let id = *self.index.entry(element.key().clone()).or_insert_with(Uuid::new_v4);
        let staging = self.config.directory.join(format!("{}.tmp", Uuid::new_v4()));

        tokio::fs::write(&staging, &data).await?;
        if !self.publish(element.key(), id, &staging).await? {
            return Ok(());
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!(auxiliary = %self.config.name, file = %id, bytes = data.len(), "Element written to disk");
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<bool> {
        self.check_alive()?;
        let Some((_, id)) = self.index.remove(key) else {
            return Ok(false);
        };
        self.removes.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_file(self.path_for(&id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_all(&self) -> Result<()> {
        self.check_alive()?;
        let ids: Vec<Uuid> = self.index.iter().map(|e| *e.value()).collect();
        self.index.clear();
        for id in ids {
            if let Err(e) = tokio::fs::remove_file(self.path_for(&id)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.status.store(STATUS_DISPOSED, Ordering::Release);
        info!(auxiliary = %self.config.name, elements = self.index.len(), "Disk cache disposed");
        Ok(())
    }

    fn status(&self) -> AuxiliaryStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_ALIVE => AuxiliaryStatus::Alive,
            _ => AuxiliaryStatus::Disposed,
        }
    }

    async fn key_set(&self) -> Result<Vec<K>> {
        self.check_alive()?;
        Ok(self.index.iter().map(|e| e.key().clone()).collect())
    }

    async fn get_matching(&self, matcher: &dyn KeyMatcher<K>) -> Result<Vec<CacheElement<K, V>>> {
        self.check_alive()?;
        let keys: Vec<K> = self
            .index
            .iter()
            .filter(|e| matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(element) = self.get(&key).await? {
                found.push(element);
            }
        }
        Ok(found)
    }

    fn statistics(&self) -> Vec<StatElement> {
        vec![
            StatElement::new("Object Count", self.index.len()),
            StatElement::new("Directory", self.config.directory.display()),
            StatElement::new("Reads", self.reads.load(Ordering::Relaxed)),
            StatElement::new("Writes", self.writes.load(Ordering::Relaxed)),
            StatElement::new("Removes", self.removes.load(Ordering::Relaxed)),
            StatElement::new("Bytes Written", self.bytes_written.load(Ordering::Relaxed)),
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================
