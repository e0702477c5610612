//! Disk-backed cache storage.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<cache name>/<sha256(key)>.entry
//! ```
//!
//! An entry file is a 4-byte big-endian header length, the JSON header (key,
//! status, headers, time) and then the raw body. Each put writes the whole file
//! under a unique temporary name and renames it into place, so concurrent puts
//! of the same key leave exactly one writer's entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::{SwError, SwResult};

const ENTRY_EXTENSION: &str = "entry";
const HEADER_LEN_BYTES: usize = 4;

/// Header of a stored entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    status: u16,
    headers: Vec<(String, String)>,
    cached_at: DateTime<Utc>,
}

impl StoredEntry {
    fn encode(&self, body: &[u8]) -> SwResult<Vec<u8>> {
        let header = serde_json::to_vec(self)?;
        let len = u32::try_from(header.len())
            .map_err(|_| SwError::Cache("entry header too large".to_string()))?;
        let mut out = Vec::with_capacity(HEADER_LEN_BYTES + header.len() + body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Split an entry file into its header and body.
    fn decode(raw: &[u8]) -> SwResult<(Self, &[u8])> {
        let corrupt = || SwError::Cache("truncated cache entry".to_string());
        let prefix: [u8; HEADER_LEN_BYTES] = raw
            .get(..HEADER_LEN_BYTES)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(corrupt)?;
        let header_end = HEADER_LEN_BYTES + u32::from_be_bytes(prefix) as usize;
        let header = raw.get(HEADER_LEN_BYTES..header_end).ok_or_else(corrupt)?;
        Ok((serde_json::from_slice(header)?, &raw[header_end..]))
    }
}

/// Cache storage persisted under a directory.
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    /// Open storage rooted at `root`, creating the directory if needed.
    pub async fn open_root(root: impl Into<PathBuf>) -> SwResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Disk cache storage ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> SwResult<PathBuf> {
        let invalid = name.is_empty()
            || name == "."
            || name.contains("..")
            || name.contains(['/', '\\'])
            || name.starts_with('.');
        if invalid {
            return Err(SwError::InvalidCacheName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    fn entry_path(dir: &Path, key: &RequestKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.method.as_bytes());
        hasher.update(b" ");
        hasher.update(key.url.as_bytes());
        dir.join(format!("{}.{ENTRY_EXTENSION}", hex::encode(hasher.finalize())))
    }

    async fn read_entry(path: &Path) -> SwResult<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(path: &Path, contents: &[u8]) -> SwResult<()> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SwError::Cache(format!("bad entry path {}", path.display())))?;
        let tmp = path.with_file_name(format!(
            "{file_name}.{}-{}.tmp",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_if_present(path: &Path) -> SwResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        fs::create_dir_all(self.cache_dir(name)?).await?;
        Ok(())
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        Ok(fs::try_exists(self.cache_dir(name)?).await?)
    }

    async fn delete_cache(&self, name: &str) -> SwResult<bool> {
        match fs::remove_dir_all(self.cache_dir(name)?).await {
            Ok(()) => {
                debug!(cache = %name, "Deleted cache directory");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn cache_names(&self) -> SwResult<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = item.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get(&self, cache: &str, key: &RequestKey) -> SwResult<Option<CacheEntry>> {
        let path = Self::entry_path(&self.cache_dir(cache)?, key);
        let Some(raw) = Self::read_entry(&path).await? else {
            return Ok(None);
        };
        let (stored, body) = StoredEntry::decode(&raw)?;

        if stored.key != *key {
            warn!(cache = %cache, key = %key, "Hash collision or corrupt entry, treating as miss");
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            body: Bytes::copy_from_slice(body),
            key: stored.key,
            status: stored.status,
            headers: stored.headers,
            cached_at: stored.cached_at,
        }))
    }

    async fn put(&self, cache: &str, entry: CacheEntry) -> SwResult<()> {
        let dir = self.cache_dir(cache)?;
        if !fs::try_exists(&dir).await? {
            return Err(SwError::CacheNotFound(cache.to_string()));
        }

        let path = Self::entry_path(&dir, &entry.key);
        let stored = StoredEntry {
            key: entry.key,
            status: entry.status,
            headers: entry.headers,
            cached_at: entry.cached_at,
        };
        Self::write_atomic(&path, &stored.encode(&entry.body)?).await
    }

    async fn delete(&self, cache: &str, key: &RequestKey) -> SwResult<bool> {
        Self::remove_if_present(&Self::entry_path(&self.cache_dir(cache)?, key)).await
    }

    async fn keys(&self, cache: &str) -> SwResult<Vec<RequestKey>> {
        let dir = self.cache_dir(cache)?;
        let mut listing = match fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            // Deleted between listing and reading.
            let Some(raw) = Self::read_entry(&path).await? else {
                continue;
            };
            let (stored, _) = StoredEntry::decode(&raw)?;
            keys.push(stored.key);
        }
        Ok(keys)
    }
}
