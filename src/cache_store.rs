//! Backing stores for the asset cache
//!
//! A store holds immutable entries addressed by a hex digest. Each entry is
//! written through an [`EntryWriter`] chunk by chunk and only becomes
//! visible on `commit`, so readers never observe a partial body.
//!
//! - [`FileStore`]: `<digest>.data` plus a bincode `<digest>.meta` sidecar
//! - [`MemoryStore`]: process-local map, used when no directory is configured

use crate::error::{GateError, Result};
use crate::models::ByteStream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Persisted description of one cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Hex digest the entry is stored under
    pub key: String,
    /// Logical asset path, matched by invalidation patterns
    pub path: String,
    pub domain: Option<String>,
    pub content_type: String,
    pub not_found: bool,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub len: u64,
    pub crc32: u32,
}

impl EntryMeta {
    pub fn new(
        key: &str,
        path: &str,
        domain: Option<&str>,
        content_type: &str,
        not_found: bool,
        ttl: Duration,
    ) -> Self {
        let now = now_ms();
        Self {
            key: key.to_string(),
            path: path.to_string(),
            domain: domain.map(|d| d.to_string()),
            content_type: content_type.to_string(),
            not_found,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            len: 0,
            crc32: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at_ms <= now_ms()
    }

    pub fn created_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_at_ms)
    }
}

/// A cache hit: metadata and a stream over the stored bytes
pub struct CachedEntry {
    pub meta: EntryMeta,
    pub stream: ByteStream,
}

/// Incremental writer for a single entry
#[async_trait]
pub trait EntryWriter: Send {
    async fn write(&mut self, chunk: &Bytes) -> Result<()>;

    /// Publish the entry; `meta.len` and `meta.crc32` are filled in here
    async fn commit(self: Box<Self>, meta: EntryMeta) -> Result<()>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry, dropping it if it has expired
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>>;

    /// Start writing an entry
    async fn begin(&self, key: &str) -> Result<Box<dyn EntryWriter>>;

    /// Remove every entry for which `matches` returns true
    ///
    /// # Returns
    /// Number of entries removed
    async fn remove_matching(&self, matches: &(dyn for<'m> Fn(&'m EntryMeta) -> bool + Sync)) -> Result<usize>;

    /// Remove everything
    async fn clear(&self) -> Result<usize>;
}

/// Directory-backed store
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            GateError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        info!("Initializing directory cache at {:?}", base_path);
        Ok(Self { base_path })
    }

    fn data_path(&self, key: &str) -> PathBuf {
        Self::entry_dir(&self.base_path, key).join(format!("{}.data", key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        Self::entry_dir(&self.base_path, key).join(format!("{}.meta", key))
    }

    /// Two-level fan-out on the digest prefix: `ab/cd/<key>`
    fn entry_dir(base_path: &Path, key: &str) -> PathBuf {
        let dir1 = key.get(0..2).unwrap_or("00");
        let dir2 = key.get(2..4).unwrap_or("00");
        base_path.join(dir1).join(dir2)
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
        match fs::read(path).await {
            Ok(raw) => bincode::deserialize(&raw).map(Some).map_err(|e| {
                GateError::CacheError(format!("Corrupt cache metadata {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GateError::CacheError(format!(
                "Failed to read cache metadata: {}",
                e
            ))),
        }
    }

    async fn remove_entry(&self, key: &str) {
        for path in [self.meta_path(key), self.data_path(key)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete cache file {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Every metadata file under the cache root
    async fn meta_files(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "meta") {
                    found.push(path);
                }
            }
        }

        Ok(found)
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        let meta = match Self::read_meta(&self.meta_path(key)).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("{}; dropping entry {}", e, key);
                self.remove_entry(key).await;
                return Ok(None);
            }
        };

        if meta.is_expired() {
            debug!("Cache entry expired: {}", key);
            self.remove_entry(key).await;
            return Ok(None);
        }

        let file = match fs::File::open(self.data_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Cache data missing for {}; dropping metadata", key);
                self.remove_entry(key).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let on_disk = file.metadata().await?.len();
        if on_disk != meta.len {
            warn!(
                "Cache data length mismatch for {}: expected {}, found {}",
                key, meta.len, on_disk
            );
            self.remove_entry(key).await;
            return Ok(None);
        }

        let stream = verified_stream(ReaderStream::new(file), meta.crc32, key.to_string());
        Ok(Some(CachedEntry { meta, stream }))
    }

    async fn begin(&self, key: &str) -> Result<Box<dyn EntryWriter>> {
        let dir = Self::entry_dir(&self.base_path, key);
        fs::create_dir_all(&dir).await.map_err(|e| {
            GateError::CacheError(format!("Failed to create cache directory: {}", e))
        })?;

        let temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| GateError::CacheError(format!("Failed to create cache file: {}", e)))?;
        let std_file = temp
            .reopen()
            .map_err(|e| GateError::CacheError(format!("Failed to open cache file: {}", e)))?;

        Ok(Box::new(FileEntryWriter {
            file: fs::File::from_std(std_file),
            temp_path: temp.into_temp_path(),
            data_path: self.data_path(key),
            meta_path: self.meta_path(key),
            hasher: crc32fast::Hasher::new(),
            len: 0,
        }))
    }

    async fn remove_matching(&self, matches: &(dyn for<'m> Fn(&'m EntryMeta) -> bool + Sync)) -> Result<usize> {
        let mut removed = 0;
        for meta_path in self.meta_files().await? {
            let Some(meta) = Self::read_meta(&meta_path).await.ok().flatten() else {
                continue;
            };
            if matches(&meta) {
                self.remove_entry(&meta.key).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize> {
        let removed = self.meta_files().await?.len();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            if let Err(e) = result {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        info!("Cleared directory cache, {} entries removed", removed);
        Ok(removed)
    }
}

struct FileEntryWriter {
    file: fs::File,
    temp_path: tempfile::TempPath,
    data_path: PathBuf,
    meta_path: PathBuf,
    hasher: crc32fast::Hasher,
    len: u64,
}

#[async_trait]
impl EntryWriter for FileEntryWriter {
    async fn write(&mut self, chunk: &Bytes) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| GateError::CacheError(format!("Failed to write data: {}", e)))?;
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>, mut meta: EntryMeta) -> Result<()> {
        let FileEntryWriter {
            mut file,
            temp_path,
            data_path,
            meta_path,
            hasher,
            len,
        } = *self;

        file.flush()
            .await
            .map_err(|e| GateError::CacheError(format!("Failed to flush data: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| GateError::CacheError(format!("Failed to sync file: {}", e)))?;
        drop(file);

        meta.len = len;
        meta.crc32 = hasher.finalize();

        temp_path
            .persist(&data_path)
            .map_err(|e| GateError::CacheError(format!("Failed to publish cache data: {}", e)))?;

        let encoded = bincode::serialize(&meta)
            .map_err(|e| GateError::CacheError(format!("Failed to encode metadata: {}", e)))?;
        let meta_tmp = meta_path.with_extension("meta.tmp");
        fs::write(&meta_tmp, encoded).await?;
        fs::rename(&meta_tmp, &meta_path).await?;

        debug!("Wrote cache entry {} ({} bytes)", meta.key, meta.len);
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        // TempPath removes the partial file on drop
        debug!("Discarded partial cache write {}", self.data_path.display());
    }
}

/// Stream over stored bytes that errors at the end if the CRC does not match
fn verified_stream(inner: ReaderStream<fs::File>, expected: u32, key: String) -> ByteStream {
    struct State {
        inner: ReaderStream<fs::File>,
        hasher: Option<crc32fast::Hasher>,
        expected: u32,
        key: String,
    }

    let state = State {
        inner,
        hasher: Some(crc32fast::Hasher::new()),
        expected,
        key,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        let hasher = state.hasher.as_mut()?;
        match state.inner.next().await {
            Some(Ok(chunk)) => {
                hasher.update(&chunk);
                Some((Ok(chunk), state))
            }
            Some(Err(e)) => {
                state.hasher = None;
                Some((Err(GateError::CacheError(e.to_string())), state))
            }
            None => {
                let actual = state.hasher.take()?.finalize();
                if actual == state.expected {
                    None
                } else {
                    warn!("Checksum mismatch for cache entry {}", state.key);
                    Some((
                        Err(GateError::CacheError(format!(
                            "Checksum mismatch for cache entry {}",
                            state.key
                        ))),
                        state,
                    ))
                }
            }
        }
    }))
}

/// Minimum time between sweeps of expired memory entries
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

type MemoryEntries = Arc<DashMap<String, (EntryMeta, Bytes)>>;

/// In-process store
///
/// Expired entries are dropped when read, and swept from the whole map on
/// commit at most once per sweep interval, so keys that are never read
/// again do not hold memory past their TTL.
pub struct MemoryStore {
    entries: MemoryEntries,
    sweeper: Arc<Sweeper>,
}

struct Sweeper {
    interval_ms: u64,
    last_sweep_ms: AtomicU64,
}

impl Sweeper {
    /// Drop expired entries if the interval has elapsed since the last sweep
    fn maybe_sweep(&self, entries: &MemoryEntries) -> usize {
        let now = now_ms();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.interval_ms {
            return 0;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }
        purge_expired(entries)
    }
}

fn purge_expired(entries: &MemoryEntries) -> usize {
    let before = entries.len();
    entries.retain(|_, (meta, _)| !meta.is_expired());
    let removed = before.saturating_sub(entries.len());
    if removed > 0 {
        debug!("Swept {} expired memory cache entries", removed);
    }
    removed
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Initializing in-memory cache");
        Self::default()
    }

    /// Store that sweeps expired entries at most once per `interval`
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sweeper: Arc::new(Sweeper {
                interval_ms: interval.as_millis() as u64,
                last_sweep_ms: AtomicU64::new(now_ms()),
            }),
        }
    }

    /// Drop every expired entry now
    ///
    /// # Returns
    /// Number of entries removed
    pub fn purge_expired(&self) -> usize {
        purge_expired(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        let hit = self.entries.get(key).map(|e| e.value().clone());
        match hit {
            Some((meta, _)) if meta.is_expired() => {
                debug!("Cache entry expired: {}", key);
                self.entries.remove(key);
                Ok(None)
            }
            Some((meta, data)) => Ok(Some(CachedEntry {
                meta,
                stream: crate::models::stream_from_bytes(data),
            })),
            None => Ok(None),
        }
    }

    async fn begin(&self, key: &str) -> Result<Box<dyn EntryWriter>> {
        Ok(Box::new(MemoryEntryWriter {
            key: key.to_string(),
            buffer: BytesMut::new(),
            entries: self.entries.clone(),
            sweeper: self.sweeper.clone(),
        }))
    }

    async fn remove_matching(&self, matches: &(dyn for<'m> Fn(&'m EntryMeta) -> bool + Sync)) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, (meta, _)| !matches(meta));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn clear(&self) -> Result<usize> {
        let removed = self.entries.len();
        self.entries.clear();
        Ok(removed)
    }
}

struct MemoryEntryWriter {
    key: String,
    buffer: BytesMut,
    entries: MemoryEntries,
    sweeper: Arc<Sweeper>,
}

#[async_trait]
impl EntryWriter for MemoryEntryWriter {
    async fn write(&mut self, chunk: &Bytes) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>, mut meta: EntryMeta) -> Result<()> {
        let data = self.buffer.freeze();
        meta.len = data.len() as u64;
        meta.crc32 = crc32fast::hash(&data);
        debug!("Stored in memory cache: {} ({} bytes)", self.key, meta.len);
        self.entries.insert(self.key, (meta, data));
        self.sweeper.maybe_sweep(&self.entries);
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::collect_stream;

    async fn write_entry(store: &dyn CacheStore, key: &str, path: &str, body: &[u8], ttl: Duration) {
        let mut writer = store.begin(key).await.unwrap();
        for chunk in body.chunks(3) {
            writer.write(&Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        let meta = EntryMeta::new(key, path, None, "text/plain", false, ttl);
        writer.commit(meta).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        write_entry(&store, "abcdef0123", "a/b.css", b"body { color: red }", Duration::from_secs(60)).await;

        let entry = store.get("abcdef0123").await.unwrap().unwrap();
        assert_eq!(entry.meta.path, "a/b.css");
        assert_eq!(entry.meta.len, 19);
        let body = collect_stream(entry.stream).await.unwrap();
        assert_eq!(&body[..], b"body { color: red }");
    }

    #[tokio::test]
    async fn test_file_store_abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        let mut writer = store.begin("feedbeef").await.unwrap();
        writer.write(&Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await;

        assert!(store.get("feedbeef").await.unwrap().is_none());
        assert!(store.meta_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        write_entry(&store, "c0ffee00", "x.js", b"console.log(1)", Duration::from_secs(60)).await;

        // Same length, different bytes
        fs::write(store.data_path("c0ffee00"), b"console.log(2)").await.unwrap();

        let entry = store.get("c0ffee00").await.unwrap().unwrap();
        assert!(collect_stream(entry.stream).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_matching_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        write_entry(&store, "aa01", "images/a.jpg", b"a", Duration::from_secs(60)).await;
        write_entry(&store, "aa02", "images/b.jpg", b"b", Duration::from_secs(60)).await;
        write_entry(&store, "bb01", "css/site.css", b"c", Duration::from_secs(60)).await;

        let removed = store
            .remove_matching(&|meta: &EntryMeta| meta.path.starts_with("images/"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("aa01").await.unwrap().is_none());
        assert!(store.get("bb01").await.unwrap().is_some());

        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.get("bb01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        let store = MemoryStore::new();
        write_entry(&store, "k1", "a.png", b"png", Duration::from_millis(50)).await;
        assert!(store.get("k1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("k1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_sweeps_unread_expired_entries() {
        let store = MemoryStore::with_sweep_interval(Duration::ZERO);
        write_entry(&store, "once", "a.png", b"png", Duration::from_millis(50)).await;
        write_entry(&store, "kept", "b.png", b"png", Duration::from_secs(60)).await;
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Committing another entry sweeps the expired one without reading it
        write_entry(&store, "next", "c.png", b"png", Duration::from_secs(60)).await;
        assert_eq!(store.len(), 2);
        assert!(store.entries.get("once").is_none());
    }

    #[tokio::test]
    async fn test_memory_store_purge_expired() {
        let store = MemoryStore::new();
        write_entry(&store, "short", "a.png", b"png", Duration::from_millis(20)).await;
        write_entry(&store, "long", "b.png", b"png", Duration::from_secs(60)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        write_entry(&store, "ab12cd34", "a/b.css", b"body{}", Duration::from_millis(50)).await;
        assert!(store.get("ab12cd34").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("ab12cd34").await.unwrap().is_none());
        // Expired entries are removed from disk, not just hidden
        assert!(store.meta_files().await.unwrap().is_empty());
        assert!(!store.data_path("ab12cd34").exists());
    }
}
