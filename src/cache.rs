//! Streaming asset cache
//!
//! Entries are addressed by a fingerprint over the request domain, the
//! normalized asset path and the canonical transform options. Reads hand
//! back a stream over the stored bytes; writes tee a response stream so the
//! caller and the store each see every chunk.
//!
//! When neither the directory nor the memory backend is enabled the cache
//! is a pass-through: lookups miss and `cache_file` returns its input.

use crate::cache_store::{CacheStore, CachedEntry, EntryMeta, FileStore, MemoryStore};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::models::{collect_stream, stream_from_bytes, ByteStream};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Logical cache key and its digest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// 128-bit xxh3 digest, lower-case hex
    pub digest: String,
    /// Normalized asset path, used by invalidation patterns
    pub path: String,
    /// Request host when multi-domain mode is on
    pub domain: Option<String>,
}

impl CacheKey {
    /// Fingerprint a request
    ///
    /// # Arguments
    /// * `domain` - Host, only when multi-domain mode is enabled
    /// * `path` - Asset path; leading slashes are ignored
    /// * `variant` - Canonical options text distinguishing transforms of one path
    pub fn new(domain: Option<&str>, path: &str, variant: &str) -> Self {
        let path = path.trim_start_matches('/').to_string();
        let domain = domain.map(|d| d.to_ascii_lowercase());

        let mut material = Vec::with_capacity(path.len() + variant.len() + 32);
        material.extend_from_slice(domain.as_deref().unwrap_or_default().as_bytes());
        material.push(0);
        material.extend_from_slice(path.as_bytes());
        material.push(0);
        material.extend_from_slice(variant.as_bytes());

        let digest = format!("{:032x}", xxhash_rust::xxh3::xxh3_128(&material));
        Self {
            digest,
            path,
            domain,
        }
    }
}

/// What gets recorded alongside a cached body
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub content_type: String,
    pub not_found: bool,
    /// Overrides the domain TTL
    pub ttl: Option<Duration>,
}

impl EntryInfo {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            not_found: false,
            ttl: None,
        }
    }

    pub fn not_found(mut self, not_found: bool) -> Self {
        self.not_found = not_found;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
}

enum TeeMessage {
    Chunk(Bytes),
    Failed(String),
    Done,
}

/// Process-wide asset cache
pub struct AssetCache {
    store: Option<Arc<dyn CacheStore>>,
    config: Arc<GateConfig>,
    counters: Arc<Counters>,
}

impl AssetCache {
    /// Build the cache from configuration
    ///
    /// The directory backend wins over the memory backend when both are on.
    pub async fn from_config(config: Arc<GateConfig>) -> Result<Self> {
        let caching = &config.caching;
        let store: Option<Arc<dyn CacheStore>> = if caching.directory.enabled {
            Some(Arc::new(FileStore::new(&caching.directory.path).await?))
        } else if caching.memory.enabled {
            Some(Arc::new(MemoryStore::new()))
        } else {
            info!("No cache backend enabled; caching is a pass-through");
            None
        };

        Ok(Self::with_store(store, config))
    }

    pub fn with_store(store: Option<Arc<dyn CacheStore>>, config: Arc<GateConfig>) -> Self {
        Self {
            store,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// A cache with no backend
    pub fn disabled(config: Arc<GateConfig>) -> Self {
        Self::with_store(None, config)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Build a key, scoping it to `domain` only in multi-domain mode
    pub fn key(&self, domain: Option<&str>, path: &str, variant: &str) -> CacheKey {
        let domain = if self.config.multi_domain.enabled {
            domain
        } else {
            None
        };
        CacheKey::new(domain, path, variant)
    }

    /// TTL for entries written under `key`
    pub fn ttl_for(&self, key: &CacheKey) -> Duration {
        self.config.ttl_for_domain(key.domain.as_deref())
    }

    /// Look up a live entry
    ///
    /// Backend failures are logged and reported as a miss.
    pub async fn get_stream(&self, key: &CacheKey) -> Option<CachedEntry> {
        let store = self.store.as_ref()?;

        match store.get(&key.digest).await {
            Ok(Some(entry)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: path={} key={}", key.path, key.digest);
                Some(entry)
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss: path={} key={}", key.path, key.digest);
                None
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                warn!("Cache lookup failed for path={}: {}", key.path, e);
                None
            }
        }
    }

    /// Tee `source` into the cache
    ///
    /// The returned stream yields exactly the items of `source`. A second copy
    /// of every chunk goes to a writer task, which commits the entry once the
    /// source ends cleanly. The returned stream does not finish until that
    /// commit has been attempted, so a reader that drained it will find the
    /// entry. A source error, or the caller dropping the stream early,
    /// discards the partial entry.
    ///
    /// Not-found bodies are only cached when `caching.cache_404` is on.
    pub fn cache_file(&self, source: ByteStream, key: &CacheKey, info: EntryInfo) -> ByteStream {
        let Some(store) = self.store.clone() else {
            return source;
        };

        if info.not_found && !self.config.caching.cache_404 {
            debug!("Not caching not-found result for path={}", key.path);
            return source;
        }

        let meta = EntryMeta::new(
            &key.digest,
            &key.path,
            key.domain.as_deref(),
            &info.content_type,
            info.not_found,
            info.ttl.unwrap_or_else(|| self.ttl_for(key)),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            let ok = Self::writer_task(store, meta, rx).await;
            if ok {
                counters.writes.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.write_errors.fetch_add(1, Ordering::Relaxed);
            }
            let _ = ack_tx.send(());
        });

        let chunk_tx = tx.clone();
        let tee = source.map(move |item| {
            let message = match &item {
                Ok(chunk) => TeeMessage::Chunk(chunk.clone()),
                Err(e) => TeeMessage::Failed(e.to_string()),
            };
            let _ = chunk_tx.send(message);
            item
        });

        let finish = futures::stream::once(async move {
            let _ = tx.send(TeeMessage::Done);
            let _ = ack_rx.await;
        })
        .filter_map(|()| futures::future::ready(None::<Result<Bytes>>));

        Box::pin(tee.chain(finish))
    }

    async fn writer_task(
        store: Arc<dyn CacheStore>,
        meta: EntryMeta,
        mut rx: mpsc::UnboundedReceiver<TeeMessage>,
    ) -> bool {
        let mut writer = match store.begin(&meta.key).await {
            Ok(writer) => writer,
            Err(e) => {
                error!("Failed to start cache write for path={}: {}", meta.path, e);
                return false;
            }
        };

        while let Some(message) = rx.recv().await {
            match message {
                TeeMessage::Chunk(chunk) => {
                    if let Err(e) = writer.write(&chunk).await {
                        error!("Failed to write cache entry for path={}: {}", meta.path, e);
                        writer.abort().await;
                        return false;
                    }
                }
                TeeMessage::Failed(reason) => {
                    debug!("Source failed for path={}, discarding cache write: {}", meta.path, reason);
                    writer.abort().await;
                    return false;
                }
                TeeMessage::Done => {
                    let path = meta.path.clone();
                    return match writer.commit(meta).await {
                        Ok(()) => true,
                        Err(e) => {
                            error!("Failed to commit cache entry for path={}: {}", path, e);
                            false
                        }
                    };
                }
            }
        }

        debug!("Consumer went away before the source finished; discarding cache write for path={}", meta.path);
        writer.abort().await;
        false
    }

    /// Store a complete buffer and wait for the write
    pub async fn cache_bytes(&self, key: &CacheKey, data: Bytes, info: EntryInfo) -> Result<()> {
        let stream = self.cache_file(stream_from_bytes(data), key, info);
        collect_stream(stream).await.map(|_| ())
    }

    /// Read a live entry fully into memory
    pub async fn get_bytes(&self, key: &CacheKey) -> Option<Bytes> {
        let entry = self.get_stream(key).await?;
        match collect_stream(entry.stream).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Discarding unreadable cache entry for path={}: {}", key.path, e);
                None
            }
        }
    }

    /// Remove entries whose path matches `pattern`
    ///
    /// `pattern` is matched from the start of the stored path with `*`
    /// standing for any run of characters; a pattern without a trailing
    /// `*` still matches longer paths. `domains` restricts removal to
    /// entries written under one of those hosts.
    ///
    /// # Returns
    /// Number of entries removed
    pub async fn delete(&self, pattern: &str, domains: Option<&[String]>) -> Result<usize> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };

        let pattern = pattern.trim_start_matches('/');
        let matches = |meta: &EntryMeta| {
            let domain_ok = match domains {
                Some(domains) => meta
                    .domain
                    .as_ref()
                    .is_some_and(|d| domains.iter().any(|allowed| allowed.eq_ignore_ascii_case(d))),
                None => true,
            };
            domain_ok && glob_prefix_match(pattern, &meta.path)
        };

        let removed = store.remove_matching(&matches).await.map_err(|e| {
            GateError::CacheError(format!("Invalidation failed for pattern {}: {}", pattern, e))
        })?;
        info!("Invalidated {} cache entries matching pattern={}", removed, pattern);
        Ok(removed)
    }

    /// Drop every entry
    pub async fn reset(&self) -> Result<usize> {
        match self.store.as_ref() {
            Some(store) => store.clear().await,
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Match `pattern` against the start of `text`, `*` matching any run
pub fn glob_prefix_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return true;
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    for part in parts {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(mutator: impl FnOnce(&mut GateConfig)) -> Arc<GateConfig> {
        let mut config = GateConfig::default();
        config.caching.memory.enabled = true;
        mutator(&mut config);
        Arc::new(config)
    }

    #[test]
    fn test_key_is_deterministic_and_scoped() {
        let a = CacheKey::new(None, "/images/a.jpg", r#"{"width":10}"#);
        let b = CacheKey::new(None, "images/a.jpg", r#"{"width":10}"#);
        let c = CacheKey::new(Some("example.com"), "images/a.jpg", r#"{"width":10}"#);
        let d = CacheKey::new(None, "images/a.jpg", r#"{"width":11}"#);

        assert_eq!(a, b);
        assert_eq!(a.digest.len(), 32);
        assert_ne!(a.digest, c.digest);
        assert_ne!(a.digest, d.digest);
    }

    #[test]
    fn test_key_ignores_domain_without_multi_domain() {
        let cache = AssetCache::disabled(Arc::new(GateConfig::default()));
        let key = cache.key(Some("example.com"), "a.jpg", "");
        assert!(key.domain.is_none());
    }

    #[test]
    fn test_glob_prefix_match() {
        assert!(glob_prefix_match("images/", "images/a.jpg"));
        assert!(glob_prefix_match("images/*.jpg", "images/a.jpg"));
        assert!(glob_prefix_match("*", "anything"));
        assert!(glob_prefix_match("*.png", "a/b/c.png"));
        assert!(!glob_prefix_match("css/", "images/a.jpg"));
        assert!(!glob_prefix_match("images/*.png", "images/a.jpg"));
    }

    #[tokio::test]
    async fn test_tee_round_trip() {
        let cache = AssetCache::from_config(config_with(|_| {})).await.unwrap();
        let key = cache.key(None, "a.txt", "");

        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let source: ByteStream = Box::pin(futures::stream::iter(chunks));
        let passthrough = collect_stream(cache.cache_file(source, &key, EntryInfo::new("text/plain")))
            .await
            .unwrap();
        assert_eq!(&passthrough[..], b"hello world");

        let entry = cache.get_stream(&key).await.unwrap();
        assert_eq!(entry.meta.content_type, "text/plain");
        assert_eq!(collect_stream(entry.stream).await.unwrap(), passthrough);
    }

    #[tokio::test]
    async fn test_failed_source_is_not_cached() {
        let cache = AssetCache::from_config(config_with(|_| {})).await.unwrap();
        let key = cache.key(None, "broken.txt", "");

        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"half")),
            Err(GateError::Storage("connection reset".into())),
        ];
        let source: ByteStream = Box::pin(futures::stream::iter(chunks));
        assert!(collect_stream(cache.cache_file(source, &key, EntryInfo::new("text/plain")))
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get_stream(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_not_found_policy() {
        let cache = AssetCache::from_config(config_with(|_| {})).await.unwrap();
        let key = cache.key(None, "missing.jpg", "");
        let info = EntryInfo::new("image/jpeg").not_found(true);
        cache.cache_bytes(&key, Bytes::from_static(b"fallback"), info.clone()).await.unwrap();
        assert!(cache.get_stream(&key).await.is_none());

        let cache = AssetCache::from_config(config_with(|c| c.caching.cache_404 = true)).await.unwrap();
        cache.cache_bytes(&key, Bytes::from_static(b"fallback"), info).await.unwrap();
        let entry = cache.get_stream(&key).await.unwrap();
        assert!(entry.meta.not_found);
    }

    #[tokio::test]
    async fn test_disabled_cache_passes_through() {
        let cache = AssetCache::disabled(Arc::new(GateConfig::default()));
        let key = cache.key(None, "a.txt", "");
        cache.cache_bytes(&key, Bytes::from_static(b"x"), EntryInfo::new("text/plain")).await.unwrap();
        assert!(cache.get_stream(&key).await.is_none());
        assert_eq!(cache.delete("*", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_scoped_to_domain() {
        let cache = AssetCache::from_config(config_with(|c| {
            c.multi_domain.enabled = true;
        }))
        .await
        .unwrap();

        let a = cache.key(Some("one.example"), "img/a.jpg", "");
        let b = cache.key(Some("two.example"), "img/a.jpg", "");
        for key in [&a, &b] {
            cache.cache_bytes(key, Bytes::from_static(b"a"), EntryInfo::new("image/jpeg")).await.unwrap();
        }

        let removed = cache.delete("img/*", Some(&["one.example".to_string()])).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get_stream(&a).await.is_none());
        assert!(cache.get_stream(&b).await.is_some());

        assert_eq!(cache.reset().await.unwrap(), 1);
        assert!(cache.get_stream(&b).await.is_none());
    }
}
