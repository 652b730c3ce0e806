use super::{AdapterKind, DiskStorage, OriginAsset, PutResult, StorageAdapter};
use crate::error::{GateError, Result};
use crate::models::ByteStream;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// Substitutes a fallback asset when the wrapped origin reports `NotFound`
///
/// The substituted asset keeps the requested path, is flagged `not_found`
/// and carries a fresh modification time.
pub struct MissingFallback {
    inner: Arc<dyn StorageAdapter>,
    fallback: PathBuf,
}

impl MissingFallback {
    /// # Arguments
    /// * `inner` - Origin to try first
    /// * `fallback` - Local file served in place of missing assets
    pub fn new(inner: Arc<dyn StorageAdapter>, fallback: impl AsRef<Path>) -> Self {
        Self {
            inner,
            fallback: fallback.as_ref().to_path_buf(),
        }
    }

    async fn fallback_asset(&self, requested: &str) -> Result<OriginAsset> {
        let file_name = self
            .fallback
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                GateError::ConfigError(format!(
                    "Invalid not-found fallback path {}",
                    self.fallback.display()
                ))
            })?;
        let dir = self.fallback.parent().unwrap_or_else(|| Path::new("."));

        let mut asset = DiskStorage::new(dir).get(file_name).await.map_err(|e| {
            GateError::Storage(format!(
                "Not-found fallback {} is unreadable: {}",
                self.fallback.display(),
                e
            ))
        })?;

        asset.metadata.path = requested.trim_start_matches('/').to_string();
        asset.metadata.not_found = true;
        asset.metadata.last_modified = Some(SystemTime::now());
        Ok(asset)
    }
}

#[async_trait]
impl StorageAdapter for MissingFallback {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Missing
    }

    async fn get(&self, locator: &str) -> Result<OriginAsset> {
        match self.inner.get(locator).await {
            Err(e) if e.is_not_found() => {
                info!(
                    "Origin {} has no {}; serving fallback {}",
                    self.inner.kind(),
                    locator,
                    self.fallback.display()
                );
                self.fallback_asset(locator).await
            }
            other => other,
        }
    }

    async fn last_modified(&self, locator: &str) -> Result<Option<SystemTime>> {
        match self.inner.last_modified(locator).await {
            Err(e) if e.is_not_found() => {
                debug!("Origin has no {}; fallback is always fresh", locator);
                Ok(Some(SystemTime::now()))
            }
            other => other,
        }
    }

    async fn put(&self, stream: ByteStream, folder: &str, file_name: &str) -> Result<PutResult> {
        self.inner.put(stream, folder, file_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::collect_stream;

    #[tokio::test]
    async fn test_serves_fallback_for_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), b"real").unwrap();
        std::fs::write(dir.path().join("missing.png"), b"fallback").unwrap();

        let inner: Arc<dyn StorageAdapter> = Arc::new(DiskStorage::new(dir.path().join("origin")));
        std::fs::create_dir_all(dir.path().join("origin")).unwrap();
        std::fs::write(dir.path().join("origin/present.txt"), b"real").unwrap();

        let storage = MissingFallback::new(inner, dir.path().join("missing.png"));

        let asset = storage.get("present.txt").await.unwrap();
        assert!(!asset.metadata.not_found);
        assert_eq!(&collect_stream(asset.stream).await.unwrap()[..], b"real");

        let asset = storage.get("/gone.jpg").await.unwrap();
        assert!(asset.metadata.not_found);
        assert_eq!(asset.metadata.path, "gone.jpg");
        assert!(asset.metadata.last_modified.is_some());
        assert_eq!(&collect_stream(asset.stream).await.unwrap()[..], b"fallback");
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let inner: Arc<dyn StorageAdapter> = Arc::new(DiskStorage::new(dir.path()));
        let storage = MissingFallback::new(inner, dir.path().join("missing.png"));
        assert!(matches!(
            storage.get("../x.jpg").await.unwrap_err(),
            GateError::BadRequest(_)
        ));
    }
}
