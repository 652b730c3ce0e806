use super::{drain_counted, normalize_locator, AdapterKind, OriginAsset, PutResult, StorageAdapter};
use crate::error::{GateError, Result};
use crate::models::{ByteStream, OriginMetadata};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Serves assets from a local directory
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, locator: &str) -> Result<(String, PathBuf)> {
        let relative = normalize_locator(locator)?;
        let full = self.root.join(&relative);
        Ok((relative, full))
    }
}

#[async_trait]
impl StorageAdapter for DiskStorage {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Disk
    }

    async fn get(&self, locator: &str) -> Result<OriginAsset> {
        let (relative, full) = self.resolve(locator)?;
        debug!("Reading disk origin path={}", full.display());

        let file = fs::File::open(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GateError::NotFound(format!("File not found: {}", relative)),
            _ => GateError::Storage(format!("Failed to open {}: {}", relative, e)),
        })?;

        let meta = file.metadata().await?;
        if meta.is_dir() {
            return Err(GateError::NotFound(format!("File not found: {}", relative)));
        }

        let mut metadata = OriginMetadata::new(relative);
        metadata.content_length = Some(meta.len());
        metadata.last_modified = meta.modified().ok();

        let stream: ByteStream = Box::pin(
            ReaderStream::new(file).map(|chunk| chunk.map_err(|e| GateError::Storage(e.to_string()))),
        );

        Ok(OriginAsset {
            stream,
            metadata,
            content_type: None,
        })
    }

    async fn last_modified(&self, locator: &str) -> Result<Option<SystemTime>> {
        let (_, full) = self.resolve(locator)?;
        Ok(fs::metadata(&full).await?.modified().ok())
    }

    async fn put(&self, stream: ByteStream, folder: &str, file_name: &str) -> Result<PutResult> {
        let relative = normalize_locator(&format!("{}/{}", folder, file_name))?;
        let full = self.root.join(&relative);

        let (data, len) = drain_counted(stream).await?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, &data).await?;

        info!("Stored upload at {} ({} bytes)", full.display(), len);
        Ok(PutResult {
            url: format!("/{}", relative),
            path: relative,
        })
    }
}
