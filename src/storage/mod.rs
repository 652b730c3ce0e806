//! Origin storage
//!
//! Adapters fetch unmodified assets from where they live:
//! - [`DiskStorage`]: a directory on the local filesystem
//! - [`HttpStorage`]: a remote web server
//! - [`S3Storage`]: an S3-compatible bucket
//! - [`MissingFallback`]: wraps another adapter and substitutes a configured
//!   fallback asset when the original is not found
//!
//! [`StorageFactory`] picks the adapter for a request.

mod disk;
mod factory;
mod missing;
mod remote;
mod s3;

pub use self::disk::DiskStorage;
pub use self::factory::{StorageDescriptor, StorageFactory};
pub use self::missing::MissingFallback;
pub use self::remote::HttpStorage;
pub use self::s3::S3Storage;

use crate::error::{GateError, Result};
use crate::models::{ByteStream, OriginMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Adapter family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Disk,
    Http,
    S3,
    Missing,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterKind::Disk => "disk",
            AdapterKind::Http => "http",
            AdapterKind::S3 => "s3",
            AdapterKind::Missing => "missing",
        })
    }
}

/// A fetched origin asset
pub struct OriginAsset {
    pub stream: ByteStream,
    pub metadata: OriginMetadata,
    /// Content type the origin declared, if any
    pub content_type: Option<String>,
}

impl fmt::Debug for OriginAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginAsset")
            .field("metadata", &self.metadata)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Where an upload landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Locator to request the asset with
    pub path: String,
    /// Public URL of the stored object
    pub url: String,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Open a stream over the asset at `locator`
    ///
    /// # Returns
    /// * `Ok(OriginAsset)` with metadata
    /// * `Err(GateError::NotFound)` if the origin has no such asset
    /// * `Err(GateError)` for any other origin failure
    async fn get(&self, locator: &str) -> Result<OriginAsset>;

    /// Last modification time, when the origin tracks it
    async fn last_modified(&self, _locator: &str) -> Result<Option<SystemTime>> {
        Ok(None)
    }

    /// Store `stream` as `<folder>/<file_name>`
    async fn put(&self, _stream: ByteStream, _folder: &str, _file_name: &str) -> Result<PutResult> {
        Err(GateError::BadRequest(format!(
            "Uploads are not supported by {} storage",
            self.kind()
        )))
    }
}

/// Counts bytes as they pass through a stream
#[derive(Clone, Default)]
pub struct LengthCounter(Arc<AtomicU64>);

impl LengthCounter {
    pub fn observe(&self, stream: ByteStream) -> ByteStream {
        let counter = self.0.clone();
        Box::pin(stream.map(move |item| {
            if let Ok(chunk) = &item {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            item
        }))
    }

    pub fn len(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain an upload stream through a [`LengthCounter`]
pub(crate) async fn drain_counted(stream: ByteStream) -> Result<(Bytes, u64)> {
    let counter = LengthCounter::default();
    let data = crate::models::collect_stream(counter.observe(stream)).await?;
    Ok((data, counter.len()))
}

/// Reject locators that could escape an origin root
pub(crate) fn normalize_locator(locator: &str) -> Result<String> {
    let mut parts = Vec::new();
    for segment in locator.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(GateError::BadRequest(format!(
                    "Invalid path: {}",
                    locator
                )))
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(GateError::BadRequest("Empty asset path".to_string()));
    }
    Ok(parts.join("/"))
}

/// File name for an upload: `<stem>-<millis>.<ext>`
pub fn generated_name(original: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let name = original.rsplit('/').next().unwrap_or(original);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, millis, ext),
        _ => format!("{}-{}", name, millis),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_locator() {
        assert_eq!(normalize_locator("/a//b/./c.jpg").unwrap(), "a/b/c.jpg");
        assert!(normalize_locator("../etc/passwd").is_err());
        assert!(normalize_locator("a/../../b").is_err());
        assert!(normalize_locator("a\\..\\b").is_err());
        assert!(normalize_locator("/").is_err());
    }

    #[test]
    fn test_generated_name() {
        let name = generated_name("photos/cat.jpg");
        assert!(name.starts_with("cat-"));
        assert!(name.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_drain_counted() {
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"de"))];
        let (data, len) = drain_counted(Box::pin(futures::stream::iter(chunks))).await.unwrap();
        assert_eq!(len, 5);
        assert_eq!(&data[..], b"abcde");
    }
}
