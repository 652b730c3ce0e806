use super::{AdapterKind, DiskStorage, HttpStorage, MissingFallback, S3Storage, StorageAdapter};
use crate::config::{GateConfig, S3Origin, StorageConfig};
use crate::error::{GateError, Result};
use crate::models::AssetKind;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which adapter serves a request and with what locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub kind: AdapterKind,
    pub locator: String,
}

/// Adapters for one storage block (`images` or `assets`)
struct Origins {
    config: StorageConfig,
    directory: Option<Arc<DiskStorage>>,
    remote: Option<Arc<HttpStorage>>,
    s3: Option<Arc<S3Storage>>,
    /// Clients for allow-listed buckets named in the request path
    s3_buckets: DashMap<String, Arc<S3Storage>>,
}

impl Origins {
    fn new(config: &StorageConfig, timeout: Duration) -> Result<Self> {
        let directory = config
            .directory
            .enabled
            .then(|| Arc::new(DiskStorage::new(&config.directory.path)));
        let remote = if config.remote.enabled {
            Some(Arc::new(HttpStorage::with_timeout(&config.remote.path, timeout)?))
        } else {
            None
        };
        let s3 = if config.s3.enabled {
            Some(Arc::new(S3Storage::new(&config.s3)?))
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            directory,
            remote,
            s3,
            s3_buckets: DashMap::new(),
        })
    }

    /// Client for a bucket named in the request path
    ///
    /// Only the configured bucket and `allowed_buckets` are reachable, which
    /// also bounds the number of clients kept.
    fn bucket(&self, s3: &S3Origin, bucket: &str) -> Result<Arc<S3Storage>> {
        if !s3.allows_bucket(bucket) {
            return Err(GateError::BadRequest(format!("S3 bucket {} is not allowed", bucket)));
        }
        if let (Some(default), true) = (&self.s3, bucket == s3.bucket_name) {
            return Ok(default.clone());
        }
        if let Some(existing) = self.s3_buckets.get(bucket) {
            return Ok(existing.clone());
        }
        let storage = Arc::new(S3Storage::for_bucket(s3, bucket)?);
        self.s3_buckets.insert(bucket.to_string(), storage.clone());
        Ok(storage)
    }
}

/// Chooses the origin adapter for each request
///
/// Selection order:
/// 1. an explicit prefix in the path: `http(s)://...` (remote origin enabled)
///    or `s3/<bucket>/<key>` (S3 origin enabled)
/// 2. otherwise the first enabled origin: directory, remote, then S3
///
/// Image adapters are wrapped in [`MissingFallback`] when
/// `not_found.images.path` is set.
pub struct StorageFactory {
    images: Origins,
    assets: Origins,
    absolute: Arc<HttpStorage>,
    fallback_image: Option<String>,
}

impl StorageFactory {
    pub fn from_config(config: &GateConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.transform.timeout_secs);
        Ok(Self {
            images: Origins::new(&config.images, timeout)?,
            assets: Origins::new(&config.assets, timeout)?,
            absolute: Arc::new(HttpStorage::absolute(timeout)?),
            fallback_image: config.not_found.images.path.clone(),
        })
    }

    fn origins(&self, kind: AssetKind) -> &Origins {
        match kind {
            AssetKind::Image => &self.images,
            AssetKind::Asset => &self.assets,
        }
    }

    /// Pick an adapter and locator for `path`
    ///
    /// # Returns
    /// * `Ok((adapter, descriptor))` for the selected origin
    /// * `Err(GateError::Storage)` if no origin is enabled for the asset kind
    pub fn create(
        &self,
        kind: AssetKind,
        path: &str,
    ) -> Result<(Arc<dyn StorageAdapter>, StorageDescriptor)> {
        let (adapter, locator) = self.select(kind, path)?;

        let adapter = match (&self.fallback_image, kind) {
            (Some(fallback), AssetKind::Image) => {
                Arc::new(MissingFallback::new(adapter, fallback)) as Arc<dyn StorageAdapter>
            }
            _ => adapter,
        };

        let descriptor = StorageDescriptor {
            kind: adapter.kind(),
            locator,
        };
        debug!("Selected {} storage for path={}", descriptor.kind, path);
        Ok((adapter, descriptor))
    }

    fn select(&self, kind: AssetKind, path: &str) -> Result<(Arc<dyn StorageAdapter>, String)> {
        let origins = self.origins(kind);
        let path = path.trim_start_matches('/');

        if origins.config.remote.enabled && (path.starts_with("http:/") || path.starts_with("https:/")) {
            let adapter: Arc<dyn StorageAdapter> = self.absolute.clone();
            return Ok((adapter, path.to_string()));
        }

        if origins.config.s3.enabled {
            if let Some(rest) = path.strip_prefix("s3/") {
                let (bucket, key) = rest.split_once('/').ok_or_else(|| {
                    GateError::BadRequest(format!("Invalid S3 path, expected s3/<bucket>/<key>: {}", path))
                })?;
                let adapter: Arc<dyn StorageAdapter> = origins.bucket(&origins.config.s3, bucket)?;
                return Ok((adapter, key.to_string()));
            }
        }

        let first_enabled: Option<Arc<dyn StorageAdapter>> = match (&origins.directory, &origins.remote, &origins.s3) {
            (Some(directory), _, _) => Some(directory.clone()),
            (None, Some(remote), _) => Some(remote.clone()),
            (None, None, Some(s3)) => Some(s3.clone()),
            (None, None, None) => None,
        };
        if let Some(adapter) = first_enabled {
            return Ok((adapter, path.to_string()));
        }

        Err(GateError::Storage(format!(
            "No storage origin is enabled for {}",
            match kind {
                AssetKind::Image => "images",
                AssetKind::Asset => "assets",
            }
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GateConfig {
        let mut config = GateConfig::default();
        config.images.directory.enabled = true;
        config.images.directory.path = "/srv/images".into();
        config.images.remote.enabled = true;
        config.images.remote.path = "https://origin.example.com".into();
        config.assets.remote.enabled = true;
        config.assets.remote.path = "https://static.example.com".into();
        config
    }

    #[test]
    fn test_directory_wins_over_remote() {
        let factory = StorageFactory::from_config(&config()).unwrap();
        let (_, descriptor) = factory.create(AssetKind::Image, "/a/b.jpg").unwrap();
        assert_eq!(descriptor.kind, AdapterKind::Disk);
        assert_eq!(descriptor.locator, "a/b.jpg");

        let (_, descriptor) = factory.create(AssetKind::Asset, "site.css").unwrap();
        assert_eq!(descriptor.kind, AdapterKind::Http);
    }

    #[test]
    fn test_explicit_url_prefix() {
        let factory = StorageFactory::from_config(&config()).unwrap();
        let (_, descriptor) = factory
            .create(AssetKind::Image, "/https:/other.example.com/x.png")
            .unwrap();
        assert_eq!(descriptor.kind, AdapterKind::Http);
        assert_eq!(descriptor.locator, "https:/other.example.com/x.png");
    }

    #[test]
    fn test_s3_prefix() {
        let mut config = config();
        config.images.s3.enabled = true;
        config.images.s3.bucket_name = "default-bucket".into();
        config.images.s3.access_key = Some("k".into());
        config.images.s3.secret_key = Some("s".into());

        config.images.s3.allowed_buckets = vec!["other".into()];

        let factory = StorageFactory::from_config(&config).unwrap();
        let (_, descriptor) = factory.create(AssetKind::Image, "s3/other/photos/a.jpg").unwrap();
        assert_eq!(descriptor.kind, AdapterKind::S3);
        assert_eq!(descriptor.locator, "photos/a.jpg");

        let (_, descriptor) = factory.create(AssetKind::Image, "s3/default-bucket/b.jpg").unwrap();
        assert_eq!(descriptor.kind, AdapterKind::S3);
        assert_eq!(descriptor.locator, "b.jpg");
    }

    #[test]
    fn test_s3_prefix_rejects_unlisted_bucket() {
        let mut config = config();
        config.images.s3.enabled = true;
        config.images.s3.bucket_name = "default-bucket".into();
        config.images.s3.access_key = Some("k".into());
        config.images.s3.secret_key = Some("s".into());

        let factory = StorageFactory::from_config(&config).unwrap();
        for bucket in ["someone-else", "default-bucket-2", "DEFAULT-BUCKET"] {
            let path = format!("s3/{}/a.jpg", bucket);
            assert!(matches!(
                factory.create(AssetKind::Image, &path),
                Err(GateError::BadRequest(_))
            ));
        }
        assert!(factory.images.s3_buckets.is_empty());
    }

    #[test]
    fn test_fallback_wraps_images_only() {
        let mut config = config();
        config.not_found.images.path = Some("/srv/missing.png".into());
        let factory = StorageFactory::from_config(&config).unwrap();

        let (_, image) = factory.create(AssetKind::Image, "a.jpg").unwrap();
        assert_eq!(image.kind, AdapterKind::Missing);
        let (_, asset) = factory.create(AssetKind::Asset, "a.css").unwrap();
        assert_eq!(asset.kind, AdapterKind::Http);
    }

    #[test]
    fn test_no_origin_enabled() {
        let factory = StorageFactory::from_config(&GateConfig::default()).unwrap();
        assert!(matches!(
            factory.create(AssetKind::Image, "a.jpg"),
            Err(GateError::Storage(_))
        ));
    }
}
