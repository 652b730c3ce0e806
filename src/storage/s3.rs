use super::{drain_counted, AdapterKind, OriginAsset, PutResult, StorageAdapter};
use crate::config::S3Origin;
use crate::error::{GateError, Result};
use crate::models::{ByteStream, OriginMetadata};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::Client;
use futures::StreamExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Serves assets from an S3-compatible bucket
pub struct S3Storage {
    client: Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    /// Build a client for the configured bucket
    ///
    /// Explicit keys are used when both are set, otherwise the ambient AWS
    /// credential chain. A custom endpoint switches to path-style addressing.
    pub fn new(config: &S3Origin) -> Result<Self> {
        Self::for_bucket(config, &config.bucket_name)
    }

    /// Same credentials and region, different bucket
    pub fn for_bucket(config: &S3Origin, bucket: &str) -> Result<Self> {
        if config.access_key.is_some() != config.secret_key.is_some() {
            return Err(GateError::ConfigError(
                "s3 requires both access_key and secret_key when either is set".to_string(),
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(key), Some(secret)) = (&config.access_key, &config.secret_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key, secret, None, None, "assetgate-config");
            builder = builder.credentials_provider(credentials);
        }

        let endpoint = config.endpoint.as_ref().map(|endpoint| {
            let lower = endpoint.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("http://{}", endpoint)
            }
        });
        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url).force_path_style(true);
        }

        info!("Configured S3 origin bucket={} region={}", bucket, config.region);
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            region: config.region.clone(),
            endpoint,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Public URL of an object
    pub fn object_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }

    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> GateError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let SdkError::ServiceError(ref service_err) = err {
            let status = service_err.raw().status().as_u16();
            if status == 404 {
                return GateError::NotFound(format!("File not found: {}", key));
            }
            return GateError::from_http_status(status, format!("S3 returned {} for {}", status, key));
        }
        GateError::Storage(format!("S3 request failed for {}: {}", key, err))
    }
}

#[async_trait]
impl StorageAdapter for S3Storage {
    fn kind(&self) -> AdapterKind {
        AdapterKind::S3
    }

    async fn get(&self, locator: &str) -> Result<OriginAsset> {
        let key = locator.trim_start_matches('/');
        debug!("Fetching S3 object bucket={} key={}", self.bucket, key);

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let err = Self::map_sdk_error(e, key);
                if !err.is_not_found() {
                    warn!("S3 get failed bucket={} key={}: {}", self.bucket, key, err);
                }
                err
            })?;

        let mut metadata = OriginMetadata::new(key);
        metadata.content_length = output.content_length().and_then(|len| u64::try_from(len).ok());
        metadata.last_modified = output
            .last_modified()
            .and_then(|dt| u64::try_from(dt.secs()).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
        let content_type = output.content_type().map(|s| s.to_string());

        let stream: ByteStream = Box::pin(
            ReaderStream::new(output.body.into_async_read())
                .map(|chunk| chunk.map_err(|e| GateError::Storage(format!("S3 body error: {}", e)))),
        );

        Ok(OriginAsset {
            stream,
            metadata,
            content_type,
        })
    }

    async fn last_modified(&self, locator: &str) -> Result<Option<SystemTime>> {
        let key = locator.trim_start_matches('/');
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        Ok(output
            .last_modified()
            .and_then(|dt| u64::try_from(dt.secs()).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)))
    }

    async fn put(&self, stream: ByteStream, folder: &str, file_name: &str) -> Result<PutResult> {
        let key = format!("{}/{}", folder.trim_matches('/'), file_name)
            .trim_start_matches('/')
            .to_string();

        let (data, len) = drain_counted(stream).await?;
        let content_type = mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .to_string();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_length(len as i64)
            .content_type(content_type)
            .body(data.into())
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &key))?;

        info!("Uploaded s3://{}/{} ({} bytes)", self.bucket, key, len);
        Ok(PutResult {
            url: self.object_url(&key),
            path: format!("s3/{}/{}", self.bucket, key),
        })
    }
}
