use super::{AdapterKind, OriginAsset, StorageAdapter};
use crate::error::{GateError, Result};
use crate::models::{parse_http_date, ByteStream, OriginMetadata};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Fetches assets from a remote web server
pub struct HttpStorage {
    client: Client,
    /// Prefix joined with each locator; empty for absolute URLs
    base_url: String,
}

impl HttpStorage {
    /// Adapter joining locators onto `base_url`
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Adapter for locators that are complete URLs
    pub fn absolute(timeout: Duration) -> Result<Self> {
        Self::with_timeout("", timeout)
    }

    /// Full URL for a locator
    pub fn url_for(&self, locator: &str) -> String {
        if self.base_url.is_empty() {
            return repair_scheme(locator);
        }
        format!("{}/{}", self.base_url, locator.trim_start_matches('/'))
    }

    async fn send(&self, method: reqwest::Method, locator: &str) -> Result<reqwest::Response> {
        let url = self.url_for(locator);
        debug!("Fetching remote origin method={} url={}", method, url);

        let response = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| {
                warn!("Request to remote origin failed for url={}: {}", url, e);
                if e.is_timeout() {
                    GateError::Timeout(format!("Remote origin timed out: {}", url))
                } else {
                    GateError::HttpError(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Remote origin returned status={} for url={}", status, url);
            return Err(GateError::from_http_status(
                status.as_u16(),
                format!("Remote origin returned {} for {}", status, locator),
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl StorageAdapter for HttpStorage {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Http
    }

    async fn get(&self, locator: &str) -> Result<OriginAsset> {
        let response = self.send(reqwest::Method::GET, locator).await?;

        let headers = response.headers();
        let mut metadata = OriginMetadata::new(strip_query(locator));
        metadata.content_length = response.content_length();
        metadata.last_modified = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| GateError::Storage(format!("Remote body error: {}", e)))),
        );

        Ok(OriginAsset {
            stream,
            metadata,
            content_type,
        })
    }

    async fn last_modified(&self, locator: &str) -> Result<Option<SystemTime>> {
        let response = self.send(reqwest::Method::HEAD, locator).await?;
        Ok(response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date))
    }
}

/// Request paths collapse `http://` to `http:/`; put the slash back
fn repair_scheme(locator: &str) -> String {
    let locator = locator.trim_start_matches('/');
    for scheme in ["https:/", "http:/"] {
        if let Some(rest) = locator.strip_prefix(scheme) {
            return format!("{}/{}", scheme, rest.trim_start_matches('/'));
        }
    }
    locator.to_string()
}

fn strip_query(locator: &str) -> String {
    locator.split('?').next().unwrap_or(locator).to_string()
}
