//! Client IP classification for route conditions
//!
//! Country lookups come from a local range database or a remote JSON
//! service; network lookups are always remote.

use crate::config::{GeolocationConfig, GeolocationMethod, NetworkConfig};
use crate::error::{GateError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolves a client IP to an ISO country code
#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// # Returns
    /// * `Ok(Some(code))` upper-cased country code
    /// * `Ok(None)` if the address is unknown to the database
    async fn country(&self, ip: IpAddr) -> Result<Option<String>>;
}

/// Resolves a client IP to a network classification (carrier, `cable`, ...)
#[async_trait]
pub trait NetworkLookup: Send + Sync {
    async fn network(&self, ip: IpAddr) -> Result<Option<String>>;
}

/// In-memory country database of inclusive IP ranges
///
/// Loaded from CSV rows of `start_ip,end_ip,country`. Blank lines and lines
/// starting with `#` are skipped.
#[derive(Debug, Default)]
pub struct LocalGeoDatabase {
    /// Sorted by range start
    ranges: Vec<(u128, u128, String)>,
}

impl LocalGeoDatabase {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            GateError::ConfigError(format!(
                "Failed to read geolocation database {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let db = Self::from_csv(&content)?;
        info!(
            "Loaded geolocation database {} with {} ranges",
            path.as_ref().display(),
            db.len()
        );
        Ok(db)
    }

    pub fn from_csv(content: &str) -> Result<Self> {
        let mut ranges = Vec::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(|f| f.trim().trim_matches('"')).collect();
            if fields.len() < 3 {
                return Err(GateError::ParseError(format!(
                    "Geolocation database line {}: expected start,end,country",
                    line_no + 1
                )));
            }

            let parse_ip = |s: &str| {
                s.parse::<IpAddr>().map(ip_to_u128).map_err(|_| {
                    GateError::ParseError(format!(
                        "Geolocation database line {}: invalid address {}",
                        line_no + 1,
                        s
                    ))
                })
            };

            let start = parse_ip(fields[0])?;
            let end = parse_ip(fields[1])?;
            if end < start {
                return Err(GateError::ParseError(format!(
                    "Geolocation database line {}: range end precedes start",
                    line_no + 1
                )));
            }
            ranges.push((start, end, fields[2].to_ascii_uppercase()));
        }

        ranges.sort_by_key(|(start, _, _)| *start);
        Ok(Self { ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Country for an address, `None` if no range covers it
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        let value = ip_to_u128(ip);
        let idx = self.ranges.partition_point(|(start, _, _)| *start <= value);
        if idx == 0 {
            return None;
        }
        let (_, end, country) = &self.ranges[idx - 1];
        (value <= *end).then_some(country.as_str())
    }
}

#[async_trait]
impl GeoLocator for LocalGeoDatabase {
    async fn country(&self, ip: IpAddr) -> Result<Option<String>> {
        Ok(self.lookup(ip).map(|c| c.to_string()))
    }
}

/// Country lookup against a JSON web service
pub struct RemoteGeoLocator {
    client: Client,
    url_template: String,
    key: Option<String>,
    country_path: String,
}

impl RemoteGeoLocator {
    pub fn new(url_template: &str, key: Option<String>, country_path: &str) -> Result<Self> {
        Ok(Self {
            client: lookup_client()?,
            url_template: url_template.to_string(),
            key,
            country_path: country_path.to_string(),
        })
    }
}

#[async_trait]
impl GeoLocator for RemoteGeoLocator {
    async fn country(&self, ip: IpAddr) -> Result<Option<String>> {
        let url = expand_template(&self.url_template, ip, self.key.as_deref());
        let value = fetch_json(&self.client, &url).await?;
        Ok(json_path(&value, &self.country_path).map(|c| c.to_ascii_uppercase()))
    }
}

/// Network classification against a JSON web service
pub struct RemoteNetworkLookup {
    client: Client,
    url_template: String,
    path: String,
}

impl RemoteNetworkLookup {
    pub fn new(url_template: &str, path: &str) -> Result<Self> {
        Ok(Self {
            client: lookup_client()?,
            url_template: url_template.to_string(),
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl NetworkLookup for RemoteNetworkLookup {
    async fn network(&self, ip: IpAddr) -> Result<Option<String>> {
        let url = expand_template(&self.url_template, ip, None);
        let value = fetch_json(&self.client, &url).await?;
        Ok(json_path(&value, &self.path).map(|n| n.to_ascii_lowercase()))
    }
}

/// Build the configured country locator, `None` when geolocation is off
pub async fn build_geolocator(config: &GeolocationConfig) -> Result<Option<Arc<dyn GeoLocator>>> {
    if !config.enabled {
        debug!("Geolocation disabled; country conditions never match");
        return Ok(None);
    }

    let locator: Arc<dyn GeoLocator> = match config.method {
        GeolocationMethod::Local => {
            let path = config.database_path.as_deref().ok_or_else(|| {
                GateError::ConfigError("geolocation.database_path is not set".to_string())
            })?;
            Arc::new(LocalGeoDatabase::load(path).await?)
        }
        GeolocationMethod::Remote => {
            let url = config.remote_url.as_deref().ok_or_else(|| {
                GateError::ConfigError("geolocation.remote_url is not set".to_string())
            })?;
            Arc::new(RemoteGeoLocator::new(
                url,
                config.remote_key.clone(),
                &config.country_path,
            )?)
        }
    };

    Ok(Some(locator))
}

/// Build the configured network lookup, `None` when disabled
pub fn build_network_lookup(config: &NetworkConfig) -> Result<Option<Arc<dyn NetworkLookup>>> {
    match (config.enabled, config.url.as_deref()) {
        (true, Some(url)) => Ok(Some(Arc::new(RemoteNetworkLookup::new(url, &config.path)?))),
        _ => Ok(None),
    }
}

fn lookup_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| GateError::HttpError(format!("Failed to create HTTP client: {}", e)))
}

fn expand_template(template: &str, ip: IpAddr, key: Option<&str>) -> String {
    template
        .replace("{ip}", &ip.to_string())
        .replace("{key}", key.unwrap_or_default())
}

async fn fetch_json(client: &Client, url: &str) -> Result<serde_json::Value> {
    debug!("Client lookup url={}", url);

    let response = client.get(url).send().await.map_err(|e| {
        warn!("Lookup request failed for url={}: {}", url, e);
        GateError::HttpError(format!("Lookup request failed: {}", e))
    })?;

    let status = response.status();
    if !status.is_success() {
        warn!("Lookup service returned status={} for url={}", status, url);
        return Err(GateError::from_http_status(
            status.as_u16(),
            format!("Lookup service returned {}", status),
        ));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| GateError::ParseError(format!("Lookup response is not JSON: {}", e)))
}

/// Walk a slash-separated path into a JSON document
///
/// Returns the value as text when it is a string or number.
pub fn json_path(value: &serde_json::Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = match current {
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            other => other.get(segment)?,
        };
    }

    match current {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}
