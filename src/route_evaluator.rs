//! Route branch evaluation
//!
//! Branches are tried in order. A branch matches when every condition key it
//! carries matches the client; a branch without a condition always matches.
//! The first match names the recipe to apply.

use crate::cache::{AssetCache, EntryInfo};
use crate::geolocation::{GeoLocator, NetworkLookup};
use crate::models::RequestContext;
use crate::recipes::{Condition, OneOrMany, Route};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Minimum `q` a language must carry when a condition does not say
pub const DEFAULT_LANGUAGE_MIN_QUALITY: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
        }
    }
}

/// Classify a User-Agent string
pub fn classify_device(user_agent: &str) -> DeviceClass {
    let ua = user_agent.to_ascii_lowercase();

    if ua.contains("ipad")
        || ua.contains("tablet")
        || ua.contains("kindle")
        || ua.contains("silk/")
        || (ua.contains("android") && !ua.contains("mobile"))
    {
        DeviceClass::Tablet
    } else if ua.contains("mobi")
        || ua.contains("iphone")
        || ua.contains("ipod")
        || ua.contains("android")
        || ua.contains("windows phone")
        || ua.contains("blackberry")
    {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    }
}

/// Parse an `Accept-Language` header into `(code, quality)` pairs
///
/// Codes are lower-cased; entries without `q` have quality 1. Malformed
/// quality values drop the entry.
pub fn parse_accept_language(header: &str) -> Vec<(String, f32)> {
    header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let code = pieces.next()?.trim().to_ascii_lowercase();
            if code.is_empty() {
                return None;
            }

            let mut quality = 1.0;
            for param in pieces {
                if let Some(value) = param.trim().strip_prefix("q=") {
                    quality = value.trim().parse::<f32>().ok()?;
                }
            }
            Some((code, quality))
        })
        .collect()
}

/// Evaluates routes against request signals
pub struct RouteEvaluator {
    geo: Option<Arc<dyn GeoLocator>>,
    network: Option<Arc<dyn NetworkLookup>>,
    cache: Arc<AssetCache>,
    lookup_ttl: Duration,
}

impl RouteEvaluator {
    pub fn new(
        geo: Option<Arc<dyn GeoLocator>>,
        network: Option<Arc<dyn NetworkLookup>>,
        cache: Arc<AssetCache>,
        lookup_ttl: Duration,
    ) -> Self {
        Self {
            geo,
            network,
            cache,
            lookup_ttl,
        }
    }

    /// Pick the recipe for a client
    ///
    /// # Returns
    /// * `Some(recipe)` from the first matching branch
    /// * `None` when no branch matches
    pub async fn evaluate(&self, route: &Route, ctx: &RequestContext) -> Option<String> {
        for (idx, branch) in route.branches.iter().enumerate() {
            let matched = match &branch.condition {
                None => true,
                Some(condition) => self.matches(route, condition, ctx).await,
            };

            if matched {
                debug!(
                    "Route {} matched branch {} -> recipe {}",
                    route.name, idx, branch.recipe
                );
                return Some(branch.recipe.clone());
            }
        }

        debug!("Route {} matched no branch", route.name);
        None
    }

    async fn matches(&self, route: &Route, condition: &Condition, ctx: &RequestContext) -> bool {
        if let Some(devices) = &condition.device {
            let device = classify_device(ctx.header("user-agent").unwrap_or_default());
            if !contains_ignore_case(devices, device.as_str()) {
                return false;
            }
        }

        if let Some(languages) = &condition.language {
            let min_quality = condition
                .language_min_quality
                .unwrap_or(DEFAULT_LANGUAGE_MIN_QUALITY);
            let accepted = parse_accept_language(ctx.header("accept-language").unwrap_or_default());
            let wanted = languages.values();

            let any = accepted
                .iter()
                .filter(|(_, q)| *q >= min_quality)
                .any(|(code, _)| wanted.iter().any(|w| language_matches(w, code)));
            if !any {
                return false;
            }
        }

        // Lookups last, they may leave the process
        if let Some(countries) = &condition.country {
            match self.country(route, ctx.client_ip).await {
                Some(country) if contains_ignore_case(countries, &country) => {}
                _ => return false,
            }
        }

        if let Some(networks) = &condition.network {
            match self.network(route, ctx.client_ip).await {
                Some(network) if contains_ignore_case(networks, &network) => {}
                _ => return false,
            }
        }

        true
    }

    async fn country(&self, route: &Route, ip: Option<IpAddr>) -> Option<String> {
        let geo = self.geo.as_ref()?;
        let ip = ip?;
        self.memoized(route, ip, "country", || async move {
            geo.country(ip).await
        })
        .await
    }

    async fn network(&self, route: &Route, ip: Option<IpAddr>) -> Option<String> {
        let lookup = self.network.as_ref()?;
        let ip = ip?;
        self.memoized(route, ip, "network", || async move {
            lookup.network(ip).await
        })
        .await
    }

    /// Resolve a client attribute, memoized per route and client IP
    ///
    /// Failed lookups are logged and treated as unknown, never cached.
    async fn memoized<F, Fut>(&self, route: &Route, ip: IpAddr, what: &str, lookup: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<Option<String>>>,
    {
        let key = self
            .cache
            .key(None, &format!("_lookups/{}/{}", route.name, ip), what);

        if let Some(cached) = self.cache.get_bytes(&key).await {
            let value = String::from_utf8_lossy(&cached).into_owned();
            return (!value.is_empty()).then_some(value);
        }

        match lookup().await {
            Ok(value) => {
                let body = bytes::Bytes::from(value.clone().unwrap_or_default());
                let info = EntryInfo::new("text/plain").with_ttl(self.lookup_ttl);
                if let Err(e) = self.cache.cache_bytes(&key, body, info).await {
                    warn!("Failed to memoize {} for {}: {}", what, ip, e);
                }
                debug!("Resolved {} for {}: {:?}", what, ip, value);
                value
            }
            Err(e) => {
                warn!("{} lookup failed for {}: {}", what, ip, e);
                None
            }
        }
    }
}

/// A condition language matches an exact tag or the tag's primary subtag
///
/// `en` matches `en` and `en-gb`; `en-gb` matches only `en-gb`.
fn language_matches(wanted: &str, accepted: &str) -> bool {
    let wanted = wanted.to_ascii_lowercase();
    accepted == wanted || accepted.split('-').next() == Some(wanted.as_str())
}

fn contains_ignore_case(values: &OneOrMany, candidate: &str) -> bool {
    values
        .values()
        .iter()
        .any(|v| v.eq_ignore_ascii_case(candidate))
}
