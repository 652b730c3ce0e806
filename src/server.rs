//! Request orchestration
//!
//! [`AssetServer::handle`] runs one request through the pipeline:
//!
//! 1. resolve the request into handler, options, origin path and cache key
//! 2. serve a live cache entry (`X-Cache: HIT`)
//! 3. otherwise join or start the single production job for the key: fetch
//!    from the origin, transform, tee into the cache (`X-Cache: MISS`)
//!
//! `/api` goes to the [`ApiHandler`] and `/metrics` renders the collectors.

use crate::api::ApiHandler;
use crate::cache::{AssetCache, EntryInfo};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::geolocation::{build_geolocator, build_network_lookup};
use crate::image::ImageEngine;
use crate::metrics::GateMetrics;
use crate::models::{collect_stream, http_date, stream_from_bytes, RequestContext};
use crate::recipes::RecipeStore;
use crate::resolver::{ResolvedRequest, Resolver};
use crate::route_evaluator::RouteEvaluator;
use crate::storage::StorageFactory;
use crate::transform::{gzip, is_compressible, Transformer};
use crate::work_queue::{JobOutcome, WorkQueue};
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// A finished production job, shared by every request that waited on it
#[derive(Debug, Clone)]
pub struct Produced {
    pub data: Bytes,
    pub content_type: String,
    pub not_found: bool,
    pub last_modified: Option<SystemTime>,
}

/// Error body: `{"statusCode": 404, "message": "..."}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    status_code: u16,
    message: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Everything production jobs need, shared across requests
struct Pipeline {
    storage: StorageFactory,
    transformer: Transformer,
    cache: Arc<AssetCache>,
    metrics: Arc<GateMetrics>,
    timeout: Duration,
    /// Cache origin misses that have no fallback asset
    cache_404: bool,
    not_found_status: u16,
}

pub struct AssetServer {
    config: Arc<GateConfig>,
    cache: Arc<AssetCache>,
    resolver: Resolver,
    queue: WorkQueue<Arc<Produced>>,
    pipeline: Arc<Pipeline>,
    api: ApiHandler,
    metrics: Arc<GateMetrics>,
}

impl AssetServer {
    /// Build every component from configuration
    ///
    /// # Returns
    /// * `Ok(AssetServer)` ready to handle requests
    /// * `Err(GateError)` if a cache directory, geolocation database or
    ///   storage client cannot be set up
    pub async fn from_config(config: GateConfig) -> Result<Self> {
        let config = Arc::new(config);

        let cache = Arc::new(AssetCache::from_config(config.clone()).await?);
        let metrics = Arc::new(
            GateMetrics::new()
                .map_err(|e| GateError::InternalError(format!("Failed to create metrics: {}", e)))?,
        );
        let recipes = Arc::new(RecipeStore::new(&config.paths.recipes, &config.paths.routes));

        let evaluator = Arc::new(RouteEvaluator::new(
            build_geolocator(&config.geolocation).await?,
            build_network_lookup(&config.network)?,
            cache.clone(),
            Duration::from_secs(config.geolocation.cache_ttl),
        ));

        let engine = ImageEngine::new(config.transform.workers, config.security.clone());
        let pipeline = Arc::new(Pipeline {
            storage: StorageFactory::from_config(&config)?,
            transformer: Transformer::new(engine),
            cache: cache.clone(),
            metrics: metrics.clone(),
            timeout: Duration::from_secs(config.transform.timeout_secs),
            cache_404: config.caching.cache_404,
            not_found_status: config.not_found.status_code,
        });

        info!(
            "Asset server ready: cache={} workers={} timeout={}s",
            cache.is_enabled(),
            config.transform.workers,
            config.transform.timeout_secs
        );

        Ok(Self {
            resolver: Resolver::new(config.clone(), recipes.clone(), evaluator, cache.clone()),
            api: ApiHandler::new(config.clone(), cache.clone(), recipes, metrics.clone()),
            queue: WorkQueue::new(),
            pipeline,
            cache,
            metrics,
            config,
        })
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.metrics
    }

    /// Handle one request
    ///
    /// Never fails: errors are rendered as `{statusCode, message}` JSON.
    ///
    /// # Arguments
    /// * `req` - Request with its body already collected
    /// * `client_ip` - Peer address, used by country and network route conditions
    pub async fn handle(&self, req: Request<Bytes>, client_ip: Option<IpAddr>) -> Response<Full<Bytes>> {
        let path = req.uri().path();

        let result = if path == "/metrics" {
            self.metrics_response()
        } else if path == "/api" || path.starts_with("/api/") {
            self.api.handle(req).await
        } else {
            self.serve_asset(req, client_ip).await
        };

        result.unwrap_or_else(|e| self.error_response(&e))
    }

    async fn serve_asset(&self, req: Request<Bytes>, client_ip: Option<IpAddr>) -> Result<Response<Full<Bytes>>> {
        let (parts, _) = req.into_parts();
        if parts.method != Method::GET && parts.method != Method::HEAD {
            return Err(GateError::BadRequest(format!(
                "Method {} is not supported for assets",
                parts.method
            )));
        }

        let ctx = RequestContext::from_parts(&parts, client_ip);
        let resolved = self.resolver.resolve(&ctx).await?;
        self.metrics.record_request(resolved.kind.as_str());

        let accepts_gzip = ctx
            .header("accept-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));
        let head_only = parts.method == Method::HEAD;

        if let Some(entry) = self.cache.get_stream(&resolved.cache_key).await {
            match collect_stream(entry.stream).await {
                Ok(data) => {
                    self.metrics.record_cache(true);
                    let produced = Produced {
                        data,
                        content_type: entry.meta.content_type.clone(),
                        not_found: entry.meta.not_found,
                        last_modified: Some(entry.meta.created_at()),
                    };
                    return self.asset_response(&produced, CacheStatus::Hit, accepts_gzip, head_only);
                }
                Err(e) => warn!(
                    "Cached body for path={} unreadable, producing again: {}",
                    resolved.cache_key.path, e
                ),
            }
        }
        self.metrics.record_cache(false);

        let pipeline = self.pipeline.clone();
        let job = resolved.clone();
        let (result, outcome) = self
            .queue
            .run(&resolved.cache_key.digest, move || produce(pipeline, job))
            .await;
        self.metrics.record_job(outcome.as_str());
        if outcome == JobOutcome::Coalesced {
            debug!("Served path={} from a coalesced job", resolved.origin_path);
        }

        let produced = result?;
        self.asset_response(&produced, CacheStatus::Miss, accepts_gzip, head_only)
    }

    fn asset_response(
        &self,
        produced: &Produced,
        cache_status: CacheStatus,
        accepts_gzip: bool,
        head_only: bool,
    ) -> Result<Response<Full<Bytes>>> {
        let status = if produced.not_found {
            StatusCode::from_u16(self.config.not_found.status_code).unwrap_or(StatusCode::NOT_FOUND)
        } else {
            StatusCode::OK
        };

        let gzipped = self.config.server.gzip && accepts_gzip && is_compressible(&produced.content_type);
        let body = if gzipped {
            gzip(&produced.data)?
        } else {
            produced.data.clone()
        };

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, &produced.content_type)
            .header(header::CONTENT_LENGTH, body.len())
            .header(header::CACHE_CONTROL, &self.config.server.cache_control)
            .header("X-Cache", cache_status.as_str());
        if gzipped {
            builder = builder
                .header(header::CONTENT_ENCODING, "gzip")
                .header(header::VARY, "Accept-Encoding");
        }
        if let Some(modified) = produced.last_modified {
            builder = builder.header(header::LAST_MODIFIED, http_date(modified));
        }

        let body = if head_only { Bytes::new() } else { body };
        builder
            .body(Full::new(body))
            .map_err(|e| GateError::InternalError(format!("Failed to build response: {}", e)))
    }

    fn metrics_response(&self) -> Result<Response<Full<Bytes>>> {
        let body = self
            .metrics
            .render()
            .map_err(|e| GateError::InternalError(format!("Failed to render metrics: {}", e)))?;
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| GateError::InternalError(format!("Failed to build response: {}", e)))
    }

    fn error_response(&self, err: &GateError) -> Response<Full<Bytes>> {
        let status = err.status_code();
        self.metrics.record_error(status);
        if status >= 500 {
            error!("Request failed with {}: {}", status, err);
        } else {
            debug!("Request rejected with {}: {}", status, err);
        }

        let message = err.to_string();
        let body = serde_json::to_vec(&ErrorBody {
            status_code: status,
            message: &message,
        })
        .unwrap_or_default();

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("Listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let server = Arc::clone(&server);
                    async move {
                        let (parts, body) = req.into_parts();
                        let response = match body.collect().await {
                            Ok(collected) => {
                                let req = Request::from_parts(parts, collected.to_bytes());
                                server.handle(req, Some(peer.ip())).await
                            }
                            Err(e) => server.error_response(&GateError::BadRequest(format!(
                                "Failed to read request body: {}",
                                e
                            ))),
                        };
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}

/// Fetch, transform and cache one asset
async fn produce(pipeline: Arc<Pipeline>, resolved: ResolvedRequest) -> Result<Arc<Produced>> {
    let started = Instant::now();
    let timeout = pipeline.timeout;
    let path = resolved.origin_path.clone();

    let work = async {
        let (adapter, descriptor) = pipeline
            .storage
            .create(resolved.kind.into(), &resolved.origin_path)?;
        let asset = match adapter.get(&descriptor.locator).await {
            Ok(asset) => asset,
            Err(e) if e.is_not_found() && pipeline.cache_404 => {
                return remember_not_found(&pipeline, &resolved, &e).await;
            }
            Err(e) => return Err(e),
        };
        debug!(
            "Fetched path={} from {} storage (not_found={})",
            path, descriptor.kind, asset.metadata.not_found
        );

        let transformed = pipeline
            .transformer
            .transform(resolved.kind, asset, &resolved.options, &resolved.cache_key.digest)
            .await?;

        let info = EntryInfo::new(transformed.content_type.clone()).not_found(transformed.not_found);
        let stream = pipeline
            .cache
            .cache_file(transformed.stream, &resolved.cache_key, info);
        let data = collect_stream(stream).await?;

        Ok(Arc::new(Produced {
            data,
            content_type: transformed.content_type,
            not_found: transformed.not_found,
            last_modified: transformed.last_modified,
        }))
    };

    let result = match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Producing path={} exceeded {:?}", path, timeout);
            Err(GateError::Timeout(format!(
                "Fetching and transforming {} took longer than {}s",
                path,
                timeout.as_secs()
            )))
        }
    };

    pipeline
        .metrics
        .record_transform(resolved.kind.as_str(), started.elapsed());
    if let Err(e) = &result {
        warn!("Failed to produce path={}: {}", path, e);
    }
    result
}

/// Cache the JSON error body for an origin miss with no fallback asset
///
/// Later requests for the key are answered from the cache with the
/// not-found status until the entry expires or is invalidated.
async fn remember_not_found(
    pipeline: &Pipeline,
    resolved: &ResolvedRequest,
    err: &GateError,
) -> Result<Arc<Produced>> {
    let message = err.to_string();
    let body = serde_json::to_vec(&ErrorBody {
        status_code: pipeline.not_found_status,
        message: &message,
    })
    .map_err(|e| GateError::InternalError(format!("Failed to encode error body: {}", e)))?;
    debug!("Caching not-found response for path={}", resolved.origin_path);

    let content_type = "application/json".to_string();
    let info = EntryInfo::new(content_type.clone()).not_found(true);
    let stream = pipeline.cache.cache_file(
        stream_from_bytes(Bytes::from(body)),
        &resolved.cache_key,
        info,
    );
    let data = collect_stream(stream).await?;

    Ok(Arc::new(Produced {
        data,
        content_type,
        not_found: true,
        last_modified: None,
    }))
}
