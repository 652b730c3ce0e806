//! Admin API
//!
//! - `POST /api` with `{"invalidate": "<pattern>"}` drops matching cache
//!   entries; `"*"` flushes everything
//! - `POST /api/recipes`, `POST /api/routes` create a recipe or route
//! - `DELETE /api/recipes/<name>`, `DELETE /api/routes/<name>` remove one
//!
//! When `api.auth_token` is set every call needs `Authorization: Bearer <token>`.

use crate::cache::AssetCache;
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::metrics::GateMetrics;
use crate::recipes::RecipeStore;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// Envelope returned by every API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            errors: None,
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: None,
            errors: Some(errors),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    invalidate: Option<String>,
}

pub struct ApiHandler {
    config: Arc<GateConfig>,
    cache: Arc<AssetCache>,
    recipes: Arc<RecipeStore>,
    metrics: Arc<GateMetrics>,
}

impl ApiHandler {
    pub fn new(
        config: Arc<GateConfig>,
        cache: Arc<AssetCache>,
        recipes: Arc<RecipeStore>,
        metrics: Arc<GateMetrics>,
    ) -> Self {
        Self {
            config,
            cache,
            recipes,
            metrics,
        }
    }

    /// Handle a request under `/api`
    ///
    /// # Returns
    /// * `Ok(response)` with a JSON envelope
    /// * `Err(GateError::Unauthorized)` when the bearer token is missing or wrong
    /// * `Err(GateError::NotFound)` when the API is disabled or the path is unknown
    pub async fn handle(&self, req: Request<Bytes>) -> Result<Response<Full<Bytes>>> {
        if !self.config.api.enabled {
            return Err(GateError::NotFound("API is disabled".to_string()));
        }
        self.check_auth(&req)?;

        let path = req.uri().path().trim_end_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (req.method(), segments.as_slice()) {
            (&Method::POST, ["api"]) => self.invalidate(&req).await,
            (&Method::POST, ["api", "recipes"]) => {
                let value = match parse_body(req.body()) {
                    Ok(value) => value,
                    Err(response) => return Ok(response),
                };
                created(self.recipes.create_recipe(&value).await, "Recipe")
            }
            (&Method::POST, ["api", "routes"]) => {
                let value = match parse_body(req.body()) {
                    Ok(value) => value,
                    Err(response) => return Ok(response),
                };
                created(self.recipes.create_route(&value).await, "Route")
            }
            (&Method::DELETE, ["api", "recipes", name]) => {
                deleted(self.recipes.delete_recipe(name).await, "Recipe", name)
            }
            (&Method::DELETE, ["api", "routes", name]) => {
                deleted(self.recipes.delete_route(name).await, "Route", name)
            }
            (_, ["api"]) | (_, ["api", "recipes" | "routes", ..]) => json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &ApiResponse::failed(vec![format!("Method {} not allowed", req.method())]),
            ),
            _ => Err(GateError::NotFound(format!("Unknown API endpoint {}", path))),
        }
    }

    fn check_auth(&self, req: &Request<Bytes>) -> Result<()> {
        let Some(expected) = &self.config.api.auth_token else {
            return Ok(());
        };

        let presented = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let matches = presented
            .is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())));
        if matches {
            Ok(())
        } else {
            warn!("Rejected API call to {} with missing or invalid token", req.uri().path());
            Err(GateError::Unauthorized(
                "Invalid or missing bearer token".to_string(),
            ))
        }
    }

    async fn invalidate(&self, req: &Request<Bytes>) -> Result<Response<Full<Bytes>>> {
        let body: InvalidateRequest = match serde_json::from_slice(req.body()) {
            Ok(body) => body,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &ApiResponse::failed(vec![format!("Invalid JSON body: {}", e)]),
                )
            }
        };
        let Some(pattern) = body.invalidate.filter(|p| !p.is_empty()) else {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::failed(vec!["Missing \"invalidate\" property".to_string()]),
            );
        };

        let domains = if self.config.multi_domain.enabled {
            let host = req
                .headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase());
            Some(host.into_iter().collect::<Vec<_>>())
        } else {
            None
        };

        // With several domains sharing the cache, `*` only flushes the caller's host
        if pattern == "*" && domains.is_none() {
            let removed = self.cache.reset().await?;
            self.metrics.record_invalidation("all");
            info!("Flushed entire cache ({} entries)", removed);
            return json_response(StatusCode::OK, &ApiResponse::ok("Cache flush successful"));
        }

        let removed = self.cache.delete(&pattern, domains.as_deref()).await?;
        self.metrics.record_invalidation("pattern");
        json_response(
            StatusCode::OK,
            &ApiResponse::ok(format!(
                "Cache flush successful for {} ({} entries)",
                pattern, removed
            )),
        )
    }
}

fn parse_body(body: &Bytes) -> std::result::Result<serde_json::Value, Response<Full<Bytes>>> {
    serde_json::from_slice(body).map_err(|e| {
        let envelope = ApiResponse::failed(vec![format!("Invalid JSON body: {}", e)]);
        plain_json(StatusCode::BAD_REQUEST, &envelope)
    })
}

fn created(
    outcome: std::result::Result<String, Vec<String>>,
    kind: &str,
) -> Result<Response<Full<Bytes>>> {
    match outcome {
        Ok(name) => json_response(
            StatusCode::CREATED,
            &ApiResponse::ok(format!("{} \"{}\" saved", kind, name)),
        ),
        Err(errors) => json_response(StatusCode::BAD_REQUEST, &ApiResponse::failed(errors)),
    }
}

fn deleted(outcome: Result<()>, kind: &str, name: &str) -> Result<Response<Full<Bytes>>> {
    match outcome {
        Ok(()) => json_response(
            StatusCode::OK,
            &ApiResponse::ok(format!("{} \"{}\" deleted", kind, name)),
        ),
        Err(GateError::NotFound(message)) => {
            json_response(StatusCode::NOT_FOUND, &ApiResponse::failed(vec![message]))
        }
        Err(e) => Err(e),
    }
}

fn json_response(status: StatusCode, body: &ApiResponse) -> Result<Response<Full<Bytes>>> {
    let json = serde_json::to_vec(body)?;
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Full::new(Bytes::from(json)))
        .map_err(|e| GateError::InternalError(format!("Failed to build response: {}", e)))
}

/// Response for paths that cannot fail to build
fn plain_json(status: StatusCode, body: &ApiResponse) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}
