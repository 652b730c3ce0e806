//! Request resolution
//!
//! Turns a request into the handler to run, its transform options, the path
//! to fetch from the origin and the cache key. Resolution order:
//!
//! 1. first segment names a route: evaluate it, then load the chosen recipe
//! 2. first segment names a recipe: load its settings
//! 3. legacy asset prefixes `/css/<0|1>/`, `/js/<0|1>/`, `/fonts/`, `/assets/`
//! 4. a query string: option names read from the query
//! 5. positional legacy segments

use crate::cache::{AssetCache, CacheKey};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::models::{file_extension, HandlerKind, RequestContext, TransformOptions};
use crate::options::{self, clamp_dimensions, LEGACY_SCHEMA};
use crate::recipes::{is_valid_name, Recipe, RecipeStore};
use crate::route_evaluator::RouteEvaluator;
use std::sync::Arc;
use tracing::debug;

/// Font extensions served from `/fonts/`
pub const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "woff", "woff2", "eot", "svg"];

/// A request ready for the work queue
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub kind: HandlerKind,
    pub options: TransformOptions,
    /// Path handed to the storage factory
    pub origin_path: String,
    pub cache_key: CacheKey,
    /// Recipe that supplied the options, if any
    pub recipe: Option<String>,
}

pub struct Resolver {
    config: Arc<GateConfig>,
    recipes: Arc<RecipeStore>,
    evaluator: Arc<RouteEvaluator>,
    cache: Arc<AssetCache>,
}

impl Resolver {
    pub fn new(
        config: Arc<GateConfig>,
        recipes: Arc<RecipeStore>,
        evaluator: Arc<RouteEvaluator>,
        cache: Arc<AssetCache>,
    ) -> Self {
        Self {
            config,
            recipes,
            evaluator,
            cache,
        }
    }

    /// Resolve a request
    ///
    /// # Returns
    /// * `Ok(ResolvedRequest)` on success
    /// * `Err(GateError::NotFound)` for an unknown domain, or a route with no matching branch
    /// * `Err(GateError::BadRequest)` for malformed paths or option values
    pub async fn resolve(&self, ctx: &RequestContext) -> Result<ResolvedRequest> {
        let domain = ctx.domain();
        if self.config.multi_domain.enabled {
            match domain.as_deref() {
                Some(d) if self.config.is_known_domain(d) => {}
                _ => return Err(GateError::NotFound("Domain not configured".to_string())),
            }
        }

        let segments: Vec<&str> = ctx.path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(GateError::BadRequest("Invalid path: no asset requested".to_string()));
        }

        let (kind, mut options, origin_path, recipe) = match self.from_recipe(ctx, &segments).await? {
            Some(resolved) => resolved,
            None => {
                let (kind, options, path) = self.from_path(ctx, &segments)?;
                (kind, options, path, None)
            }
        };

        if kind == HandlerKind::Image {
            clamp_dimensions(&mut options, &self.config.security);
        }

        let variant = format!("{}:{}", kind, options.canonical());
        let cache_key = self.cache.key(domain.as_deref(), &origin_path, &variant);

        debug!(
            "Resolved {} -> kind={} origin={} recipe={:?} key={}",
            ctx.path, kind, origin_path, recipe, cache_key.digest
        );
        Ok(ResolvedRequest {
            kind,
            options,
            origin_path,
            cache_key,
            recipe,
        })
    }

    /// Route or recipe named by the first segment
    async fn from_recipe(
        &self,
        ctx: &RequestContext,
        segments: &[&str],
    ) -> Result<Option<(HandlerKind, TransformOptions, String, Option<String>)>> {
        let name = segments[0];
        if segments.len() < 2 || !is_valid_name(name) {
            return Ok(None);
        }

        let recipe = if let Some(route) = self.recipes.load_route(name).await? {
            let recipe_name = self.evaluator.evaluate(&route, ctx).await.ok_or_else(|| {
                GateError::NotFound(format!("No branch of route {} matched the request", name))
            })?;
            let recipe = self.recipes.load_recipe(&recipe_name).await?.ok_or_else(|| {
                GateError::NotFound(format!("Recipe {} used by route {} not found", recipe_name, name))
            })?;
            debug!("Route {} selected recipe {}", name, recipe.name);
            recipe
        } else if let Some(recipe) = self.recipes.load_recipe(name).await? {
            recipe
        } else {
            return Ok(None);
        };

        let rest = segments[1..].join("/");
        let origin_path = recipe_origin(&recipe, &rest);
        let extension = file_extension(&origin_path);

        let mut options = recipe.settings.clone();
        if ctx.query.is_some() {
            // Explicit query values override the recipe
            let overrides = options::parse_query(&ctx.query_pairs(), None)?;
            options.merge(&overrides);
        }

        let kind = extension
            .as_deref()
            .map(HandlerKind::from_extension)
            .unwrap_or(HandlerKind::Image);
        Ok(Some((kind, options, origin_path, Some(recipe.name))))
    }

    fn from_path(&self, ctx: &RequestContext, segments: &[&str]) -> Result<(HandlerKind, TransformOptions, String)> {
        match segments[0] {
            prefix @ ("css" | "js") if segments.len() >= 3 && matches!(segments[1], "0" | "1") => {
                let kind = if prefix == "css" { HandlerKind::Css } else { HandlerKind::Js };
                let mut options = TransformOptions {
                    compress: Some(segments[1] == "1"),
                    ..Default::default()
                };
                options.sanitize();
                return Ok((kind, options, segments[2..].join("/")));
            }
            "fonts" if segments.len() >= 2 => {
                let path = segments[1..].join("/");
                let extension = file_extension(&path).unwrap_or_default();
                if !FONT_EXTENSIONS.contains(&extension.as_str()) {
                    return Err(GateError::BadRequest(
                        "Font file type should be TTF, OTF, WOFF, WOFF2, SVG or EOT".to_string(),
                    ));
                }
                return Ok((HandlerKind::Default, TransformOptions::default(), path));
            }
            "assets" if segments.len() >= 2 => {
                return Ok((HandlerKind::Default, TransformOptions::default(), segments[1..].join("/")));
            }
            _ => {}
        }

        let path = segments.join("/");
        let extension = file_extension(&path);

        if ctx.query.is_some() {
            let kind = extension
                .as_deref()
                .map(HandlerKind::from_extension)
                .unwrap_or(HandlerKind::Image);
            let options = options::parse_query(&ctx.query_pairs(), extension.as_deref())?;
            return Ok((kind, options, path));
        }

        if segments.len() > LEGACY_SCHEMA.len() || looks_like_legacy(segments[0]) {
            let (options, path) = options::parse_legacy(segments)?;
            return Ok((HandlerKind::Image, options, path));
        }

        // Plain path with no options: served as stored, format from the extension
        let kind = extension
            .as_deref()
            .map(HandlerKind::from_extension)
            .unwrap_or(HandlerKind::Default);
        let options = if kind == HandlerKind::Image {
            options::parse_query(&[], extension.as_deref())?
        } else {
            TransformOptions::default()
        };
        Ok((kind, options, path))
    }
}

/// A first segment naming an output format starts positional options
fn looks_like_legacy(first: &str) -> bool {
    let first = first.to_ascii_lowercase();
    first == "json" || HandlerKind::IMAGE_EXTENSIONS.contains(&first.as_str())
}

fn recipe_origin(recipe: &Recipe, rest: &str) -> String {
    match &recipe.origin_path {
        Some(prefix) => format!("{}/{}", prefix.trim_matches('/'), rest)
            .trim_start_matches('/')
            .to_string(),
        None => rest.to_string(),
    }
}
