//! Assetgate
//!
//! An asset delivery server that fetches images, stylesheets, scripts and
//! other files from a pluggable origin, transforms them on the fly and
//! caches the result.
//!
//! # Overview
//!
//! A request names an origin asset plus the transform to apply, in one of
//! three shapes:
//!
//! - positional legacy segments: `/jpg/80/0/0/640/480/0/0/0/1/aspectfill/Center/0/0/0/0/0/photos/cat.jpg`
//! - query parameters: `/photos/cat.jpg?width=640&height=480&format=png`
//! - a recipe or route name: `/thumbnail/photos/cat.jpg`
//!
//! # Features
//!
//! - **Image transforms**: resize styles, crop, ratio, device pixel ratio,
//!   blur, rotate, flip, trim, format conversion and JSON metadata
//! - **Recipes and routes**: named option bundles, chosen per client by
//!   device, language, country or network
//! - **Single-flight production**: concurrent requests for the same result
//!   share one origin fetch and one transform
//! - **Streaming cache**: directory or in-memory, with per-domain TTLs and
//!   pattern invalidation
//! - **Pluggable origins**: local directory, remote HTTP and S3, with a
//!   fallback image for missing assets
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use assetgate::{AssetServer, GateConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GateConfig::from_file("assetgate.yaml")?;
//! let addr = format!("{}:{}", config.server.host, config.server.port);
//!
//! let server = Arc::new(AssetServer::from_config(config).await?);
//! let listener = tokio::net::TcpListener::bind(addr).await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`Resolver`]: turns a request into handler, options, origin path and cache key
//! - [`RouteEvaluator`]: picks a recipe from a route's conditional branches
//! - [`WorkQueue`]: at most one production job per cache key
//! - [`AssetCache`]: tee-on-write cache over a [`CacheStore`]
//! - [`StorageFactory`]: selects the origin [`StorageAdapter`]
//! - [`ImageEngine`]: decode, transform and encode images
//! - [`AssetServer`]: wires the pieces together per request
//!
//! # Configuration
//!
//! ```yaml
//! server:
//!   port: 8001
//! images:
//!   directory:
//!     enabled: true
//!     path: ./images
//! caching:
//!   ttl: 3600
//!   directory:
//!     enabled: true
//!     path: ./cache
//! security:
//!   max_width: 2048
//!   max_height: 1024
//! ```
//!
//! See [`GateConfig`] for every option.
//!
//! # Error Handling
//!
//! Every component returns [`GateError`]; the server renders it as
//! `{"statusCode": ..., "message": ...}` with the matching HTTP status.
//!
//! ```rust,no_run
//! use assetgate::{GateConfig, GateError};
//!
//! # fn main() {
//! match GateConfig::from_file("assetgate.yaml") {
//!     Ok(_) => println!("Config loaded"),
//!     Err(GateError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod cache_store;
pub mod config;
pub mod error;
pub mod geolocation;
pub mod image;
pub mod metrics;
pub mod models;
pub mod options;
pub mod recipes;
pub mod resolver;
pub mod route_evaluator;
pub mod server;
pub mod storage;
pub mod transform;
pub mod work_queue;

// Re-export commonly used types
pub use api::{ApiHandler, ApiResponse};
pub use cache::{AssetCache, CacheKey, CacheStats, EntryInfo};
pub use cache_store::{CacheStore, FileStore, MemoryStore};
pub use config::GateConfig;
pub use error::{GateError, Result};
pub use image::ImageEngine;
pub use metrics::GateMetrics;
pub use models::{AssetKind, HandlerKind, RequestContext, TransformOptions};
pub use recipes::{Recipe, RecipeStore, Route};
pub use resolver::{ResolvedRequest, Resolver};
pub use route_evaluator::RouteEvaluator;
pub use server::AssetServer;
pub use storage::{StorageAdapter, StorageFactory};
pub use work_queue::{JobOutcome, WorkQueue};
