//! Handler dispatch
//!
//! Each [`HandlerKind`] turns an origin asset into response bytes:
//! - Image: the [`ImageEngine`]
//! - Css: optional minification
//! - Js: served as stored
//! - Default: served as stored with a content type guessed from the path

use crate::error::{GateError, Result};
use crate::image::ImageEngine;
use crate::models::{collect_stream, stream_from_bytes, ByteStream, HandlerKind, TransformOptions};
use crate::storage::OriginAsset;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::time::SystemTime;
use tracing::debug;

/// Output of a handler, before caching
pub struct Transformed {
    pub stream: ByteStream,
    pub content_type: String,
    /// Result stands in for a missing origin asset
    pub not_found: bool,
    pub last_modified: Option<SystemTime>,
}

pub struct Transformer {
    engine: ImageEngine,
}

impl Transformer {
    pub fn new(engine: ImageEngine) -> Self {
        Self { engine }
    }

    /// Run the handler for `kind` over an origin asset
    ///
    /// # Arguments
    /// * `kind` - Handler chosen by the resolver
    /// * `asset` - Fetched origin asset
    /// * `options` - Resolved transform options
    /// * `cache_reference` - Fingerprint of the request, reported by JSON metadata
    pub async fn transform(
        &self,
        kind: HandlerKind,
        asset: OriginAsset,
        options: &TransformOptions,
        cache_reference: &str,
    ) -> Result<Transformed> {
        let OriginAsset {
            stream,
            metadata,
            content_type,
        } = asset;

        let (stream, content_type): (ByteStream, String) = match kind {
            HandlerKind::Image => {
                let output = self
                    .engine
                    .convert(stream, &metadata, options, cache_reference)
                    .await?;
                (stream_from_bytes(output.data), output.content_type)
            }
            HandlerKind::Css => {
                let stream = if options.compress.unwrap_or(false) {
                    let source = collect_stream(stream).await?;
                    let text = std::str::from_utf8(&source)
                        .map_err(|e| GateError::BadRequest(format!("Stylesheet is not UTF-8: {}", e)))?;
                    let minified = minify_css(text);
                    debug!(
                        "Minified {} from {} to {} bytes",
                        metadata.path,
                        source.len(),
                        minified.len()
                    );
                    stream_from_bytes(Bytes::from(minified))
                } else {
                    stream
                };
                (stream, "text/css".to_string())
            }
            HandlerKind::Js => (stream, "application/javascript".to_string()),
            HandlerKind::Default => {
                let content_type = content_type.unwrap_or_else(|| {
                    mime_guess::from_path(&metadata.path)
                        .first_or_octet_stream()
                        .to_string()
                });
                (stream, content_type)
            }
        };

        Ok(Transformed {
            stream,
            content_type,
            not_found: metadata.not_found,
            last_modified: metadata.last_modified,
        })
    }
}

/// Strip comments and collapse whitespace in a stylesheet
///
/// Quoted strings are copied untouched. Whitespace before `:` survives in
/// selectors, where `a :hover` and `a:hover` differ.
pub fn minify_css(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut pending_space = false;
    // One entry per open brace: true when it holds rules (`@media`) rather
    // than declarations
    let mut blocks: Vec<bool> = Vec::new();
    let mut statement_start = true;
    let mut at_rule = false;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            '"' | '\'' => {
                statement_start = false;
                if pending_space && !out.is_empty() && !ends_with_punct(&out) {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
                let mut escaped = false;
                for inner in chars.by_ref() {
                    out.push(inner);
                    if escaped {
                        escaped = false;
                    } else if inner == '\\' {
                        escaped = true;
                    } else if inner == c {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => pending_space = true,
            '{' | '}' | ';' | ':' | ',' | '>' => {
                let in_declarations = blocks.last() == Some(&false);
                if c == ':' && pending_space && !in_declarations && !out.is_empty() && !ends_with_punct(&out) {
                    out.push(' ');
                }
                match c {
                    '{' => {
                        blocks.push(at_rule);
                        statement_start = true;
                    }
                    '}' => {
                        blocks.pop();
                        statement_start = true;
                    }
                    ';' => statement_start = true,
                    _ => {}
                }
                if c == '}' && out.ends_with(';') {
                    out.pop();
                }
                out.push(c);
                pending_space = false;
            }
            c => {
                if statement_start {
                    at_rule = c == '@';
                    statement_start = false;
                }
                if pending_space && !out.is_empty() && !ends_with_punct(&out) {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }

    out
}

fn ends_with_punct(out: &str) -> bool {
    out.ends_with(['{', '}', ';', ':', ',', '>'])
}

/// Whether a content type benefits from gzip
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.starts_with("text/")
        || matches!(
            essence,
            "application/javascript" | "application/json" | "image/svg+xml"
        )
}

/// Gzip-encode a response body
pub fn gzip(data: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}
