//! Transform option parsing
//!
//! Options arrive in one of three shapes:
//! - positional legacy segments: `/jpg/50/0/0/801/478/0/0/0/2/aspectfit/North/0/0/0/0/0/test.jpg`
//! - query parameters: `/test.jpg?width=801&height=478&resizeStyle=aspectfit`
//! - recipe settings: a JSON object keyed by option name
//!
//! All three funnel into [`apply_field`], so validation lives in one place.

use crate::config::SecurityConfig;
use crate::error::{GateError, Result};
use crate::models::{Flip, Gravity, ResizeStyle, TransformOptions};
use serde_json::Value;
use tracing::debug;

/// Ordered field names of the positional legacy syntax
///
/// Index `i` of the path maps to `LEGACY_SCHEMA[i]`; everything after the
/// last field is the asset path.
pub const LEGACY_SCHEMA: [&str; 17] = [
    "format",
    "quality",
    "trim",
    "trimFuzz",
    "width",
    "height",
    "cropX",
    "cropY",
    "ratio",
    "devicePixelRatio",
    "resizeStyle",
    "gravity",
    "filter",
    "blur",
    "strip",
    "rotate",
    "flip",
];

/// Raster format used when the origin path carries no extension
pub const DEFAULT_IMAGE_FORMAT: &str = "jpg";

/// Parse positional legacy segments into options and the asset path
///
/// # Arguments
/// * `segments` - Non-empty path segments, option values first
///
/// # Returns
/// * `Ok((options, path))` with the options sanitized
/// * `Err(GateError::BadRequest)` if fewer than 17 option segments precede the path
pub fn parse_legacy(segments: &[&str]) -> Result<(TransformOptions, String)> {
    if segments.len() <= LEGACY_SCHEMA.len() {
        return Err(GateError::BadRequest(format!(
            "Invalid path: expected {} option segments followed by an asset path, got {} segments",
            LEGACY_SCHEMA.len(),
            segments.len()
        )));
    }

    let mut options = TransformOptions::default();
    for (name, value) in LEGACY_SCHEMA.iter().zip(segments.iter()) {
        apply_field(&mut options, name, value)?;
    }

    let path = segments[LEGACY_SCHEMA.len()..].join("/");
    options.sanitize();

    debug!("Parsed legacy options for path={}: {}", path, options.canonical());
    Ok((options, path))
}

/// Parse query parameters into options
///
/// `format` defaults to the asset's file extension when not given.
pub fn parse_query(pairs: &[(String, String)], extension: Option<&str>) -> Result<TransformOptions> {
    let mut options = TransformOptions::default();
    for (name, value) in pairs {
        apply_field(&mut options, name, value)?;
    }

    if options.format.is_none() {
        options.format = extension.map(|e| e.to_ascii_lowercase());
    }

    options.sanitize();
    Ok(options)
}

/// Parse a recipe `settings` object
///
/// Values may be JSON strings, numbers or booleans.
pub fn parse_settings(settings: &serde_json::Map<String, Value>) -> Result<TransformOptions> {
    let mut options = TransformOptions::default();
    for (name, value) in settings {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Null => continue,
            other => {
                return Err(GateError::BadRequest(format!(
                    "Invalid value for setting '{}': {}",
                    name, other
                )))
            }
        };
        apply_field(&mut options, name, &text)?;
    }

    options.sanitize();
    Ok(options)
}

/// Set one named option from its textual value
///
/// Unknown names are ignored so unrelated query parameters (cache busters
/// and the like) pass through. Zero values and "none" sentinels leave the
/// field unset.
pub fn apply_field(options: &mut TransformOptions, name: &str, value: &str) -> Result<()> {
    let value = value.trim();
    if is_absent(value) {
        return Ok(());
    }

    match name {
        "format" | "fmt" => options.format = Some(value.to_ascii_lowercase()),
        "quality" | "q" => options.quality = Some(parse_number::<u8>(name, value)?.min(100)),
        "trim" => options.trim = Some(parse_flag(name, value)?),
        "trimFuzz" => options.trim_fuzz = Some(parse_number::<f32>(name, value)?),
        "width" | "w" => options.width = Some(parse_number(name, value)?),
        "height" | "h" => options.height = Some(parse_number(name, value)?),
        "cropX" => options.crop_x = Some(parse_number(name, value)?),
        "cropY" => options.crop_y = Some(parse_number(name, value)?),
        "ratio" => {
            parse_ratio(value)?;
            options.ratio = Some(value.to_string());
        }
        "devicePixelRatio" | "dpr" => {
            options.device_pixel_ratio = Some(parse_number::<f32>(name, value)?)
        }
        "resizeStyle" => {
            options.resize_style = Some(ResizeStyle::parse(value).ok_or_else(|| {
                GateError::BadRequest(format!("Invalid resizeStyle: {}", value))
            })?)
        }
        "gravity" => {
            options.gravity = Some(Gravity::parse(value).ok_or_else(|| {
                GateError::BadRequest(format!("Invalid gravity: {}", value))
            })?)
        }
        "filter" => options.filter = Some(capitalize(value)),
        "blur" => options.blur = Some(parse_number::<f32>(name, value)?),
        "strip" => options.strip = Some(parse_flag(name, value)?),
        "rotate" => options.rotate = Some(parse_number::<f32>(name, value)?),
        "flip" => {
            options.flip = Some(
                Flip::parse(value)
                    .ok_or_else(|| GateError::BadRequest(format!("Invalid flip: {}", value)))?,
            )
        }
        "compress" => options.compress = Some(parse_flag(name, value)?),
        _ => {}
    }

    Ok(())
}

/// Parse a `W-H` aspect ratio
pub fn parse_ratio(value: &str) -> Result<(f64, f64)> {
    let invalid = || GateError::BadRequest(format!("Invalid ratio: {}", value));
    let (w, h) = value.split_once(['-', ':']).ok_or_else(invalid)?;
    let w: f64 = w.trim().parse().map_err(|_| invalid())?;
    let h: f64 = h.trim().parse().map_err(|_| invalid())?;
    if w <= 0.0 || h <= 0.0 {
        return Err(invalid());
    }
    Ok((w, h))
}

/// Cap requested dimensions to the configured maxima
///
/// Values above the cap are reduced, never rejected.
pub fn clamp_dimensions(options: &mut TransformOptions, security: &SecurityConfig) {
    if let Some(width) = options.width.as_mut() {
        *width = (*width).min(security.max_width);
    }
    if let Some(height) = options.height.as_mut() {
        *height = (*height).min(security.max_height);
    }
}

/// Format the image engine should encode to
///
/// The JSON sentinel asks for metadata, so the bytes stay in the origin's
/// own format, or [`DEFAULT_IMAGE_FORMAT`] when the path has no extension.
pub fn effective_format(options: &TransformOptions, extension: Option<&str>) -> String {
    match options.format.as_deref() {
        Some("json") | None => extension
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_IMAGE_FORMAT.to_string()),
        Some(format) => format.to_string(),
    }
}

/// Capitalise the first letter and lower-case the rest
pub fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

fn is_absent(value: &str) -> bool {
    value.is_empty() || value == "0" || value.eq_ignore_ascii_case("none")
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| GateError::BadRequest(format!("Invalid value for {}: {}", name, value)))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(GateError::BadRequest(format!(
            "Invalid value for {}: {}",
            name, value
        ))),
    }
}
