//! Core data models shared across the request pipeline

use crate::error::Result;
use bytes::Bytes;
use futures::Stream;
use http::HeaderMap;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::SystemTime;

/// Boxed byte stream passed between origins, the cache and transforms
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Wrap an in-memory buffer as a single-chunk stream
pub fn stream_from_bytes(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a stream into one contiguous buffer
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes> {
    use futures::StreamExt;

    let mut buffer = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// How an image is fitted into the requested box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeStyle {
    /// Contain: scale to fit inside the box, preserving aspect ratio
    AspectFit,
    /// Cover: scale and crop to fill the box exactly
    AspectFill,
    /// Stretch to the box, ignoring aspect ratio
    Fill,
}

impl ResizeStyle {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "aspectfit" => Some(ResizeStyle::AspectFit),
            "aspectfill" | "cover" => Some(ResizeStyle::AspectFill),
            "fill" => Some(ResizeStyle::Fill),
            _ => None,
        }
    }
}

/// Anchor used when cropping an image down to the requested box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gravity {
    NorthWest,
    North,
    NorthEast,
    West,
    Center,
    East,
    SouthWest,
    South,
    SouthEast,
}

impl Gravity {
    /// Parse a gravity name in any letter case
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "northwest" => Some(Gravity::NorthWest),
            "north" => Some(Gravity::North),
            "northeast" => Some(Gravity::NorthEast),
            "west" => Some(Gravity::West),
            "center" | "centre" => Some(Gravity::Center),
            "east" => Some(Gravity::East),
            "southwest" => Some(Gravity::SouthWest),
            "south" => Some(Gravity::South),
            "southeast" => Some(Gravity::SouthEast),
            _ => None,
        }
    }

    /// Horizontal and vertical anchor as fractions of the free space
    pub fn anchor(self) -> (f64, f64) {
        match self {
            Gravity::NorthWest => (0.0, 0.0),
            Gravity::North => (0.5, 0.0),
            Gravity::NorthEast => (1.0, 0.0),
            Gravity::West => (0.0, 0.5),
            Gravity::Center => (0.5, 0.5),
            Gravity::East => (1.0, 0.5),
            Gravity::SouthWest => (0.0, 1.0),
            Gravity::South => (0.5, 1.0),
            Gravity::SouthEast => (1.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flip {
    X,
    Y,
    XY,
}

impl Flip {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "x" | "h" | "horizontal" => Some(Flip::X),
            "y" | "v" | "vertical" => Some(Flip::Y),
            "xy" | "yx" | "both" => Some(Flip::XY),
            _ => None,
        }
    }
}

/// Canonical set of transform parameters for one request
///
/// Every field is optional: an absent field means "not requested". Zero
/// values and "none" sentinels never survive parsing, see
/// [`TransformOptions::sanitize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trim: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trim_fuzz: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_x: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_y: Option<u32>,
    /// Aspect ratio written as `W-H`, e.g. `16-9`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_pixel_ratio: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize_style: Option<ResizeStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gravity: Option<Gravity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blur: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flip: Option<Flip>,
    /// Minify text assets (css/js)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
}

impl TransformOptions {
    /// Drop every field holding a zero, `false` or empty value
    ///
    /// Zero means "not requested", never "requested as zero". Applying this
    /// to an already sanitized record changes nothing.
    pub fn sanitize(&mut self) {
        fn keep_nonzero_u32(v: &mut Option<u32>) {
            if *v == Some(0) {
                *v = None;
            }
        }
        fn keep_nonzero_f32(v: &mut Option<f32>) {
            if matches!(v, Some(x) if *x == 0.0 || !x.is_finite()) {
                *v = None;
            }
        }
        fn keep_true(v: &mut Option<bool>) {
            if *v == Some(false) {
                *v = None;
            }
        }
        fn keep_text(v: &mut Option<String>) {
            if matches!(v, Some(s) if s.is_empty() || s == "0" || s.eq_ignore_ascii_case("none")) {
                *v = None;
            }
        }

        if self.quality == Some(0) {
            self.quality = None;
        }
        keep_text(&mut self.format);
        keep_true(&mut self.trim);
        keep_nonzero_f32(&mut self.trim_fuzz);
        keep_nonzero_u32(&mut self.width);
        keep_nonzero_u32(&mut self.height);
        keep_nonzero_u32(&mut self.crop_x);
        keep_nonzero_u32(&mut self.crop_y);
        keep_text(&mut self.ratio);
        keep_nonzero_f32(&mut self.device_pixel_ratio);
        keep_text(&mut self.filter);
        keep_nonzero_f32(&mut self.blur);
        keep_true(&mut self.strip);
        keep_nonzero_f32(&mut self.rotate);
        keep_true(&mut self.compress);
    }

    /// Whether the JSON metadata sentinel was requested
    pub fn wants_json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }

    /// Whether any crop offset was requested
    pub fn has_crop(&self) -> bool {
        self.crop_x.is_some() || self.crop_y.is_some()
    }

    /// Overlay the fields set in `other` onto `self`
    pub fn merge(&mut self, other: &TransformOptions) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        overlay!(
            format, quality, trim, trim_fuzz, width, height, crop_x, crop_y, ratio,
            device_pixel_ratio, resize_style, gravity, filter, blur, strip, rotate, flip,
            compress
        );
    }

    /// Stable textual form used for fingerprinting
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Which transform engine handles a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Image,
    Css,
    Js,
    Default,
}

impl HandlerKind {
    /// Image extensions the image engine can decode
    pub const IMAGE_EXTENSIONS: &'static [&'static str] =
        &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff"];

    /// Choose a handler from a file extension
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        if Self::IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            HandlerKind::Image
        } else if ext == "css" {
            HandlerKind::Css
        } else if ext == "js" {
            HandlerKind::Js
        } else {
            HandlerKind::Default
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Image => "image",
            HandlerKind::Css => "css",
            HandlerKind::Js => "js",
            HandlerKind::Default => "default",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view of one incoming request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: http::Method,
    /// Percent-decoded request path, always starting with `/`
    pub path: String,
    /// Raw query string, if the URL carried one
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
}

impl RequestContext {
    pub fn new(method: http::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            client_ip: None,
        }
    }

    /// Build a context from request parts
    pub fn from_parts(parts: &http::request::Parts, client_ip: Option<IpAddr>) -> Self {
        let path = percent_decode_str(parts.uri.path())
            .decode_utf8_lossy()
            .into_owned();

        Self {
            method: parts.method.clone(),
            path,
            query: parts.uri.query().filter(|q| !q.is_empty()).map(|q| q.to_string()),
            headers: parts.headers.clone(),
            client_ip,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = http::HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decoded query parameters in order of appearance
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Host header without port
    pub fn domain(&self) -> Option<String> {
        self.header("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
            .filter(|h| !h.is_empty())
    }
}

/// What the origin told us about an asset
#[derive(Debug, Clone, PartialEq)]
pub struct OriginMetadata {
    /// Asset path relative to the origin root
    pub path: String,
    pub last_modified: Option<SystemTime>,
    pub content_length: Option<u64>,
    /// The bytes are a configured fallback, not the requested asset
    pub not_found: bool,
}

impl OriginMetadata {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
            content_length: None,
            not_found: false,
        }
    }

    /// Lower-cased file extension of the asset path
    pub fn extension(&self) -> Option<String> {
        file_extension(&self.path)
    }

    /// Final path segment
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Which storage block serves an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Image,
    Asset,
}

impl From<HandlerKind> for AssetKind {
    fn from(kind: HandlerKind) -> Self {
        match kind {
            HandlerKind::Image => AssetKind::Image,
            _ => AssetKind::Asset,
        }
    }
}

const HTTP_DATE: &[time::format_description::FormatItem<'static>] = time::macros::format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Format a timestamp as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn http_date(at: SystemTime) -> String {
    time::OffsetDateTime::from(at)
        .to_offset(time::UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

/// Parse an IMF-fixdate header value
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    time::PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .ok()
        .map(|dt| dt.assume_utc().into())
}

/// Lower-cased extension of a path, ignoring any query part
pub fn file_extension(path: &str) -> Option<String> {
    let name = path.split('?').next().unwrap_or(path);
    let name = name.rsplit('/').next().unwrap_or(name);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}
