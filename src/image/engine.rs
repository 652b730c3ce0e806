use super::dimensions::{get_dimensions, FitMode};
use super::effects::{self, filter_type, wants_sharpen};
use super::palette::extract_palette;
use crate::config::SecurityConfig;
use crate::error::{GateError, Result};
use crate::models::{collect_stream, ByteStream, OriginMetadata, TransformOptions};
use crate::options::effective_format;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Quality used when the request does not name one
pub const DEFAULT_QUALITY: u8 = 75;

/// Result of one image conversion
#[derive(Debug, Clone)]
pub struct ImageOutput {
    pub data: Bytes,
    pub content_type: String,
    /// Format the pixels were encoded to
    pub format: String,
    pub width: u32,
    pub height: u32,
}

/// Decodes, transforms and re-encodes images
///
/// Codec work runs on the blocking pool; at most `workers` conversions run
/// at once, further callers wait for a permit.
pub struct ImageEngine {
    permits: Arc<Semaphore>,
    security: SecurityConfig,
}

impl ImageEngine {
    /// # Arguments
    /// * `workers` - Maximum number of concurrent conversions
    /// * `security` - Output dimension caps
    pub fn new(workers: usize, security: SecurityConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            security,
        }
    }

    /// Transform an origin image
    ///
    /// # Arguments
    /// * `source` - Origin bytes
    /// * `metadata` - Origin description; its extension picks the default format
    /// * `options` - Sanitized, clamped transform options
    /// * `cache_reference` - Fingerprint reported in JSON metadata mode
    ///
    /// # Returns
    /// * `Ok(ImageOutput)` with encoded image bytes, or a JSON document when
    ///   `format=json` was requested
    /// * `Err(GateError::BadRequest)` for impossible geometry
    /// * `Err(GateError::ImageProcessing)` when decoding or encoding fails
    pub async fn convert(
        &self,
        source: ByteStream,
        metadata: &OriginMetadata,
        options: &TransformOptions,
        cache_reference: &str,
    ) -> Result<ImageOutput> {
        let input = collect_stream(source).await?;

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| GateError::InternalError(format!("Image worker pool closed: {}", e)))?;

        let job = ConvertJob {
            input,
            file_name: metadata.file_name().to_string(),
            extension: metadata.extension(),
            options: options.clone(),
            security: self.security.clone(),
            cache_reference: cache_reference.to_string(),
        };

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job.run()
        })
        .await
        .map_err(|e| GateError::InternalError(format!("Image worker failed: {}", e)))?
    }
}

struct ConvertJob {
    input: Bytes,
    file_name: String,
    extension: Option<String>,
    options: TransformOptions,
    security: SecurityConfig,
    cache_reference: String,
}

impl ConvertJob {
    fn run(self) -> Result<ImageOutput> {
        let started = Instant::now();
        let options = &self.options;

        let mut img = image::load_from_memory(&self.input).map_err(|e| {
            warn!("Failed to decode {}: {}", self.file_name, e);
            GateError::ImageProcessing {
                status: 400,
                message: format!("Unable to decode {}: {}", self.file_name, e),
            }
        })?;
        let (original_width, original_height) = img.dimensions();

        if options.trim.unwrap_or(false) {
            img = effects::trim(img, options.trim_fuzz.unwrap_or(0.0));
        }

        let plan = get_dimensions(options, img.dimensions(), &self.security)?;
        let cropped = matches!(plan.mode, FitMode::Crop(_));
        img = effects::resize(img, &plan, filter_type(options.filter.as_deref()));

        if let Some(sigma) = options.blur {
            img = img.blur(sigma);
        }
        if let Some(flip) = options.flip {
            img = effects::flip(img, flip);
        }
        if let Some(degrees) = options.rotate {
            img = effects::rotate(img, degrees);
        }

        let quality = options.quality.unwrap_or(DEFAULT_QUALITY).min(100);
        if wants_sharpen(quality, cropped) {
            img = effects::sharpen(img);
        }

        let format = effective_format(options, self.extension.as_deref());
        let (data, content_type) = encode(&img, &format, quality)?;
        let (width, height) = img.dimensions();

        debug!(
            "Converted {} {}x{} -> {}x{} {} ({} bytes) in {:?}",
            self.file_name,
            original_width,
            original_height,
            width,
            height,
            format,
            data.len(),
            started.elapsed()
        );

        if !options.wants_json() {
            return Ok(ImageOutput {
                data,
                content_type: content_type.to_string(),
                format,
                width,
                height,
            });
        }

        let palette = extract_palette(&img);
        let mut document = json!({
            "fileName": self.file_name,
            "cacheReference": self.cache_reference,
            "format": format,
            "fileSize": data.len(),
            "originalWidth": original_width,
            "originalHeight": original_height,
            "width": width,
            "height": height,
            "primaryColor": palette.primary,
            "palette": palette.colors,
        });
        if let (Value::Object(fields), Ok(Value::Object(requested))) =
            (&mut document, serde_json::to_value(options))
        {
            for (name, value) in requested {
                fields.entry(name).or_insert(value);
            }
        }

        let body = serde_json::to_vec(&document)?;
        Ok(ImageOutput {
            data: Bytes::from(body),
            content_type: "application/json".to_string(),
            format: "json".to_string(),
            width,
            height,
        })
    }
}

/// PNG compression for a quality value
///
/// Higher quality asks for less compression effort.
pub fn png_compression(quality: u8) -> CompressionType {
    match quality {
        q if q >= 70 => CompressionType::Fast,
        q if q >= 50 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn encode(img: &DynamicImage, format: &str, quality: u8) -> Result<(Bytes, &'static str)> {
    let encode_err = |e: image::ImageError| {
        GateError::image_processing(format!("Failed to encode {}: {}", format, e))
    };

    let mut out = Vec::new();
    let content_type = match format.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality.max(1))
                .encode_image(&rgb)
                .map_err(encode_err)?;
            "image/jpeg"
        }
        "png" => {
            let encoder = PngEncoder::new_with_quality(&mut out, png_compression(quality), PngFilter::Adaptive);
            img.write_with_encoder(encoder).map_err(encode_err)?;
            "image/png"
        }
        "gif" => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Gif)
                .map_err(encode_err)?;
            "image/gif"
        }
        "webp" => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut out), ImageFormat::WebP)
                .map_err(encode_err)?;
            "image/webp"
        }
        "bmp" => {
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Bmp)
                .map_err(encode_err)?;
            "image/bmp"
        }
        "tif" | "tiff" => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Tiff)
                .map_err(encode_err)?;
            "image/tiff"
        }
        other => {
            return Err(GateError::BadRequest(format!(
                "Unsupported output format: {}",
                other
            )))
        }
    };

    if out.is_empty() {
        return Err(GateError::image_processing(format!(
            "Encoder produced no data for {}",
            format
        )));
    }
    Ok((Bytes::from(out), content_type))
}
