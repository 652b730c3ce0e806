//! Output geometry for the image engine
//!
//! Turns the requested options and the origin's natural size into a
//! [`ResizePlan`]: the box to produce, how to fit the image into it, and the
//! crop rectangle when explicit crop offsets were given.

use crate::config::SecurityConfig;
use crate::error::{GateError, Result};
use crate::models::{Gravity, ResizeStyle, TransformOptions};
use crate::options::parse_ratio;

/// Device pixel ratios at or above this are ignored
pub const MAX_DEVICE_PIXEL_RATIO: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// How the source is fitted into the target box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Scale to fit inside the box, keeping aspect ratio
    Contain,
    /// Scale to cover the box, then crop the overflow at the anchor
    Cover(Gravity),
    /// Stretch to the box
    Stretch,
    /// Cut the crop region out at its natural size
    Crop(CropRegion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub width: u32,
    pub height: u32,
    pub mode: FitMode,
}

/// Compute the output plan for an origin of `original` size
///
/// # Arguments
/// * `options` - Sanitized transform options
/// * `original` - Natural `(width, height)` of the decoded origin
/// * `security` - Dimension caps
///
/// # Returns
/// * `Ok(ResizePlan)` describing the output geometry
/// * `Err(GateError::BadRequest)` for an invalid ratio or a crop outside the image
pub fn get_dimensions(
    options: &TransformOptions,
    original: (u32, u32),
    security: &SecurityConfig,
) -> Result<ResizePlan> {
    if options.has_crop() {
        return crop_plan(options, original, security);
    }

    let (orig_w, orig_h) = (original.0.max(1) as f64, original.1.max(1) as f64);
    let requested = (options.width, options.height);

    let (mut width, mut height, both_requested) = match (&options.ratio, requested) {
        (Some(ratio), (Some(w), None)) => {
            let (rw, rh) = parse_ratio(ratio)?;
            (w as f64, w as f64 * rh / rw, true)
        }
        (Some(ratio), (None, Some(h))) => {
            let (rw, rh) = parse_ratio(ratio)?;
            (h as f64 * rw / rh, h as f64, true)
        }
        (Some(ratio), (None, None)) => {
            // Largest box of the ratio that fits the origin
            let (rw, rh) = parse_ratio(ratio)?;
            let target = rw / rh;
            if orig_w / orig_h > target {
                (orig_h * target, orig_h, true)
            } else {
                (orig_w, orig_w / target, true)
            }
        }
        (_, (Some(w), Some(h))) => (w as f64, h as f64, true),
        (None, (Some(w), None)) => (w as f64, w as f64 * orig_h / orig_w, false),
        (None, (None, Some(h))) => (h as f64 * orig_w / orig_h, h as f64, false),
        (None, (None, None)) => (orig_w, orig_h, false),
    };

    width = width.min(security.max_width as f64);
    height = height.min(security.max_height as f64);

    if let Some(dpr) = options.device_pixel_ratio {
        if dpr > 0.0 && dpr < MAX_DEVICE_PIXEL_RATIO {
            width *= dpr as f64;
            height *= dpr as f64;
        }
    }

    let mode = if both_requested {
        match options.resize_style {
            Some(ResizeStyle::AspectFit) => FitMode::Contain,
            Some(ResizeStyle::Fill) => FitMode::Stretch,
            Some(ResizeStyle::AspectFill) | None => {
                FitMode::Cover(options.gravity.unwrap_or(Gravity::Center))
            }
        }
    } else {
        FitMode::Contain
    };

    Ok(ResizePlan {
        width: to_pixels(width),
        height: to_pixels(height),
        mode,
    })
}

/// Explicit crop: width/height are the size of the cut, taken at the offsets
fn crop_plan(
    options: &TransformOptions,
    original: (u32, u32),
    security: &SecurityConfig,
) -> Result<ResizePlan> {
    let crop_x = options.crop_x.unwrap_or(0);
    let crop_y = options.crop_y.unwrap_or(0);
    let available_w = original.0.saturating_sub(crop_x);
    let available_h = original.1.saturating_sub(crop_y);

    // Only requested sides are checked against the extent; a missing side
    // takes whatever remains past its offset
    let exceeds = |requested: Option<u32>, offset: u32, available: u32| {
        requested.map_or(false, |size| size as u64 + offset as u64 > available as u64)
    };
    if exceeds(options.width, crop_x, available_w) || exceeds(options.height, crop_y, available_h) {
        return Err(GateError::BadRequest(
            "Crop size is greater than image size".to_string(),
        ));
    }

    let width = options
        .width
        .unwrap_or(available_w)
        .min(security.max_width);
    let height = options
        .height
        .unwrap_or(available_h)
        .min(security.max_height);

    if width == 0 || height == 0 {
        return Err(GateError::BadRequest(
            "Crop size is greater than image size".to_string(),
        ));
    }

    Ok(ResizePlan {
        width,
        height,
        mode: FitMode::Crop(CropRegion {
            x: crop_x,
            y: crop_y,
            width,
            height,
        }),
    })
}

fn to_pixels(value: f64) -> u32 {
    value.round().clamp(1.0, u32::MAX as f64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security() -> SecurityConfig {
        SecurityConfig {
            max_width: 2048,
            max_height: 1024,
        }
    }

    #[test]
    fn test_ratio_from_height() {
        let options = TransformOptions {
            ratio: Some("16-9".into()),
            height: Some(900),
            ..Default::default()
        };
        let plan = get_dimensions(&options, (4000, 3000), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (1600, 900));
    }

    #[test]
    fn test_ratio_without_dimensions_fits_origin() {
        let options = TransformOptions {
            ratio: Some("1-1".into()),
            ..Default::default()
        };
        let plan = get_dimensions(&options, (800, 600), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (600, 600));
        assert_eq!(plan.mode, FitMode::Cover(Gravity::Center));
    }

    #[test]
    fn test_no_options_keeps_natural_size() {
        let plan = get_dimensions(&TransformOptions::default(), (640, 480), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (640, 480));
        assert_eq!(plan.mode, FitMode::Contain);

        let plan = get_dimensions(&TransformOptions::default(), (4000, 3000), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (2048, 1024));
    }

    #[test]
    fn test_width_only_is_proportional() {
        let options = TransformOptions {
            width: Some(512),
            ..Default::default()
        };
        let plan = get_dimensions(&options, (1024, 768), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (512, 384));
    }

    #[test]
    fn test_dpr_applies_after_clamp() {
        let options = TransformOptions {
            width: Some(801),
            height: Some(478),
            device_pixel_ratio: Some(2.0),
            resize_style: Some(ResizeStyle::AspectFit),
            gravity: Some(Gravity::North),
            ..Default::default()
        };
        let plan = get_dimensions(&options, (1024, 768), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (1602, 956));
        assert_eq!(plan.mode, FitMode::Contain);

        let too_dense = TransformOptions {
            device_pixel_ratio: Some(4.0),
            ..options
        };
        let plan = get_dimensions(&too_dense, (1024, 768), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (801, 478));
    }

    #[test]
    fn test_default_style_is_cover() {
        let options = TransformOptions {
            width: Some(100),
            height: Some(100),
            gravity: Some(Gravity::SouthEast),
            ..Default::default()
        };
        let plan = get_dimensions(&options, (1024, 768), &security()).unwrap();
        assert_eq!(plan.mode, FitMode::Cover(Gravity::SouthEast));
    }

    #[test]
    fn test_crop_larger_than_image_is_rejected() {
        let options = TransformOptions {
            width: Some(500),
            height: Some(500),
            crop_x: Some(50),
            crop_y: Some(50),
            ..Default::default()
        };
        let err = get_dimensions(&options, (400, 400), &security()).unwrap_err();
        assert_eq!(
            err,
            GateError::BadRequest("Crop size is greater than image size".to_string())
        );
    }

    #[test]
    fn test_crop_fills_missing_size_from_extent() {
        let options = TransformOptions {
            width: Some(100),
            crop_x: Some(10),
            crop_y: Some(20),
            ..Default::default()
        };
        let plan = get_dimensions(&options, (400, 400), &security()).unwrap();
        assert_eq!(
            plan.mode,
            FitMode::Crop(CropRegion {
                x: 10,
                y: 20,
                width: 100,
                height: 380
            })
        );
    }

    #[test]
    fn test_crop_with_offsets_only_takes_remaining_region() {
        let options = TransformOptions {
            crop_x: Some(100),
            crop_y: Some(50),
            ..Default::default()
        };
        let plan = get_dimensions(&options, (400, 300), &security()).unwrap();
        assert_eq!((plan.width, plan.height), (300, 250));

        let past_edge = TransformOptions {
            crop_x: Some(400),
            crop_y: Some(10),
            ..Default::default()
        };
        assert!(get_dimensions(&past_edge, (400, 300), &security()).is_err());
    }

    #[test]
    fn test_crop_rejects_requested_side_past_extent() {
        let options = TransformOptions {
            height: Some(200),
            crop_x: Some(10),
            crop_y: Some(150),
            ..Default::default()
        };
        assert!(get_dimensions(&options, (400, 400), &security()).is_err());
    }
}
