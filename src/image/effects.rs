//! Pixel operations applied by the image engine

use super::dimensions::{FitMode, ResizePlan};
use crate::models::{Flip, Gravity};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

/// Quality at or above which output is sharpened
pub const SHARPEN_QUALITY_THRESHOLD: u8 = 70;

/// Map a capitalised kernel name onto a resize filter
///
/// Unknown or absent names use Lanczos.
pub fn filter_type(name: Option<&str>) -> FilterType {
    match name {
        Some("Point") => FilterType::Nearest,
        Some("Triangle") => FilterType::Triangle,
        Some("Cubic") | Some("Catrom") => FilterType::CatmullRom,
        Some("Gaussian") => FilterType::Gaussian,
        _ => FilterType::Lanczos3,
    }
}

/// Crop away border rows and columns matching the top-left pixel
///
/// # Arguments
/// * `img` - Source image
/// * `fuzz` - Colour distance tolerance as a fraction of full scale (0.0 - 1.0)
///
/// # Returns
/// The trimmed image, or the input unchanged when every pixel matches
pub fn trim(img: DynamicImage, fuzz: f32) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return img;
    }

    let background = *rgba.get_pixel(0, 0);
    let tolerance = (fuzz.clamp(0.0, 1.0) * 255.0).round() as i32;
    let differs = |p: &Rgba<u8>| {
        p.0.iter()
            .zip(background.0.iter())
            .any(|(a, b)| (*a as i32 - *b as i32).abs() > tolerance)
    };

    let (mut min_x, mut min_y, mut max_x, mut max_y) = (width, height, 0u32, 0u32);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        if differs(pixel) {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }

    if min_x > max_x || min_y > max_y {
        return img;
    }
    img.crop_imm(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

/// Fit the image into the plan's box
pub fn resize(img: DynamicImage, plan: &ResizePlan, filter: FilterType) -> DynamicImage {
    match plan.mode {
        FitMode::Crop(region) => img.crop_imm(region.x, region.y, region.width, region.height),
        FitMode::Contain => {
            if img.dimensions() == (plan.width, plan.height) {
                img
            } else {
                img.resize(plan.width, plan.height, filter)
            }
        }
        FitMode::Stretch => img.resize_exact(plan.width, plan.height, filter),
        FitMode::Cover(gravity) => cover(img, plan.width, plan.height, gravity, filter),
    }
}

/// Scale to cover `width` x `height`, then cut the overflow at the gravity anchor
fn cover(img: DynamicImage, width: u32, height: u32, gravity: Gravity, filter: FilterType) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    if src_w == 0 || src_h == 0 {
        return img;
    }

    let scale = f64::max(width as f64 / src_w as f64, height as f64 / src_h as f64);
    let scaled_w = ((src_w as f64 * scale).ceil() as u32).max(width);
    let scaled_h = ((src_h as f64 * scale).ceil() as u32).max(height);

    let scaled = if (scaled_w, scaled_h) == (src_w, src_h) {
        img
    } else {
        img.resize_exact(scaled_w, scaled_h, filter)
    };

    let (anchor_x, anchor_y) = gravity.anchor();
    let x = ((scaled_w - width) as f64 * anchor_x).round() as u32;
    let y = ((scaled_h - height) as f64 * anchor_y).round() as u32;
    scaled.crop_imm(x, y, width, height)
}

pub fn flip(img: DynamicImage, flip: Flip) -> DynamicImage {
    match flip {
        Flip::X => img.fliph(),
        Flip::Y => img.flipv(),
        Flip::XY => img.fliph().flipv(),
    }
}

/// Rotate clockwise by `degrees`
///
/// Right angles are lossless. Any other angle rotates into a canvas large
/// enough to hold the result, with the uncovered corners filled white.
pub fn rotate(img: DynamicImage, degrees: f32) -> DynamicImage {
    let normalized = degrees.rem_euclid(360.0);
    match normalized {
        d if d == 0.0 => img,
        d if d == 90.0 => img.rotate90(),
        d if d == 180.0 => img.rotate180(),
        d if d == 270.0 => img.rotate270(),
        d => DynamicImage::ImageRgba8(rotate_free(&img.to_rgba8(), d)),
    }
}

fn rotate_free(src: &RgbaImage, degrees: f32) -> RgbaImage {
    let (src_w, src_h) = (src.width() as f64, src.height() as f64);
    let radians = (degrees as f64).to_radians();
    let (sin, cos) = radians.sin_cos();

    let dst_w = (src_w * cos.abs() + src_h * sin.abs()).ceil().max(1.0) as u32;
    let dst_h = (src_w * sin.abs() + src_h * cos.abs()).ceil().max(1.0) as u32;

    let (src_cx, src_cy) = (src_w / 2.0, src_h / 2.0);
    let (dst_cx, dst_cy) = (dst_w as f64 / 2.0, dst_h as f64 / 2.0);

    RgbaImage::from_fn(dst_w, dst_h, |x, y| {
        // Inverse-map the destination pixel centre back into the source
        let dx = x as f64 + 0.5 - dst_cx;
        let dy = y as f64 + 0.5 - dst_cy;
        let sx = dx * cos + dy * sin + src_cx;
        let sy = -dx * sin + dy * cos + src_cy;

        if sx >= 0.0 && sy >= 0.0 && sx < src_w && sy < src_h {
            *src.get_pixel(sx as u32, sy as u32)
        } else {
            Rgba([255, 255, 255, 255])
        }
    })
}

/// Apply the post-resize sharpening pass
pub fn sharpen(img: DynamicImage) -> DynamicImage {
    img.unsharpen(0.8, 2)
}

/// Whether the sharpening pass should run
pub fn wants_sharpen(quality: u8, cropped: bool) -> bool {
    quality >= SHARPEN_QUALITY_THRESHOLD || cropped
}
