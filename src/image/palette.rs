//! Dominant colour extraction
//!
//! Pixels of a downscaled copy are bucketed on a 5-bit-per-channel grid; the
//! most populated buckets, averaged, form the palette.

use image::DynamicImage;
use std::collections::HashMap;

/// Side of the thumbnail sampled for the palette
const SAMPLE_SIZE: u32 = 64;

/// Pixels more transparent than this are ignored
const MIN_ALPHA: u8 = 128;

/// Number of palette entries reported
pub const PALETTE_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    /// Most populated colour as `#rrggbb`
    pub primary: Option<String>,
    /// Up to [`PALETTE_SIZE`] colours, most populated first
    pub colors: Vec<String>,
}

#[derive(Default)]
struct Bucket {
    count: u64,
    r: u64,
    g: u64,
    b: u64,
}

pub fn extract_palette(img: &DynamicImage) -> Palette {
    let sample = if img.width() > SAMPLE_SIZE || img.height() > SAMPLE_SIZE {
        img.thumbnail(SAMPLE_SIZE, SAMPLE_SIZE).to_rgba8()
    } else {
        img.to_rgba8()
    };

    let mut buckets: HashMap<u16, Bucket> = HashMap::new();
    for pixel in sample.pixels() {
        let [r, g, b, a] = pixel.0;
        if a < MIN_ALPHA {
            continue;
        }
        let index = ((r as u16 >> 3) << 10) | ((g as u16 >> 3) << 5) | (b as u16 >> 3);
        let bucket = buckets.entry(index).or_default();
        bucket.count += 1;
        bucket.r += r as u64;
        bucket.g += g as u64;
        bucket.b += b as u64;
    }

    let mut ranked: Vec<(u16, Bucket)> = buckets.into_iter().collect();
    // Ties broken by bucket index so output is deterministic
    ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(&b.0)));

    let colors: Vec<String> = ranked
        .iter()
        .take(PALETTE_SIZE)
        .map(|(_, bucket)| {
            hex_color(
                (bucket.r / bucket.count) as u8,
                (bucket.g / bucket.count) as u8,
                (bucket.b / bucket.count) as u8,
            )
        })
        .collect();

    Palette {
        primary: colors.first().cloned(),
        colors,
    }
}

pub fn hex_color(r: u8, g: u8, b: u8) -> String {
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}
