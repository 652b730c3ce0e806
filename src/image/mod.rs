//! Image transform engine
//!
//! [`ImageEngine::convert`] decodes an origin image, applies the requested
//! geometry and effects, and re-encodes it. Geometry is computed in
//! [`dimensions`], pixel operations live in [`effects`] and the JSON
//! metadata mode uses [`palette`] for dominant colours.

pub mod dimensions;
pub mod effects;
mod engine;
pub mod palette;

pub use dimensions::{get_dimensions, CropRegion, FitMode, ResizePlan};
pub use engine::{png_compression, ImageEngine, ImageOutput, DEFAULT_QUALITY};
pub use palette::{extract_palette, Palette};
