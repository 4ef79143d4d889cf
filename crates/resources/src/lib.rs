//! GPU resources filled by synchronous uploads.
//!
//! - [`UploadPipeline`]: staging copy plus layout transitions on a one-shot
//!   command buffer
//! - [`Texture`]: image, view and sampler, created from pixels or files
//! - [`FontAtlas`]: single-channel glyph texture with a glyph table

mod error;

pub mod font_atlas;
pub mod texture;
pub mod upload;

pub use error::{ResourceError, ResourceResult};
pub use font_atlas::{CoverageBitmap, FontAtlas, Glyph, GlyphMetrics, GlyphRect, UvRect};
pub use texture::{PixelFormat, Texture};
pub use upload::{UploadPipeline, UploadReport, UploadStatistics};
