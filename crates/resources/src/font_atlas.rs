//! Glyph atlases for text rendering.
//!
//! A [`FontAtlas`] is a single-channel coverage texture plus a table that
//! maps each character to its rectangle in the texture. Rasterizing glyphs
//! is the caller's job; the atlas only validates, uploads and indexes them.

use std::collections::HashMap;

use tracing::info;

use framesync_rhi::sampler::SamplerDesc;

use crate::error::{ResourceError, ResourceResult};
use crate::texture::{PixelFormat, Texture};
use crate::upload::UploadPipeline;

/// Pixel rectangle inside the atlas bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlyphRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Normalized texture coordinates of a glyph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UvRect {
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
}

/// Caller-supplied placement and metrics of one glyph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlyphMetrics {
    pub rect: GlyphRect,
    /// Horizontal pen advance in pixels.
    pub advance: f32,
}

/// A glyph as stored in the atlas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Glyph {
    pub rect: GlyphRect,
    pub uv: UvRect,
    pub advance: f32,
}

/// Single-channel coverage bitmap, one byte per pixel, rows tightly packed.
#[derive(Clone, Copy, Debug)]
pub struct CoverageBitmap<'a> {
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
}

/// Uploaded glyph atlas.
#[derive(Debug)]
pub struct FontAtlas {
    texture: Texture,
    glyphs: HashMap<char, Glyph>,
}

impl FontAtlas {
    /// Validates the glyph table against `bitmap` and uploads the bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::InvalidData`] when the bitmap is empty, its
    /// pixel count does not match its size, or a glyph rectangle reaches
    /// outside it. Nothing is uploaded in that case.
    pub fn new(
        uploader: &UploadPipeline,
        bitmap: CoverageBitmap<'_>,
        glyphs: impl IntoIterator<Item = (char, GlyphMetrics)>,
    ) -> ResourceResult<Self> {
        if bitmap.width == 0 || bitmap.height == 0 {
            return Err(ResourceError::InvalidData(format!(
                "font atlas bitmap must be non-empty, got {}x{}",
                bitmap.width, bitmap.height
            )));
        }
        let expected = bitmap.width as usize * bitmap.height as usize;
        if bitmap.pixels.len() != expected {
            return Err(ResourceError::InvalidData(format!(
                "{}x{} coverage bitmap needs {} bytes, got {}",
                bitmap.width,
                bitmap.height,
                expected,
                bitmap.pixels.len()
            )));
        }

        let table = glyphs
            .into_iter()
            .map(|(ch, metrics)| {
                let glyph = place(&bitmap, ch, metrics)?;
                Ok((ch, glyph))
            })
            .collect::<ResourceResult<HashMap<_, _>>>()?;

        let texture = Texture::from_pixels(
            uploader,
            bitmap.pixels,
            bitmap.width,
            bitmap.height,
            PixelFormat::R8Unorm,
            &SamplerDesc::linear(),
        )?;

        info!(
            "Font atlas created: {}x{} with {} glyph(s)",
            bitmap.width,
            bitmap.height,
            table.len()
        );

        Ok(Self {
            texture,
            glyphs: table,
        })
    }

    pub fn glyph(&self, ch: char) -> Option<&Glyph> {
        self.glyphs.get(&ch)
    }

    pub fn glyph_count(&self) -> usize {
        self.glyphs.len()
    }

    #[inline]
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    /// Sum of advances over `text`. Characters missing from the atlas
    /// contribute nothing.
    pub fn measure(&self, text: &str) -> f32 {
        text.chars()
            .filter_map(|ch| self.glyphs.get(&ch))
            .map(|glyph| glyph.advance)
            .sum()
    }
}

fn place(bitmap: &CoverageBitmap<'_>, ch: char, metrics: GlyphMetrics) -> ResourceResult<Glyph> {
    let rect = metrics.rect;
    let right = rect.x.checked_add(rect.width);
    let bottom = rect.y.checked_add(rect.height);

    match (right, bottom) {
        (Some(right), Some(bottom)) if right <= bitmap.width && bottom <= bitmap.height => {}
        _ => {
            return Err(ResourceError::InvalidData(format!(
                "glyph {:?} at ({}, {}) size {}x{} lies outside the {}x{} atlas",
                ch, rect.x, rect.y, rect.width, rect.height, bitmap.width, bitmap.height
            )));
        }
    }

    let width = bitmap.width as f32;
    let height = bitmap.height as f32;
    Ok(Glyph {
        rect,
        uv: UvRect {
            u0: rect.x as f32 / width,
            v0: rect.y as f32 / height,
            u1: (rect.x + rect.width) as f32 / width,
            v1: (rect.y + rect.height) as f32 / height,
        },
        advance: metrics.advance,
    })
}
