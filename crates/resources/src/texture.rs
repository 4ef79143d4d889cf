//! Sampled textures.
//!
//! A [`Texture`] bundles an image, a view over it and a sampler. Pixels are
//! uploaded through an [`UploadPipeline`] when the texture is created, so a
//! returned texture is always ready for shader reads.

use std::path::Path;

use ash::vk;
use bytemuck::Pod;
use tracing::info;

use framesync_rhi::image::{Image, ImageDesc, ImageView};
use framesync_rhi::sampler::{Sampler, SamplerDesc};

use crate::error::{ResourceError, ResourceResult};
use crate::upload::{UploadPipeline, validate_pixels};

/// Texel layouts a texture can be created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit RGBA, sRGB encoded. Photos and UI art.
    Rgba8Srgb,
    /// 8-bit RGBA, linear. Data textures.
    Rgba8Unorm,
    /// 8-bit single channel. Glyph coverage, masks.
    R8Unorm,
}

impl PixelFormat {
    pub fn vk_format(self) -> vk::Format {
        match self {
            PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            PixelFormat::R8Unorm => vk::Format::R8_UNORM,
        }
    }
}

/// GPU texture ready for sampling.
#[derive(Debug)]
pub struct Texture {
    // Field order is drop order: view before image
    view: ImageView,
    image: Image,
    sampler: Sampler,
    format: PixelFormat,
}

impl Texture {
    /// Creates a texture from any plain-old-data texel type.
    ///
    /// `pixels` is reinterpreted as bytes and must hold exactly
    /// `width * height` texels of `format`. The size is checked before any
    /// GPU object is created.
    pub fn from_pixels<P: Pod>(
        uploader: &UploadPipeline,
        pixels: &[P],
        width: u32,
        height: u32,
        format: PixelFormat,
        sampler: &SamplerDesc,
    ) -> ResourceResult<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(pixels);
        let extent = vk::Extent2D { width, height };
        validate_pixels(bytes, extent, format.vk_format())?;

        let device = uploader.device().clone();
        let image = Image::new(device.clone(), ImageDesc::texture(extent, format.vk_format()))?;

        uploader.upload_image(image.handle(), bytes, extent, format.vk_format())?;

        let view = image.create_view()?;
        let sampler = Sampler::new(device, sampler)?;

        info!("Texture created: {}x{} {:?}", width, height, format);

        Ok(Self {
            view,
            image,
            sampler,
            format,
        })
    }

    /// Creates an sRGB texture from tightly packed RGBA8 bytes.
    pub fn from_rgba8(
        uploader: &UploadPipeline,
        rgba: &[u8],
        width: u32,
        height: u32,
        sampler: &SamplerDesc,
    ) -> ResourceResult<Self> {
        Self::from_pixels(uploader, rgba, width, height, PixelFormat::Rgba8Srgb, sampler)
    }

    /// Creates an sRGB texture from a decoded image of any color type.
    pub fn from_image(
        uploader: &UploadPipeline,
        image: &image::DynamicImage,
        sampler: &SamplerDesc,
    ) -> ResourceResult<Self> {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::from_rgba8(uploader, rgba.as_raw(), width, height, sampler)
    }

    /// Decodes an image file (PNG or JPEG) and uploads it.
    pub fn load<P: AsRef<Path>>(
        uploader: &UploadPipeline,
        path: P,
        sampler: &SamplerDesc,
    ) -> ResourceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ResourceError::FileNotFound(path.to_path_buf()));
        }

        let decoded = image::open(path)?;
        info!("Loading texture from {:?}", path);
        Self::from_image(uploader, &decoded, sampler)
    }

    #[inline]
    pub fn image(&self) -> &Image {
        &self.image
    }

    #[inline]
    pub fn view(&self) -> &ImageView {
        &self.view
    }

    #[inline]
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}
