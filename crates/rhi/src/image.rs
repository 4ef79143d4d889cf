//! GPU image management.
//!
//! - [`ImageDesc`] describes a sampled 2D image that is filled by transfers
//! - [`Image`] owns an image handle and its memory
//! - [`ImageView`] owns a view over an image
//!
//! Images are created in `UNDEFINED` layout. Moving them into a sampleable
//! layout is the upload path's job.

use ash::vk;
use tracing::debug;

use crate::device::DeviceRef;
use crate::error::{RhiError, RhiResult};

/// Bytes per texel of the formats the upload path understands.
///
/// Returns `None` for formats it does not handle.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Creation parameters for a 2D image with one mip level and one layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    /// A texture: copy destination, sampled by shaders.
    pub fn texture(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        }
    }

    /// A render target that can also be copied from.
    pub fn render_target(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        }
    }

    /// Size in bytes of a tightly packed copy of the whole image.
    pub fn byte_size(&self) -> RhiResult<vk::DeviceSize> {
        let texel = texel_size(self.format).ok_or_else(|| {
            RhiError::InvalidArgument(format!("unsupported image format {:?}", self.format))
        })?;
        Ok(self.extent.width as vk::DeviceSize
            * self.extent.height as vk::DeviceSize
            * texel as vk::DeviceSize)
    }

    pub(crate) fn validate(&self) -> RhiResult<()> {
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(RhiError::InvalidArgument(format!(
                "image extent must be non-zero, got {}x{}",
                self.extent.width, self.extent.height
            )));
        }
        self.byte_size().map(|_| ())
    }
}

/// Device-local image with bound memory.
pub struct Image {
    device: DeviceRef,
    image: vk::Image,
    desc: ImageDesc,
}

impl Image {
    /// Creates an image in `UNDEFINED` layout.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero extent, an unsupported format, or when
    /// image or memory creation fails.
    pub fn new(device: DeviceRef, desc: ImageDesc) -> RhiResult<Self> {
        desc.validate()?;
        let image = device.create_image(&desc)?;

        debug!(
            "Created image {:?}: {}x{} {:?}",
            image, desc.extent.width, desc.extent.height, desc.format
        );

        Ok(Self {
            device,
            image,
            desc,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Creates a color view over the whole image.
    pub fn create_view(&self) -> RhiResult<ImageView> {
        ImageView::new(
            self.device.clone(),
            self.image,
            self.desc.format,
            vk::ImageAspectFlags::COLOR,
        )
    }

    #[inline]
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.device.destroy_image(self.image);
        debug!("Destroyed image {:?}", self.image);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("image", &self.image)
            .field("desc", &self.desc)
            .finish()
    }
}

/// Owned image view.
pub struct ImageView {
    device: DeviceRef,
    view: vk::ImageView,
}

impl ImageView {
    pub fn new(
        device: DeviceRef,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<Self> {
        let view = device.create_image_view(image, format, aspect)?;
        Ok(Self { device, view })
    }

    #[inline]
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.device.destroy_image_view(self.view);
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ImageView").field(&self.view).finish()
    }
}
