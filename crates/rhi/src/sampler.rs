//! Texture samplers.

use ash::vk;
use tracing::debug;

use crate::device::DeviceRef;
use crate::error::RhiResult;

/// Sampler parameters. Addressing is clamp-to-edge in every direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
}

impl SamplerDesc {
    /// Bilinear filtering, for photos and UI textures.
    pub fn linear() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }

    /// Point sampling, for pixel art and glyph bitmaps rendered 1:1.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }

    /// Looks up a preset by its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "linear" => Some(Self::linear()),
            "nearest" => Some(Self::nearest()),
            _ => None,
        }
    }

    pub fn to_vk(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .max_lod(0.0)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
    }
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self::linear()
    }
}

/// Owned sampler.
pub struct Sampler {
    device: DeviceRef,
    sampler: vk::Sampler,
}

impl Sampler {
    pub fn new(device: DeviceRef, desc: &SamplerDesc) -> RhiResult<Self> {
        let sampler = device.create_sampler(desc)?;
        debug!("Created sampler {:?} ({:?})", sampler, desc.mag_filter);
        Ok(Self { device, sampler })
    }

    #[inline]
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.sampler);
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Sampler").field(&self.sampler).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_by_name() {
        assert_eq!(SamplerDesc::from_name("linear"), Some(SamplerDesc::linear()));
        assert_eq!(
            SamplerDesc::from_name("nearest").map(|d| d.mag_filter),
            Some(vk::Filter::NEAREST)
        );
        assert!(SamplerDesc::from_name("cubic").is_none());
    }

    #[test]
    fn test_to_vk_clamps() {
        let info = SamplerDesc::nearest().to_vk();
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.min_filter, vk::Filter::NEAREST);
    }
}
