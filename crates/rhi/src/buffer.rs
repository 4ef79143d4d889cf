//! GPU buffer management.
//!
//! Buffers in this subsystem exist to carry pixel payloads from the CPU to
//! device-local images. Memory placement follows [`BufferUsage`]; the device
//! backend performs the actual allocation (gpu-allocator on Vulkan).
//!
//! # Overview
//!
//! - [`BufferUsage`] defines how a buffer will be used and where it lives
//! - [`Buffer`] owns a buffer handle and its memory
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framesync_rhi::buffer::{Buffer, BufferUsage};
//! use framesync_rhi::device::DeviceRef;
//! use framesync_rhi::headless::HeadlessDevice;
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let device: DeviceRef = Arc::new(HeadlessDevice::new());
//! let pixels = [255u8; 16];
//! let staging = Buffer::new_with_data(device, BufferUsage::Staging, &pixels)?;
//! assert_eq!(staging.size(), 16);
//! # Ok(())
//! # }
//! ```

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::device::DeviceRef;
use crate::error::{RhiError, RhiResult};

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which affects
/// Vulkan usage flags and memory allocation strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Host-visible, host-coherent source of transfer operations.
    Staging,
    /// Device-local destination of transfer operations.
    DeviceLocal,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::DeviceLocal => {
                vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER
            }
        }
    }

    /// Returns the preferred memory location for this buffer type.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferUsage::Staging => MemoryLocation::CpuToGpu,
            BufferUsage::DeviceLocal => MemoryLocation::GpuOnly,
        }
    }

    /// Whether the CPU can write the buffer directly.
    pub fn is_host_visible(self) -> bool {
        matches!(self.memory_location(), MemoryLocation::CpuToGpu)
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Staging => "staging",
            BufferUsage::DeviceLocal => "device-local",
        }
    }
}

/// GPU buffer with bound memory.
///
/// The handle and its memory are released together on drop.
pub struct Buffer {
    device: DeviceRef,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    usage: BufferUsage,
}

impl Buffer {
    /// Creates a new buffer with the specified size.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or buffer/memory allocation fails.
    pub fn new(device: DeviceRef, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer = device.create_buffer(size, usage)?;

        debug!("Created {} buffer: {} bytes", usage.name(), size);

        Ok(Self {
            device,
            buffer,
            size,
            usage,
        })
    }

    /// Creates a new buffer and initializes it with data.
    ///
    /// The buffer must use CPU-visible memory.
    pub fn new_with_data(device: DeviceRef, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(device, usage, data.len() as vk::DeviceSize)?;
        buffer.write_data(0, data)?;
        Ok(buffer)
    }

    /// Writes data to the buffer at the specified offset.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The buffer is not host visible
    /// - The write would exceed the buffer size
    pub fn write_data(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        if !self.usage.is_host_visible() {
            return Err(RhiError::InvalidArgument(format!(
                "Cannot write to {} buffer from the host",
                self.usage.name()
            )));
        }

        let end = offset + data.len() as vk::DeviceSize;
        if end > self.size {
            return Err(RhiError::InvalidArgument(format!(
                "Write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }

        self.device.write_buffer(self.buffer, offset, data)
    }

    /// Returns the native buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Returns the buffer usage type.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        debug!("Destroyed {} buffer", self.usage.name());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Staging
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_SRC)
        );
        assert!(
            BufferUsage::DeviceLocal
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_DST)
        );
    }

    #[test]
    fn test_buffer_usage_memory_location() {
        assert_eq!(
            BufferUsage::Staging.memory_location(),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            BufferUsage::DeviceLocal.memory_location(),
            MemoryLocation::GpuOnly
        );
        assert!(BufferUsage::Staging.is_host_visible());
        assert!(!BufferUsage::DeviceLocal.is_host_visible());
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let result = Buffer::new(device, BufferUsage::Staging, 0);
        assert!(matches!(result, Err(RhiError::InvalidArgument(_))));
    }

    #[test]
    fn test_write_out_of_bounds_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let buffer = Buffer::new(device, BufferUsage::Staging, 8).unwrap();
        assert!(buffer.write_data(4, &[0u8; 8]).is_err());
        assert!(buffer.write_data(0, &[0u8; 8]).is_ok());
    }

    #[test]
    fn test_device_local_not_writable() {
        let device = Arc::new(HeadlessDevice::new());
        let buffer = Buffer::new(device, BufferUsage::DeviceLocal, 8).unwrap();
        assert!(buffer.write_data(0, &[1u8; 4]).is_err());
    }

    #[test]
    fn test_drop_releases_buffer() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let _buffer = Buffer::new_with_data(device.clone(), BufferUsage::Staging, &[7u8; 32])
                .unwrap();
            assert_eq!(device.live_buffers(), 1);
        }
        assert_eq!(device.live_buffers(), 0);
    }
}
