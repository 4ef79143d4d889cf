//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// API usage that the driver would leave undefined, caught by the
    /// headless backend
    #[error("Validation error: {0}")]
    Validation(String),

    /// A layout pair the upload path does not record
    #[error("Unsupported layout transition: {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    /// Invalid argument passed by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
}

impl RhiError {
    /// Returns true when the error means the device is gone and every
    /// object created from it must be rebuilt.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST))
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
