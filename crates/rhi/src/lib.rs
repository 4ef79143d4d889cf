//! Device seam and Vulkan primitives for frame synchronization.
//!
//! Everything above this crate talks to the GPU through [`GpuDevice`]. Two
//! backends implement it:
//! - [`vulkan::VulkanDevice`] over `ash` and `gpu-allocator`
//! - [`headless::HeadlessDevice`], a deterministic simulated GPU for tests
//!
//! On top of the seam it provides owned wrappers for fences, semaphores,
//! command pools, staging buffers, images and samplers.

mod error;

pub mod buffer;
pub mod command;
pub mod device;
pub mod headless;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod sampler;
pub mod sync;
pub mod vulkan;

pub use device::{DeviceRef, GpuDevice};
pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
