//! The device seam.
//!
//! Every native call made by the frame-sync subsystem goes through
//! [`GpuDevice`]. Two implementations exist:
//!
//! - [`VulkanDevice`](crate::vulkan::VulkanDevice) talks to a real driver through `ash`
//! - [`HeadlessDevice`](crate::headless::HeadlessDevice) simulates a GPU for tests and CI
//!
//! Handles are plain `ash::vk` handle types in both cases, so code above this
//! layer never knows which backend it runs on.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framesync_rhi::device::{DeviceRef, GpuDevice};
//! use framesync_rhi::headless::HeadlessDevice;
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let device: DeviceRef = Arc::new(HeadlessDevice::new());
//! let fence = device.create_fence(true)?;
//! assert!(device.wait_for_fences(&[fence], true, 0)?);
//! device.destroy_fence(fence);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;

use crate::buffer::BufferUsage;
use crate::command::ImageBarrier;
use crate::error::RhiResult;
use crate::image::ImageDesc;
use crate::physical_device::QueueFamilyIndices;
use crate::sampler::SamplerDesc;

/// Shared handle to a device, used by every wrapper type.
pub type DeviceRef = Arc<dyn GpuDevice>;

/// A semaphore wait performed at the start of a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    /// Semaphore that must be signaled before the batch proceeds.
    pub semaphore: vk::Semaphore,
    /// Pipeline stages that block on the semaphore.
    pub stage: vk::PipelineStageFlags,
}

/// One queue submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitDesc<'a> {
    pub wait_semaphores: &'a [SemaphoreWait],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Native operations required by the frame-sync subsystem.
///
/// Preconditions documented on each method mirror the Vulkan valid-usage
/// rules. The Vulkan backend does not check them; the headless backend
/// reports violations as [`RhiError::Validation`](crate::RhiError::Validation).
pub trait GpuDevice: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Queues
    // =========================================================================

    /// Queue family indices. Transfer and compute fall back to the graphics
    /// family when the device has no dedicated family for them.
    fn queue_families(&self) -> QueueFamilyIndices;

    /// The graphics queue, which also accepts transfer and compute work.
    fn graphics_queue(&self) -> vk::Queue;

    /// Dedicated transfer queue, if the device exposes one.
    fn transfer_queue(&self) -> Option<vk::Queue>;

    /// Dedicated compute queue, if the device exposes one.
    fn compute_queue(&self) -> Option<vk::Queue>;

    /// Submits one batch. `fence` may be null.
    ///
    /// Command buffers must be in the executable state and not pending; the
    /// fence must be unsignaled.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> RhiResult<()>;

    /// Blocks until every queue is idle.
    fn wait_idle(&self) -> RhiResult<()>;

    /// Blocks until `queue` is idle.
    fn queue_wait_idle(&self, queue: vk::Queue) -> RhiResult<()>;

    // =========================================================================
    // Fences and semaphores
    // =========================================================================

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;

    /// The fence must not guard pending work.
    fn destroy_fence(&self, fence: vk::Fence);

    /// Waits for all (or any) of `fences`.
    ///
    /// Returns `Ok(false)` when `timeout_ns` elapses first. `u64::MAX` waits
    /// forever.
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64)
    -> RhiResult<bool>;

    /// The fences must not guard pending work.
    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;

    /// Non-blocking status query.
    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;

    /// The semaphore must not be referenced by pending work.
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // =========================================================================
    // Command pools and buffers
    // =========================================================================

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool>;

    /// Destroys the pool and implicitly frees its command buffers. None of
    /// them may be pending.
    fn destroy_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>>;

    /// None of `buffers` may be pending.
    fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    ) -> RhiResult<()>;

    /// No buffer of the pool may be pending.
    fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> RhiResult<()>;

    fn trim_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()>;

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()>;

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier);

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    // =========================================================================
    // Memory-backed resources
    // =========================================================================

    /// Creates a buffer with bound memory chosen by `usage`.
    fn create_buffer(&self, size: vk::DeviceSize, usage: BufferUsage) -> RhiResult<vk::Buffer>;

    /// Copies `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8])
    -> RhiResult<()>;

    /// Destroys the buffer and frees its memory.
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Creates a device-local 2D image with bound memory, in `UNDEFINED` layout.
    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image>;

    /// Destroys the image and frees its memory.
    fn destroy_image(&self, image: vk::Image);

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<vk::Sampler>;

    fn destroy_sampler(&self, sampler: vk::Sampler);
}
