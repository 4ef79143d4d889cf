//! Command pool and command buffer management.
//!
//! # Overview
//!
//! - [`CommandPool`] owns a native pool scoped to one queue family, tracks
//!   every command buffer it has handed out and keeps allocation statistics
//! - [`CommandBuffer`] is a non-owning recording view over a checked-out handle
//! - [`ImageBarrier`] and [`LayoutTransition`] describe image layout changes
//!
//! # Command buffer lifecycle
//!
//! ```text
//! allocate -> Initial -> begin -> Recording -> end -> Executable
//!          -> submit -> Pending -> (GPU done) -> free | pool reset -> Initial
//! ```
//!
//! The pool only tracks which handles are checked out. Whether a handle is
//! still pending on the GPU is the caller's business: freeing or resetting
//! a pending buffer is a precondition violation.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framesync_rhi::command::{CommandBuffer, CommandPool};
//! use framesync_rhi::device::DeviceRef;
//! use framesync_rhi::headless::HeadlessDevice;
//! use framesync_rhi::vk;
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let device: DeviceRef = Arc::new(HeadlessDevice::new());
//! let family = device.queue_families().graphics_family;
//! let pool = CommandPool::new(device.clone(), family, true, false)?;
//!
//! let handles = pool.allocate(2, vk::CommandBufferLevel::PRIMARY)?;
//! let cmd = CommandBuffer::from_handle(device.clone(), handles[0]);
//! cmd.begin()?;
//! cmd.end()?;
//!
//! pool.free(&handles)?;
//! assert_eq!(pool.statistics().total_allocated, 0);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::time::Instant;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::DeviceRef;
use crate::error::{RhiError, RhiResult};

/// Estimated driver memory behind one primary command buffer.
pub const PRIMARY_BUFFER_ESTIMATE_BYTES: u64 = 64 * 1024;
/// Estimated driver memory behind one secondary command buffer.
pub const SECONDARY_BUFFER_ESTIMATE_BYTES: u64 = 16 * 1024;

/// Snapshot of a pool's allocation counters.
#[derive(Clone, Debug)]
pub struct PoolStatistics {
    /// Buffers currently checked out.
    pub total_allocated: usize,
    pub primary_count: usize,
    pub secondary_count: usize,
    /// Number of `allocate` calls with a non-zero count.
    pub allocation_requests: u64,
    /// Number of `free` calls with a non-empty slice.
    pub free_requests: u64,
    pub reset_count: u64,
    pub trim_count: u64,
    pub estimated_memory_bytes: u64,
    pub queue_family: u32,
    pub allows_individual_reset: bool,
    pub is_transient: bool,
    pub created_at: Instant,
    pub last_reset_at: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    allocated: HashMap<vk::CommandBuffer, vk::CommandBufferLevel>,
    allocation_requests: u64,
    free_requests: u64,
    reset_count: u64,
    trim_count: u64,
    last_reset_at: Option<Instant>,
    released: bool,
}

impl PoolState {
    fn count_level(&self, level: vk::CommandBufferLevel) -> usize {
        self.allocated.values().filter(|&&l| l == level).count()
    }
}

/// Command pool wrapper with allocation tracking.
///
/// A command pool allocates command buffers for one queue family. Buffers
/// may only be submitted to queues of that family.
///
/// # Thread Safety
///
/// Bookkeeping is guarded internally, so a pool can be shared through an
/// `Arc`. Recording into two buffers of the same pool from different threads
/// at once is still not allowed; use one pool per recording thread.
pub struct CommandPool {
    device: DeviceRef,
    pool: vk::CommandPool,
    queue_family_index: u32,
    allows_individual_reset: bool,
    is_transient: bool,
    created_at: Instant,
    state: Mutex<PoolState>,
}

impl CommandPool {
    /// Creates a new command pool for the specified queue family.
    ///
    /// # Arguments
    ///
    /// * `device` - The device
    /// * `queue_family_index` - The queue family for command buffer submission
    /// * `allow_individual_reset` - Sets `RESET_COMMAND_BUFFER`, letting
    ///   buffers be re-recorded without resetting the whole pool
    /// * `transient` - Sets `TRANSIENT`, a hint that buffers are short-lived
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(
        device: DeviceRef,
        queue_family_index: u32,
        allow_individual_reset: bool,
        transient: bool,
    ) -> RhiResult<Self> {
        let mut flags = vk::CommandPoolCreateFlags::empty();
        if allow_individual_reset {
            flags |= vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        }
        if transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }

        let pool = device.create_command_pool(queue_family_index, flags)?;

        info!(
            "Command pool {:?} created for queue family {} (individual reset: {}, transient: {})",
            pool, queue_family_index, allow_individual_reset, transient
        );

        Ok(Self {
            device,
            pool,
            queue_family_index,
            allows_individual_reset: allow_individual_reset,
            is_transient: transient,
            created_at: Instant::now(),
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Creates a transient pool for one-shot command buffers.
    pub fn new_transient(device: DeviceRef, queue_family_index: u32) -> RhiResult<Self> {
        Self::new(device, queue_family_index, false, true)
    }

    /// Returns the native command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Returns the queue family index this pool belongs to.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn allows_individual_reset(&self) -> bool {
        self.allows_individual_reset
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    /// Returns the device this pool was created on.
    #[inline]
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Allocates `count` command buffers of the given level.
    ///
    /// A count of zero returns an empty vector without touching the device
    /// or the counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool was released or the native allocation
    /// fails. Failures are not retried.
    pub fn allocate(
        &self,
        count: u32,
        level: vk::CommandBufferLevel,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock();
        if state.released {
            return Err(RhiError::InvalidHandle(format!(
                "command pool {:?} has been released",
                self.pool
            )));
        }

        let buffers = self
            .device
            .allocate_command_buffers(self.pool, level, count)?;

        for &buffer in &buffers {
            state.allocated.insert(buffer, level);
        }
        state.allocation_requests += 1;

        debug!(
            "Allocated {} {:?} command buffer(s) from pool {:?}",
            count, level, self.pool
        );

        Ok(buffers)
    }

    /// Allocates a primary command buffer from this pool.
    pub fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        self.allocate_one(vk::CommandBufferLevel::PRIMARY)
    }

    /// Allocates a secondary command buffer from this pool.
    ///
    /// Secondary command buffers are executed from primary command buffers.
    pub fn allocate_secondary_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        self.allocate_one(vk::CommandBufferLevel::SECONDARY)
    }

    fn allocate_one(&self, level: vk::CommandBufferLevel) -> RhiResult<vk::CommandBuffer> {
        self.allocate(1, level)?
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("driver returned no command buffer".into()))
    }

    /// Returns command buffers to the pool.
    ///
    /// None of `buffers` may be pending on the GPU. Handles this pool did not
    /// hand out are skipped with a warning.
    pub fn free(&self, buffers: &[vk::CommandBuffer]) -> RhiResult<()> {
        if buffers.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.released {
            return Err(RhiError::InvalidHandle(format!(
                "command pool {:?} has been released",
                self.pool
            )));
        }

        let owned: Vec<vk::CommandBuffer> = buffers
            .iter()
            .copied()
            .filter(|buffer| {
                let tracked = state.allocated.contains_key(buffer);
                if !tracked {
                    warn!(
                        "Command buffer {:?} does not belong to pool {:?}, skipping",
                        buffer, self.pool
                    );
                }
                tracked
            })
            .collect();

        if owned.is_empty() {
            return Ok(());
        }

        self.device.free_command_buffers(self.pool, &owned)?;

        for buffer in &owned {
            state.allocated.remove(buffer);
        }
        state.free_requests += 1;

        debug!(
            "Freed {} command buffer(s) back to pool {:?}",
            owned.len(),
            self.pool
        );

        Ok(())
    }

    /// Resets every buffer of the pool to the initial state.
    ///
    /// Buffers stay checked out. Nothing allocated from the pool may be
    /// executing.
    ///
    /// # Arguments
    ///
    /// * `release_resources` - If true, also returns pool memory to the system
    pub fn reset(&self, release_resources: bool) -> RhiResult<()> {
        let flags = if release_resources {
            vk::CommandPoolResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandPoolResetFlags::empty()
        };

        let mut state = self.state.lock();
        self.device.reset_command_pool(self.pool, flags)?;

        state.reset_count += 1;
        state.last_reset_at = Some(Instant::now());

        debug!(
            "Reset command pool {:?} (release resources: {})",
            self.pool, release_resources
        );

        Ok(())
    }

    /// Returns unused pool memory to the system. Has no effect on
    /// correctness.
    pub fn trim(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        self.device.trim_command_pool(self.pool)?;
        state.trim_count += 1;
        Ok(())
    }

    /// Whether `buffer` is currently checked out from this pool.
    pub fn contains(&self, buffer: vk::CommandBuffer) -> bool {
        self.state.lock().allocated.contains_key(&buffer)
    }

    /// Number of buffers currently checked out.
    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    /// Returns a snapshot of the pool's counters.
    pub fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock();
        let primary_count = state.count_level(vk::CommandBufferLevel::PRIMARY);
        let secondary_count = state.count_level(vk::CommandBufferLevel::SECONDARY);

        PoolStatistics {
            total_allocated: state.allocated.len(),
            primary_count,
            secondary_count,
            allocation_requests: state.allocation_requests,
            free_requests: state.free_requests,
            reset_count: state.reset_count,
            trim_count: state.trim_count,
            estimated_memory_bytes: primary_count as u64 * PRIMARY_BUFFER_ESTIMATE_BYTES
                + secondary_count as u64 * SECONDARY_BUFFER_ESTIMATE_BYTES,
            queue_family: self.queue_family_index,
            allows_individual_reset: self.allows_individual_reset,
            is_transient: self.is_transient,
            created_at: self.created_at,
            last_reset_at: state.last_reset_at,
        }
    }

    /// Frees outstanding buffers and destroys the native pool.
    ///
    /// Safe to call more than once; only the first successful call does any
    /// work. A failed destroy leaves the pool in place so a later call (or
    /// `Drop`) can retry.
    pub fn release(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        if state.released {
            return Ok(());
        }

        let outstanding: Vec<vk::CommandBuffer> = state.allocated.keys().copied().collect();
        if !outstanding.is_empty() {
            match self.device.free_command_buffers(self.pool, &outstanding) {
                Ok(()) => state.allocated.clear(),
                Err(e) => warn!(
                    "Failed to free {} outstanding buffer(s) of pool {:?}: {}",
                    outstanding.len(),
                    self.pool,
                    e
                ),
            }
        }

        self.device.destroy_command_pool(self.pool)?;
        state.allocated.clear();
        state.released = true;

        info!(
            "Command pool {:?} destroyed for queue family {}",
            self.pool, self.queue_family_index
        );

        Ok(())
    }

    /// Whether [`release`](Self::release) has completed.
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("Failed to destroy command pool {:?}: {}", self.pool, e);
        }
    }
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.pool)
            .field("queue_family_index", &self.queue_family_index)
            .field("allows_individual_reset", &self.allows_individual_reset)
            .field("is_transient", &self.is_transient)
            .finish()
    }
}

/// One image memory barrier.
///
/// Built with the `with_*` methods; masks default to empty and the aspect to
/// color.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageBarrier {
    pub fn new(image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::empty(),
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn with_stages(mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) -> Self {
        self.src_stage = src;
        self.dst_stage = dst;
        self
    }

    pub fn with_access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    pub fn with_aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    /// Builds the Vulkan barrier covering the base mip level and layer.
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }
}

/// The two layout transitions an upload performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayoutTransition {
    /// Discard contents and prepare the image as a copy destination.
    UndefinedToTransferDst,
    /// Make copied data visible to fragment shader reads.
    TransferDstToShaderRead,
}

impl LayoutTransition {
    /// Maps a layout pair onto a supported transition.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::UnsupportedLayoutTransition`] for any other pair.
    pub fn from_layouts(old: vk::ImageLayout, new: vk::ImageLayout) -> RhiResult<Self> {
        match (old, new) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
                Ok(Self::UndefinedToTransferDst)
            }
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
                Ok(Self::TransferDstToShaderRead)
            }
            (from, to) => Err(RhiError::UnsupportedLayoutTransition { from, to }),
        }
    }

    pub fn old_layout(self) -> vk::ImageLayout {
        match self {
            Self::UndefinedToTransferDst => vk::ImageLayout::UNDEFINED,
            Self::TransferDstToShaderRead => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }
    }

    pub fn new_layout(self) -> vk::ImageLayout {
        match self {
            Self::UndefinedToTransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::TransferDstToShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// The barrier for this transition with its fixed stage and access masks.
    pub fn barrier(self, image: vk::Image) -> ImageBarrier {
        let barrier = ImageBarrier::new(image, self.old_layout(), self.new_layout());
        match self {
            Self::UndefinedToTransferDst => barrier
                .with_stages(
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                )
                .with_access(vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE),
            Self::TransferDstToShaderRead => barrier
                .with_stages(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                )
                .with_access(vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::SHADER_READ),
        }
    }
}

/// Recording view over a command buffer handle.
///
/// # Note
///
/// The view does NOT own the handle. The handle is returned through
/// [`CommandPool::free`] or freed when the owning pool is released.
#[derive(Clone)]
pub struct CommandBuffer {
    device: DeviceRef,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    /// Allocates a primary command buffer from `pool` and wraps it.
    pub fn new(pool: &CommandPool) -> RhiResult<Self> {
        let buffer = pool.allocate_command_buffer()?;
        Ok(Self {
            device: pool.device().clone(),
            buffer,
        })
    }

    /// Wraps an existing command buffer handle.
    #[inline]
    pub fn from_handle(device: DeviceRef, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    /// Returns the raw command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins recording for a single submission.
    pub fn begin(&self) -> RhiResult<()> {
        self.device
            .begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    /// Begins recording commands that can be resubmitted.
    pub fn begin_reusable(&self) -> RhiResult<()> {
        self.device
            .begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::empty())
    }

    /// Ends recording. The buffer is then ready for submission.
    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Inserts an image memory barrier.
    pub fn pipeline_barrier(&self, barrier: &ImageBarrier) {
        self.device.cmd_image_barrier(self.buffer, barrier);
    }

    /// Records one of the supported layout transitions for `image`.
    pub fn transition_image_layout(&self, image: vk::Image, transition: LayoutTransition) {
        self.pipeline_barrier(&transition.barrier(image));
    }

    // =========================================================================
    // Transfer Commands
    // =========================================================================

    /// Copies data from a buffer to an image.
    ///
    /// # Arguments
    ///
    /// * `src` - Source buffer
    /// * `dst` - Destination image
    /// * `dst_layout` - Current layout of the destination image
    /// * `regions` - Copy regions
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.device
            .cmd_copy_buffer_to_image(self.buffer, src, dst, dst_layout, regions);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CommandBuffer").field(&self.buffer).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::headless::{Fault, HeadlessDevice};

    fn pool(device: &Arc<HeadlessDevice>) -> CommandPool {
        CommandPool::new(device.clone(), 0, false, false).unwrap()
    }

    #[test]
    fn test_command_pool_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CommandPool>();
        assert_send_sync::<CommandBuffer>();
    }

    #[test]
    fn test_zero_count_allocate_is_noop() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device);

        let buffers = pool.allocate(0, vk::CommandBufferLevel::PRIMARY).unwrap();
        assert!(buffers.is_empty());

        let stats = pool.statistics();
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.allocation_requests, 0);
        assert_eq!(device.live_command_buffers(), 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_allocate_free_symmetry() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device);

        let buffers = pool.allocate(3, vk::CommandBufferLevel::PRIMARY).unwrap();
        assert_eq!(pool.statistics().total_allocated, 3);
        assert_eq!(pool.statistics().primary_count, 3);

        pool.free(&buffers).unwrap();
        let stats = pool.statistics();
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.primary_count, 0);
        assert_eq!(stats.allocation_requests, 1);
        assert_eq!(stats.free_requests, 1);
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn test_statistics_split_by_level() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device);

        pool.allocate(2, vk::CommandBufferLevel::PRIMARY).unwrap();
        pool.allocate_secondary_command_buffer().unwrap();

        let stats = pool.statistics();
        assert_eq!(stats.total_allocated, 3);
        assert_eq!(stats.primary_count, 2);
        assert_eq!(stats.secondary_count, 1);
        assert_eq!(
            stats.estimated_memory_bytes,
            2 * PRIMARY_BUFFER_ESTIMATE_BYTES + SECONDARY_BUFFER_ESTIMATE_BYTES
        );
    }

    #[test]
    fn test_free_skips_foreign_handles() {
        let device = Arc::new(HeadlessDevice::new());
        let a = pool(&device);
        let b = pool(&device);

        let foreign = b.allocate_command_buffer().unwrap();
        let own = a.allocate_command_buffer().unwrap();

        a.free(&[foreign, own]).unwrap();
        assert!(!a.contains(own));
        assert!(b.contains(foreign));
        assert_eq!(b.allocated_count(), 1);
    }

    #[test]
    fn test_empty_free_is_noop() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device);
        pool.free(&[]).unwrap();
        assert_eq!(pool.statistics().free_requests, 0);
    }

    #[test]
    fn test_reset_and_trim_counters() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device);
        pool.allocate(2, vk::CommandBufferLevel::PRIMARY).unwrap();

        assert!(pool.statistics().last_reset_at.is_none());
        pool.reset(true).unwrap();
        pool.trim().unwrap();

        let stats = pool.statistics();
        assert_eq!(stats.reset_count, 1);
        assert_eq!(stats.trim_count, 1);
        assert!(stats.last_reset_at.is_some());
        // Reset keeps buffers checked out
        assert_eq!(stats.total_allocated, 2);
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device);
        device.inject_fault(Fault::CommandBufferAllocation);

        let result = pool.allocate(2, vk::CommandBufferLevel::PRIMARY);
        assert!(matches!(result, Err(RhiError::VulkanError(_))));
        assert_eq!(pool.statistics().total_allocated, 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device);
        pool.allocate(4, vk::CommandBufferLevel::PRIMARY).unwrap();

        pool.release().unwrap();
        pool.release().unwrap();
        assert!(pool.is_released());
        assert_eq!(device.live_command_pools(), 0);
        assert_eq!(device.live_command_buffers(), 0);

        assert!(pool.allocate(1, vk::CommandBufferLevel::PRIMARY).is_err());
        drop(pool);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_drop_destroys_pool() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let pool = pool(&device);
            pool.allocate(2, vk::CommandBufferLevel::PRIMARY).unwrap();
            assert_eq!(device.live_command_pools(), 1);
        }
        assert_eq!(device.live_command_pools(), 0);
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn test_layout_transition_from_layouts() {
        assert_eq!(
            LayoutTransition::from_layouts(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            )
            .unwrap(),
            LayoutTransition::UndefinedToTransferDst
        );
        assert_eq!(
            LayoutTransition::from_layouts(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            )
            .unwrap(),
            LayoutTransition::TransferDstToShaderRead
        );

        let err = LayoutTransition::from_layouts(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(err, RhiError::UnsupportedLayoutTransition { .. }));
    }

    #[test]
    fn test_layout_transition_masks() {
        let image = vk::Image::null();
        let to_dst = LayoutTransition::UndefinedToTransferDst.barrier(image);
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = LayoutTransition::TransferDstToShaderRead.barrier(image);
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let vk_barrier = to_read.to_vk();
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(vk_barrier.subresource_range.level_count, 1);
    }
}
