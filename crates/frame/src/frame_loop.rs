//! The per-frame protocol.
//!
//! # Overview
//!
//! [`FrameLoop`] drives one frame at a time through the slot ring:
//!
//! ```text
//! begin_frame:
//!   1. wait on the slot's completion fence (TimedOut leaves everything as is)
//!   2. free the buffers this slot submitted last time, begin a fresh one
//!   3. acquire an image, signaling the slot's acquire semaphore
//!      (OutOfDate returns here, before the fence is reset)
//!   4. reset the fence
//! end_frame:
//!   5. submit: wait acquire, signal render-complete[image] + fence
//!   6. present: wait render-complete[image]
//!   7. advance the ring
//! ```
//!
//! Everything that can fail happens before the reset, so an error never
//! leaves the slot with an unsignaled fence that nothing will signal.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framesync_core::SyncConfig;
//! use framesync_frame::{CommandPoolManager, FrameBegin, FrameLoop, OffscreenTarget};
//! use framesync_rhi::device::DeviceRef;
//! use framesync_rhi::headless::HeadlessDevice;
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let device: DeviceRef = Arc::new(HeadlessDevice::new());
//! let pools = Arc::new(CommandPoolManager::new(device.clone()));
//! let target = OffscreenTarget::new(device.clone(), 3)?;
//! let mut frames = FrameLoop::new(device, pools, target, &SyncConfig::default())?;
//!
//! for _ in 0..4 {
//!     if let FrameBegin::Ready(frame) = frames.begin_frame()? {
//!         // Record into frame.command_buffer() here
//!         frames.end_frame(frame)?;
//!     }
//! }
//! frames.dispose()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use framesync_core::SyncConfig;
use framesync_rhi::command::CommandBuffer;
use framesync_rhi::device::{SemaphoreWait, SubmitDesc};
use framesync_rhi::{DeviceRef, RhiError, RhiResult};

use crate::pool_manager::CommandPoolManager;
use crate::present::{Acquire, PresentTarget};
use crate::sync_manager::SyncManager;

/// A frame between [`FrameLoop::begin_frame`] and [`FrameLoop::end_frame`].
///
/// Must be handed back to `end_frame`: its slot's fence has been reset and
/// only the submission in `end_frame` signals it again.
#[derive(Debug)]
pub struct ActiveFrame {
    frame_index: usize,
    image_index: u32,
    suboptimal: bool,
    command_buffer: CommandBuffer,
}

impl ActiveFrame {
    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// The primary command buffer, already in the recording state.
    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }
}

/// Outcome of [`FrameLoop::begin_frame`].
#[derive(Debug)]
pub enum FrameBegin {
    Ready(ActiveFrame),
    /// The slot's fence did not signal within the configured timeout.
    TimedOut,
    /// The present target must be recreated before rendering resumes.
    OutOfDate,
}

/// Frames-in-flight loop over a [`PresentTarget`].
///
/// # Thread Safety
///
/// Belongs to the frame-submission thread. The pool manager it shares can
/// be used from other threads at the same time, e.g. by uploads.
pub struct FrameLoop<T: PresentTarget> {
    device: DeviceRef,
    sync: SyncManager,
    pools: Arc<CommandPoolManager>,
    target: T,
    fence_timeout_ns: u64,
    /// Command buffers last submitted from each slot.
    submitted: Vec<Vec<vk::CommandBuffer>>,
    disposed: bool,
}

impl<T: PresentTarget> FrameLoop<T> {
    /// Creates the slot ring described by `config`.
    pub fn new(
        device: DeviceRef,
        pools: Arc<CommandPoolManager>,
        target: T,
        config: &SyncConfig,
    ) -> RhiResult<Self> {
        let sync = SyncManager::new(device.clone(), config.max_frames_in_flight)?;

        info!(
            "Frame loop created: {} frames in flight, {} images, fence timeout {}",
            config.max_frames_in_flight,
            target.image_count(),
            if config.fence_timeout_ms == 0 {
                "infinite".to_string()
            } else {
                format!("{} ms", config.fence_timeout_ms)
            }
        );

        Ok(Self {
            device,
            submitted: vec![Vec::new(); config.max_frames_in_flight],
            sync,
            pools,
            target,
            fence_timeout_ns: config.fence_timeout_ns(),
            disposed: false,
        })
    }

    #[inline]
    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    #[inline]
    pub fn pools(&self) -> &Arc<CommandPoolManager> {
        &self.pools
    }

    #[inline]
    pub fn target(&self) -> &T {
        &self.target
    }

    #[inline]
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Starts the frame of the current slot.
    ///
    /// # Errors
    ///
    /// Returns an error if a wait fails for a reason other than the timeout
    /// (e.g. a lost device), or if acquisition, reset or command buffer
    /// allocation fails.
    pub fn begin_frame(&mut self) -> RhiResult<FrameBegin> {
        if self.disposed {
            return Err(RhiError::InvalidHandle(
                "frame loop has been disposed".to_string(),
            ));
        }

        let frame_index = self.sync.current_frame_index();
        let slot = self.sync.frame_slot(frame_index)?;

        if !self
            .sync
            .wait_for_fence(slot.completion_fence(), self.fence_timeout_ns)?
        {
            warn!("Frame slot {} is still in flight, skipping frame", frame_index);
            return Ok(FrameBegin::TimedOut);
        }

        // The slot's previous work is done, so its buffers can go. A failure
        // here leaves the fence signaled and no semaphore pending.
        let pool = self.pools.graphics_pool()?;
        if !self.submitted[frame_index].is_empty() {
            pool.free(&self.submitted[frame_index])?;
            self.submitted[frame_index].clear();
        }

        let command_buffer = CommandBuffer::new(&pool)?;
        self.submitted[frame_index].push(command_buffer.handle());
        command_buffer.begin()?;

        let (image_index, suboptimal) = match self
            .target
            .acquire(slot.acquire_signal().handle(), self.fence_timeout_ns)?
        {
            Acquire::Image { index, suboptimal } => (index, suboptimal),
            Acquire::OutOfDate => {
                // The unused buffer stays tracked and is freed next time
                debug!("Present target out of date during acquire");
                return Ok(FrameBegin::OutOfDate);
            }
        };

        self.sync.reset_fence(slot.completion_fence())?;

        Ok(FrameBegin::Ready(ActiveFrame {
            frame_index,
            image_index,
            suboptimal,
            command_buffer,
        }))
    }

    /// Submits and presents `frame`, then advances the ring.
    ///
    /// Returns `true` when the present target asked to be recreated.
    pub fn end_frame(&mut self, frame: ActiveFrame) -> RhiResult<bool> {
        if frame.frame_index != self.sync.current_frame_index() {
            return Err(RhiError::InvalidArgument(format!(
                "frame {} ended while slot {} is current",
                frame.frame_index,
                self.sync.current_frame_index()
            )));
        }

        frame.command_buffer.end()?;

        let render_complete = self
            .sync
            .image_slot(frame.image_index)?
            .render_complete_signal()
            .handle();
        let slot = self.sync.frame_slot(frame.frame_index)?;

        let waits = [SemaphoreWait {
            semaphore: slot.acquire_signal().handle(),
            stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }];
        let command_buffers = [frame.command_buffer.handle()];
        let signals = [render_complete];

        self.device.queue_submit(
            self.device.graphics_queue(),
            &SubmitDesc {
                wait_semaphores: &waits,
                command_buffers: &command_buffers,
                signal_semaphores: &signals,
            },
            slot.completion_fence().handle(),
        )?;

        let recreate = self.target.present(frame.image_index, render_complete)?;

        let next = self.sync.advance_frame();
        debug!(
            "Frame {} submitted on image {}, next slot {}",
            frame.frame_index, frame.image_index, next
        );

        Ok(recreate || frame.suboptimal)
    }

    /// Blocks until every slot's last submission has finished.
    pub fn wait_for_all_frames(&self) -> RhiResult<()> {
        let fences = (0..self.sync.max_frames_in_flight())
            .map(|i| self.sync.frame_slot(i).map(|s| s.completion_fence().handle()))
            .collect::<RhiResult<Vec<_>>>()?;
        self.sync.wait_for_fences(&fences, true, u64::MAX)?;
        Ok(())
    }

    /// Waits for the device to go idle, returns the slots' command buffers
    /// and tears down the sync objects. Later calls do nothing.
    pub fn dispose(&mut self) -> RhiResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let idle = self.sync.device_wait_idle();

        let outstanding: Vec<vk::CommandBuffer> = self.submitted.drain(..).flatten().collect();
        if !outstanding.is_empty() && !self.pools.is_disposed() {
            match self.pools.graphics_pool() {
                Ok(pool) => {
                    if let Err(e) = pool.free(&outstanding) {
                        warn!("Failed to free {} frame command buffer(s): {}", outstanding.len(), e);
                    }
                }
                Err(e) => warn!("Graphics pool unavailable during frame teardown: {}", e),
            }
        }

        let disposed = self.sync.dispose();
        info!("Frame loop disposed");
        idle.and(disposed)
    }
}

impl<T: PresentTarget> Drop for FrameLoop<T> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::error!("Frame loop teardown failed: {}", e);
        }
    }
}
