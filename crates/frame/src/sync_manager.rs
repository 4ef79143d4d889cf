//! Frames-in-flight synchronization.
//!
//! # Overview
//!
//! The [`SyncManager`] owns one [`FrameSlot`] per frame in flight and one
//! [`ImageSlot`] per presentable image index:
//!
//! ```text
//! FrameSlot[i]  = acquire semaphore + completion fence (created signaled)
//! ImageSlot[k]  = render-complete semaphore (created on first use)
//! ```
//!
//! Render-complete semaphores are keyed by image rather than by frame so a
//! semaphore is never signaled for one image while a present of another
//! image still waits on it.
//!
//! # Slot protocol
//!
//! ```text
//! Signaled (created) -> wait -> reset -> Pending (submit) -> Signaled (GPU done) -> ...
//! ```
//!
//! A fence is only reset after it has been waited on, so its slot's
//! resources are never touched while the GPU may still use them.

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use framesync_core::Timer;
use framesync_rhi::sync::{Fence, Semaphore};
use framesync_rhi::{DeviceRef, RhiError, RhiResult};

use crate::stats::SyncStatistics;

/// Synchronization objects of one frame in flight.
pub struct FrameSlot {
    frame_index: usize,
    acquire_signal: Semaphore,
    completion_fence: Fence,
}

impl FrameSlot {
    fn new(device: &DeviceRef, frame_index: usize) -> RhiResult<Self> {
        let acquire_signal = Semaphore::new(device.clone())?;
        // Signaled so the first wait on this slot returns immediately
        let completion_fence = Fence::new(device.clone(), true)?;
        Ok(Self {
            frame_index,
            acquire_signal,
            completion_fence,
        })
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Signaled when the image acquired for this frame is ready.
    #[inline]
    pub fn acquire_signal(&self) -> &Semaphore {
        &self.acquire_signal
    }

    /// Signaled when the frame's submission has finished on the GPU.
    #[inline]
    pub fn completion_fence(&self) -> &Fence {
        &self.completion_fence
    }
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("frame_index", &self.frame_index)
            .field("acquire_signal", &self.acquire_signal)
            .field("completion_fence", &self.completion_fence)
            .finish()
    }
}

/// Synchronization objects of one presentable image.
pub struct ImageSlot {
    image_index: u32,
    render_complete_signal: Semaphore,
}

impl ImageSlot {
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Signaled when rendering into the image is done; presentation waits
    /// on it.
    #[inline]
    pub fn render_complete_signal(&self) -> &Semaphore {
        &self.render_complete_signal
    }
}

impl std::fmt::Debug for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSlot")
            .field("image_index", &self.image_index)
            .field("render_complete_signal", &self.render_complete_signal)
            .finish()
    }
}

#[derive(Default)]
struct Counters {
    total_fence_waits: u64,
    fence_wait_timeouts: u64,
    total_fence_resets: u64,
    total_fence_wait_time_ms: f64,
    device_wait_idle_calls: u64,
    queue_wait_idle_calls: u64,
    total_frames_rendered: u64,
}

/// Owner of the per-frame and per-image synchronization objects.
///
/// # Thread Safety
///
/// Frame slot accessors only read and may be called from any thread.
/// Counters are guarded internally. Image slot creation, advancing the ring
/// and disposal take `&mut self` and belong to the frame-submission thread.
pub struct SyncManager {
    device: DeviceRef,
    max_frames_in_flight: usize,
    frame_slots: Vec<FrameSlot>,
    image_slots: HashMap<u32, ImageSlot>,
    counters: Mutex<Counters>,
    disposed: bool,
}

impl SyncManager {
    /// Creates `max_frames_in_flight` frame slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] for zero frames in flight, or
    /// the native error if a semaphore or fence cannot be created. Objects
    /// created before the failure are destroyed.
    pub fn new(device: DeviceRef, max_frames_in_flight: usize) -> RhiResult<Self> {
        if max_frames_in_flight == 0 {
            return Err(RhiError::InvalidArgument(
                "max_frames_in_flight must be at least 1".to_string(),
            ));
        }

        let frame_slots = (0..max_frames_in_flight)
            .map(|i| {
                let slot = FrameSlot::new(&device, i)?;
                debug!("Created frame slot {}", i);
                Ok(slot)
            })
            .collect::<RhiResult<Vec<_>>>()?;

        info!(
            "Sync manager created with {} frames in flight",
            max_frames_in_flight
        );

        Ok(Self {
            device,
            max_frames_in_flight,
            frame_slots,
            image_slots: HashMap::new(),
            counters: Mutex::new(Counters::default()),
            disposed: false,
        })
    }

    #[inline]
    pub fn max_frames_in_flight(&self) -> usize {
        self.max_frames_in_flight
    }

    #[inline]
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Returns the slot for frame index `index`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] when `index` is not below
    /// [`max_frames_in_flight`](Self::max_frames_in_flight), and
    /// [`RhiError::InvalidHandle`] after disposal.
    pub fn frame_slot(&self, index: usize) -> RhiResult<&FrameSlot> {
        if self.disposed {
            return Err(RhiError::InvalidHandle(
                "sync manager has been disposed".to_string(),
            ));
        }
        self.frame_slots.get(index).ok_or_else(|| {
            RhiError::InvalidArgument(format!(
                "frame index {} out of range (max frames in flight: {})",
                index, self.max_frames_in_flight
            ))
        })
    }

    /// Index of the current slot: frames rendered modulo frames in flight.
    pub fn current_frame_index(&self) -> usize {
        (self.counters.lock().total_frames_rendered % self.max_frames_in_flight as u64) as usize
    }

    pub fn current_frame_slot(&self) -> RhiResult<&FrameSlot> {
        self.frame_slot(self.current_frame_index())
    }

    /// Marks the current frame as submitted and moves to the next slot.
    /// Returns the new current index.
    pub fn advance_frame(&mut self) -> usize {
        let mut counters = self.counters.lock();
        counters.total_frames_rendered += 1;
        (counters.total_frames_rendered % self.max_frames_in_flight as u64) as usize
    }

    /// Returns the slot for image `image_index`, creating it on first use.
    ///
    /// Slots are owned here, so [`dispose`](Self::dispose) destroys every
    /// render-complete semaphore.
    pub fn image_slot(&mut self, image_index: u32) -> RhiResult<&ImageSlot> {
        if self.disposed {
            return Err(RhiError::InvalidHandle(
                "sync manager has been disposed".to_string(),
            ));
        }

        if !self.image_slots.contains_key(&image_index) {
            let slot = ImageSlot {
                image_index,
                render_complete_signal: Semaphore::new(self.device.clone())?,
            };
            debug!("Created image slot {}", image_index);
            self.image_slots.insert(image_index, slot);
        }
        Ok(&self.image_slots[&image_index])
    }

    // =========================================================================
    // Fences
    // =========================================================================

    /// Blocks until `fence` is signaled or `timeout_ns` elapses.
    ///
    /// Returns `false` only when a finite timeout elapsed. `u64::MAX` waits
    /// forever.
    pub fn wait_for_fence(&self, fence: &Fence, timeout_ns: u64) -> RhiResult<bool> {
        self.wait_for_fences(&[fence.handle()], true, timeout_ns)
    }

    /// Blocks until all (or, with `wait_all == false`, any) of `fences` are
    /// signaled or `timeout_ns` elapses. An empty slice returns `true`
    /// without touching the device.
    pub fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> RhiResult<bool> {
        if fences.is_empty() {
            return Ok(true);
        }

        let timer = Timer::new();
        let result = self.device.wait_for_fences(fences, wait_all, timeout_ns);
        let elapsed_ms = timer.elapsed_ms();

        let mut counters = self.counters.lock();
        counters.total_fence_waits += 1;
        counters.total_fence_wait_time_ms += elapsed_ms;

        match result {
            Ok(true) => Ok(true),
            Ok(false) => {
                counters.fence_wait_timeouts += 1;
                warn!(
                    "Fence wait timed out after {:.3} ms ({} fence(s))",
                    elapsed_ms,
                    fences.len()
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Resets `fence` to unsignaled. It must not guard in-flight work.
    pub fn reset_fence(&self, fence: &Fence) -> RhiResult<()> {
        self.reset_fences(&[fence.handle()])
    }

    pub fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        self.device.reset_fences(fences)?;
        self.counters.lock().total_fence_resets += fences.len() as u64;
        Ok(())
    }

    // =========================================================================
    // Idle waits
    // =========================================================================

    /// Waits for all queues to drain. Meant for teardown and reloads, not
    /// per-frame use.
    pub fn device_wait_idle(&self) -> RhiResult<()> {
        self.counters.lock().device_wait_idle_calls += 1;
        self.device.wait_idle()
    }

    pub fn queue_wait_idle(&self, queue: vk::Queue) -> RhiResult<()> {
        self.counters.lock().queue_wait_idle_calls += 1;
        self.device.queue_wait_idle(queue)
    }

    pub fn statistics(&self) -> SyncStatistics {
        let image_slot_count = self.image_slots.len();
        let counters = self.counters.lock();

        let average_fence_wait_time_ms = if counters.total_fence_waits == 0 {
            0.0
        } else {
            counters.total_fence_wait_time_ms / counters.total_fence_waits as f64
        };

        SyncStatistics {
            max_frames_in_flight: self.max_frames_in_flight,
            total_fence_waits: counters.total_fence_waits,
            fence_wait_timeouts: counters.fence_wait_timeouts,
            total_fence_resets: counters.total_fence_resets,
            total_fence_wait_time_ms: counters.total_fence_wait_time_ms,
            average_fence_wait_time_ms,
            device_wait_idle_calls: counters.device_wait_idle_calls,
            queue_wait_idle_calls: counters.queue_wait_idle_calls,
            current_frame_index: (counters.total_frames_rendered
                % self.max_frames_in_flight as u64) as usize,
            total_frames_rendered: counters.total_frames_rendered,
            active_semaphore_count: self.frame_slots.len() + image_slot_count,
            active_fence_count: self.frame_slots.len(),
        }
    }

    /// Waits for the device to go idle, then destroys frame objects and
    /// image semaphores in that order.
    ///
    /// Only the first call does anything. Objects are destroyed even when
    /// the idle wait fails; its error is returned afterwards.
    pub fn dispose(&mut self) -> RhiResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let idle = self.device_wait_idle();
        if let Err(e) = &idle {
            warn!("Device idle wait failed during sync teardown: {}", e);
        }

        let frame_count = self.frame_slots.len();
        self.frame_slots.clear();

        let image_count = self.image_slots.len();
        self.image_slots.clear();

        info!(
            "Sync manager disposed ({} frame slot(s), {} image slot(s))",
            frame_count, image_count
        );

        idle
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::error!("Sync manager teardown failed: {}", e);
        }
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("max_frames_in_flight", &self.max_frames_in_flight)
            .field("current_frame_index", &self.current_frame_index())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use framesync_rhi::device::{GpuDevice, SubmitDesc};
    use framesync_rhi::headless::HeadlessDevice;

    use super::*;

    fn manager(frames: usize) -> (Arc<HeadlessDevice>, SyncManager) {
        let device = Arc::new(HeadlessDevice::new());
        let sync = SyncManager::new(device.clone(), frames).unwrap();
        (device, sync)
    }

    #[test]
    fn test_zero_frames_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        assert!(matches!(
            SyncManager::new(device, 0),
            Err(RhiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_frame_slots_are_distinct_and_stable() {
        let (_device, sync) = manager(2);
        let first = sync.frame_slot(0).unwrap();
        let second = sync.frame_slot(1).unwrap();

        assert_eq!(first.frame_index(), 0);
        assert_eq!(second.frame_index(), 1);
        assert_ne!(first.completion_fence().handle(), second.completion_fence().handle());
        assert_ne!(first.acquire_signal().handle(), second.acquire_signal().handle());
        assert_eq!(
            sync.frame_slot(0).unwrap().completion_fence().handle(),
            first.completion_fence().handle()
        );
    }

    #[test]
    fn test_out_of_range_frame_index() {
        let (_device, sync) = manager(2);
        assert!(matches!(
            sync.frame_slot(2),
            Err(RhiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_image_slots_are_cached() {
        let (device, mut sync) = manager(2);
        let first = sync.image_slot(3).unwrap().render_complete_signal().handle();
        let slot = sync.image_slot(3).unwrap();
        assert_eq!(slot.render_complete_signal().handle(), first);
        assert_eq!(slot.image_index(), 3);
        assert_eq!(device.live_semaphores(), 3);
        assert_eq!(sync.statistics().active_semaphore_count, 3);
    }

    #[test]
    fn test_first_wait_does_not_block() {
        let (_device, sync) = manager(2);
        let slot = sync.frame_slot(0).unwrap();
        assert!(sync.wait_for_fence(slot.completion_fence(), u64::MAX).unwrap());
        assert_eq!(sync.statistics().fence_wait_timeouts, 0);
    }

    #[test]
    fn test_timeout_counts() {
        let (device, sync) = manager(1);
        let fence = Fence::new(device.clone(), false).unwrap();

        assert!(!sync.wait_for_fence(&fence, 0).unwrap());

        let stats = sync.statistics();
        assert_eq!(stats.total_fence_waits, 1);
        assert_eq!(stats.fence_wait_timeouts, 1);
    }

    #[test]
    fn test_reset_after_wait_and_resubmit() {
        let (device, sync) = manager(1);
        let slot = sync.frame_slot(0).unwrap();
        let fence = slot.completion_fence();

        assert!(sync.wait_for_fence(fence, u64::MAX).unwrap());
        sync.reset_fence(fence).unwrap();
        assert!(!fence.is_signaled());

        device
            .queue_submit(device.graphics_queue(), &SubmitDesc::default(), fence.handle())
            .unwrap();
        assert!(sync.wait_for_fence(fence, u64::MAX).unwrap());
        assert_eq!(sync.statistics().total_fence_resets, 1);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_advance_wraps() {
        let (_device, mut sync) = manager(3);
        assert_eq!(sync.current_frame_index(), 0);
        assert_eq!(sync.advance_frame(), 1);
        assert_eq!(sync.advance_frame(), 2);
        assert_eq!(sync.advance_frame(), 0);
        assert_eq!(sync.statistics().total_frames_rendered, 3);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (device, mut sync) = manager(2);
        sync.image_slot(0).unwrap();

        sync.dispose().unwrap();
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(sync.statistics().device_wait_idle_calls, 1);

        sync.dispose().unwrap();
        assert_eq!(sync.statistics().device_wait_idle_calls, 1);
        assert!(sync.frame_slot(0).is_err());
    }

    #[test]
    fn test_wait_any_returns_on_first_signaled_fence() {
        let (device, sync) = manager(1);
        let signaled = Fence::new(device.clone(), true).unwrap();
        let unused = Fence::new(device.clone(), false).unwrap();

        // `unused` guards no work, so waiting on all of them could never finish
        assert!(
            sync.wait_for_fences(&[unused.handle(), signaled.handle()], false, u64::MAX)
                .unwrap()
        );
        assert!(!unused.is_signaled());
        assert_eq!(sync.statistics().fence_wait_timeouts, 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_empty_fence_wait_skips_device() {
        let (_device, sync) = manager(1);
        assert!(sync.wait_for_fences(&[], true, u64::MAX).unwrap());
        assert!(sync.wait_for_fences(&[], false, 0).unwrap());
        assert_eq!(sync.statistics().total_fence_waits, 0);
    }

    #[test]
    fn test_queue_wait_idle_drains_and_counts() {
        let (device, sync) = manager(1);
        let fence = Fence::new(device.clone(), false).unwrap();
        device
            .queue_submit(device.graphics_queue(), &SubmitDesc::default(), fence.handle())
            .unwrap();

        sync.queue_wait_idle(device.graphics_queue()).unwrap();
        sync.queue_wait_idle(device.graphics_queue()).unwrap();

        assert!(fence.is_signaled());
        assert_eq!(device.pending_submissions(), 0);
        let stats = sync.statistics();
        assert_eq!(stats.queue_wait_idle_calls, 2);
        assert_eq!(stats.device_wait_idle_calls, 0);
    }

    #[test]
    fn test_dispose_destroys_image_semaphores() {
        let (device, mut sync) = manager(2);
        for image in 0..3 {
            sync.image_slot(image).unwrap();
        }
        assert_eq!(sync.statistics().active_semaphore_count, 5);

        sync.dispose().unwrap();
        assert_eq!(device.live_semaphores(), 0);
        assert!(sync.image_slot(0).is_err());
    }
}
