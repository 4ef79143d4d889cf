//! Synchronization primitives.
//!
//! This module provides owning wrappers for the two synchronization objects
//! the frame-sync subsystem uses:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//!
//! # Overview
//!
//! - **Semaphores** order operations within or across queues: image
//!   acquisition before rendering, rendering before presentation.
//!
//! - **Fences** let the CPU learn when a submission has finished. A fence
//!   guarding in-flight work must not be reset until it has been waited on.
//!
//! Both wrappers destroy their handle exactly once, on drop.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framesync_rhi::device::DeviceRef;
//! use framesync_rhi::headless::HeadlessDevice;
//! use framesync_rhi::sync::{Fence, Semaphore};
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let device: DeviceRef = Arc::new(HeadlessDevice::new());
//!
//! let acquire = Semaphore::new(device.clone())?;
//! let in_flight = Fence::new(device.clone(), true)?;
//!
//! // The first wait on a signaled fence returns immediately.
//! assert!(in_flight.wait(u64::MAX)?);
//! in_flight.reset()?;
//! # let _ = acquire;
//! # Ok(())
//! # }
//! ```

use ash::vk;
use tracing::debug;

use crate::device::DeviceRef;
use crate::error::RhiResult;

/// Semaphore wrapper.
///
/// Semaphores are used for GPU-to-GPU synchronization between queue operations.
/// Common use cases include:
/// - Acquire semaphore: signaled when a present image is ready
/// - Render-complete semaphore: signaled when rendering is complete
///
/// # Thread Safety
///
/// The semaphore is immutable after creation and can be safely shared between
/// threads.
pub struct Semaphore {
    device: DeviceRef,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: DeviceRef) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;

        debug!("Created semaphore {:?}", semaphore);

        Ok(Self { device, semaphore })
    }

    /// Returns the native semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore {:?}", self.semaphore);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

/// Fence wrapper.
///
/// Fences are used for GPU-to-CPU synchronization, allowing the host to wait
/// for GPU operations to complete. Common use cases include:
/// - Frame-in-flight fence: wait before reusing a frame slot
/// - Transfer completion fence: wait for data upload to complete
///
/// # Thread Safety
///
/// Wait and reset can be called from any thread, but resetting a fence while
/// another thread waits on it is the caller's responsibility to avoid.
pub struct Fence {
    device: DeviceRef,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The device
    /// * `signaled` - If true, creates the fence in the signaled state.
    ///   Frame fences start signaled so the first wait returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: DeviceRef, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;

        debug!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { device, fence })
    }

    /// Returns the native fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Waits for the fence to become signaled.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in nanoseconds. Use `u64::MAX` for infinite wait.
    ///
    /// # Returns
    ///
    /// `true` when the fence is signaled, `false` when the timeout elapsed
    /// first. A timeout is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails for another reason, for example a
    /// lost device.
    pub fn wait(&self, timeout: u64) -> RhiResult<bool> {
        self.device.wait_for_fences(&[self.fence], true, timeout)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not guard any pending queue operation.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fences(&[self.fence])
    }

    /// Checks if the fence is currently signaled without blocking.
    pub fn is_signaled(&self) -> bool {
        matches!(self.device.fence_status(self.fence), Ok(true))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
        debug!("Destroyed fence {:?}", self.fence);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.fence).finish()
    }
}
