//! Image acquisition and presentation.
//!
//! [`PresentTarget`] is the part of a swapchain the frame loop needs. The
//! crate ships [`OffscreenTarget`], which runs the full semaphore protocol
//! without a window: acquiring submits an empty batch that signals the
//! acquire semaphore, presenting submits an empty batch that waits on the
//! render-complete semaphore.

use ash::vk;
use tracing::debug;

use framesync_rhi::device::{SemaphoreWait, SubmitDesc};
use framesync_rhi::{DeviceRef, RhiError, RhiResult};

/// Result of asking a target for the next image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// `signal` will be signaled once the image is ready for rendering.
    Image { index: u32, suboptimal: bool },
    /// The target must be recreated; `signal` was not touched.
    OutOfDate,
}

/// Source of presentable images.
pub trait PresentTarget {
    /// Number of images the target cycles through.
    fn image_count(&self) -> u32;

    /// Acquires the next image, arranging for `signal` to be signaled when
    /// it is ready.
    fn acquire(&mut self, signal: vk::Semaphore, timeout_ns: u64) -> RhiResult<Acquire>;

    /// Presents `image_index` once `wait` is signaled.
    ///
    /// Returns `true` when the target should be recreated.
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RhiResult<bool>;
}

/// Windowless present target handing out images round-robin.
pub struct OffscreenTarget {
    device: DeviceRef,
    queue: vk::Queue,
    image_count: u32,
    next_image: u32,
    out_of_date: bool,
    presented: u64,
}

impl OffscreenTarget {
    /// Creates a target cycling through `image_count` images on the
    /// device's graphics queue.
    pub fn new(device: DeviceRef, image_count: u32) -> RhiResult<Self> {
        if image_count == 0 {
            return Err(RhiError::InvalidArgument(
                "offscreen target needs at least one image".to_string(),
            ));
        }
        let queue = device.graphics_queue();
        Ok(Self {
            device,
            queue,
            image_count,
            next_image: 0,
            out_of_date: false,
            presented: 0,
        })
    }

    /// Makes the next acquire report [`Acquire::OutOfDate`], as a window
    /// resize would.
    pub fn invalidate(&mut self) {
        self.out_of_date = true;
    }

    /// Number of completed present calls.
    pub fn presented_count(&self) -> u64 {
        self.presented
    }
}

impl PresentTarget for OffscreenTarget {
    fn image_count(&self) -> u32 {
        self.image_count
    }

    fn acquire(&mut self, signal: vk::Semaphore, _timeout_ns: u64) -> RhiResult<Acquire> {
        if self.out_of_date {
            self.out_of_date = false;
            debug!("Offscreen target out of date");
            return Ok(Acquire::OutOfDate);
        }

        let signals = [signal];
        let submit = SubmitDesc {
            signal_semaphores: &signals,
            ..Default::default()
        };
        self.device.queue_submit(self.queue, &submit, vk::Fence::null())?;

        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(Acquire::Image {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RhiResult<bool> {
        if image_index >= self.image_count {
            return Err(RhiError::InvalidArgument(format!(
                "present of image {} on a target with {} images",
                image_index, self.image_count
            )));
        }

        let waits = [SemaphoreWait {
            semaphore: wait,
            stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }];
        let submit = SubmitDesc {
            wait_semaphores: &waits,
            ..Default::default()
        };
        self.device.queue_submit(self.queue, &submit, vk::Fence::null())?;

        self.presented += 1;
        Ok(false)
    }
}

impl std::fmt::Debug for OffscreenTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffscreenTarget")
            .field("image_count", &self.image_count)
            .field("next_image", &self.next_image)
            .finish()
    }
}
