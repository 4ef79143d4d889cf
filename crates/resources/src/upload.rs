//! Synchronous staging uploads.
//!
//! # Overview
//!
//! [`UploadPipeline::upload_image`] fills a device-local image from host
//! memory and leaves it ready for sampling:
//!
//! ```text
//! 1. staging buffer (host visible) <- pixels
//! 2. barrier  UNDEFINED            -> TRANSFER_DST_OPTIMAL
//! 3. copy     staging buffer       -> image (full extent, mip 0, layer 0)
//! 4. barrier  TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL
//! 5. submit on the graphics queue, wait for the queue to go idle,
//!    free the command buffer and the staging buffer
//! ```
//!
//! Commands are recorded into a one-shot buffer from the manager's
//! [`PoolCategory::TransientGraphics`] pool. Every texture and font atlas
//! goes through this one function.
//!
//! # Thread Safety
//!
//! Uploads may run on any thread. Recording into the shared transient pool
//! is serialized internally.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

use framesync_core::Timer;
use framesync_frame::{CommandPoolManager, PoolCategory};
use framesync_rhi::buffer::{Buffer, BufferUsage};
use framesync_rhi::command::{CommandBuffer, CommandPool, LayoutTransition};
use framesync_rhi::device::SubmitDesc;
use framesync_rhi::image::texel_size;
use framesync_rhi::{DeviceRef, RhiError, RhiResult};

/// What one upload did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UploadReport {
    pub bytes: u64,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    /// Wall time from staging allocation to queue idle.
    pub elapsed: Duration,
}

/// Running totals over all uploads of a pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStatistics {
    pub uploads: u64,
    pub bytes: u64,
    pub failures: u64,
}

/// Command buffer checked out for a single submission.
///
/// Returned to its pool on drop unless the GPU may still be executing it,
/// in which case the pool reclaims it when it is released.
struct OneShot {
    pool: Arc<CommandPool>,
    buffer: CommandBuffer,
    pending: bool,
}

impl OneShot {
    fn new(pool: Arc<CommandPool>) -> RhiResult<Self> {
        let buffer = CommandBuffer::new(&pool)?;
        Ok(Self {
            pool,
            buffer,
            pending: false,
        })
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        if self.pending {
            warn!(
                "One-shot command buffer {:?} may still be executing, leaving it to its pool",
                self.buffer.handle()
            );
            return;
        }
        if let Err(e) = self.pool.free(&[self.buffer.handle()]) {
            warn!(
                "Failed to free one-shot command buffer {:?}: {}",
                self.buffer.handle(),
                e
            );
        }
    }
}

/// Executes staging uploads against a shared [`CommandPoolManager`].
pub struct UploadPipeline {
    device: DeviceRef,
    pools: Arc<CommandPoolManager>,
    recording: Mutex<()>,
    stats: Mutex<UploadStatistics>,
}

impl UploadPipeline {
    pub fn new(device: DeviceRef, pools: Arc<CommandPoolManager>) -> Self {
        Self {
            device,
            pools,
            recording: Mutex::new(()),
            stats: Mutex::new(UploadStatistics::default()),
        }
    }

    #[inline]
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Records commands with `record` into a one-shot buffer, submits it on
    /// the graphics queue and blocks until the queue is idle.
    pub fn one_time_submit<F, R>(&self, record: F) -> RhiResult<R>
    where
        F: FnOnce(&CommandBuffer) -> RhiResult<R>,
    {
        let pool = self.pools.get_or_create(PoolCategory::TransientGraphics)?;
        let queue = self.device.graphics_queue();

        let _recording = self.recording.lock();
        let mut one_shot = OneShot::new(pool)?;

        one_shot.buffer.begin()?;
        let result = record(&one_shot.buffer)?;
        one_shot.buffer.end()?;

        let command_buffers = [one_shot.buffer.handle()];
        self.device.queue_submit(
            queue,
            &SubmitDesc {
                command_buffers: &command_buffers,
                ..Default::default()
            },
            vk::Fence::null(),
        )?;

        one_shot.pending = true;
        self.device.queue_wait_idle(queue)?;
        one_shot.pending = false;

        Ok(result)
    }

    /// Uploads `pixels` into `image` and transitions it for shader reads.
    ///
    /// `image` must be in `UNDEFINED` layout or its contents may be
    /// discarded; after the call it is in `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] when the extent is zero, the
    /// format is unsupported, or `pixels` is not exactly
    /// `width * height * texel size` bytes. Device failures are returned as
    /// is; nothing created by the upload outlives the call.
    pub fn upload_image(
        &self,
        image: vk::Image,
        pixels: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> RhiResult<UploadReport> {
        let result = self.upload_image_inner(image, pixels, extent, format);

        let mut stats = self.stats.lock();
        match &result {
            Ok(report) => {
                stats.uploads += 1;
                stats.bytes += report.bytes;
            }
            Err(_) => stats.failures += 1,
        }
        result
    }

    fn upload_image_inner(
        &self,
        image: vk::Image,
        pixels: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> RhiResult<UploadReport> {
        let expected = validate_pixels(pixels, extent, format)?;

        let timer = Timer::new();
        let staging = Buffer::new_with_data(self.device.clone(), BufferUsage::Staging, pixels)?;

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        self.one_time_submit(|cmd| {
            cmd.transition_image_layout(image, LayoutTransition::UndefinedToTransferDst);
            cmd.copy_buffer_to_image(
                staging.handle(),
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            cmd.transition_image_layout(image, LayoutTransition::TransferDstToShaderRead);
            Ok(())
        })?;

        let report = UploadReport {
            bytes: expected,
            extent,
            format,
            elapsed: timer.elapsed(),
        };

        debug!(
            "Uploaded {} bytes to image {:?} ({}x{} {:?}) in {:.3} ms",
            report.bytes,
            image,
            extent.width,
            extent.height,
            format,
            timer.elapsed_ms()
        );

        Ok(report)
    }

    pub fn statistics(&self) -> UploadStatistics {
        *self.stats.lock()
    }
}

impl std::fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

/// Checks that `pixels` is exactly one tightly packed `extent` image of
/// `format`, and returns its size in bytes.
///
/// # Errors
///
/// Returns [`RhiError::InvalidArgument`] for an empty extent, a format the
/// upload path does not handle, or a byte count that does not match.
pub fn validate_pixels(pixels: &[u8], extent: vk::Extent2D, format: vk::Format) -> RhiResult<u64> {
    let expected = expected_size(extent, format)?;
    if pixels.len() as u64 != expected {
        return Err(RhiError::InvalidArgument(format!(
            "pixel data is {} bytes, a {}x{} {:?} image needs {}",
            pixels.len(),
            extent.width,
            extent.height,
            format,
            expected
        )));
    }
    Ok(expected)
}

/// Bytes a tightly packed `extent` image of `format` occupies.
fn expected_size(extent: vk::Extent2D, format: vk::Format) -> RhiResult<u64> {
    if extent.width == 0 || extent.height == 0 {
        return Err(RhiError::InvalidArgument(format!(
            "upload extent must be non-zero, got {}x{}",
            extent.width, extent.height
        )));
    }
    let texel = texel_size(format)
        .ok_or_else(|| RhiError::InvalidArgument(format!("unsupported upload format {:?}", format)))?;
    Ok(extent.width as u64 * extent.height as u64 * texel as u64)
}
