//! framesync demo - Main Entry Point
//!
//! Drives the frame loop against an offscreen target, uploads a texture and
//! a font atlas, and logs pool and sync statistics. Runs on the first
//! suitable Vulkan GPU, or on the headless device when no Vulkan loader or
//! GPU is available.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use framesync_core::{Config, Timer};
use framesync_frame::{CommandPoolManager, FrameBegin, FrameLoop, OffscreenTarget, PoolCategory};
use framesync_resources::{
    CoverageBitmap, FontAtlas, GlyphMetrics, GlyphRect, PixelFormat, Texture, UploadPipeline,
};
use framesync_rhi::command::LayoutTransition;
use framesync_rhi::headless::HeadlessDevice;
use framesync_rhi::image::{Image, ImageDesc};
use framesync_rhi::instance::Instance;
use framesync_rhi::physical_device::select_physical_device;
use framesync_rhi::sampler::SamplerDesc;
use framesync_rhi::vk;
use framesync_rhi::DeviceRef;
use framesync_rhi::vulkan::VulkanDevice;

const DEMO_FRAMES: u64 = 120;
const POOL_MAINTENANCE_INTERVAL: u64 = 60;

fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    framesync_core::init_logging_with_filter(&config.debug.log_filter);
    info!("Starting framesync demo");

    // The instance must outlive every object created from the device
    match Instance::new(config.debug.validation_layers) {
        Ok(instance) => match select_physical_device(instance.handle()) {
            Ok(gpu) => {
                info!("Using {} ({})", gpu.device_name(), gpu.device_type_name());
                let device = VulkanDevice::new(&instance, &gpu)?;
                run(device, &config)?;
            }
            Err(e) => {
                warn!("No usable GPU ({}), falling back to the headless device", e);
                run(Arc::new(HeadlessDevice::new()), &config)?;
            }
        },
        Err(e) => {
            warn!("Vulkan unavailable ({}), falling back to the headless device", e);
            run(Arc::new(HeadlessDevice::new()), &config)?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn run(device: DeviceRef, config: &Config) -> Result<()> {
    let pools = Arc::new(CommandPoolManager::new(device.clone()));
    let uploader = UploadPipeline::new(device.clone(), pools.clone());

    let sampler = SamplerDesc::from_name(&config.upload.default_filter).unwrap_or_else(|| {
        warn!(
            "Unknown sampler filter {:?}, using linear",
            config.upload.default_filter
        );
        SamplerDesc::linear()
    });

    let checkerboard = checkerboard(8);
    let texture = Texture::from_pixels(
        &uploader,
        &checkerboard,
        8,
        8,
        PixelFormat::Rgba8Srgb,
        &sampler,
    )?;
    let atlas = demo_font_atlas(&uploader)?;
    info!(
        "Resources ready: texture {}x{}, atlas with {} glyph(s), \"HI\" measures {} px",
        texture.extent().width,
        texture.extent().height,
        atlas.glyph_count(),
        atlas.measure("HI")
    );

    let target = OffscreenTarget::new(device.clone(), config.sync.offscreen_images)?;
    let mut frames = FrameLoop::new(device.clone(), pools.clone(), target, &config.sync)?;

    // Transitioned every frame so each submission carries a real command
    let scratch = Image::new(
        device.clone(),
        ImageDesc::texture(
            vk::Extent2D {
                width: 4,
                height: 4,
            },
            vk::Format::R8G8B8A8_UNORM,
        ),
    )?;

    let timer = Timer::new();
    let mut rendered = 0u64;
    while rendered < DEMO_FRAMES {
        let frame = match frames.begin_frame()? {
            FrameBegin::Ready(frame) => frame,
            FrameBegin::TimedOut => {
                warn!("Frame fence wait timed out, retrying");
                continue;
            }
            FrameBegin::OutOfDate => {
                warn!("Present target out of date, skipping frame");
                continue;
            }
        };

        frame
            .command_buffer()
            .transition_image_layout(scratch.handle(), LayoutTransition::UndefinedToTransferDst);
        frames.end_frame(frame)?;
        rendered += 1;

        if rendered % POOL_MAINTENANCE_INTERVAL == 0 {
            pool_maintenance(&frames, config)?;
        }
    }

    let elapsed = timer.elapsed().as_secs_f64();
    info!(
        "Rendered {} frames in {:.3} s ({:.1} fps)",
        rendered,
        elapsed,
        rendered as f64 / elapsed.max(f64::EPSILON)
    );

    frames.dispose()?;

    let sync = frames.sync().statistics();
    info!(
        "Sync: {} fence wait(s), {} timeout(s), average wait {:.3} ms",
        sync.total_fence_waits, sync.fence_wait_timeouts, sync.average_fence_wait_time_ms
    );
    for entry in pools.per_pool_statistics() {
        let name = entry.category.map_or("custom", |c| c.name());
        info!(
            "Pool {}: {} allocation request(s), {} free request(s), {} reset(s)",
            name,
            entry.statistics.allocation_requests,
            entry.statistics.free_requests,
            entry.statistics.reset_count
        );
    }
    let uploads = uploader.statistics();
    info!(
        "Uploads: {} ({} bytes, {} failed)",
        uploads.uploads, uploads.bytes, uploads.failures
    );

    drop(scratch);
    drop(atlas);
    drop(texture);
    drop(frames);

    let outcome = pools.dispose();
    if !outcome.is_complete() {
        warn!("{} command pool(s) failed to release", outcome.failed);
    }

    Ok(())
}

/// Resets the upload pool with all frames drained, then optionally trims
/// every pool.
fn pool_maintenance(frames: &FrameLoop<OffscreenTarget>, config: &Config) -> Result<()> {
    if !config.pools.trim_after_reset && !config.pools.release_resources_on_reset {
        return Ok(());
    }

    frames.wait_for_all_frames()?;
    // Slot buffers are still owned by the frame loop, so only the upload
    // pool is reset wholesale.
    frames
        .pools()
        .get_or_create(PoolCategory::TransientGraphics)?
        .reset(config.pools.release_resources_on_reset)?;
    if config.pools.trim_after_reset {
        let outcome = frames.pools().trim_all();
        info!(
            "Trimmed {} pool(s), {} failed",
            outcome.succeeded, outcome.failed
        );
    }

    let stats = frames.pools().aggregate_statistics();
    info!(
        "Pools: {} pool(s), {} buffer(s) live, ~{} KiB estimated",
        stats.pool_count,
        stats.total_allocated,
        stats.estimated_memory_bytes / 1024
    );
    Ok(())
}

fn checkerboard(size: u32) -> Vec<[u8; 4]> {
    (0..size * size)
        .map(|i| {
            let (x, y) = (i % size, i / size);
            if (x + y) % 2 == 0 {
                [255, 255, 255, 255]
            } else {
                [40, 40, 40, 255]
            }
        })
        .collect()
}

/// Two hand-drawn 4x4 glyphs, 'H' and 'I', side by side.
fn demo_font_atlas(uploader: &UploadPipeline) -> Result<FontAtlas> {
    #[rustfmt::skip]
    let pixels: [u8; 32] = [
        255, 0, 0, 255,   255, 255, 255, 0,
        255, 255, 255, 255, 0, 255, 0, 0,
        255, 0, 0, 255,   0, 255, 0, 0,
        255, 0, 0, 255,   255, 255, 255, 0,
    ];
    let glyph = |x| GlyphMetrics {
        rect: GlyphRect {
            x,
            y: 0,
            width: 4,
            height: 4,
        },
        advance: 5.0,
    };

    let atlas = FontAtlas::new(
        uploader,
        CoverageBitmap {
            width: 8,
            height: 4,
            pixels: &pixels,
        },
        [('H', glyph(0)), ('I', glyph(4))],
    )?;
    Ok(atlas)
}
