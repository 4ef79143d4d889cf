//! Integration tests for uploads, textures and font atlases on the headless
//! device.

use std::sync::Arc;

use framesync_frame::{CommandPoolManager, PoolCategory};
use framesync_resources::{
    CoverageBitmap, FontAtlas, GlyphMetrics, GlyphRect, PixelFormat, ResourceError, Texture,
    UploadPipeline,
};
use framesync_rhi::RhiError;
use framesync_rhi::command::LayoutTransition;
use framesync_rhi::headless::{Fault, HeadlessDevice, RecordedCommand};
use framesync_rhi::image::{Image, ImageDesc};
use framesync_rhi::sampler::SamplerDesc;
use framesync_rhi::vk;

fn uploader(device: &Arc<HeadlessDevice>) -> (Arc<CommandPoolManager>, UploadPipeline) {
    let pools = Arc::new(CommandPoolManager::new(device.clone()));
    let uploader = UploadPipeline::new(device.clone(), pools.clone());
    (pools, uploader)
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

#[test]
fn test_upload_fills_image_and_cleans_up() {
    let device = Arc::new(HeadlessDevice::new());
    let (pools, uploader) = uploader(&device);

    let image = Image::new(
        device.clone(),
        ImageDesc::texture(extent(2, 2), vk::Format::R8G8B8A8_UNORM),
    )
    .unwrap();
    let pixels: Vec<u8> = (0..16).collect();

    let report = uploader
        .upload_image(image.handle(), &pixels, extent(2, 2), vk::Format::R8G8B8A8_UNORM)
        .unwrap();

    assert_eq!(report.bytes, 16);
    assert_eq!(device.image_contents(image.handle()).unwrap(), pixels);
    assert_eq!(
        device.image_layout(image.handle()),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );

    // Staging buffer and one-shot command buffer are gone
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_command_buffers(), 0);
    assert_eq!(device.pending_submissions(), 0);
    assert!(device.validation_errors().is_empty());

    let transient = pools.get_or_create(PoolCategory::TransientGraphics).unwrap();
    let stats = transient.statistics();
    assert!(stats.is_transient);
    assert_eq!(stats.allocation_requests, 1);
    assert_eq!(stats.free_requests, 1);
    assert_eq!(stats.total_allocated, 0);
    assert_eq!(uploader.statistics().uploads, 1);
}

#[test]
fn test_one_time_submit_runs_recorded_commands() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let image = Image::new(
        device.clone(),
        ImageDesc::texture(extent(1, 1), vk::Format::R8_UNORM),
    )
    .unwrap();

    let recorded = uploader
        .one_time_submit(|cmd| {
            cmd.transition_image_layout(image.handle(), LayoutTransition::UndefinedToTransferDst);
            Ok(device.recorded_commands(cmd.handle()))
        })
        .unwrap();

    assert_eq!(recorded.len(), 1);
    let RecordedCommand::ImageBarrier(barrier) = &recorded[0] else {
        panic!("expected a barrier, got {:?}", recorded[0]);
    };
    assert_eq!(barrier.dst_access, vk::AccessFlags::TRANSFER_WRITE);
    assert_eq!(barrier.dst_stage, vk::PipelineStageFlags::TRANSFER);
    assert_eq!(
        device.image_layout(image.handle()),
        Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
    );
}

#[test]
fn test_size_mismatch_rejected_before_any_allocation() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let image = Image::new(
        device.clone(),
        ImageDesc::texture(extent(4, 4), vk::Format::R8_UNORM),
    )
    .unwrap();

    let err = uploader
        .upload_image(image.handle(), &[0u8; 15], extent(4, 4), vk::Format::R8_UNORM)
        .unwrap_err();

    assert!(matches!(err, RhiError::InvalidArgument(_)));
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.submission_count(), 0);
    assert_eq!(uploader.statistics().failures, 1);
}

#[test]
fn test_allocation_failure_leaves_nothing_behind() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let image = Image::new(
        device.clone(),
        ImageDesc::texture(extent(2, 1), vk::Format::R8_UNORM),
    )
    .unwrap();

    device.inject_fault(Fault::CommandBufferAllocation);
    let err = uploader
        .upload_image(image.handle(), &[1, 2], extent(2, 1), vk::Format::R8_UNORM)
        .unwrap_err();

    assert!(matches!(
        err,
        RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    ));
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_command_buffers(), 0);

    // The next upload goes through
    uploader
        .upload_image(image.handle(), &[1, 2], extent(2, 1), vk::Format::R8_UNORM)
        .unwrap();
    assert_eq!(device.image_contents(image.handle()).unwrap(), vec![1, 2]);
}

#[test]
fn test_texture_from_rgba8() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let rgba = [255u8, 0, 0, 255, 0, 255, 0, 255];
    let texture = Texture::from_rgba8(&uploader, &rgba, 2, 1, &SamplerDesc::nearest()).unwrap();

    assert_eq!(texture.format(), PixelFormat::Rgba8Srgb);
    assert_eq!(texture.extent(), extent(2, 1));
    assert_eq!(texture.image().format(), vk::Format::R8G8B8A8_SRGB);
    assert_eq!(
        device.image_contents(texture.image().handle()).unwrap(),
        rgba.to_vec()
    );
    assert_eq!(device.live_samplers(), 1);
    assert_eq!(device.live_image_views(), 1);

    drop(texture);
    assert_eq!(device.live_images(), 0);
    assert_eq!(device.live_image_views(), 0);
    assert_eq!(device.live_samplers(), 0);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn test_texture_from_pod_texels() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let texels: [[u8; 4]; 2] = [[1, 2, 3, 4], [5, 6, 7, 8]];
    let texture = Texture::from_pixels(
        &uploader,
        &texels,
        1,
        2,
        PixelFormat::Rgba8Unorm,
        &SamplerDesc::default(),
    )
    .unwrap();

    assert_eq!(
        device.image_contents(texture.image().handle()).unwrap(),
        vec![1, 2, 3, 4, 5, 6, 7, 8]
    );
}

#[test]
fn test_texture_size_mismatch_creates_no_image() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let err = Texture::from_rgba8(&uploader, &[0u8; 7], 2, 1, &SamplerDesc::linear()).unwrap_err();
    assert!(matches!(err, ResourceError::Rhi(RhiError::InvalidArgument(_))));

    let err = Texture::from_pixels(
        &uploader,
        &[0u8; 0],
        0,
        4,
        PixelFormat::R8Unorm,
        &SamplerDesc::linear(),
    )
    .unwrap_err();
    assert!(matches!(err, ResourceError::Rhi(RhiError::InvalidArgument(_))));

    assert_eq!(device.live_images(), 0);
    assert_eq!(device.submission_count(), 0);
    assert_eq!(uploader.statistics().failures, 0);
}

#[test]
fn test_texture_from_dynamic_image() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let gray = image::GrayImage::from_pixel(3, 2, image::Luma([128u8]));
    let texture = Texture::from_image(
        &uploader,
        &image::DynamicImage::ImageLuma8(gray),
        &SamplerDesc::linear(),
    )
    .unwrap();

    assert_eq!(texture.extent(), extent(3, 2));
    let contents = device.image_contents(texture.image().handle()).unwrap();
    assert_eq!(contents.len(), 3 * 2 * 4);
    assert_eq!(&contents[..4], &[128, 128, 128, 255]);
}

#[test]
fn test_load_missing_file() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let err = Texture::load(&uploader, "no/such/texture.png", &SamplerDesc::linear()).unwrap_err();
    assert!(matches!(err, ResourceError::FileNotFound(_)));
}

#[test]
fn test_font_atlas_upload_and_lookup() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let pixels: Vec<u8> = (0..32).collect();
    let glyph = |x, advance| GlyphMetrics {
        rect: GlyphRect {
            x,
            y: 0,
            width: 4,
            height: 4,
        },
        advance,
    };

    let atlas = FontAtlas::new(
        &uploader,
        CoverageBitmap {
            width: 8,
            height: 4,
            pixels: &pixels,
        },
        [('A', glyph(0, 5.0)), ('B', glyph(4, 6.0))],
    )
    .unwrap();

    assert_eq!(atlas.glyph_count(), 2);
    assert_eq!(atlas.glyph('B').unwrap().uv.u0, 0.5);
    assert!(atlas.glyph('C').is_none());
    assert_eq!(atlas.measure("ABCA"), 16.0);
    assert_eq!(atlas.texture().format(), PixelFormat::R8Unorm);
    assert_eq!(
        device.image_contents(atlas.texture().image().handle()).unwrap(),
        pixels
    );
}

#[test]
fn test_font_atlas_rejects_glyph_outside_bitmap() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);

    let pixels = [0u8; 16];
    let err = FontAtlas::new(
        &uploader,
        CoverageBitmap {
            width: 4,
            height: 4,
            pixels: &pixels,
        },
        [(
            'x',
            GlyphMetrics {
                rect: GlyphRect {
                    x: 2,
                    y: 2,
                    width: 3,
                    height: 1,
                },
                advance: 3.0,
            },
        )],
    )
    .unwrap_err();

    assert!(matches!(err, ResourceError::InvalidData(_)));
    assert_eq!(device.live_images(), 0);
    assert_eq!(device.submission_count(), 0);
}

#[test]
fn test_concurrent_uploads() {
    let device = Arc::new(HeadlessDevice::new());
    let (_pools, uploader) = uploader(&device);
    let uploader = Arc::new(uploader);

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let uploader = uploader.clone();
            std::thread::spawn(move || {
                let texture = Texture::from_pixels(
                    &uploader,
                    &[i; 4],
                    2,
                    2,
                    PixelFormat::R8Unorm,
                    &SamplerDesc::nearest(),
                )
                .unwrap();
                texture.image().handle()
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(uploader.statistics().uploads, 4);
    assert_eq!(device.live_images(), 0);
    assert!(device.validation_errors().is_empty());
}
