//! Integration tests for the frame loop on the headless device.

use std::sync::Arc;

use framesync_core::SyncConfig;
use framesync_frame::{CommandPoolManager, FrameBegin, FrameLoop, OffscreenTarget, PoolCategory};
use framesync_rhi::RhiError;
use framesync_rhi::command::LayoutTransition;
use framesync_rhi::headless::{Fault, HeadlessDevice};
use framesync_rhi::image::{Image, ImageDesc};
use framesync_rhi::vk;

fn config(frames: usize, timeout_ms: u64) -> SyncConfig {
    SyncConfig {
        max_frames_in_flight: frames,
        fence_timeout_ms: timeout_ms,
        offscreen_images: 3,
    }
}

fn frame_loop(
    device: &Arc<HeadlessDevice>,
    config: &SyncConfig,
) -> FrameLoop<OffscreenTarget> {
    let pools = Arc::new(CommandPoolManager::new(device.clone()));
    let target = OffscreenTarget::new(device.clone(), config.offscreen_images).unwrap();
    FrameLoop::new(device.clone(), pools, target, config).unwrap()
}

fn run_frame(frames: &mut FrameLoop<OffscreenTarget>) {
    match frames.begin_frame().unwrap() {
        FrameBegin::Ready(frame) => {
            frames.end_frame(frame).unwrap();
        }
        other => panic!("expected a ready frame, got {:?}", other),
    }
}

#[test]
fn test_many_frames_without_validation_errors() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(2, 0));

    for _ in 0..10 {
        run_frame(&mut frames);
    }

    assert!(
        device.validation_errors().is_empty(),
        "{:?}",
        device.validation_errors()
    );

    let stats = frames.sync().statistics();
    assert_eq!(stats.total_frames_rendered, 10);
    assert_eq!(stats.current_frame_index, 0);
    assert_eq!(stats.fence_wait_timeouts, 0);
    assert_eq!(stats.total_fence_resets, 10);
    // Two acquire semaphores plus one render-complete semaphore per image
    assert_eq!(stats.active_semaphore_count, 5);
    assert_eq!(frames.target().presented_count(), 10);
}

#[test]
fn test_first_frames_do_not_block() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(2, 0));

    run_frame(&mut frames);
    run_frame(&mut frames);

    // Nothing was forced to complete: both slots are still in flight
    assert_eq!(device.pending_submissions(), 6);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn test_slot_buffers_are_recycled() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(2, 0));

    for _ in 0..6 {
        run_frame(&mut frames);
    }

    let graphics = frames.pools().graphics_pool().unwrap();
    // One buffer per slot stays checked out until the slot comes around again
    assert_eq!(graphics.allocated_count(), 2);
    assert_eq!(graphics.statistics().free_requests, 4);
}

#[test]
fn test_stalled_gpu_times_out_without_touching_the_slot() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(2, 5));

    run_frame(&mut frames);
    run_frame(&mut frames);

    device.stall(true);
    assert!(matches!(frames.begin_frame().unwrap(), FrameBegin::TimedOut));
    assert!(matches!(frames.begin_frame().unwrap(), FrameBegin::TimedOut));
    assert_eq!(frames.sync().statistics().fence_wait_timeouts, 2);
    assert_eq!(frames.sync().statistics().total_fence_resets, 2);

    device.stall(false);
    run_frame(&mut frames);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn test_infinite_wait_on_hung_gpu_reports_device_lost() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(1, 0));

    run_frame(&mut frames);
    device.stall(true);

    let err = frames.begin_frame().unwrap_err();
    assert!(err.is_device_lost());

    device.stall(false);
}

#[test]
fn test_out_of_date_keeps_fence_signaled() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(2, 0));

    frames.target_mut().invalidate();
    assert!(matches!(frames.begin_frame().unwrap(), FrameBegin::OutOfDate));

    let slot = frames.sync().frame_slot(0).unwrap();
    assert!(slot.completion_fence().is_signaled());

    run_frame(&mut frames);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn test_end_frame_out_of_order_rejected() {
    let device = Arc::new(HeadlessDevice::new());
    let mut first = frame_loop(&device, &config(2, 0));
    let mut second = frame_loop(&device, &config(2, 0));

    run_frame(&mut second);
    let FrameBegin::Ready(frame) = first.begin_frame().unwrap() else {
        panic!("expected a ready frame");
    };
    let FrameBegin::Ready(other) = second.begin_frame().unwrap() else {
        panic!("expected a ready frame");
    };

    // `other` belongs to slot 1 while `first` is on slot 0
    assert!(matches!(
        first.end_frame(other),
        Err(RhiError::InvalidArgument(_))
    ));
    first.end_frame(frame).unwrap();
}

#[test]
fn test_recorded_transition_executes_with_the_frame() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(2, 0));

    let image = Image::new(
        device.clone(),
        ImageDesc::texture(
            vk::Extent2D {
                width: 2,
                height: 2,
            },
            vk::Format::R8_UNORM,
        ),
    )
    .unwrap();

    let FrameBegin::Ready(frame) = frames.begin_frame().unwrap() else {
        panic!("expected a ready frame");
    };
    frame
        .command_buffer()
        .transition_image_layout(image.handle(), LayoutTransition::UndefinedToTransferDst);
    frames.end_frame(frame).unwrap();

    assert_eq!(device.image_layout(image.handle()), Some(vk::ImageLayout::UNDEFINED));
    frames.wait_for_all_frames().unwrap();
    assert_eq!(
        device.image_layout(image.handle()),
        Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
    );
}

#[test]
fn test_dispose_releases_everything() {
    let device = Arc::new(HeadlessDevice::new());
    let pools = Arc::new(CommandPoolManager::new(device.clone()));
    let target = OffscreenTarget::new(device.clone(), 3).unwrap();
    let mut frames = FrameLoop::new(device.clone(), pools.clone(), target, &config(3, 0)).unwrap();

    for _ in 0..5 {
        run_frame(&mut frames);
    }

    frames.dispose().unwrap();
    frames.dispose().unwrap();
    assert_eq!(device.live_fences(), 0);
    assert_eq!(device.live_semaphores(), 0);
    assert_eq!(pools.graphics_pool().unwrap().allocated_count(), 0);

    pools.dispose();
    assert_eq!(device.live_command_pools(), 0);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn test_reset_all_isolates_failures() {
    let device = Arc::new(HeadlessDevice::new());
    let manager = CommandPoolManager::new(device.clone());

    let pools: Vec<_> = PoolCategory::ALL
        .iter()
        .map(|&category| manager.get_or_create(category).unwrap())
        .collect();
    device.inject_fault(Fault::PoolReset(pools[1].handle()));

    let outcome = manager.reset_all(false);

    assert_eq!(outcome.succeeded, 3);
    assert_eq!(outcome.failed, 1);
    assert_eq!(pools[0].statistics().reset_count, 1);
    assert_eq!(pools[1].statistics().reset_count, 0);
    assert_eq!(pools[2].statistics().reset_count, 1);
    assert_eq!(pools[3].statistics().reset_count, 1);
}

#[test]
fn test_graphics_pool_is_cached() {
    let manager = CommandPoolManager::new(Arc::new(HeadlessDevice::new()));
    let a = manager.graphics_pool().unwrap();
    let b = manager.graphics_pool().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_concurrent_get_or_create_yields_one_pool() {
    let device = Arc::new(HeadlessDevice::new());
    let manager = Arc::new(CommandPoolManager::new(device.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                manager
                    .get_or_create(PoolCategory::TransientGraphics)
                    .unwrap()
                    .handle()
            })
        })
        .collect();

    let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(pools.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(device.live_command_pools(), 1);
}

#[test]
fn test_allocate_free_symmetry_through_manager() {
    let manager = CommandPoolManager::new(Arc::new(HeadlessDevice::new()));
    let pool = manager.graphics_pool().unwrap();

    let buffers = pool.allocate(3, vk::CommandBufferLevel::PRIMARY).unwrap();
    assert_eq!(manager.aggregate_statistics().total_allocated, 3);

    pool.free(&buffers).unwrap();
    let stats = manager.aggregate_statistics();
    assert_eq!(stats.total_allocated, 0);
    assert_eq!(stats.primary_count, 0);
    assert_eq!(stats.estimated_memory_bytes, 0);
}

#[test]
fn test_failed_buffer_allocation_leaves_slot_usable() {
    let device = Arc::new(HeadlessDevice::new());
    let mut frames = frame_loop(&device, &config(1, 5));

    run_frame(&mut frames);

    device.inject_fault(Fault::CommandBufferAllocation);
    let err = frames.begin_frame().unwrap_err();
    assert!(matches!(
        err,
        RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    ));

    let slot = frames.sync().frame_slot(0).unwrap();
    assert!(slot.completion_fence().is_signaled());

    // The slot recovers once the device stops failing
    for _ in 0..3 {
        run_frame(&mut frames);
    }
    assert_eq!(frames.sync().statistics().fence_wait_timeouts, 0);
    assert_eq!(frames.sync().statistics().total_frames_rendered, 4);
    assert!(
        device.validation_errors().is_empty(),
        "{:?}",
        device.validation_errors()
    );
}

#[test]
fn test_dispose_isolates_pool_failures() {
    let device = Arc::new(HeadlessDevice::new());
    let manager = CommandPoolManager::new(device.clone());

    let pools: Vec<_> = PoolCategory::ALL
        .iter()
        .map(|&category| manager.get_or_create(category).unwrap())
        .collect();
    pools[2].allocate(2, vk::CommandBufferLevel::PRIMARY).unwrap();
    device.inject_fault(Fault::PoolDestroy(pools[1].handle()));

    let outcome = manager.dispose();

    assert_eq!(outcome.succeeded, PoolCategory::ALL.len() - 1);
    assert_eq!(outcome.failed, 1);
    assert!(!outcome.is_complete());
    // Only the failing pool is still alive
    assert_eq!(device.live_command_pools(), 1);
    assert_eq!(device.live_command_buffers(), 0);
    assert!(manager.is_disposed());

    // Dropping the last handle retries the release
    drop(pools);
    assert_eq!(device.live_command_pools(), 0);
}
