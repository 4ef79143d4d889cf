//! Vulkan logical device and queue management.
//!
//! [`VulkanDevice`] is the production [`GpuDevice`]: an `ash` logical device
//! with one queue per unique family and a gpu-allocator instance for buffer
//! and image memory.
//!
//! # Example
//!
//! ```no_run
//! use framesync_rhi::device::DeviceRef;
//! use framesync_rhi::instance::Instance;
//! use framesync_rhi::physical_device::select_physical_device;
//! use framesync_rhi::vulkan::VulkanDevice;
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let instance = Instance::new(false)?;
//! let physical_device_info = select_physical_device(instance.handle())?;
//! let device: DeviceRef = VulkanDevice::new(&instance, &physical_device_info)?;
//! let graphics_queue = device.graphics_queue();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::BufferUsage;
use crate::command::ImageBarrier;
use crate::device::{GpuDevice, SubmitDesc};
use crate::error::{RhiError, RhiResult};
use crate::image::ImageDesc;
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices};
use crate::sampler::SamplerDesc;

/// Allocator plus the allocation bound to each live handle.
struct Memory {
    allocator: Allocator,
    buffers: HashMap<vk::Buffer, Allocation>,
    images: HashMap<vk::Image, Allocation>,
}

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// Shared across threads as `Arc<dyn GpuDevice>`. Memory bookkeeping is
/// guarded by a mutex; queue access follows Vulkan's external
/// synchronization rules, which the frame loop satisfies by submitting from
/// one thread.
pub struct VulkanDevice {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    memory: ManuallyDrop<Mutex<Memory>>,
    graphics_queue: vk::Queue,
    transfer_queue: Option<vk::Queue>,
    compute_queue: Option<vk::Queue>,
    queue_families: QueueFamilyIndices,
}

impl VulkanDevice {
    /// Creates a logical device with a queue for every unique family and
    /// initializes gpu-allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialization fails.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> Result<Arc<Self>, RhiError> {
        let queue_families = physical_device_info.queue_families;

        let unique_families = queue_families.unique_families();
        let queue_priorities = [1.0f32];

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        debug!(
            "Creating {} queue(s) for families: {:?}",
            queue_create_infos.len(),
            unique_families
        );

        let create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device_info.device, &create_info, None)?
        };

        info!("Logical device created");

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics_family, 0) };
        debug!(
            "Graphics queue retrieved from family {}",
            queue_families.graphics_family
        );

        let transfer_queue = queue_families.has_dedicated_transfer().then(|| {
            debug!(
                "Transfer queue retrieved from family {}",
                queue_families.transfer_family
            );
            unsafe { device.get_device_queue(queue_families.transfer_family, 0) }
        });

        let compute_queue = queue_families.has_dedicated_compute().then(|| {
            debug!(
                "Compute queue retrieved from family {}",
                queue_families.compute_family
            );
            unsafe { device.get_device_queue(queue_families.compute_family, 0) }
        });

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical_device_info.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!("GPU memory allocator initialized");

        Ok(Arc::new(Self {
            device,
            physical_device: physical_device_info.device,
            memory: ManuallyDrop::new(Mutex::new(Memory {
                allocator,
                buffers: HashMap::new(),
                images: HashMap::new(),
            })),
            graphics_queue,
            transfer_queue,
            compute_queue,
            queue_families,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    fn allocate_and_bind_buffer(
        &self,
        buffer: vk::Buffer,
        usage: BufferUsage,
    ) -> RhiResult<Allocation> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.memory.lock().allocator.allocate(&AllocationCreateDesc {
            name: usage.name(),
            requirements,
            location: usage.memory_location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free_allocation(allocation);
            return Err(e.into());
        }

        Ok(allocation)
    }

    fn allocate_and_bind_image(&self, image: vk::Image) -> RhiResult<Allocation> {
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.memory.lock().allocator.allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free_allocation(allocation);
            return Err(e.into());
        }

        Ok(allocation)
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.memory.lock().allocator.free(allocation) {
            error!("Failed to free allocation: {:?}", e);
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn backend_name(&self) -> &'static str {
        "vulkan"
    }

    fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn transfer_queue(&self) -> Option<vk::Queue> {
        self.transfer_queue
    }

    fn compute_queue(&self) -> Option<vk::Queue> {
        self.compute_queue
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            submit.wait_semaphores.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submit.wait_semaphores.iter().map(|w| w.stage).collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signal_semaphores);

        unsafe { self.device.queue_submit(queue, &[submit_info], fence)? };
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> RhiResult<()> {
        unsafe { self.device.queue_wait_idle(queue)? };
        Ok(())
    }

    // =========================================================================
    // Fences and semaphores
    // =========================================================================

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> RhiResult<bool> {
        match unsafe { self.device.wait_for_fences(fences, wait_all, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        unsafe { self.device.reset_fences(fences)? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    // =========================================================================
    // Command pools and buffers
    // =========================================================================

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        unsafe { self.device.destroy_command_pool(pool, None) };
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&alloc_info)? })
    }

    fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    ) -> RhiResult<()> {
        unsafe { self.device.free_command_buffers(pool, buffers) };
        Ok(())
    }

    fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> RhiResult<()> {
        unsafe { self.device.reset_command_pool(pool, flags)? };
        Ok(())
    }

    fn trim_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        unsafe {
            self.device
                .trim_command_pool(pool, vk::CommandPoolTrimFlags::empty())
        };
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(buffer)? };
        Ok(())
    }

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = barrier.to_vk();
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(buffer, src, dst, dst_layout, regions);
        }
    }

    // =========================================================================
    // Memory-backed resources
    // =========================================================================

    fn create_buffer(&self, size: vk::DeviceSize, usage: BufferUsage) -> RhiResult<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        match self.allocate_and_bind_buffer(buffer, usage) {
            Ok(allocation) => {
                self.memory.lock().buffers.insert(buffer, allocation);
                Ok(buffer)
            }
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> RhiResult<()> {
        let memory = self.memory.lock();
        let allocation = memory
            .buffers
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {:?}", buffer)))?;

        let end = offset + data.len() as vk::DeviceSize;
        if end > allocation.size() {
            return Err(RhiError::InvalidArgument(format!(
                "Write exceeds buffer allocation: {} > {}",
                end,
                allocation.size()
            )));
        }

        let mapped_ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| RhiError::InvalidHandle("Buffer memory is not mapped".to_string()))?;

        unsafe {
            let dst = mapped_ptr.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }

        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = self.memory.lock().buffers.remove(&buffer);
        if let Some(allocation) = allocation {
            self.free_allocation(allocation);
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image> {
        desc.validate()?;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None)? };

        match self.allocate_and_bind_image(image) {
            Ok(allocation) => {
                self.memory.lock().images.insert(image, allocation);
                Ok(image)
            }
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        let allocation = self.memory.lock().images.remove(&image);
        if let Some(allocation) = allocation {
            self.free_allocation(allocation);
        }
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        Ok(unsafe { self.device.create_image_view(&view_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        let create_info = desc.to_vk();
        Ok(unsafe { self.device.create_sampler(&create_info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
        }

        {
            let mut memory = self.memory.lock();
            let leaked = memory.buffers.len() + memory.images.len();
            if leaked > 0 {
                warn!("{} allocation(s) still live at device teardown", leaked);
            }
            let buffers: Vec<_> = memory.buffers.drain().collect();
            let images: Vec<_> = memory.images.drain().collect();
            for (buffer, allocation) in buffers {
                let _ = memory.allocator.free(allocation);
                unsafe { self.device.destroy_buffer(buffer, None) };
            }
            for (image, allocation) in images {
                let _ = memory.allocator.free(allocation);
                unsafe { self.device.destroy_image(image, None) };
            }
        }

        // The allocator releases its memory blocks through the device
        unsafe {
            ManuallyDrop::drop(&mut self.memory);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: VulkanDevice is Send+Sync because:
// - ash::Device is Send+Sync
// - queue and physical device handles are plain handles
// - allocator and allocation maps are behind a Mutex
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}
