//! Physical device (GPU) selection.
//!
//! # Overview
//!
//! The physical device selection process involves:
//! 1. Enumerating all available GPUs
//! 2. Checking each GPU for a graphics queue family and Vulkan 1.1
//! 3. Discovering dedicated transfer and compute families
//! 4. Selecting the most suitable GPU (preferring discrete GPUs)
//!
//! No surface is involved: presentation is an external collaborator of the
//! frame-sync subsystem.
//!
//! # Example
//!
//! ```no_run
//! use framesync_rhi::instance::Instance;
//! use framesync_rhi::physical_device::select_physical_device;
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let instance = Instance::new(false)?;
//! let device_info = select_physical_device(instance.handle())?;
//! println!("Selected GPU: {:?}", device_info.device_name());
//! # Ok(())
//! # }
//! ```

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;

/// Queue family indices for the three queue types the subsystem submits to.
///
/// Transfer and compute fall back to the graphics family when the device has
/// no dedicated family for them; the graphics family accepts both kinds of
/// work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Index of the queue family that supports graphics operations.
    pub graphics_family: u32,
    /// Index of the queue family used for compute operations.
    pub compute_family: u32,
    /// Index of the queue family used for transfer operations.
    pub transfer_family: u32,
}

impl QueueFamilyIndices {
    /// Indices for a device that exposes only a graphics family.
    pub fn graphics_only(graphics_family: u32) -> Self {
        Self {
            graphics_family,
            compute_family: graphics_family,
            transfer_family: graphics_family,
        }
    }

    /// Whether transfer work has a family separate from graphics.
    #[inline]
    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer_family != self.graphics_family
    }

    /// Whether compute work has a family separate from graphics.
    #[inline]
    pub fn has_dedicated_compute(&self) -> bool {
        self.compute_family != self.graphics_family
    }

    /// Returns the unique queue family indices as a vector.
    ///
    /// This is useful when creating logical devices to avoid creating
    /// duplicate queues for the same family.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        families.push(self.graphics_family);

        if !families.contains(&self.compute_family) {
            families.push(self.compute_family);
        }
        if !families.contains(&self.transfer_family) {
            families.push(self.transfer_family);
        }

        families
    }
}

/// Information about a physical device (GPU).
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family indices for different operations.
    pub queue_families: QueueFamilyIndices,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Device")
        }
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns the Vulkan API version supported by the device.
    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Selects the most suitable physical device.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no GPU has a graphics queue family
/// and Vulkan 1.1 support.
pub fn select_physical_device(instance: &ash::Instance) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let mut suitable_devices: Vec<(PhysicalDeviceInfo, u32)> = Vec::new();

    for device in devices {
        if let Some(info) = check_device_suitability(instance, device) {
            let score = rate_device(&info);
            debug!(
                "GPU '{}' ({}) - Score: {}",
                info.device_name(),
                info.device_type_name(),
                score
            );
            suitable_devices.push((info, score));
        }
    }

    suitable_devices.sort_by(|a, b| b.1.cmp(&a.1));
    let Some((selected_device, score)) = suitable_devices.into_iter().next() else {
        warn!("No suitable GPU found with required capabilities");
        return Err(RhiError::NoSuitableGpu);
    };

    let (major, minor, patch) = selected_device.api_version();
    info!(
        "Selected GPU: '{}' ({}) - Vulkan {}.{}.{}, Score: {}, queues: {:?}",
        selected_device.device_name(),
        selected_device.device_type_name(),
        major,
        minor,
        patch,
        score,
        selected_device.queue_families
    );

    Ok(selected_device)
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    let device_name = unsafe {
        CStr::from_ptr(properties.device_name.as_ptr())
            .to_str()
            .unwrap_or("Unknown")
    };

    let family_properties =
        unsafe { instance.get_physical_device_queue_family_properties(device) };
    let Some(queue_families) = find_queue_families(&family_properties) else {
        debug!("GPU '{}' skipped: no graphics queue family", device_name);
        return None;
    };

    // vkTrimCommandPool is core in 1.1
    if vk::api_version_major(properties.api_version) == 1
        && vk::api_version_minor(properties.api_version) < 1
    {
        debug!(
            "GPU '{}' skipped: Vulkan 1.1 not supported (version: {}.{})",
            device_name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version)
        );
        return None;
    }

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
    })
}

/// Finds queue family indices, preferring dedicated transfer and compute
/// families. Returns `None` without a graphics family.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
) -> Option<QueueFamilyIndices> {
    let mut graphics_family: Option<u32> = None;
    let mut dedicated_transfer_family: Option<u32> = None;
    let mut dedicated_compute_family: Option<u32> = None;
    let mut other_transfer_family: Option<u32> = None;

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;

        if family.queue_count == 0 {
            continue;
        }

        let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let has_compute = family.queue_flags.contains(vk::QueueFlags::COMPUTE);
        let has_transfer = family.queue_flags.contains(vk::QueueFlags::TRANSFER);

        if has_graphics && graphics_family.is_none() {
            graphics_family = Some(i);
        }

        if has_compute && !has_graphics && dedicated_compute_family.is_none() {
            dedicated_compute_family = Some(i);
        }

        // Transfer-only families are the copy engines; any other non-graphics
        // family is a second choice.
        if !has_graphics && (has_transfer || has_compute) {
            if has_transfer && !has_compute && dedicated_transfer_family.is_none() {
                dedicated_transfer_family = Some(i);
            } else if other_transfer_family.is_none() {
                other_transfer_family = Some(i);
            }
        }
    }

    let graphics_family = graphics_family?;

    Some(QueueFamilyIndices {
        graphics_family,
        compute_family: dedicated_compute_family.unwrap_or(graphics_family),
        transfer_family: dedicated_transfer_family
            .or(other_transfer_family)
            .unwrap_or(graphics_family),
    })
}

/// Rates a physical device based on its capabilities.
///
/// Higher scores indicate more desirable devices.
fn rate_device(info: &PhysicalDeviceInfo) -> u32 {
    let mut score = 0u32;

    match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 10000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 1000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 100,
        vk::PhysicalDeviceType::CPU => score += 10,
        _ => score += 1,
    }

    score += info.properties.limits.max_image_dimension2_d;

    let vram_mb = (info.device_local_memory() / (1024 * 1024)) as u32;
    score += vram_mb.min(16000);

    // Uploads overlap with rendering on a separate copy queue
    if info.queue_families.has_dedicated_transfer() {
        score += 100;
    }
    if info.queue_families.has_dedicated_compute() {
        score += 100;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_graphics_only_falls_back() {
        let indices = QueueFamilyIndices::graphics_only(0);
        assert!(!indices.has_dedicated_transfer());
        assert!(!indices.has_dedicated_compute());
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn test_unique_families_no_duplicates() {
        let indices = QueueFamilyIndices {
            graphics_family: 0,
            compute_family: 1,
            transfer_family: 2,
        };
        assert_eq!(indices.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn test_find_queue_families_prefers_dedicated() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = find_queue_families(&families).unwrap();
        assert_eq!(indices.graphics_family, 0);
        assert_eq!(indices.compute_family, 1);
        assert_eq!(indices.transfer_family, 2);
    }

    #[test]
    fn test_find_queue_families_single_family() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let indices = find_queue_families(&families).unwrap();
        assert_eq!(indices, QueueFamilyIndices::graphics_only(0));
    }

    #[test]
    fn test_find_queue_families_requires_graphics() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        assert!(find_queue_families(&families).is_none());
    }

    #[test]
    fn test_empty_families_skipped() {
        let mut empty = family(vk::QueueFlags::TRANSFER);
        empty.queue_count = 0;
        let families = [family(vk::QueueFlags::GRAPHICS), empty];
        let indices = find_queue_families(&families).unwrap();
        assert!(!indices.has_dedicated_transfer());
    }
}
