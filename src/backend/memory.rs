// Memory-backed resources for the transfer
//
// Provides the device-local source image and the host-visible readback
// buffer, each owning its memory. Two backing strategies:
// - Dedicated: one vkAllocateMemory per resource, first matching memory type
// - Allocator: sub-allocated through gpu-allocator

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::VulkanDevice;

/// How image and buffer memory is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    Dedicated,
    Allocator,
}

/// A memory type satisfying a resource's requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeMatch {
    pub type_index: u32,
    pub heap_index: u32,
}

/// All memory types allowed by `type_filter` that carry every flag in `required`,
/// in index order
pub fn find_memory_types(
    mem_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Vec<MemoryTypeMatch> {
    let count = mem_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .filter(|&i| type_filter & (1 << i) != 0)
        .filter_map(|i| {
            let memory_type = mem_properties.memory_types[i as usize];
            memory_type.property_flags.contains(required).then_some(MemoryTypeMatch {
                type_index: i,
                heap_index: memory_type.heap_index,
            })
        })
        .collect()
}

enum Backing {
    Dedicated(vk::DeviceMemory),
    Allocated(Allocation),
}

impl Backing {
    fn new(
        device: &VulkanDevice,
        strategy: AllocationStrategy,
        name: &str,
        requirements: vk::MemoryRequirements,
        required_flags: vk::MemoryPropertyFlags,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Self> {
        match strategy {
            AllocationStrategy::Dedicated => {
                let matches = find_memory_types(
                    &device.memory_properties,
                    requirements.memory_type_bits,
                    required_flags,
                );
                let chosen = matches
                    .first()
                    .with_context(|| format!("Failed to find suitable memory type for {}", name))?;

                log::debug!(
                    "{}: {} bytes from memory type {} (heap {})",
                    name,
                    requirements.size,
                    chosen.type_index,
                    chosen.heap_index
                );

                let alloc_info = vk::MemoryAllocateInfo::builder()
                    .allocation_size(requirements.size)
                    .memory_type_index(chosen.type_index);

                let memory = unsafe {
                    device.device.allocate_memory(&alloc_info, None)
                        .with_context(|| format!("Failed to allocate {} memory", name))?
                };

                Ok(Backing::Dedicated(memory))
            }
            AllocationStrategy::Allocator => {
                let mut guard = device.allocator.lock();
                let allocator = guard
                    .as_mut()
                    .context("Memory allocator already released")?;

                let allocation = allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location,
                        linear,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .with_context(|| format!("Failed to allocate {} memory", name))?;

                if !allocation.memory_properties().contains(required_flags) {
                    let flags = allocation.memory_properties();
                    let _ = allocator.free(allocation);
                    anyhow::bail!(
                        "Allocator placed {} in memory with {:?}, need {:?}",
                        name,
                        flags,
                        required_flags
                    );
                }

                log::debug!(
                    "{}: {} bytes at offset {} (dedicated block: {})",
                    name,
                    allocation.size(),
                    allocation.offset(),
                    allocation.is_dedicated()
                );

                Ok(Backing::Allocated(allocation))
            }
        }
    }

    fn memory_and_offset(&self) -> (vk::DeviceMemory, vk::DeviceSize) {
        match self {
            Backing::Dedicated(memory) => (*memory, 0),
            Backing::Allocated(allocation) => unsafe { (allocation.memory(), allocation.offset()) },
        }
    }

    fn release(self, device: &VulkanDevice) {
        match self {
            Backing::Dedicated(memory) => unsafe {
                device.device.free_memory(memory, None);
            },
            Backing::Allocated(allocation) => {
                if let Some(allocator) = device.allocator.lock().as_mut() {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free allocation: {}", e);
                    }
                }
            }
        }
    }
}

/// Optimal-tiling 2D image in device-local memory
pub struct DeviceImage {
    pub image: vk::Image,
    backing: Option<Backing>,
    device: Arc<VulkanDevice>,
}

impl DeviceImage {
    pub fn new(
        device: &Arc<VulkanDevice>,
        strategy: AllocationStrategy,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            device.device.create_image(&image_info, None)
                .context("Failed to create image")?
        };

        // From here on Drop owns the image, even if allocation fails
        let mut this = Self {
            image,
            backing: None,
            device: Arc::clone(device),
        };

        let mem_requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let backing = Backing::new(
            device,
            strategy,
            "image",
            mem_requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::GpuOnly,
            false,
        )?;
        let (memory, offset) = backing.memory_and_offset();
        this.backing = Some(backing);

        unsafe {
            device.device.bind_image_memory(image, memory, offset)
                .context("Failed to bind image memory")?;
        }

        Ok(this)
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(backing) = self.backing.take() {
            backing.release(&self.device);
        }
    }
}

/// Host-visible, host-coherent buffer for reading transfer results back
pub struct HostBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    backing: Option<Backing>,
    device: Arc<VulkanDevice>,
}

impl HostBuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        strategy: AllocationStrategy,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device.device.create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let mut this = Self {
            buffer,
            size,
            backing: None,
            device: Arc::clone(device),
        };

        let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let backing = Backing::new(
            device,
            strategy,
            "buffer",
            mem_requirements,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            MemoryLocation::GpuToCpu,
            true,
        )?;
        let (memory, offset) = backing.memory_and_offset();
        this.backing = Some(backing);

        unsafe {
            device.device.bind_buffer_memory(buffer, memory, offset)
                .context("Failed to bind buffer memory")?;
        }

        Ok(this)
    }

    /// Copy the buffer contents out of mapped memory.
    ///
    /// Only valid once the GPU work writing the buffer has completed.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let len = self.size as usize;

        match self.backing.as_ref() {
            Some(Backing::Dedicated(memory)) => unsafe {
                let ptr = self.device.device.map_memory(
                    *memory,
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                )
                .context("Failed to map buffer memory")? as *const u8;

                let bytes = std::slice::from_raw_parts(ptr, len).to_vec();
                self.device.device.unmap_memory(*memory);
                Ok(bytes)
            },
            Some(Backing::Allocated(allocation)) => {
                let mapped = allocation
                    .mapped_slice()
                    .context("Buffer allocation is not host mapped")?;
                mapped
                    .get(..len)
                    .map(<[u8]>::to_vec)
                    .context("Buffer allocation smaller than requested size")
            }
            None => anyhow::bail!("Buffer has no memory bound"),
        }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
        if let Some(backing) = self.backing.take() {
            backing.release(&self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[(vk::MemoryPropertyFlags, u32)]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &(flags, heap)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: heap,
            };
        }
        props
    }

    // Layout seen on typical discrete GPUs
    fn discrete_layout() -> vk::PhysicalDeviceMemoryProperties {
        memory_properties(&[
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                1,
            ),
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                1,
            ),
            (
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                2,
            ),
        ])
    }

    #[test]
    fn finds_all_matching_types_in_order() {
        let props = discrete_layout();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let found = find_memory_types(&props, u32::MAX, host);

        assert_eq!(
            found,
            vec![
                MemoryTypeMatch { type_index: 1, heap_index: 1 },
                MemoryTypeMatch { type_index: 2, heap_index: 1 },
                MemoryTypeMatch { type_index: 3, heap_index: 2 },
            ]
        );
    }

    #[test]
    fn type_filter_excludes_types() {
        let props = discrete_layout();

        let found = find_memory_types(&props, 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL);

        assert_eq!(found, vec![MemoryTypeMatch { type_index: 3, heap_index: 2 }]);
    }

    #[test]
    fn types_beyond_count_are_ignored() {
        let mut props = discrete_layout();
        props.memory_type_count = 1;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert!(find_memory_types(&props, u32::MAX, host).is_empty());
    }

    #[test]
    fn empty_flags_match_every_allowed_type() {
        let props = discrete_layout();
        let found = find_memory_types(&props, 0b0101, vk::MemoryPropertyFlags::empty());

        let indices: Vec<_> = found.iter().map(|m| m.type_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }
}
