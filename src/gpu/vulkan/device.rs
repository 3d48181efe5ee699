//! Vulkan device implementation

use std::ptr::NonNull;

use ash::vk;
use ash::vk::Handle;

use crate::gpu::traits::{
    BufferHandle, BufferUsage, DeviceLimits, DeviceMemoryHandle, DeviceSize, FenceHandle,
    GpuAllocError, GpuDevice, MemoryHeap, MemoryProperties, MemoryPropertyFlags,
    MemoryRequirements, MemoryType, NativeHandle,
};

/// [`GpuDevice`] over a Vulkan logical device.
///
/// The logical device is borrowed: dropping an `AshDevice` does not destroy
/// it, and it must outlive every allocator built on top.
pub struct AshDevice {
    device: ash::Device,
    properties: MemoryProperties,
    limits: DeviceLimits,
}

impl AshDevice {
    /// Wrap `device`, querying memory properties and limits from
    /// `physical_device`.
    ///
    /// # Safety
    ///
    /// `device` must have been created from `physical_device` on `instance`.
    pub unsafe fn new(instance: &ash::Instance, physical_device: vk::PhysicalDevice, device: ash::Device) -> Self {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let limits = instance.get_physical_device_properties(physical_device).limits;

        let memory_types = memory_properties.memory_types[..memory_properties.memory_type_count as usize]
            .iter()
            .map(|t| MemoryType {
                property_flags: MemoryPropertyFlags::from_raw(t.property_flags.as_raw()),
                heap_index: t.heap_index,
            })
            .collect();
        let memory_heaps = memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
            .iter()
            .map(|h| MemoryHeap {
                size: h.size,
                device_local: h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
            })
            .collect();

        Self {
            device,
            properties: MemoryProperties {
                memory_types,
                memory_heaps,
            },
            limits: DeviceLimits {
                max_memory_allocation_count: limits.max_memory_allocation_count,
                min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
                min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
                min_texel_buffer_offset_alignment: limits.min_texel_buffer_offset_alignment,
                non_coherent_atom_size: limits.non_coherent_atom_size,
                buffer_image_granularity: limits.buffer_image_granularity,
            },
        }
    }

    /// The wrapped logical device.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn memory_range(memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(vk::DeviceMemory::from_raw(memory.0))
            .offset(offset)
            .size(size)
            .build()
    }
}

fn map_vk_error(result: vk::Result) -> GpuAllocError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GpuAllocError::OutOfDeviceMemory,
        vk::Result::ERROR_MEMORY_MAP_FAILED => GpuAllocError::MappingFailed,
        other => GpuAllocError::Backend(format!("{:?}", other)),
    }
}

// Vulkan requires external synchronization only on the objects passed to a
// call, never on the device itself.
impl GpuDevice for AshDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn allocate_memory(&self, size: DeviceSize, memory_type_index: u32) -> Result<DeviceMemoryHandle, GpuAllocError> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        // SAFETY: valid create info; the device outlives self.
        let memory = unsafe { self.device.allocate_memory(&info, None) }.map_err(map_vk_error)?;
        Ok(DeviceMemoryHandle(memory.as_raw()))
    }

    fn free_memory(&self, memory: DeviceMemoryHandle) {
        // SAFETY: the handle came from allocate_memory and is freed once.
        unsafe { self.device.free_memory(vk::DeviceMemory::from_raw(memory.0), None) };
    }

    fn map_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<NonNull<u8>, GpuAllocError> {
        // SAFETY: the memory is host-visible and not currently mapped.
        let ptr = unsafe {
            self.device.map_memory(
                vk::DeviceMemory::from_raw(memory.0),
                offset,
                size,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(map_vk_error)?;
        NonNull::new(ptr.cast::<u8>()).ok_or(GpuAllocError::MappingFailed)
    }

    fn unmap_memory(&self, memory: DeviceMemoryHandle) {
        // SAFETY: the memory is mapped.
        unsafe { self.device.unmap_memory(vk::DeviceMemory::from_raw(memory.0)) };
    }

    fn flush_mapped_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError> {
        let range = Self::memory_range(memory, offset, size);
        // SAFETY: the range lies inside a mapped allocation and is atom aligned.
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }.map_err(map_vk_error)
    }

    fn invalidate_mapped_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError> {
        let range = Self::memory_range(memory, offset, size);
        // SAFETY: the range lies inside a mapped allocation and is atom aligned.
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }.map_err(map_vk_error)
    }

    fn create_buffer(&self, size: DeviceSize, usage: BufferUsage) -> Result<(BufferHandle, MemoryRequirements), GpuAllocError> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::from_raw(usage.as_raw()))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: valid create info.
        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(map_vk_error)?;
        // SAFETY: the buffer was just created.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        Ok((
            BufferHandle(buffer.as_raw()),
            MemoryRequirements {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
            },
        ))
    }

    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: DeviceMemoryHandle, offset: DeviceSize) -> Result<(), GpuAllocError> {
        // SAFETY: the buffer is unbound and the offset satisfies its requirements.
        unsafe {
            self.device.bind_buffer_memory(
                vk::Buffer::from_raw(buffer.0),
                vk::DeviceMemory::from_raw(memory.0),
                offset,
            )
        }
        .map_err(map_vk_error)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        // SAFETY: no pending GPU work references the buffer.
        unsafe { self.device.destroy_buffer(vk::Buffer::from_raw(buffer.0), None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, GpuAllocError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        // SAFETY: valid create info.
        let fence = unsafe { self.device.create_fence(&info, None) }.map_err(map_vk_error)?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        // SAFETY: the fence is not part of a pending submission.
        unsafe { self.device.destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<bool, GpuAllocError> {
        // SAFETY: the fence is alive.
        unsafe { self.device.get_fence_status(vk::Fence::from_raw(fence.0)) }.map_err(map_vk_error)
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<bool, GpuAllocError> {
        // SAFETY: the fence is alive.
        match unsafe { self.device.wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(map_vk_error(err)),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), GpuAllocError> {
        // SAFETY: the fence is not part of a pending submission.
        unsafe { self.device.reset_fences(&[vk::Fence::from_raw(fence.0)]) }.map_err(map_vk_error)
    }

    fn destroy_other(&self, handle: NativeHandle) {
        // SAFETY: deferred deletion only hands over objects whose last use has
        // retired.
        unsafe {
            match handle {
                NativeHandle::Buffer(buffer) => self.destroy_buffer(buffer),
                NativeHandle::Fence(fence) => self.destroy_fence(fence),
                NativeHandle::DeviceMemory(memory) => self.free_memory(memory),
                NativeHandle::BufferView(raw) => self.device.destroy_buffer_view(vk::BufferView::from_raw(raw), None),
                NativeHandle::Image(raw) => self.device.destroy_image(vk::Image::from_raw(raw), None),
                NativeHandle::ImageView(raw) => self.device.destroy_image_view(vk::ImageView::from_raw(raw), None),
                NativeHandle::Pipeline(raw) => self.device.destroy_pipeline(vk::Pipeline::from_raw(raw), None),
                NativeHandle::PipelineLayout(raw) => {
                    self.device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(raw), None)
                }
                NativeHandle::Sampler(raw) => self.device.destroy_sampler(vk::Sampler::from_raw(raw), None),
                NativeHandle::ShaderModule(raw) => {
                    self.device.destroy_shader_module(vk::ShaderModule::from_raw(raw), None)
                }
                NativeHandle::Framebuffer(raw) => self.device.destroy_framebuffer(vk::Framebuffer::from_raw(raw), None),
                NativeHandle::RenderPass(raw) => self.device.destroy_render_pass(vk::RenderPass::from_raw(raw), None),
                NativeHandle::DescriptorSetLayout(raw) => self
                    .device
                    .destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(raw), None),
                NativeHandle::QueryPool(raw) => self.device.destroy_query_pool(vk::QueryPool::from_raw(raw), None),
                NativeHandle::Semaphore(raw) => self.device.destroy_semaphore(vk::Semaphore::from_raw(raw), None),
                NativeHandle::Event(raw) => self.device.destroy_event(vk::Event::from_raw(raw), None),
            }
        }
    }
}
