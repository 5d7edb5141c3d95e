//! Test support: a recording mock driver and inert collaborators.
//!
//! The mock hands out fake handles, keeps byte backings for memory so
//! mapped pointers and copies behave, executes recorded transfer
//! commands at submit time, and logs every entry point so tests can
//! assert exactly what reached the "driver".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use vkdecoder_core::emulation::{NoopExternalObjects, NoopVmOps};
use vkdecoder_core::{Features, Global};

#[derive(Clone, Debug)]
#[allow(dead_code)]
enum RecordedCmd {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    Dispatch,
}

#[derive(Default)]
struct BufferState {
    size: u64,
    memory: vk::DeviceMemory,
    offset: u64,
}

#[derive(Default)]
struct ImageState {
    byte_size: u64,
    memory: vk::DeviceMemory,
    offset: u64,
}

#[derive(Default)]
pub struct MockState {
    next_handle: AtomicU64,
    pub calls: Mutex<Vec<String>>,
    memories: Mutex<std::collections::HashMap<vk::DeviceMemory, Vec<u8>>>,
    buffers: Mutex<std::collections::HashMap<vk::Buffer, BufferState>>,
    images: Mutex<std::collections::HashMap<vk::Image, ImageState>>,
    fences: Mutex<std::collections::HashMap<vk::Fence, bool>>,
    semaphores: Mutex<std::collections::HashMap<vk::Semaphore, u64>>,
    commands: Mutex<std::collections::HashMap<vk::CommandBuffer, Vec<RecordedCmd>>>,
    queues: Mutex<std::collections::HashMap<(u32, u32), vk::Queue>>,
    pub etc2_supported: bool,
}

pub struct MockDriver(pub Arc<MockState>);

impl MockDriver {
    pub fn new(etc2_supported: bool) -> Arc<Self> {
        Arc::new(Self(Arc::new(MockState {
            // Step keeps the low bit clear so virtual-queue synthesis
            // has the bit to itself.
            next_handle: AtomicU64::new(0x1000),
            etc2_supported,
            ..Default::default()
        })))
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.calls.lock().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.0.calls.lock().iter().filter(|c| *c == name).count()
    }

    fn log(&self, name: &str) {
        self.0.calls.lock().push(name.to_owned());
    }

    fn mint(&self) -> u64 {
        self.0.next_handle.fetch_add(16, Ordering::Relaxed)
    }

    fn execute(&self, command_buffers: &[vk::CommandBuffer]) {
        let commands = self.0.commands.lock();
        let buffers = self.0.buffers.lock();
        let images = self.0.images.lock();
        let mut memories = self.0.memories.lock();
        for cb in command_buffers {
            for cmd in commands.get(cb).map(|v| v.as_slice()).unwrap_or(&[]) {
                match cmd {
                    RecordedCmd::CopyBuffer { src, dst, regions } => {
                        let (Some(src), Some(dst)) = (buffers.get(src), buffers.get(dst)) else {
                            continue;
                        };
                        for region in regions {
                            let data: Vec<u8> = {
                                let Some(backing) = memories.get(&src.memory) else {
                                    continue;
                                };
                                let start = (src.offset + region.src_offset) as usize;
                                backing[start..start + region.size as usize].to_vec()
                            };
                            if let Some(backing) = memories.get_mut(&dst.memory) {
                                let start = (dst.offset + region.dst_offset) as usize;
                                backing[start..start + data.len()].copy_from_slice(&data);
                            }
                        }
                    }
                    RecordedCmd::CopyBufferToImage { src, dst, regions } => {
                        let (Some(src), Some(dst)) = (buffers.get(src), images.get(dst)) else {
                            continue;
                        };
                        for region in regions {
                            let len = (dst.byte_size as usize)
                                .min((src.size - region.buffer_offset) as usize);
                            let data: Vec<u8> = {
                                let Some(backing) = memories.get(&src.memory) else {
                                    continue;
                                };
                                let start = (src.offset + region.buffer_offset) as usize;
                                backing[start..(start + len).min(backing.len())].to_vec()
                            };
                            if let Some(backing) = memories.get_mut(&dst.memory) {
                                let start = dst.offset as usize;
                                let end = (start + data.len()).min(backing.len());
                                backing[start..end].copy_from_slice(&data[..end - start]);
                            }
                        }
                    }
                    RecordedCmd::CopyImageToBuffer { src, dst, regions } => {
                        let (Some(src), Some(dst)) = (images.get(src), buffers.get(dst)) else {
                            continue;
                        };
                        for region in regions {
                            let data: Vec<u8> = {
                                let Some(backing) = memories.get(&src.memory) else {
                                    continue;
                                };
                                let start = src.offset as usize;
                                let end =
                                    (start + src.byte_size as usize).min(backing.len());
                                backing[start..end].to_vec()
                            };
                            if let Some(backing) = memories.get_mut(&dst.memory) {
                                let start = (dst.offset + region.buffer_offset) as usize;
                                let end = (start + data.len()).min(backing.len());
                                backing[start..end].copy_from_slice(&data[..end - start]);
                            }
                        }
                    }
                    RecordedCmd::Dispatch => {}
                }
            }
        }
    }
}

impl hal::EntryDispatch for MockDriver {
    unsafe fn create_instance(
        &self,
        _create_info: &vk::InstanceCreateInfo,
    ) -> hal::DriverResult<(vk::Instance, Arc<dyn hal::InstanceDispatch>)> {
        self.log("create_instance");
        let instance = vk::Instance::from_raw(self.mint());
        Ok((instance, Arc::new(MockDriver(self.0.clone()))))
    }
}

impl hal::InstanceDispatch for MockDriver {
    unsafe fn destroy_instance(&self) {
        self.log("destroy_instance");
    }

    unsafe fn enumerate_physical_devices(&self) -> hal::DriverResult<Vec<vk::PhysicalDevice>> {
        self.log("enumerate_physical_devices");
        Ok(vec![vk::PhysicalDevice::from_raw(0x51)])
    }

    unsafe fn get_physical_device_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            api_version: vk::API_VERSION_1_3,
            driver_version: 1,
            vendor_id: 0x1234,
            device_id: 0x5678,
            device_type: vk::PhysicalDeviceType::VIRTUAL_GPU,
            ..Default::default()
        }
    }

    unsafe fn get_physical_device_memory_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 1,
            ..Default::default()
        };
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        props.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props
    }

    unsafe fn get_physical_device_queue_family_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        vec![vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
            queue_count: 1,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        }]
    }

    unsafe fn get_physical_device_format_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties {
        let compressed = matches!(
            format,
            vk::Format::ETC2_R8G8B8_UNORM_BLOCK
                | vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK
                | vk::Format::EAC_R11_UNORM_BLOCK
        );
        if compressed && !self.0.etc2_supported {
            return vk::FormatProperties::default();
        }
        vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::TRANSFER_SRC
                | vk::FormatFeatureFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    unsafe fn get_physical_device_features(
        &self,
        _physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures {
            texture_compression_etc2: self.0.etc2_supported as u32,
            texture_compression_astc_ldr: vk::FALSE,
            ..Default::default()
        }
    }

    unsafe fn get_physical_device_external_semaphore_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
        _info: &vk::PhysicalDeviceExternalSemaphoreInfo,
    ) -> vk::ExternalSemaphoreProperties {
        vk::ExternalSemaphoreProperties {
            external_semaphore_features: vk::ExternalSemaphoreFeatureFlags::EXPORTABLE,
            ..Default::default()
        }
    }

    unsafe fn get_physical_device_external_fence_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
        _info: &vk::PhysicalDeviceExternalFenceInfo,
    ) -> vk::ExternalFenceProperties {
        vk::ExternalFenceProperties {
            external_fence_features: vk::ExternalFenceFeatureFlags::EXPORTABLE,
            ..Default::default()
        }
    }

    unsafe fn create_device(
        &self,
        _physical_device: vk::PhysicalDevice,
        _create_info: &vk::DeviceCreateInfo,
    ) -> hal::DriverResult<(vk::Device, Arc<dyn hal::DeviceDispatch>)> {
        self.log("create_device");
        let device = vk::Device::from_raw(self.mint());
        Ok((device, Arc::new(MockDriver(self.0.clone()))))
    }
}

impl hal::DeviceDispatch for MockDriver {
    unsafe fn destroy_device(&self) {
        self.log("destroy_device");
    }

    unsafe fn get_device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        *self
            .0
            .queues
            .lock()
            .entry((family_index, queue_index))
            .or_insert_with(|| vk::Queue::from_raw(self.mint()))
    }

    unsafe fn device_wait_idle(&self) -> hal::DriverResult<()> {
        self.log("device_wait_idle");
        Ok(())
    }

    unsafe fn allocate_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo,
    ) -> hal::DriverResult<vk::DeviceMemory> {
        self.log("allocate_memory");
        let memory = vk::DeviceMemory::from_raw(self.mint());
        self.0
            .memories
            .lock()
            .insert(memory, vec![0u8; allocate_info.allocation_size as usize]);
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.log("free_memory");
        self.0.memories.lock().remove(&memory);
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> hal::DriverResult<*mut u8> {
        let mut memories = self.0.memories.lock();
        let backing = memories
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        Ok(backing.as_mut_ptr().add(offset as usize))
    }

    unsafe fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    unsafe fn get_memory_fd(&self, _info: &vk::MemoryGetFdInfoKHR) -> hal::DriverResult<i32> {
        Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    unsafe fn get_memory_host_pointer_properties(
        &self,
        _handle_type: vk::ExternalMemoryHandleTypeFlags,
        _host_pointer: *const std::ffi::c_void,
    ) -> hal::DriverResult<vk::MemoryHostPointerPropertiesEXT> {
        Ok(vk::MemoryHostPointerPropertiesEXT {
            memory_type_bits: 0b11,
            ..Default::default()
        })
    }

    unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo,
    ) -> hal::DriverResult<vk::Buffer> {
        self.log("create_buffer");
        let buffer = vk::Buffer::from_raw(self.mint());
        self.0.buffers.lock().insert(
            buffer,
            BufferState {
                size: create_info.size,
                ..Default::default()
            },
        );
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.log("destroy_buffer");
        self.0.buffers.lock().remove(&buffer);
    }

    unsafe fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.0.buffers.lock().get(&buffer).map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: 0b11,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> hal::DriverResult<()> {
        self.log("bind_buffer_memory");
        if let Some(state) = self.0.buffers.lock().get_mut(&buffer) {
            state.memory = memory;
            state.offset = offset;
        }
        Ok(())
    }

    unsafe fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
    ) -> hal::DriverResult<vk::Image> {
        self.log("create_image");
        let image = vk::Image::from_raw(self.mint());
        let bytes_per_texel: u64 = match create_info.format {
            vk::Format::R32G32_UINT => 8,
            vk::Format::R32G32B32A32_UINT => 16,
            _ => 4,
        };
        let mut byte_size = 0u64;
        for level in 0..create_info.mip_levels {
            let w = (create_info.extent.width >> level).max(1) as u64;
            let h = (create_info.extent.height >> level).max(1) as u64;
            let d = (create_info.extent.depth >> level).max(1) as u64;
            byte_size += w * h * d * create_info.array_layers as u64 * bytes_per_texel;
        }
        self.0.images.lock().insert(
            image,
            ImageState {
                byte_size,
                ..Default::default()
            },
        );
        Ok(image)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.log("destroy_image");
        self.0.images.lock().remove(&image);
    }

    unsafe fn get_image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self.0.images.lock().get(&image).map_or(0, |i| i.byte_size);
        vk::MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: 0b11,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> hal::DriverResult<()> {
        self.log("bind_image_memory");
        if let Some(state) = self.0.images.lock().get_mut(&image) {
            state.memory = memory;
            state.offset = offset;
        }
        Ok(())
    }

    unsafe fn bind_image_memory2(&self, binds: &[vk::BindImageMemoryInfo]) -> hal::DriverResult<()> {
        self.log("bind_image_memory2");
        for bind in binds {
            self.bind_image_memory(bind.image, bind.memory, bind.memory_offset)?;
        }
        Ok(())
    }

    unsafe fn create_image_view(
        &self,
        _create_info: &vk::ImageViewCreateInfo,
    ) -> hal::DriverResult<vk::ImageView> {
        self.log("create_image_view");
        Ok(vk::ImageView::from_raw(self.mint()))
    }

    unsafe fn destroy_image_view(&self, _view: vk::ImageView) {
        self.log("destroy_image_view");
    }

    unsafe fn create_sampler(
        &self,
        _create_info: &vk::SamplerCreateInfo,
    ) -> hal::DriverResult<vk::Sampler> {
        self.log("create_sampler");
        Ok(vk::Sampler::from_raw(self.mint()))
    }

    unsafe fn destroy_sampler(&self, _sampler: vk::Sampler) {
        self.log("destroy_sampler");
    }

    unsafe fn create_semaphore(
        &self,
        _create_info: &vk::SemaphoreCreateInfo,
    ) -> hal::DriverResult<vk::Semaphore> {
        self.log("create_semaphore");
        let semaphore = vk::Semaphore::from_raw(self.mint());
        self.0.semaphores.lock().insert(semaphore, 0);
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.log("destroy_semaphore");
        self.0.semaphores.lock().remove(&semaphore);
    }

    unsafe fn signal_semaphore(&self, info: &vk::SemaphoreSignalInfo) -> hal::DriverResult<()> {
        let mut semaphores = self.0.semaphores.lock();
        let value = semaphores.entry(info.semaphore).or_insert(0);
        *value = (*value).max(info.value);
        Ok(())
    }

    unsafe fn get_semaphore_counter_value(
        &self,
        semaphore: vk::Semaphore,
    ) -> hal::DriverResult<u64> {
        Ok(*self.0.semaphores.lock().get(&semaphore).unwrap_or(&0))
    }

    unsafe fn wait_semaphores(
        &self,
        _info: &vk::SemaphoreWaitInfo,
        _timeout_ns: u64,
    ) -> hal::DriverResult<()> {
        Ok(())
    }

    unsafe fn get_semaphore_fd(&self, _info: &vk::SemaphoreGetFdInfoKHR) -> hal::DriverResult<i32> {
        Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    unsafe fn import_semaphore_fd(
        &self,
        _info: &vk::ImportSemaphoreFdInfoKHR,
    ) -> hal::DriverResult<()> {
        Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    unsafe fn create_fence(&self, create_info: &vk::FenceCreateInfo) -> hal::DriverResult<vk::Fence> {
        self.log("create_fence");
        let fence = vk::Fence::from_raw(self.mint());
        let signaled = create_info.flags.contains(vk::FenceCreateFlags::SIGNALED);
        self.0.fences.lock().insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.log("destroy_fence");
        self.0.fences.lock().remove(&fence);
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> hal::DriverResult<()> {
        let mut map = self.0.fences.lock();
        for fence in fences {
            map.insert(*fence, false);
        }
        Ok(())
    }

    unsafe fn get_fence_status(&self, fence: vk::Fence) -> hal::DriverResult<bool> {
        Ok(*self.0.fences.lock().get(&fence).unwrap_or(&false))
    }

    unsafe fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        _timeout_ns: u64,
    ) -> hal::DriverResult<()> {
        let map = self.0.fences.lock();
        let check = |fence: &vk::Fence| *map.get(fence).unwrap_or(&false);
        let ok = if wait_all {
            fences.iter().all(check)
        } else {
            fences.iter().any(check)
        };
        if ok {
            Ok(())
        } else {
            Err(vk::Result::TIMEOUT)
        }
    }

    unsafe fn get_fence_fd(&self, _info: &vk::FenceGetFdInfoKHR) -> hal::DriverResult<i32> {
        Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    unsafe fn create_command_pool(
        &self,
        _create_info: &vk::CommandPoolCreateInfo,
    ) -> hal::DriverResult<vk::CommandPool> {
        self.log("create_command_pool");
        Ok(vk::CommandPool::from_raw(self.mint()))
    }

    unsafe fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.log("destroy_command_pool");
    }

    unsafe fn reset_command_pool(
        &self,
        _pool: vk::CommandPool,
        _flags: vk::CommandPoolResetFlags,
    ) -> hal::DriverResult<()> {
        Ok(())
    }

    unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo,
    ) -> hal::DriverResult<Vec<vk::CommandBuffer>> {
        self.log("allocate_command_buffers");
        let mut out = Vec::new();
        for _ in 0..allocate_info.command_buffer_count {
            let cb = vk::CommandBuffer::from_raw(self.mint());
            self.0.commands.lock().insert(cb, Vec::new());
            out.push(cb);
        }
        Ok(out)
    }

    unsafe fn free_command_buffers(
        &self,
        _pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let mut commands = self.0.commands.lock();
        for cb in command_buffers {
            commands.remove(cb);
        }
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _begin_info: &vk::CommandBufferBeginInfo,
    ) -> hal::DriverResult<()> {
        self.0.commands.lock().insert(command_buffer, Vec::new());
        Ok(())
    }

    unsafe fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> hal::DriverResult<()> {
        Ok(())
    }

    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferResetFlags,
    ) -> hal::DriverResult<()> {
        self.0.commands.lock().insert(command_buffer, Vec::new());
        Ok(())
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        _create_info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> hal::DriverResult<vk::DescriptorSetLayout> {
        self.log("create_descriptor_set_layout");
        Ok(vk::DescriptorSetLayout::from_raw(self.mint()))
    }

    unsafe fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.log("destroy_descriptor_set_layout");
    }

    unsafe fn create_descriptor_pool(
        &self,
        _create_info: &vk::DescriptorPoolCreateInfo,
    ) -> hal::DriverResult<vk::DescriptorPool> {
        self.log("create_descriptor_pool");
        Ok(vk::DescriptorPool::from_raw(self.mint()))
    }

    unsafe fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.log("destroy_descriptor_pool");
    }

    unsafe fn reset_descriptor_pool(&self, _pool: vk::DescriptorPool) -> hal::DriverResult<()> {
        self.log("reset_descriptor_pool");
        Ok(())
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo,
    ) -> hal::DriverResult<Vec<vk::DescriptorSet>> {
        self.log("allocate_descriptor_sets");
        Ok((0..allocate_info.descriptor_set_count)
            .map(|_| vk::DescriptorSet::from_raw(self.mint()))
            .collect())
    }

    unsafe fn free_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        _sets: &[vk::DescriptorSet],
    ) -> hal::DriverResult<()> {
        self.log("free_descriptor_sets");
        Ok(())
    }

    unsafe fn update_descriptor_sets(
        &self,
        _writes: &[vk::WriteDescriptorSet],
        _copies: &[vk::CopyDescriptorSet],
    ) {
        self.log("update_descriptor_sets");
    }

    unsafe fn create_shader_module(
        &self,
        _create_info: &vk::ShaderModuleCreateInfo,
    ) -> hal::DriverResult<vk::ShaderModule> {
        self.log("create_shader_module");
        Ok(vk::ShaderModule::from_raw(self.mint()))
    }

    unsafe fn destroy_shader_module(&self, _module: vk::ShaderModule) {}

    unsafe fn create_pipeline_cache(
        &self,
        _create_info: &vk::PipelineCacheCreateInfo,
    ) -> hal::DriverResult<vk::PipelineCache> {
        Ok(vk::PipelineCache::from_raw(self.mint()))
    }

    unsafe fn destroy_pipeline_cache(&self, _cache: vk::PipelineCache) {}

    unsafe fn create_pipeline_layout(
        &self,
        _create_info: &vk::PipelineLayoutCreateInfo,
    ) -> hal::DriverResult<vk::PipelineLayout> {
        self.log("create_pipeline_layout");
        Ok(vk::PipelineLayout::from_raw(self.mint()))
    }

    unsafe fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    unsafe fn create_compute_pipelines(
        &self,
        _cache: vk::PipelineCache,
        create_infos: &[vk::ComputePipelineCreateInfo],
    ) -> hal::DriverResult<Vec<vk::Pipeline>> {
        self.log("create_compute_pipelines");
        Ok(create_infos
            .iter()
            .map(|_| vk::Pipeline::from_raw(self.mint()))
            .collect())
    }

    unsafe fn create_graphics_pipelines(
        &self,
        _cache: vk::PipelineCache,
        create_infos: &[vk::GraphicsPipelineCreateInfo],
    ) -> hal::DriverResult<Vec<vk::Pipeline>> {
        self.log("create_graphics_pipelines");
        Ok(create_infos
            .iter()
            .map(|_| vk::Pipeline::from_raw(self.mint()))
            .collect())
    }

    unsafe fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.log("destroy_pipeline");
    }

    unsafe fn create_render_pass(
        &self,
        _create_info: &vk::RenderPassCreateInfo,
    ) -> hal::DriverResult<vk::RenderPass> {
        self.log("create_render_pass");
        Ok(vk::RenderPass::from_raw(self.mint()))
    }

    unsafe fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {}

    unsafe fn create_framebuffer(
        &self,
        _create_info: &vk::FramebufferCreateInfo,
    ) -> hal::DriverResult<vk::Framebuffer> {
        self.log("create_framebuffer");
        Ok(vk::Framebuffer::from_raw(self.mint()))
    }

    unsafe fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {}

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> hal::DriverResult<()> {
        self.log("queue_submit");
        for submit in submits {
            if submit.command_buffer_count == 0 {
                continue;
            }
            let cbs = std::slice::from_raw_parts(
                submit.p_command_buffers,
                submit.command_buffer_count as usize,
            );
            self.execute(cbs);
        }
        if fence != vk::Fence::null() {
            self.0.fences.lock().insert(fence, true);
        }
        Ok(())
    }

    unsafe fn queue_submit2(
        &self,
        _queue: vk::Queue,
        submits: &[vk::SubmitInfo2],
        fence: vk::Fence,
    ) -> hal::DriverResult<()> {
        self.log("queue_submit2");
        for submit in submits {
            if submit.command_buffer_info_count > 0 {
                let cb_infos = std::slice::from_raw_parts(
                    submit.p_command_buffer_infos,
                    submit.command_buffer_info_count as usize,
                );
                let cbs: Vec<vk::CommandBuffer> =
                    cb_infos.iter().map(|i| i.command_buffer).collect();
                self.execute(&cbs);
            }
            if submit.signal_semaphore_info_count > 0 {
                let signals = std::slice::from_raw_parts(
                    submit.p_signal_semaphore_infos,
                    submit.signal_semaphore_info_count as usize,
                );
                let mut semaphores = self.0.semaphores.lock();
                for signal in signals {
                    let value = semaphores.entry(signal.semaphore).or_insert(0);
                    *value = (*value).max(signal.value);
                }
            }
        }
        if fence != vk::Fence::null() {
            self.0.fences.lock().insert(fence, true);
        }
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, _queue: vk::Queue) -> hal::DriverResult<()> {
        self.log("queue_wait_idle");
        Ok(())
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        _command_buffer: vk::CommandBuffer,
        _src_stage_mask: vk::PipelineStageFlags,
        _dst_stage_mask: vk::PipelineStageFlags,
        _dependency_flags: vk::DependencyFlags,
        _memory_barriers: &[vk::MemoryBarrier],
        _buffer_barriers: &[vk::BufferMemoryBarrier],
        _image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        self.log("cmd_pipeline_barrier");
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.log("cmd_copy_buffer");
        if let Some(cmds) = self.0.commands.lock().get_mut(&command_buffer) {
            cmds.push(RecordedCmd::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            });
        }
    }

    unsafe fn cmd_copy_image(
        &self,
        _command_buffer: vk::CommandBuffer,
        _src: vk::Image,
        _src_layout: vk::ImageLayout,
        _dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageCopy],
    ) {
        self.log("cmd_copy_image");
    }

    unsafe fn cmd_copy_image2(
        &self,
        _command_buffer: vk::CommandBuffer,
        _info: &vk::CopyImageInfo2,
    ) {
        self.log("cmd_copy_image2");
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.log("cmd_copy_buffer_to_image");
        if let Some(cmds) = self.0.commands.lock().get_mut(&command_buffer) {
            cmds.push(RecordedCmd::CopyBufferToImage {
                src,
                dst,
                regions: regions.to_vec(),
            });
        }
    }

    unsafe fn cmd_copy_buffer_to_image2(
        &self,
        _command_buffer: vk::CommandBuffer,
        _info: &vk::CopyBufferToImageInfo2,
    ) {
        self.log("cmd_copy_buffer_to_image2");
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.log("cmd_copy_image_to_buffer");
        if let Some(cmds) = self.0.commands.lock().get_mut(&command_buffer) {
            cmds.push(RecordedCmd::CopyImageToBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            });
        }
    }

    unsafe fn cmd_copy_image_to_buffer2(
        &self,
        _command_buffer: vk::CommandBuffer,
        _info: &vk::CopyImageToBufferInfo2,
    ) {
        self.log("cmd_copy_image_to_buffer2");
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        _command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _pipeline: vk::Pipeline,
    ) {
        self.log("cmd_bind_pipeline");
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        _sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) {
        self.log("cmd_bind_descriptor_sets");
    }

    unsafe fn cmd_push_constants(
        &self,
        _command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stage_flags: vk::ShaderStageFlags,
        _offset: u32,
        _constants: &[u8],
    ) {
        self.log("cmd_push_constants");
    }

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, _x: u32, _y: u32, _z: u32) {
        self.log("cmd_dispatch");
        if let Some(cmds) = self.0.commands.lock().get_mut(&command_buffer) {
            cmds.push(RecordedCmd::Dispatch);
        }
    }
}

/// Kernel provider double. The real kernels are shader-toolchain build
/// products supplied by the embedder; the mock driver never parses
/// SPIR-V, so a stand-in word sequence is enough to drive the pipeline
/// plumbing end to end.
pub struct TestKernels;

impl vkdecoder_core::emulation::DecompressionKernels for TestKernels {
    fn kernel_spirv(
        &self,
        _class: vkdecoder_core::decompress::CompressedClass,
    ) -> Option<Vec<u32>> {
        Some(vec![0x0723_0203, 0x0001_0000, 0, 8, 0])
    }
}

/// Emulation facade that satisfies the decoder without a compositor.
pub struct TestEmulation;

impl vkdecoder_core::emulation::Emulation for TestEmulation {
    fn color_buffer_allocation_info(
        &self,
        _handle: u32,
    ) -> Option<vkdecoder_core::emulation::AllocationInfo> {
        None
    }
    fn buffer_allocation_info(
        &self,
        _handle: u32,
    ) -> Option<vkdecoder_core::emulation::AllocationInfo> {
        None
    }
    fn dup_color_buffer_external_handle(
        &self,
        _handle: u32,
    ) -> Option<hal::external::ExternalHandle> {
        None
    }
    fn dup_buffer_external_handle(&self, _handle: u32) -> Option<hal::external::ExternalHandle> {
        None
    }
    fn invalidate_color_buffer(&self, _handle: u32) {}
    fn flush_color_buffer(&self, _handle: u32) {}
    fn set_color_buffer_current_layout(&self, _handle: u32, _layout: vk::ImageLayout) {}
    fn decompression_kernels(
        &self,
    ) -> Option<Arc<dyn vkdecoder_core::emulation::DecompressionKernels>> {
        Some(Arc::new(TestKernels))
    }
    fn on_device_lost(&self) {}
}

pub struct TestContext {
    pub global: Arc<Global>,
    pub driver: Arc<MockDriver>,
}

/// Builds a decoder over a fresh mock driver.
pub fn test_context(features: Features, etc2_supported: bool) -> TestContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let driver = MockDriver::new(etc2_supported);
    let global = Global::new(
        driver.clone(),
        Arc::new(TestEmulation),
        Arc::new(NoopExternalObjects),
        Arc::new(NoopVmOps),
        features,
    );
    TestContext { global, driver }
}
