//! Dispatch-table implementations over `ash`'s loaded function pointers.
//!
//! The embedder hands us an [`ash::Entry`]; instances and devices created
//! through it carry their own tables, so two devices from different ICDs
//! coexist. Extension entry points that were promoted to a core version
//! are called through the core table ([`ExtensionFn::Promoted`]).

use std::ffi::CStr;
use std::sync::Arc;

use ash::{extensions::khr, vk};

use crate::{DeviceDispatch, DriverResult, EntryDispatch, InstanceDispatch};

enum ExtensionFn<T> {
    /// The loaded function pointer struct for an extension.
    Extension(T),
    /// The extension was promoted to a core version of Vulkan; call
    /// through the device table instead.
    Promoted,
}

pub struct AshEntry {
    entry: ash::Entry,
}

impl AshEntry {
    pub fn new(entry: ash::Entry) -> Self {
        Self { entry }
    }
}

impl EntryDispatch for AshEntry {
    unsafe fn create_instance(
        &self,
        create_info: &vk::InstanceCreateInfo,
    ) -> DriverResult<(vk::Instance, Arc<dyn InstanceDispatch>)> {
        let raw = self.entry.create_instance(create_info, None)?;
        let handle = raw.handle();
        Ok((handle, Arc::new(AshInstance { raw })))
    }
}

pub struct AshInstance {
    raw: ash::Instance,
}

impl AshInstance {
    pub fn new(raw: ash::Instance) -> Self {
        Self { raw }
    }
}

impl InstanceDispatch for AshInstance {
    unsafe fn destroy_instance(&self) {
        self.raw.destroy_instance(None);
    }

    unsafe fn enumerate_physical_devices(&self) -> DriverResult<Vec<vk::PhysicalDevice>> {
        self.raw.enumerate_physical_devices()
    }

    unsafe fn get_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        self.raw.get_physical_device_properties(physical_device)
    }

    unsafe fn get_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        self.raw
            .get_physical_device_memory_properties(physical_device)
    }

    unsafe fn get_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        self.raw
            .get_physical_device_queue_family_properties(physical_device)
    }

    unsafe fn get_physical_device_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties {
        self.raw
            .get_physical_device_format_properties(physical_device, format)
    }

    unsafe fn get_physical_device_features(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceFeatures {
        self.raw.get_physical_device_features(physical_device)
    }

    unsafe fn get_physical_device_external_semaphore_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &vk::PhysicalDeviceExternalSemaphoreInfo,
    ) -> vk::ExternalSemaphoreProperties {
        let mut props = vk::ExternalSemaphoreProperties::default();
        self.raw.get_physical_device_external_semaphore_properties(
            physical_device,
            info,
            &mut props,
        );
        props
    }

    unsafe fn get_physical_device_external_fence_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &vk::PhysicalDeviceExternalFenceInfo,
    ) -> vk::ExternalFenceProperties {
        let mut props = vk::ExternalFenceProperties::default();
        self.raw
            .get_physical_device_external_fence_properties(physical_device, info, &mut props);
        props
    }

    unsafe fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo,
    ) -> DriverResult<(vk::Device, Arc<dyn DeviceDispatch>)> {
        let raw = self
            .raw
            .create_device(physical_device, create_info, None)?;
        let handle = raw.handle();

        let api_version = self
            .raw
            .get_physical_device_properties(physical_device)
            .api_version;
        let enabled: Vec<&CStr> = (0..create_info.enabled_extension_count as usize)
            .map(|i| unsafe { CStr::from_ptr(*create_info.pp_enabled_extension_names.add(i)) })
            .collect();

        let device = AshDevice::load(&self.raw, raw, api_version, &enabled);
        Ok((handle, Arc::new(device)))
    }
}

struct DeviceExtensionFunctions {
    timeline_semaphore: Option<ExtensionFn<khr::TimelineSemaphore>>,
    synchronization2: Option<ExtensionFn<khr::Synchronization2>>,
    copy_commands2: Option<ExtensionFn<khr::CopyCommands2>>,
    external_memory_fd: Option<khr::ExternalMemoryFd>,
    external_memory_host: Option<crate::external_memory_host::ExternalMemoryHost>,
    external_semaphore_fd: Option<khr::ExternalSemaphoreFd>,
    external_fence_fd: Option<khr::ExternalFenceFd>,
}

pub struct AshDevice {
    raw: ash::Device,
    extension_fns: DeviceExtensionFunctions,
}

fn has_ext(enabled: &[&CStr], name: &CStr) -> bool {
    enabled.iter().any(|e| *e == name)
}

impl AshDevice {
    pub fn load(
        instance: &ash::Instance,
        raw: ash::Device,
        api_version: u32,
        enabled_extensions: &[&CStr],
    ) -> Self {
        let timeline_semaphore = if vk::api_version_minor(api_version) >= 2 {
            Some(ExtensionFn::Promoted)
        } else if has_ext(enabled_extensions, khr::TimelineSemaphore::name()) {
            Some(ExtensionFn::Extension(khr::TimelineSemaphore::new(
                instance, &raw,
            )))
        } else {
            None
        };
        let synchronization2 = if vk::api_version_minor(api_version) >= 3 {
            Some(ExtensionFn::Promoted)
        } else if has_ext(enabled_extensions, khr::Synchronization2::name()) {
            Some(ExtensionFn::Extension(khr::Synchronization2::new(
                instance, &raw,
            )))
        } else {
            None
        };
        let copy_commands2 = if vk::api_version_minor(api_version) >= 3 {
            Some(ExtensionFn::Promoted)
        } else if has_ext(enabled_extensions, khr::CopyCommands2::name()) {
            Some(ExtensionFn::Extension(khr::CopyCommands2::new(
                instance, &raw,
            )))
        } else {
            None
        };
        let extension_fns = DeviceExtensionFunctions {
            timeline_semaphore,
            synchronization2,
            copy_commands2,
            external_memory_fd: has_ext(enabled_extensions, khr::ExternalMemoryFd::name())
                .then(|| khr::ExternalMemoryFd::new(instance, &raw)),
            external_memory_host: has_ext(
                enabled_extensions,
                crate::external_memory_host::ExternalMemoryHost::name(),
            )
            .then(|| crate::external_memory_host::ExternalMemoryHost::new(instance, &raw)),
            external_semaphore_fd: has_ext(enabled_extensions, khr::ExternalSemaphoreFd::name())
                .then(|| khr::ExternalSemaphoreFd::new(instance, &raw)),
            external_fence_fd: has_ext(enabled_extensions, khr::ExternalFenceFd::name())
                .then(|| khr::ExternalFenceFd::new(instance, &raw)),
        };
        Self { raw, extension_fns }
    }
}

impl DeviceDispatch for AshDevice {
    unsafe fn destroy_device(&self) {
        self.raw.destroy_device(None);
    }

    unsafe fn get_device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        self.raw.get_device_queue(family_index, queue_index)
    }

    unsafe fn device_wait_idle(&self) -> DriverResult<()> {
        self.raw.device_wait_idle()
    }

    unsafe fn allocate_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo,
    ) -> DriverResult<vk::DeviceMemory> {
        self.raw.allocate_memory(allocate_info, None)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.raw.free_memory(memory, None)
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> DriverResult<*mut u8> {
        self.raw
            .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
            .map(|p| p.cast())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.raw.unmap_memory(memory)
    }

    unsafe fn get_memory_fd(&self, info: &vk::MemoryGetFdInfoKHR) -> DriverResult<i32> {
        match self.extension_fns.external_memory_fd {
            Some(ref f) => f.get_memory_fd(info),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn get_memory_host_pointer_properties(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        host_pointer: *const std::ffi::c_void,
    ) -> DriverResult<vk::MemoryHostPointerPropertiesEXT> {
        match self.extension_fns.external_memory_host {
            Some(ref f) => f.get_memory_host_pointer_properties(handle_type, host_pointer),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn create_buffer(&self, create_info: &vk::BufferCreateInfo) -> DriverResult<vk::Buffer> {
        self.raw.create_buffer(create_info, None)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.raw.destroy_buffer(buffer, None)
    }

    unsafe fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        self.raw.get_buffer_memory_requirements(buffer)
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> DriverResult<()> {
        self.raw.bind_buffer_memory(buffer, memory, offset)
    }

    unsafe fn create_image(&self, create_info: &vk::ImageCreateInfo) -> DriverResult<vk::Image> {
        self.raw.create_image(create_info, None)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.raw.destroy_image(image, None)
    }

    unsafe fn get_image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        self.raw.get_image_memory_requirements(image)
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> DriverResult<()> {
        self.raw.bind_image_memory(image, memory, offset)
    }

    unsafe fn bind_image_memory2(&self, binds: &[vk::BindImageMemoryInfo]) -> DriverResult<()> {
        self.raw.bind_image_memory2(binds)
    }

    unsafe fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo,
    ) -> DriverResult<vk::ImageView> {
        self.raw.create_image_view(create_info, None)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.raw.destroy_image_view(view, None)
    }

    unsafe fn create_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo,
    ) -> DriverResult<vk::Sampler> {
        self.raw.create_sampler(create_info, None)
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.raw.destroy_sampler(sampler, None)
    }

    unsafe fn create_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo,
    ) -> DriverResult<vk::Semaphore> {
        self.raw.create_semaphore(create_info, None)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.raw.destroy_semaphore(semaphore, None)
    }

    unsafe fn signal_semaphore(&self, info: &vk::SemaphoreSignalInfo) -> DriverResult<()> {
        match self.extension_fns.timeline_semaphore {
            Some(ExtensionFn::Extension(ref ext)) => ext.signal_semaphore(info),
            Some(ExtensionFn::Promoted) => self.raw.signal_semaphore(info),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn get_semaphore_counter_value(&self, semaphore: vk::Semaphore) -> DriverResult<u64> {
        match self.extension_fns.timeline_semaphore {
            Some(ExtensionFn::Extension(ref ext)) => ext.get_semaphore_counter_value(semaphore),
            Some(ExtensionFn::Promoted) => self.raw.get_semaphore_counter_value(semaphore),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn wait_semaphores(
        &self,
        info: &vk::SemaphoreWaitInfo,
        timeout_ns: u64,
    ) -> DriverResult<()> {
        match self.extension_fns.timeline_semaphore {
            Some(ExtensionFn::Extension(ref ext)) => ext.wait_semaphores(info, timeout_ns),
            Some(ExtensionFn::Promoted) => self.raw.wait_semaphores(info, timeout_ns),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn get_semaphore_fd(&self, info: &vk::SemaphoreGetFdInfoKHR) -> DriverResult<i32> {
        match self.extension_fns.external_semaphore_fd {
            Some(ref f) => f.get_semaphore_fd(info),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn import_semaphore_fd(&self, info: &vk::ImportSemaphoreFdInfoKHR) -> DriverResult<()> {
        match self.extension_fns.external_semaphore_fd {
            Some(ref f) => f.import_semaphore_fd(info),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn create_fence(&self, create_info: &vk::FenceCreateInfo) -> DriverResult<vk::Fence> {
        self.raw.create_fence(create_info, None)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.raw.destroy_fence(fence, None)
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> DriverResult<()> {
        self.raw.reset_fences(fences)
    }

    unsafe fn get_fence_status(&self, fence: vk::Fence) -> DriverResult<bool> {
        self.raw.get_fence_status(fence)
    }

    unsafe fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> DriverResult<()> {
        self.raw.wait_for_fences(fences, wait_all, timeout_ns)
    }

    unsafe fn get_fence_fd(&self, info: &vk::FenceGetFdInfoKHR) -> DriverResult<i32> {
        match self.extension_fns.external_fence_fd {
            Some(ref f) => f.get_fence_fd(info),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn create_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo,
    ) -> DriverResult<vk::CommandPool> {
        self.raw.create_command_pool(create_info, None)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.raw.destroy_command_pool(pool, None)
    }

    unsafe fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> DriverResult<()> {
        self.raw.reset_command_pool(pool, flags)
    }

    unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo,
    ) -> DriverResult<Vec<vk::CommandBuffer>> {
        self.raw.allocate_command_buffers(allocate_info)
    }

    unsafe fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        self.raw.free_command_buffers(pool, command_buffers)
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo,
    ) -> DriverResult<()> {
        self.raw.begin_command_buffer(command_buffer, begin_info)
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()> {
        self.raw.end_command_buffer(command_buffer)
    }

    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> DriverResult<()> {
        self.raw.reset_command_buffer(command_buffer, flags)
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> DriverResult<vk::DescriptorSetLayout> {
        self.raw.create_descriptor_set_layout(create_info, None)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.raw.destroy_descriptor_set_layout(layout, None)
    }

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo,
    ) -> DriverResult<vk::DescriptorPool> {
        self.raw.create_descriptor_pool(create_info, None)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.raw.destroy_descriptor_pool(pool, None)
    }

    unsafe fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> DriverResult<()> {
        self.raw
            .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo,
    ) -> DriverResult<Vec<vk::DescriptorSet>> {
        self.raw.allocate_descriptor_sets(allocate_info)
    }

    unsafe fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> DriverResult<()> {
        self.raw.free_descriptor_sets(pool, sets)
    }

    unsafe fn update_descriptor_sets(
        &self,
        writes: &[vk::WriteDescriptorSet],
        copies: &[vk::CopyDescriptorSet],
    ) {
        self.raw.update_descriptor_sets(writes, copies)
    }

    unsafe fn create_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo,
    ) -> DriverResult<vk::ShaderModule> {
        self.raw.create_shader_module(create_info, None)
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.raw.destroy_shader_module(module, None)
    }

    unsafe fn create_pipeline_cache(
        &self,
        create_info: &vk::PipelineCacheCreateInfo,
    ) -> DriverResult<vk::PipelineCache> {
        self.raw.create_pipeline_cache(create_info, None)
    }

    unsafe fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.raw.destroy_pipeline_cache(cache, None)
    }

    unsafe fn create_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo,
    ) -> DriverResult<vk::PipelineLayout> {
        self.raw.create_pipeline_layout(create_info, None)
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.raw.destroy_pipeline_layout(layout, None)
    }

    unsafe fn create_compute_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::ComputePipelineCreateInfo],
    ) -> DriverResult<Vec<vk::Pipeline>> {
        self.raw
            .create_compute_pipelines(cache, create_infos, None)
            .map_err(|(_, err)| err)
    }

    unsafe fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::GraphicsPipelineCreateInfo],
    ) -> DriverResult<Vec<vk::Pipeline>> {
        self.raw
            .create_graphics_pipelines(cache, create_infos, None)
            .map_err(|(_, err)| err)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.raw.destroy_pipeline(pipeline, None)
    }

    unsafe fn create_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo,
    ) -> DriverResult<vk::RenderPass> {
        self.raw.create_render_pass(create_info, None)
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.raw.destroy_render_pass(render_pass, None)
    }

    unsafe fn create_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo,
    ) -> DriverResult<vk::Framebuffer> {
        self.raw.create_framebuffer(create_info, None)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.raw.destroy_framebuffer(framebuffer, None)
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        self.raw.queue_submit(queue, submits, fence)
    }

    unsafe fn queue_submit2(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo2],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        match self.extension_fns.synchronization2 {
            Some(ExtensionFn::Extension(ref ext)) => ext.queue_submit2(queue, submits, fence),
            Some(ExtensionFn::Promoted) => self.raw.queue_submit2(queue, submits, fence),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()> {
        self.raw.queue_wait_idle(queue)
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        self.raw.cmd_pipeline_barrier(
            command_buffer,
            src_stage_mask,
            dst_stage_mask,
            dependency_flags,
            memory_barriers,
            buffer_barriers,
            image_barriers,
        )
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.raw.cmd_copy_buffer(command_buffer, src, dst, regions)
    }

    unsafe fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.raw
            .cmd_copy_image(command_buffer, src, src_layout, dst, dst_layout, regions)
    }

    unsafe fn cmd_copy_image2(&self, command_buffer: vk::CommandBuffer, info: &vk::CopyImageInfo2) {
        match self.extension_fns.copy_commands2 {
            Some(ExtensionFn::Extension(ref ext)) => ext.cmd_copy_image2(command_buffer, info),
            _ => self.raw.cmd_copy_image2(command_buffer, info),
        }
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.raw
            .cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, regions)
    }

    unsafe fn cmd_copy_buffer_to_image2(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &vk::CopyBufferToImageInfo2,
    ) {
        match self.extension_fns.copy_commands2 {
            Some(ExtensionFn::Extension(ref ext)) => {
                ext.cmd_copy_buffer_to_image2(command_buffer, info)
            }
            _ => self.raw.cmd_copy_buffer_to_image2(command_buffer, info),
        }
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.raw
            .cmd_copy_image_to_buffer(command_buffer, src, src_layout, dst, regions)
    }

    unsafe fn cmd_copy_image_to_buffer2(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &vk::CopyImageToBufferInfo2,
    ) {
        match self.extension_fns.copy_commands2 {
            Some(ExtensionFn::Extension(ref ext)) => {
                ext.cmd_copy_image_to_buffer2(command_buffer, info)
            }
            _ => self.raw.cmd_copy_image_to_buffer2(command_buffer, info),
        }
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.raw
            .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.raw.cmd_bind_descriptor_sets(
            command_buffer,
            bind_point,
            layout,
            first_set,
            sets,
            dynamic_offsets,
        )
    }

    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        self.raw
            .cmd_push_constants(command_buffer, layout, stage_flags, offset, constants)
    }

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.raw.cmd_dispatch(command_buffer, x, y, z)
    }
}
