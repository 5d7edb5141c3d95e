/*!
# Driver boundary for the Vulkan decoder.

The decoder core never links against the Vulkan loader. Every driver call
goes through one of the dispatch traits in this crate, mirroring how the
driver itself hands out per-instance and per-device function-pointer
tables:

  - [`EntryDispatch`] covers the pre-instance entry points.
  - [`InstanceDispatch`] covers instance-level and physical-device calls.
  - [`DeviceDispatch`] covers everything keyed by a `VkDevice`, including
    queue and command-buffer entry points.

[`loaded::AshEntry`] and friends implement the traits on top of `ash`'s
loaded function tables; tests implement them with a recording mock.

All trait methods are `unsafe`: the caller owns handle validity and
external synchronization exactly as the Vulkan spec demands of a driver
caller.
!*/

pub mod external;
pub mod external_memory_host;
pub mod loaded;

use std::sync::Arc;

use ash::vk;

/// `Result` alias matching ash's convention: the error arm is the raw
/// `VkResult` code from the driver.
pub type DriverResult<T> = Result<T, vk::Result>;

/// Pre-instance entry points.
pub trait EntryDispatch: Send + Sync {
    /// # Safety
    ///
    /// `create_info` and everything it points to must be valid for the
    /// duration of the call.
    unsafe fn create_instance(
        &self,
        create_info: &vk::InstanceCreateInfo,
    ) -> DriverResult<(vk::Instance, Arc<dyn InstanceDispatch>)>;
}

/// Instance-level entry points, bound to one `VkInstance`.
///
/// # Safety
///
/// All methods require the handles passed in to belong to this instance
/// and to be externally synchronized per the Vulkan spec.
#[allow(clippy::missing_safety_doc)]
pub trait InstanceDispatch: Send + Sync {
    unsafe fn destroy_instance(&self);

    unsafe fn enumerate_physical_devices(&self) -> DriverResult<Vec<vk::PhysicalDevice>>;
    unsafe fn get_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties;
    unsafe fn get_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties;
    unsafe fn get_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties>;
    unsafe fn get_physical_device_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties;
    unsafe fn get_physical_device_features(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceFeatures;
    unsafe fn get_physical_device_external_semaphore_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &vk::PhysicalDeviceExternalSemaphoreInfo,
    ) -> vk::ExternalSemaphoreProperties;
    unsafe fn get_physical_device_external_fence_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        info: &vk::PhysicalDeviceExternalFenceInfo,
    ) -> vk::ExternalFenceProperties;

    /// Creates the device and loads its dispatch table in one step, so a
    /// freshly created `VkDevice` is never observable without a table.
    unsafe fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo,
    ) -> DriverResult<(vk::Device, Arc<dyn DeviceDispatch>)>;
}

/// Device-level entry points, bound to one `VkDevice`.
///
/// Extension entry points (`vkGetMemoryFdKHR`, host-pointer properties,
/// external fd import/export) return `ERROR_EXTENSION_NOT_PRESENT` when the
/// device was created without the matching extension.
///
/// # Safety
///
/// All methods require the handles passed in to belong to this device and
/// to be externally synchronized per the Vulkan spec.
#[allow(clippy::missing_safety_doc)]
pub trait DeviceDispatch: Send + Sync {
    unsafe fn destroy_device(&self);
    unsafe fn get_device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue;
    unsafe fn device_wait_idle(&self) -> DriverResult<()>;

    // Memory.
    unsafe fn allocate_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo,
    ) -> DriverResult<vk::DeviceMemory>;
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> DriverResult<*mut u8>;
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);
    unsafe fn get_memory_fd(&self, info: &vk::MemoryGetFdInfoKHR) -> DriverResult<i32>;
    unsafe fn get_memory_host_pointer_properties(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        host_pointer: *const std::ffi::c_void,
    ) -> DriverResult<vk::MemoryHostPointerPropertiesEXT>;

    // Buffers.
    unsafe fn create_buffer(&self, create_info: &vk::BufferCreateInfo) -> DriverResult<vk::Buffer>;
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);
    unsafe fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> DriverResult<()>;

    // Images and views.
    unsafe fn create_image(&self, create_info: &vk::ImageCreateInfo) -> DriverResult<vk::Image>;
    unsafe fn destroy_image(&self, image: vk::Image);
    unsafe fn get_image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> DriverResult<()>;
    unsafe fn bind_image_memory2(&self, binds: &[vk::BindImageMemoryInfo]) -> DriverResult<()>;
    unsafe fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo,
    ) -> DriverResult<vk::ImageView>;
    unsafe fn destroy_image_view(&self, view: vk::ImageView);
    unsafe fn create_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo,
    ) -> DriverResult<vk::Sampler>;
    unsafe fn destroy_sampler(&self, sampler: vk::Sampler);

    // Semaphores.
    unsafe fn create_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo,
    ) -> DriverResult<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    unsafe fn signal_semaphore(&self, info: &vk::SemaphoreSignalInfo) -> DriverResult<()>;
    unsafe fn get_semaphore_counter_value(&self, semaphore: vk::Semaphore) -> DriverResult<u64>;
    unsafe fn wait_semaphores(
        &self,
        info: &vk::SemaphoreWaitInfo,
        timeout_ns: u64,
    ) -> DriverResult<()>;
    unsafe fn get_semaphore_fd(&self, info: &vk::SemaphoreGetFdInfoKHR) -> DriverResult<i32>;
    unsafe fn import_semaphore_fd(&self, info: &vk::ImportSemaphoreFdInfoKHR) -> DriverResult<()>;

    // Fences.
    unsafe fn create_fence(&self, create_info: &vk::FenceCreateInfo) -> DriverResult<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> DriverResult<()>;
    unsafe fn get_fence_status(&self, fence: vk::Fence) -> DriverResult<bool>;
    unsafe fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> DriverResult<()>;
    unsafe fn get_fence_fd(&self, info: &vk::FenceGetFdInfoKHR) -> DriverResult<i32>;

    // Command pools and buffers.
    unsafe fn create_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo,
    ) -> DriverResult<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> DriverResult<()>;
    unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo,
    ) -> DriverResult<Vec<vk::CommandBuffer>>;
    unsafe fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    );
    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo,
    ) -> DriverResult<()>;
    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()>;
    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> DriverResult<()>;

    // Descriptors.
    unsafe fn create_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> DriverResult<vk::DescriptorSetLayout>;
    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    unsafe fn create_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo,
    ) -> DriverResult<vk::DescriptorPool>;
    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    unsafe fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> DriverResult<()>;
    unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo,
    ) -> DriverResult<Vec<vk::DescriptorSet>>;
    unsafe fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> DriverResult<()>;
    unsafe fn update_descriptor_sets(
        &self,
        writes: &[vk::WriteDescriptorSet],
        copies: &[vk::CopyDescriptorSet],
    );

    // Pipeline-state objects.
    unsafe fn create_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo,
    ) -> DriverResult<vk::ShaderModule>;
    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule);
    unsafe fn create_pipeline_cache(
        &self,
        create_info: &vk::PipelineCacheCreateInfo,
    ) -> DriverResult<vk::PipelineCache>;
    unsafe fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);
    unsafe fn create_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo,
    ) -> DriverResult<vk::PipelineLayout>;
    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    unsafe fn create_compute_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::ComputePipelineCreateInfo],
    ) -> DriverResult<Vec<vk::Pipeline>>;
    unsafe fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::GraphicsPipelineCreateInfo],
    ) -> DriverResult<Vec<vk::Pipeline>>;
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    unsafe fn create_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo,
    ) -> DriverResult<vk::RenderPass>;
    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    unsafe fn create_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo,
    ) -> DriverResult<vk::Framebuffer>;
    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Queues.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()>;
    unsafe fn queue_submit2(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo2],
        fence: vk::Fence,
    ) -> DriverResult<()>;
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()>;

    // Command recording. Only the entry points the decoder rewrites or
    // emits itself appear here; everything else is the marshaller's
    // passthrough concern.
    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    );
    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    unsafe fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );
    unsafe fn cmd_copy_image2(&self, command_buffer: vk::CommandBuffer, info: &vk::CopyImageInfo2);
    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    unsafe fn cmd_copy_buffer_to_image2(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &vk::CopyBufferToImageInfo2,
    );
    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    unsafe fn cmd_copy_image_to_buffer2(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &vk::CopyImageToBufferInfo2,
    );
    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    );
    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
}
