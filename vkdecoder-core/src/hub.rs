//! The per-kind object tables.
//!
//! One map per Vulkan object kind, keyed by the driver handle, all owned
//! by the [`Global`](crate::Global)'s single state mutex. A duplicate
//! insertion means the driver returned a handle we already track, which
//! violates the registry's reverse-mapping invariant and is fatal.

use ash::vk;

use crate::resource::*;
use crate::FastHashMap;

fn insert_new<K, V>(map: &mut FastHashMap<K, V>, key: K, value: V, kind: &'static str)
where
    K: std::hash::Hash + Eq + Copy + std::fmt::Debug,
{
    if map.insert(key, value).is_some() {
        panic!("duplicate {kind} table entry for driver handle {key:?}");
    }
}

#[derive(Default)]
pub struct ObjectTables {
    pub instances: FastHashMap<vk::Instance, InstanceInfo>,
    pub physical_devices: FastHashMap<vk::PhysicalDevice, PhysicalDeviceInfo>,
    pub devices: FastHashMap<vk::Device, DeviceInfo>,
    pub queues: FastHashMap<vk::Queue, QueueInfo>,
    pub memories: FastHashMap<vk::DeviceMemory, MemoryInfo>,
    pub buffers: FastHashMap<vk::Buffer, BufferInfo>,
    pub images: FastHashMap<vk::Image, ImageInfo>,
    pub image_views: FastHashMap<vk::ImageView, ImageViewInfo>,
    pub samplers: FastHashMap<vk::Sampler, SamplerInfo>,
    pub semaphores: FastHashMap<vk::Semaphore, SemaphoreInfo>,
    pub fences: FastHashMap<vk::Fence, FenceInfo>,
    pub command_buffers: FastHashMap<vk::CommandBuffer, CommandBufferInfo>,
    pub command_pools: FastHashMap<vk::CommandPool, CommandPoolInfo>,
    pub descriptor_pools: FastHashMap<vk::DescriptorPool, DescriptorPoolInfo>,
    pub descriptor_sets: FastHashMap<vk::DescriptorSet, DescriptorSetInfo>,
    pub descriptor_set_layouts: FastHashMap<vk::DescriptorSetLayout, DescriptorSetLayoutInfo>,
    pub descriptor_update_templates:
        FastHashMap<vk::DescriptorUpdateTemplate, DescriptorUpdateTemplateInfo>,
    pub shader_modules: FastHashMap<vk::ShaderModule, ShaderModuleInfo>,
    pub pipeline_caches: FastHashMap<vk::PipelineCache, PipelineCacheInfo>,
    pub pipeline_layouts: FastHashMap<vk::PipelineLayout, PipelineLayoutInfo>,
    pub pipelines: FastHashMap<vk::Pipeline, PipelineInfo>,
    pub render_passes: FastHashMap<vk::RenderPass, RenderPassInfo>,
    pub framebuffers: FastHashMap<vk::Framebuffer, FramebufferInfo>,
}

macro_rules! table_accessors {
    ($($add:ident, $table:ident, $key:ty, $info:ty, $name:literal;)*) => {
        impl ObjectTables {
            $(
                pub fn $add(&mut self, key: $key, info: $info) {
                    insert_new(&mut self.$table, key, info, $name);
                }
            )*
        }
    };
}

table_accessors! {
    add_instance, instances, vk::Instance, InstanceInfo, "instance";
    add_physical_device, physical_devices, vk::PhysicalDevice, PhysicalDeviceInfo, "physical device";
    add_device, devices, vk::Device, DeviceInfo, "device";
    add_queue, queues, vk::Queue, QueueInfo, "queue";
    add_memory, memories, vk::DeviceMemory, MemoryInfo, "memory";
    add_buffer, buffers, vk::Buffer, BufferInfo, "buffer";
    add_image, images, vk::Image, ImageInfo, "image";
    add_image_view, image_views, vk::ImageView, ImageViewInfo, "image view";
    add_sampler, samplers, vk::Sampler, SamplerInfo, "sampler";
    add_semaphore, semaphores, vk::Semaphore, SemaphoreInfo, "semaphore";
    add_fence, fences, vk::Fence, FenceInfo, "fence";
    add_command_buffer, command_buffers, vk::CommandBuffer, CommandBufferInfo, "command buffer";
    add_command_pool, command_pools, vk::CommandPool, CommandPoolInfo, "command pool";
    add_descriptor_pool, descriptor_pools, vk::DescriptorPool, DescriptorPoolInfo, "descriptor pool";
    add_descriptor_set, descriptor_sets, vk::DescriptorSet, DescriptorSetInfo, "descriptor set";
    add_descriptor_set_layout, descriptor_set_layouts, vk::DescriptorSetLayout,
        DescriptorSetLayoutInfo, "descriptor set layout";
    add_descriptor_update_template, descriptor_update_templates, vk::DescriptorUpdateTemplate,
        DescriptorUpdateTemplateInfo, "descriptor update template";
    add_shader_module, shader_modules, vk::ShaderModule, ShaderModuleInfo, "shader module";
    add_pipeline_cache, pipeline_caches, vk::PipelineCache, PipelineCacheInfo, "pipeline cache";
    add_pipeline_layout, pipeline_layouts, vk::PipelineLayout, PipelineLayoutInfo, "pipeline layout";
    add_pipeline, pipelines, vk::Pipeline, PipelineInfo, "pipeline";
    add_render_pass, render_passes, vk::RenderPass, RenderPassInfo, "render pass";
    add_framebuffer, framebuffers, vk::Framebuffer, FramebufferInfo, "framebuffer";
}

/// Everything owned by one device, detached from the tables so it can be
/// destroyed outside the global mutex. Field order is irrelevant; the
/// destroy pass imposes its own ordering.
pub struct DeviceBundle {
    pub device: vk::Device,
    pub info: DeviceInfo,
    pub queues: Vec<(vk::Queue, QueueInfo)>,
    pub memories: Vec<(vk::DeviceMemory, MemoryInfo)>,
    pub buffers: Vec<(vk::Buffer, BufferInfo)>,
    pub images: Vec<(vk::Image, ImageInfo)>,
    pub image_views: Vec<(vk::ImageView, ImageViewInfo)>,
    pub samplers: Vec<(vk::Sampler, SamplerInfo)>,
    pub semaphores: Vec<(vk::Semaphore, SemaphoreInfo)>,
    pub fences: Vec<(vk::Fence, FenceInfo)>,
    pub command_buffers: Vec<(vk::CommandBuffer, CommandBufferInfo)>,
    pub command_pools: Vec<(vk::CommandPool, CommandPoolInfo)>,
    pub descriptor_pools: Vec<(vk::DescriptorPool, DescriptorPoolInfo)>,
    pub descriptor_sets: Vec<(vk::DescriptorSet, DescriptorSetInfo)>,
    pub descriptor_set_layouts: Vec<(vk::DescriptorSetLayout, DescriptorSetLayoutInfo)>,
    pub descriptor_update_templates:
        Vec<(vk::DescriptorUpdateTemplate, DescriptorUpdateTemplateInfo)>,
    pub shader_modules: Vec<(vk::ShaderModule, ShaderModuleInfo)>,
    pub pipeline_caches: Vec<(vk::PipelineCache, PipelineCacheInfo)>,
    pub pipeline_layouts: Vec<(vk::PipelineLayout, PipelineLayoutInfo)>,
    pub pipelines: Vec<(vk::Pipeline, PipelineInfo)>,
    pub render_passes: Vec<(vk::RenderPass, RenderPassInfo)>,
    pub framebuffers: Vec<(vk::Framebuffer, FramebufferInfo)>,
}

macro_rules! drain_owned {
    ($tables:expr, $table:ident, $device:expr) => {{
        let keys: Vec<_> = $tables
            .$table
            .iter()
            .filter(|(_, info)| info.device == $device)
            .map(|(&k, _)| k)
            .collect();
        keys.into_iter()
            .map(|k| {
                let info = $tables.$table.remove(&k).unwrap();
                (k, info)
            })
            .collect::<Vec<_>>()
    }};
}

impl ObjectTables {
    /// Detaches the device record and every table entry it owns.
    pub fn extract_device(&mut self, device: vk::Device) -> Option<DeviceBundle> {
        let info = self.devices.remove(&device)?;
        Some(DeviceBundle {
            device,
            info,
            queues: drain_owned!(self, queues, device),
            memories: drain_owned!(self, memories, device),
            buffers: drain_owned!(self, buffers, device),
            images: drain_owned!(self, images, device),
            image_views: drain_owned!(self, image_views, device),
            samplers: drain_owned!(self, samplers, device),
            semaphores: drain_owned!(self, semaphores, device),
            fences: drain_owned!(self, fences, device),
            command_buffers: drain_owned!(self, command_buffers, device),
            command_pools: drain_owned!(self, command_pools, device),
            descriptor_pools: drain_owned!(self, descriptor_pools, device),
            descriptor_sets: drain_owned!(self, descriptor_sets, device),
            descriptor_set_layouts: drain_owned!(self, descriptor_set_layouts, device),
            descriptor_update_templates: drain_owned!(self, descriptor_update_templates, device),
            shader_modules: drain_owned!(self, shader_modules, device),
            pipeline_caches: drain_owned!(self, pipeline_caches, device),
            pipeline_layouts: drain_owned!(self, pipeline_layouts, device),
            pipelines: drain_owned!(self, pipelines, device),
            render_passes: drain_owned!(self, render_passes, device),
            framebuffers: drain_owned!(self, framebuffers, device),
        })
    }

    /// Devices created from physical devices of `instance`, in no
    /// particular order.
    pub fn devices_of_instance(&self, instance: vk::Instance) -> Vec<vk::Device> {
        self.devices
            .iter()
            .filter(|(_, dev)| {
                self.physical_devices
                    .get(&dev.physical_device)
                    .is_some_and(|pd| pd.instance == instance)
            })
            .map(|(&d, _)| d)
            .collect()
    }

    /// Total number of tracked objects, instances included.
    pub fn total_entries(&self) -> usize {
        self.instances.len()
            + self.physical_devices.len()
            + self.devices.len()
            + self.queues.len()
            + self.memories.len()
            + self.buffers.len()
            + self.images.len()
            + self.image_views.len()
            + self.samplers.len()
            + self.semaphores.len()
            + self.fences.len()
            + self.command_buffers.len()
            + self.command_pools.len()
            + self.descriptor_pools.len()
            + self.descriptor_sets.len()
            + self.descriptor_set_layouts.len()
            + self.descriptor_update_templates.len()
            + self.shader_modules.len()
            + self.pipeline_caches.len()
            + self.pipeline_layouts.len()
            + self.pipelines.len()
            + self.render_passes.len()
            + self.framebuffers.len()
    }
}
