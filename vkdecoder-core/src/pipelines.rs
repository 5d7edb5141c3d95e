//! Pipeline-state object kinds.
//!
//! These tables are thin: the decoder's job here is handle translation,
//! ownership tracking for teardown, and snapshot recording. Graphics
//! pipeline state is forwarded wholesale with only the embedded handles
//! rewritten.

use ash::vk::{self, Handle};

use crate::global::Global;
use crate::id::ObjectType;
use crate::resource::{
    FramebufferInfo, PipelineCacheInfo, PipelineInfo, PipelineLayoutInfo, RenderPassInfo,
    ShaderModuleInfo,
};
use crate::snapshot::{PushConstantRangeParams, SubpassParams};

macro_rules! thin_destroy {
    ($name:ident, $table:ident, $handle:ty, $destroy:ident, $log:literal) => {
        pub fn $name(&self, boxed_device: vk::Device, boxed: $handle) {
            self.api_log($log);
            let Some(raw) = self.registry.try_unbox(boxed) else {
                return;
            };
            let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
            if self.lock_state().tables.$table.remove(&raw).is_some() {
                unsafe { dispatch.$destroy(raw) };
            }
            self.snapshot.lock().forget(boxed.as_raw());
            self.registry.delete_boxed(boxed.as_raw());
        }
    };
}

impl Global {
    /// # Safety
    ///
    /// `create_info.p_code` must point to `code_size` bytes of SPIR-V.
    pub unsafe fn on_create_shader_module(
        &self,
        boxed_device: vk::Device,
        create_info: &vk::ShaderModuleCreateInfo,
    ) -> Result<vk::ShaderModule, vk::Result> {
        self.api_log("vkCreateShaderModule");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let words = std::slice::from_raw_parts(create_info.p_code, create_info.code_size / 4);
        let forwarded = vk::ShaderModuleCreateInfo::builder().code(words);
        let raw = dispatch.create_shader_module(&forwarded)?;

        let boxed = vk::ShaderModule::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::ShaderModule,
            None,
        ));
        self.lock_state()
            .tables
            .add_shader_module(raw, ShaderModuleInfo { device, boxed });
        self.snapshot.lock().record_create_shader_module(
            boxed.as_raw(),
            boxed_device.as_raw(),
            words.to_vec(),
        );
        Ok(boxed)
    }

    thin_destroy!(
        on_destroy_shader_module,
        shader_modules,
        vk::ShaderModule,
        destroy_shader_module,
        "vkDestroyShaderModule"
    );

    pub fn on_create_pipeline_cache(
        &self,
        boxed_device: vk::Device,
    ) -> Result<vk::PipelineCache, vk::Result> {
        self.api_log("vkCreatePipelineCache");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let raw = unsafe {
            dispatch.create_pipeline_cache(&vk::PipelineCacheCreateInfo::builder())
        }?;
        let boxed = vk::PipelineCache::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::PipelineCache,
            None,
        ));
        self.lock_state()
            .tables
            .add_pipeline_cache(raw, PipelineCacheInfo { device, boxed });
        self.snapshot
            .lock()
            .record_create_pipeline_cache(boxed.as_raw(), boxed_device.as_raw());
        Ok(boxed)
    }

    thin_destroy!(
        on_destroy_pipeline_cache,
        pipeline_caches,
        vk::PipelineCache,
        destroy_pipeline_cache,
        "vkDestroyPipelineCache"
    );

    pub fn on_create_pipeline_layout(
        &self,
        boxed_device: vk::Device,
        boxed_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, vk::Result> {
        self.api_log("vkCreatePipelineLayout");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let set_layouts: Vec<vk::DescriptorSetLayout> = boxed_set_layouts
            .iter()
            .map(|&b| self.registry.unbox(b))
            .collect();
        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let raw = unsafe { dispatch.create_pipeline_layout(&create_info) }?;

        let boxed = vk::PipelineLayout::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::PipelineLayout,
            None,
        ));
        self.lock_state()
            .tables
            .add_pipeline_layout(raw, PipelineLayoutInfo { device, boxed });
        self.snapshot.lock().record_create_pipeline_layout(
            boxed.as_raw(),
            boxed_device.as_raw(),
            boxed_set_layouts.iter().map(|l| l.as_raw()).collect(),
            push_constant_ranges
                .iter()
                .map(|r| PushConstantRangeParams {
                    stage_flags: r.stage_flags,
                    offset: r.offset,
                    size: r.size,
                })
                .collect(),
        );
        Ok(boxed)
    }

    thin_destroy!(
        on_destroy_pipeline_layout,
        pipeline_layouts,
        vk::PipelineLayout,
        destroy_pipeline_layout,
        "vkDestroyPipelineLayout"
    );

    /// One compute pipeline per call keeps the snapshot log per-object.
    pub fn on_create_compute_pipeline(
        &self,
        boxed_device: vk::Device,
        boxed_cache: vk::PipelineCache,
        boxed_module: vk::ShaderModule,
        entry_point: &str,
        boxed_layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, vk::Result> {
        self.api_log("vkCreateComputePipelines");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let cache = self
            .registry
            .try_unbox(boxed_cache)
            .unwrap_or(vk::PipelineCache::null());
        let module = self.registry.unbox(boxed_module);
        let layout = self.registry.unbox(boxed_layout);

        let entry = std::ffi::CString::new(entry_point).map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry)
            .build();
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();
        let raw = unsafe { dispatch.create_compute_pipelines(cache, &[create_info]) }?[0];

        let boxed = vk::Pipeline::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::Pipeline,
            None,
        ));
        self.lock_state()
            .tables
            .add_pipeline(raw, PipelineInfo { device, boxed });
        self.snapshot.lock().record_create_compute_pipeline(
            boxed.as_raw(),
            boxed_device.as_raw(),
            boxed_module.as_raw(),
            entry_point.to_owned(),
            boxed_layout.as_raw(),
        );
        Ok(boxed)
    }

    /// Graphics state is too wide to mirror; handles are rewritten in a
    /// shallow copy and the snapshot save is flagged unreliable.
    ///
    /// # Safety
    ///
    /// `create_infos` and everything they point to must be valid.
    pub unsafe fn on_create_graphics_pipelines(
        &self,
        boxed_device: vk::Device,
        boxed_cache: vk::PipelineCache,
        create_infos: &[vk::GraphicsPipelineCreateInfo],
    ) -> Result<Vec<vk::Pipeline>, vk::Result> {
        self.api_log("vkCreateGraphicsPipelines");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let cache = self
            .registry
            .try_unbox(boxed_cache)
            .unwrap_or(vk::PipelineCache::null());

        let mut stage_storage: Vec<Vec<vk::PipelineShaderStageCreateInfo>> = Vec::new();
        let mut forwarded: Vec<vk::GraphicsPipelineCreateInfo> = Vec::new();
        for info in create_infos {
            let stages: Vec<vk::PipelineShaderStageCreateInfo> = (0..info.stage_count as usize)
                .map(|i| {
                    let mut stage = unsafe { *info.p_stages.add(i) };
                    stage.module = self.registry.unbox(stage.module);
                    stage
                })
                .collect();
            stage_storage.push(stages);
            let mut copy = *info;
            copy.layout = self.registry.unbox(info.layout);
            copy.render_pass = self
                .registry
                .try_unbox(info.render_pass)
                .unwrap_or(vk::RenderPass::null());
            copy.base_pipeline_handle = self
                .registry
                .try_unbox(info.base_pipeline_handle)
                .unwrap_or(vk::Pipeline::null());
            forwarded.push(copy);
        }
        for (copy, stages) in forwarded.iter_mut().zip(&stage_storage) {
            copy.p_stages = stages.as_ptr();
        }

        let raws = dispatch.create_graphics_pipelines(cache, &forwarded)?;
        self.vm_ops.set_skip_snapshot_save(true);

        let mut boxed_out = Vec::with_capacity(raws.len());
        let mut state = self.lock_state();
        for raw in raws {
            let boxed = vk::Pipeline::from_raw(self.registry.new_boxed(
                raw.as_raw(),
                ObjectType::Pipeline,
                None,
            ));
            state.tables.add_pipeline(raw, PipelineInfo { device, boxed });
            boxed_out.push(boxed);
        }
        Ok(boxed_out)
    }

    thin_destroy!(
        on_destroy_pipeline,
        pipelines,
        vk::Pipeline,
        destroy_pipeline,
        "vkDestroyPipeline"
    );

    /// Render pass create info carries no boxed handles; forward as-is.
    ///
    /// # Safety
    ///
    /// `create_info` and everything it points to must be valid.
    pub unsafe fn on_create_render_pass(
        &self,
        boxed_device: vk::Device,
        create_info: &vk::RenderPassCreateInfo,
    ) -> Result<vk::RenderPass, vk::Result> {
        self.api_log("vkCreateRenderPass");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let raw = dispatch.create_render_pass(create_info)?;

        let boxed = vk::RenderPass::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::RenderPass,
            None,
        ));
        self.lock_state()
            .tables
            .add_render_pass(raw, RenderPassInfo { device, boxed });
        // Attachment descriptions are value types; snapshot them whole,
        // along with the subpass reference shape.
        let attachments: Vec<vk::AttachmentDescription> = (0..create_info.attachment_count
            as usize)
            .map(|i| unsafe { *create_info.p_attachments.add(i) })
            .collect();
        let subpasses: Vec<SubpassParams> = (0..create_info.subpass_count as usize)
            .map(|i| {
                let subpass = unsafe { &*create_info.p_subpasses.add(i) };
                let read_refs = |ptr: *const vk::AttachmentReference, count: u32| {
                    (0..count as usize)
                        .map(|j| {
                            let r = unsafe { &*ptr.add(j) };
                            (r.attachment, r.layout)
                        })
                        .collect::<Vec<_>>()
                };
                SubpassParams {
                    color_refs: read_refs(subpass.p_color_attachments, subpass.color_attachment_count),
                    input_refs: read_refs(subpass.p_input_attachments, subpass.input_attachment_count),
                    depth_ref: (!subpass.p_depth_stencil_attachment.is_null()).then(|| {
                        let r = unsafe { &*subpass.p_depth_stencil_attachment };
                        (r.attachment, r.layout)
                    }),
                }
            })
            .collect();
        self.snapshot.lock().record_create_render_pass(
            boxed.as_raw(),
            boxed_device.as_raw(),
            attachments,
            subpasses,
        );
        Ok(boxed)
    }

    thin_destroy!(
        on_destroy_render_pass,
        render_passes,
        vk::RenderPass,
        destroy_render_pass,
        "vkDestroyRenderPass"
    );

    pub fn on_create_framebuffer(
        &self,
        boxed_device: vk::Device,
        boxed_render_pass: vk::RenderPass,
        boxed_attachments: &[vk::ImageView],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<vk::Framebuffer, vk::Result> {
        self.api_log("vkCreateFramebuffer");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let render_pass = self.registry.unbox(boxed_render_pass);
        let attachments: Vec<vk::ImageView> = boxed_attachments
            .iter()
            .map(|&b| self.registry.unbox(b))
            .collect();

        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(width)
            .height(height)
            .layers(layers);
        let raw = unsafe { dispatch.create_framebuffer(&create_info) }?;

        let attached_color_buffers = {
            let state = self.lock_state();
            attachments
                .iter()
                .filter_map(|view| {
                    state
                        .tables
                        .image_views
                        .get(view)
                        .and_then(|v| v.bound_color_buffer)
                })
                .collect()
        };

        let boxed = vk::Framebuffer::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::Framebuffer,
            None,
        ));
        self.lock_state().tables.add_framebuffer(
            raw,
            FramebufferInfo {
                device,
                boxed,
                attached_color_buffers,
            },
        );
        self.snapshot.lock().record_create_framebuffer(
            boxed.as_raw(),
            boxed_device.as_raw(),
            boxed_render_pass.as_raw(),
            boxed_attachments.iter().map(|a| a.as_raw()).collect(),
            [width, height, layers],
        );
        Ok(boxed)
    }

    thin_destroy!(
        on_destroy_framebuffer,
        framebuffers,
        vk::Framebuffer,
        destroy_framebuffer,
        "vkDestroyFramebuffer"
    );
}
