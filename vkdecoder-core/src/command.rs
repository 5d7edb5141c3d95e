//! Command pools, command buffers, and the recorded-command hooks the
//! emulation cares about.
//!
//! The decoder does not shadow whole command streams; it records just
//! enough per command buffer to act at submit time (ColorBuffer
//! acquire/release, terminal layouts) and rewrites the commands that
//! touch emulated compressed images: copies retarget the per-mip
//! aliases, and a barrier into a readable layout gets a compute
//! decompression pass stitched in front of it, after which the caller's
//! bound compute state is restored.

use std::sync::Arc;

use arrayvec::ArrayVec;
use ash::vk::{self, Handle};

use crate::global::Global;
use crate::id::ObjectType;
use crate::resource::{CommandBufferInfo, CommandPoolInfo};

impl Global {
    pub fn on_create_command_pool(
        &self,
        boxed_device: vk::Device,
        flags: vk::CommandPoolCreateFlags,
        queue_family_index: u32,
    ) -> Result<vk::CommandPool, vk::Result> {
        self.api_log("vkCreateCommandPool");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family_index);
        let raw = unsafe { dispatch.create_command_pool(&create_info) }?;

        let boxed = vk::CommandPool::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::CommandPool,
            None,
        ));
        self.lock_state().tables.add_command_pool(
            raw,
            CommandPoolInfo {
                device,
                boxed,
                command_buffers: Default::default(),
            },
        );
        self.snapshot.lock().record_create_command_pool(
            boxed.as_raw(),
            boxed_device.as_raw(),
            flags,
            queue_family_index,
        );
        Ok(boxed)
    }

    pub fn on_destroy_command_pool(&self, boxed_device: vk::Device, boxed: vk::CommandPool) {
        self.api_log("vkDestroyCommandPool");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let member_boxed: Vec<u64> = {
            let mut state = self.lock_state();
            let Some(pool_info) = state.tables.command_pools.remove(&raw) else {
                return;
            };
            let mut members = Vec::new();
            for cb in pool_info.command_buffers {
                if let Some(cb_info) = state.tables.command_buffers.remove(&cb) {
                    self.reclaim_staging(&dispatch, &cb_info);
                    members.push(cb_info.boxed.as_raw());
                }
            }
            members
        };
        unsafe { dispatch.destroy_command_pool(raw) };
        {
            let mut snapshot = self.snapshot.lock();
            snapshot.forget(boxed.as_raw());
            for b in &member_boxed {
                snapshot.forget(*b);
            }
        }
        for b in member_boxed {
            self.registry.delete_boxed(b);
        }
        self.registry.delete_boxed(boxed.as_raw());
    }

    pub fn on_reset_command_pool(
        &self,
        boxed_device: vk::Device,
        boxed: vk::CommandPool,
    ) -> Result<(), vk::Result> {
        self.api_log("vkResetCommandPool");
        let raw = self.registry.unbox(boxed);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        unsafe { dispatch.reset_command_pool(raw, vk::CommandPoolResetFlags::empty()) }?;

        let mut state = self.lock_state();
        let members: Vec<vk::CommandBuffer> = state
            .tables
            .command_pools
            .get(&raw)
            .map(|p| p.command_buffers.iter().copied().collect())
            .unwrap_or_default();
        for cb in members {
            if let Some(info) = state.tables.command_buffers.get_mut(&cb) {
                let staging = std::mem::take(&mut info.staging_buffers);
                info.reset();
                staging_guard(&dispatch, staging);
            }
        }
        Ok(())
    }

    pub fn on_allocate_command_buffers(
        &self,
        boxed_device: vk::Device,
        boxed_pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        self.api_log("vkAllocateCommandBuffers");
        let device = self.registry.unbox(boxed_device);
        let pool = self.registry.unbox(boxed_pool);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        let raws = unsafe { dispatch.allocate_command_buffers(&allocate_info) }?;

        let mut boxed_out = Vec::with_capacity(raws.len());
        let mut state = self.lock_state();
        for &raw in &raws {
            let boxed = vk::CommandBuffer::from_raw(self.registry.new_boxed(
                raw.as_raw(),
                ObjectType::CommandBuffer,
                Some(crate::registry::Dispatch::Device(dispatch.clone())),
            ));
            state
                .tables
                .add_command_buffer(raw, CommandBufferInfo::new(device, boxed, pool));
            if let Some(pool_info) = state.tables.command_pools.get_mut(&pool) {
                pool_info.command_buffers.insert(raw);
            }
            self.snapshot.lock().record_allocate_command_buffer(
                boxed.as_raw(),
                boxed_device.as_raw(),
                boxed_pool.as_raw(),
                level,
            );
            boxed_out.push(boxed);
        }
        Ok(boxed_out)
    }

    pub fn on_free_command_buffers(
        &self,
        boxed_device: vk::Device,
        boxed_pool: vk::CommandPool,
        boxed_command_buffers: &[vk::CommandBuffer],
    ) {
        self.api_log("vkFreeCommandBuffers");
        let pool = self.registry.unbox(boxed_pool);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let raws: Vec<vk::CommandBuffer> = boxed_command_buffers
            .iter()
            .filter_map(|&b| self.registry.try_unbox(b))
            .collect();

        {
            let mut state = self.lock_state();
            for raw in &raws {
                if let Some(info) = state.tables.command_buffers.remove(raw) {
                    self.reclaim_staging(&dispatch, &info);
                }
                if let Some(pool_info) = state.tables.command_pools.get_mut(&pool) {
                    pool_info.command_buffers.remove(raw);
                }
            }
        }
        unsafe { dispatch.free_command_buffers(pool, &raws) };
        let mut snapshot = self.snapshot.lock();
        for boxed in boxed_command_buffers {
            snapshot.forget(boxed.as_raw());
        }
        drop(snapshot);
        for boxed in boxed_command_buffers {
            self.registry.delete_boxed(boxed.as_raw());
        }
    }

    pub fn on_begin_command_buffer(
        &self,
        boxed_cb: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), vk::Result> {
        self.api_log("vkBeginCommandBuffer");
        let raw = self.registry.unbox(boxed_cb);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());

        {
            let mut state = self.lock_state();
            if let Some(info) = state.tables.command_buffers.get_mut(&raw) {
                let staging = std::mem::take(&mut info.staging_buffers);
                info.reset();
                staging_guard(&dispatch, staging);
            }
        }
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { dispatch.begin_command_buffer(raw, &begin_info) }
    }

    pub fn on_end_command_buffer(&self, boxed_cb: vk::CommandBuffer) -> Result<(), vk::Result> {
        self.api_log("vkEndCommandBuffer");
        let raw = self.registry.unbox(boxed_cb);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());
        unsafe { dispatch.end_command_buffer(raw) }
    }

    pub fn on_reset_command_buffer(
        &self,
        boxed_cb: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        self.api_log("vkResetCommandBuffer");
        let raw = self.registry.unbox(boxed_cb);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());
        {
            let mut state = self.lock_state();
            if let Some(info) = state.tables.command_buffers.get_mut(&raw) {
                let staging = std::mem::take(&mut info.staging_buffers);
                info.reset();
                staging_guard(&dispatch, staging);
            }
        }
        unsafe { dispatch.reset_command_buffer(raw, flags) }
    }

    pub fn on_cmd_bind_pipeline(
        &self,
        boxed_cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        boxed_pipeline: vk::Pipeline,
    ) {
        let raw = self.registry.unbox(boxed_cb);
        let pipeline = self.registry.unbox(boxed_pipeline);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());

        if bind_point == vk::PipelineBindPoint::COMPUTE {
            let mut state = self.lock_state();
            if let Some(info) = state.tables.command_buffers.get_mut(&raw) {
                info.compute_pipeline = pipeline;
            }
        }
        unsafe { dispatch.cmd_bind_pipeline(raw, bind_point, pipeline) };
    }

    pub fn on_cmd_bind_descriptor_sets(
        &self,
        boxed_cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        boxed_layout: vk::PipelineLayout,
        first_set: u32,
        boxed_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        let raw = self.registry.unbox(boxed_cb);
        let layout = self.registry.unbox(boxed_layout);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());
        let sets: Vec<vk::DescriptorSet> = boxed_sets
            .iter()
            .map(|&b| self.registry.unbox(b))
            .collect();

        {
            let mut state = self.lock_state();
            if let Some(info) = state.tables.command_buffers.get_mut(&raw) {
                info.all_descriptor_sets.extend(sets.iter().copied());
                if bind_point == vk::PipelineBindPoint::COMPUTE {
                    info.first_set = first_set;
                    info.descriptor_layout = layout;
                    info.current_descriptor_sets = sets.clone();
                    info.dynamic_offsets = dynamic_offsets.to_vec();
                }
            }
        }
        unsafe {
            dispatch.cmd_bind_descriptor_sets(
                raw,
                bind_point,
                layout,
                first_set,
                &sets,
                dynamic_offsets,
            )
        };
    }

    /// ColorBuffer handoff markers recorded by the guest's compositor
    /// protocol; consumed at submit time.
    pub fn on_command_buffer_acquire_color_buffer(
        &self,
        boxed_cb: vk::CommandBuffer,
        color_buffer: u32,
    ) {
        let raw = self.registry.unbox(boxed_cb);
        let mut state = self.lock_state();
        if let Some(info) = state.tables.command_buffers.get_mut(&raw) {
            info.acquired_color_buffers.insert(color_buffer);
        }
    }

    pub fn on_command_buffer_release_color_buffer(
        &self,
        boxed_cb: vk::CommandBuffer,
        color_buffer: u32,
    ) {
        let raw = self.registry.unbox(boxed_cb);
        let mut state = self.lock_state();
        if let Some(info) = state.tables.command_buffers.get_mut(&raw) {
            info.released_color_buffers.insert(color_buffer);
        }
    }

    /// Rewrites image barriers against emulated images (decompressing
    /// first when the transition makes the image readable), records
    /// terminal layouts, and forwards.
    pub fn on_cmd_pipeline_barrier(
        &self,
        boxed_cb: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) -> Result<(), vk::Result> {
        let raw = self.registry.unbox(boxed_cb);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());

        let unboxed_buffer_barriers: Vec<vk::BufferMemoryBarrier> = buffer_barriers
            .iter()
            .map(|barrier| {
                let mut b = *barrier;
                b.buffer = self.registry.unbox(b.buffer);
                b
            })
            .collect();

        let mut forwarded_image_barriers: Vec<vk::ImageMemoryBarrier> = Vec::new();
        let mut decompress_targets: Vec<vk::Image> = Vec::new();
        {
            let mut state = self.lock_state();
            for barrier in image_barriers {
                let mut b = *barrier;
                b.image = self.registry.unbox(b.image);
                let (tracked, bound_color_buffer, device) =
                    match state.tables.images.get_mut(&b.image) {
                        Some(info) => {
                            info.layout = b.new_layout;
                            (true, info.bound_color_buffer, info.device)
                        }
                        None => (false, None, vk::Device::null()),
                    };
                if !tracked {
                    forwarded_image_barriers.push(b);
                    continue;
                }
                if let Some(cb_info) = state.tables.command_buffers.get_mut(&raw) {
                    cb_info.image_layouts.insert(b.image, b.new_layout);
                    if let Some(cb_handle) = bound_color_buffer {
                        cb_info.color_buffer_layouts.insert(cb_handle, b.new_layout);
                    }
                }
                // Only images the device decodes on the GPU get a pass
                // stitched in; the ASTC CPU path uploads decoded texels
                // at copy time instead.
                let needs_gpu_pass = state
                    .tables
                    .images
                    .get(&b.image)
                    .and_then(|info| info.cmp.as_ref())
                    .zip(state.tables.devices.get(&device))
                    .is_some_and(|(cmp, dev)| dev.need_gpu_decompression(cmp));
                if needs_gpu_pass
                    && matches!(
                        b.new_layout,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL | vk::ImageLayout::GENERAL
                    )
                {
                    decompress_targets.push(b.image);
                    // The decompression pass leaves the output image in
                    // GENERAL; the caller's transition starts there.
                    b.old_layout = vk::ImageLayout::GENERAL;
                }
                forwarded_image_barriers.push(b);
            }
        }

        for image in decompress_targets {
            self.emit_decompression_pass(&dispatch, raw, image)?;
        }

        unsafe {
            dispatch.cmd_pipeline_barrier(
                raw,
                src_stage_mask,
                dst_stage_mask,
                dependency_flags,
                memory_barriers,
                &unboxed_buffer_barriers,
                &forwarded_image_barriers,
            )
        };
        Ok(())
    }

    pub fn on_cmd_copy_buffer_to_image(
        &self,
        boxed_cb: vk::CommandBuffer,
        boxed_src: vk::Buffer,
        boxed_dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> Result<(), vk::Result> {
        let raw = self.registry.unbox(boxed_cb);
        let src = self.registry.unbox(boxed_src);
        let dst = self.registry.unbox(boxed_dst);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());

        let rewritten = {
            let state = self.lock_state();
            state
                .tables
                .images
                .get(&dst)
                .and_then(|info| info.cmp.as_ref())
                .map(|cmp| cmp.rewrite_buffer_image_regions(regions))
        };
        match rewritten {
            Some(pairs) => {
                self.maybe_cpu_decompress_upload(&dispatch, raw, src, dst, regions)?;
                for (alias, region) in pairs {
                    unsafe {
                        dispatch.cmd_copy_buffer_to_image(
                            raw,
                            src,
                            alias,
                            vk::ImageLayout::GENERAL,
                            &[region],
                        )
                    };
                }
            }
            None => unsafe {
                dispatch.cmd_copy_buffer_to_image(raw, src, dst, dst_layout, regions)
            },
        }
        Ok(())
    }

    pub fn on_cmd_copy_image_to_buffer(
        &self,
        boxed_cb: vk::CommandBuffer,
        boxed_src: vk::Image,
        src_layout: vk::ImageLayout,
        boxed_dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        let raw = self.registry.unbox(boxed_cb);
        let src = self.registry.unbox(boxed_src);
        let dst = self.registry.unbox(boxed_dst);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());

        let rewritten = {
            let state = self.lock_state();
            state
                .tables
                .images
                .get(&src)
                .and_then(|info| info.cmp.as_ref())
                .map(|cmp| cmp.rewrite_buffer_image_regions(regions))
        };
        match rewritten {
            Some(pairs) => {
                for (alias, region) in pairs {
                    unsafe {
                        dispatch.cmd_copy_image_to_buffer(
                            raw,
                            alias,
                            vk::ImageLayout::GENERAL,
                            dst,
                            &[region],
                        )
                    };
                }
            }
            None => unsafe {
                dispatch.cmd_copy_image_to_buffer(raw, src, src_layout, dst, regions)
            },
        }
    }

    pub fn on_cmd_copy_image(
        &self,
        boxed_cb: vk::CommandBuffer,
        boxed_src: vk::Image,
        src_layout: vk::ImageLayout,
        boxed_dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        let raw = self.registry.unbox(boxed_cb);
        let src = self.registry.unbox(boxed_src);
        let dst = self.registry.unbox(boxed_dst);
        let dispatch = self.registry.device_dispatch(boxed_cb.as_raw());

        let state = self.lock_state();
        let src_cmp = state.tables.images.get(&src).and_then(|i| i.cmp.as_ref());
        let dst_cmp = state.tables.images.get(&dst).and_then(|i| i.cmp.as_ref());

        for region in regions {
            let (actual_src, actual_dst, rewritten) = match (src_cmp, dst_cmp) {
                (Some(cmp), _) => {
                    let (alias, r) = cmp
                        .rewrite_image_copy(region, true)
                        .unwrap_or((src, *region));
                    (alias, dst, r)
                }
                (None, Some(cmp)) => {
                    let (alias, r) = cmp
                        .rewrite_image_copy(region, false)
                        .unwrap_or((dst, *region));
                    (src, alias, r)
                }
                (None, None) => (src, dst, *region),
            };
            let src_layout = if src_cmp.is_some() {
                vk::ImageLayout::GENERAL
            } else {
                src_layout
            };
            let dst_layout = if dst_cmp.is_some() {
                vk::ImageLayout::GENERAL
            } else {
                dst_layout
            };
            unsafe {
                dispatch.cmd_copy_image(
                    raw,
                    actual_src,
                    src_layout,
                    actual_dst,
                    dst_layout,
                    &[rewritten],
                )
            };
        }
    }

    /// `vkCmdCopyImage2` and friends carry the same payloads in chained
    /// structs; convert and share the rewrite path.
    ///
    /// # Safety
    ///
    /// `info` and everything it points to must be valid.
    pub unsafe fn on_cmd_copy_image2(
        &self,
        boxed_cb: vk::CommandBuffer,
        info: &vk::CopyImageInfo2,
    ) {
        let regions: Vec<vk::ImageCopy> = (0..info.region_count as usize)
            .map(|i| {
                let r = unsafe { &*info.p_regions.add(i) };
                vk::ImageCopy {
                    src_subresource: r.src_subresource,
                    src_offset: r.src_offset,
                    dst_subresource: r.dst_subresource,
                    dst_offset: r.dst_offset,
                    extent: r.extent,
                }
            })
            .collect();
        self.on_cmd_copy_image(
            boxed_cb,
            info.src_image,
            info.src_image_layout,
            info.dst_image,
            info.dst_image_layout,
            &regions,
        );
    }

    /// # Safety
    ///
    /// `info` and everything it points to must be valid.
    pub unsafe fn on_cmd_copy_buffer_to_image2(
        &self,
        boxed_cb: vk::CommandBuffer,
        info: &vk::CopyBufferToImageInfo2,
    ) -> Result<(), vk::Result> {
        let regions: Vec<vk::BufferImageCopy> = (0..info.region_count as usize)
            .map(|i| {
                let r = unsafe { &*info.p_regions.add(i) };
                vk::BufferImageCopy {
                    buffer_offset: r.buffer_offset,
                    buffer_row_length: r.buffer_row_length,
                    buffer_image_height: r.buffer_image_height,
                    image_subresource: r.image_subresource,
                    image_offset: r.image_offset,
                    image_extent: r.image_extent,
                }
            })
            .collect();
        self.on_cmd_copy_buffer_to_image(
            boxed_cb,
            info.src_buffer,
            info.dst_image,
            info.dst_image_layout,
            &regions,
        )
    }

    /// # Safety
    ///
    /// `info` and everything it points to must be valid.
    pub unsafe fn on_cmd_copy_image_to_buffer2(
        &self,
        boxed_cb: vk::CommandBuffer,
        info: &vk::CopyImageToBufferInfo2,
    ) {
        let regions: Vec<vk::BufferImageCopy> = (0..info.region_count as usize)
            .map(|i| {
                let r = unsafe { &*info.p_regions.add(i) };
                vk::BufferImageCopy {
                    buffer_offset: r.buffer_offset,
                    buffer_row_length: r.buffer_row_length,
                    buffer_image_height: r.buffer_image_height,
                    image_subresource: r.image_subresource,
                    image_offset: r.image_offset,
                    image_extent: r.image_extent,
                }
            })
            .collect();
        self.on_cmd_copy_image_to_buffer(
            boxed_cb,
            info.src_image,
            info.src_image_layout,
            info.dst_buffer,
            &regions,
        );
    }

    /// Inserts the compute decompression pass for one emulated image and
    /// restores whatever compute state the guest had bound.
    fn emit_decompression_pass(
        &self,
        dispatch: &Arc<dyn hal::DeviceDispatch>,
        cb: vk::CommandBuffer,
        image: vk::Image,
    ) -> Result<(), vk::Result> {
        let (manager, class, mip_count, dispatch_extents, views) = {
            let mut state = self.lock_state();
            let device = match state.tables.images.get(&image) {
                Some(info) => info.device,
                None => return Ok(()),
            };
            let Some(manager) = state
                .tables
                .devices
                .get(&device)
                .and_then(|d| d.decompression_pipelines.clone())
            else {
                log::error!("emulated image without decompression pipelines; contents stay raw");
                return Ok(());
            };
            let info = state.tables.images.get_mut(&image).unwrap();
            let cmp = info.cmp.as_mut().unwrap();

            // Storage views are built once per image, on first use.
            if cmp.storage_views.is_empty() {
                for level in 0..cmp.create_params.mip_levels {
                    let alias = cmp.mipmap_images[level as usize];
                    let mip_view_info = vk::ImageViewCreateInfo::builder()
                        .image(alias)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(cmp.mipmap_format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: cmp.create_params.array_layers,
                        });
                    let out_view_info = vk::ImageViewCreateInfo::builder()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(cmp.output_format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: level,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: cmp.create_params.array_layers,
                        });
                    let mip_view = unsafe { dispatch.create_image_view(&mip_view_info) }?;
                    let out_view = unsafe { dispatch.create_image_view(&out_view_info) }?;
                    cmp.storage_views.push((mip_view, out_view));
                }
            }
            let extents: Vec<(u32, u32, u32)> = (0..cmp.create_params.mip_levels)
                .map(|level| cmp.dispatch_extent(level))
                .collect();
            (
                manager,
                cmp.class(),
                cmp.create_params.mip_levels,
                extents,
                cmp.storage_views.clone(),
            )
        };

        let pipeline = manager.pipeline_for(class)?;
        unsafe {
            dispatch.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline);
        }
        for level in 0..mip_count as usize {
            let (mip_view, out_view) = views[level];
            let set = manager.allocate_decompression_set(mip_view, out_view)?;
            let (x, y, z) = dispatch_extents[level];
            let push: ArrayVec<u8, 16> = [x, y, z, level as u32]
                .iter()
                .flat_map(|v| v.to_ne_bytes())
                .collect();
            unsafe {
                dispatch.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::COMPUTE,
                    manager.pipeline_layout(),
                    0,
                    &[set],
                    &[],
                );
                dispatch.cmd_push_constants(
                    cb,
                    manager.pipeline_layout(),
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    &push,
                );
                dispatch.cmd_dispatch(cb, x.div_ceil(8).max(1), y.div_ceil(8).max(1), z.max(1));
            }
        }

        // Re-establish the guest's compute bindings so a following
        // vkCmdDispatch sees the state it recorded.
        let saved = {
            let state = self.lock_state();
            state.tables.command_buffers.get(&cb).map(|info| {
                (
                    info.compute_pipeline,
                    info.descriptor_layout,
                    info.first_set,
                    info.current_descriptor_sets.clone(),
                    info.dynamic_offsets.clone(),
                )
            })
        };
        if let Some((pipeline, layout, first_set, sets, offsets)) = saved {
            unsafe {
                if pipeline != vk::Pipeline::null() {
                    dispatch.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline);
                }
                if layout != vk::PipelineLayout::null() && !sets.is_empty() {
                    dispatch.cmd_bind_descriptor_sets(
                        cb,
                        vk::PipelineBindPoint::COMPUTE,
                        layout,
                        first_set,
                        &sets,
                        &offsets,
                    );
                }
            }
        }
        Ok(())
    }

    /// ASTC CPU fallback: decode the compressed payload on the CPU and
    /// record an upload of the RGBA result into the output image via a
    /// transient staging buffer.
    fn maybe_cpu_decompress_upload(
        &self,
        dispatch: &Arc<dyn hal::DeviceDispatch>,
        cb: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) -> Result<(), vk::Result> {
        let Some(decoder) = self.emulation.astc_decompressor() else {
            return Ok(());
        };

        let plan = {
            let state = self.lock_state();
            let image_info = match state.tables.images.get(&dst_image) {
                Some(info) => info,
                None => return Ok(()),
            };
            let Some(cmp) = image_info.cmp.as_ref() else {
                return Ok(());
            };
            let use_cpu = state
                .tables
                .devices
                .get(&image_info.device)
                .is_some_and(|d| cmp.is_astc() && d.use_astc_cpu_decompression);
            if !use_cpu {
                return Ok(());
            }
            let buffer_info = match state.tables.buffers.get(&src_buffer) {
                Some(info) => info,
                None => return Ok(()),
            };
            let source_ptr = state
                .tables
                .memories
                .get(&buffer_info.memory)
                .filter(|m| !m.ptr.is_null())
                .map(|m| crate::resource::MappedPtr(unsafe {
                    m.ptr.0.add(buffer_info.memory_offset as usize)
                }));
            let Some(source_ptr) = source_ptr else {
                // Source bytes are not host readable; the compute path
                // already covers this upload.
                return Ok(());
            };
            let device_info = state.tables.devices.get(&image_info.device).unwrap();
            let memory_helper = state
                .tables
                .physical_devices
                .get(&device_info.physical_device)
                .map(|pd| pd.memory.clone());
            (
                source_ptr,
                cmp.block_width,
                cmp.block_height,
                buffer_info.size,
                memory_helper,
            )
        };
        let (source_ptr, block_w, block_h, src_size, memory_helper) = plan;
        let Some(memory_helper) = memory_helper else {
            return Ok(());
        };

        for region in regions {
            let width = region.image_extent.width;
            let height = region.image_extent.height;
            let blocks_x = width.div_ceil(block_w);
            let blocks_y = height.div_ceil(block_h);
            let compressed_len = (blocks_x * blocks_y * 16) as usize;
            if region.buffer_offset as usize + compressed_len > src_size as usize {
                log::warn!("compressed upload region exceeds the source buffer; skipped");
                continue;
            }
            let compressed = unsafe {
                std::slice::from_raw_parts(
                    source_ptr.0.add(region.buffer_offset as usize),
                    compressed_len,
                )
            };
            let mut rgba = vec![0u8; (width * height * 4) as usize];
            if let Err(err) =
                decoder.decompress(width, height, block_w, block_h, compressed, &mut rgba)
            {
                log::error!("ASTC CPU decode failed: {err}");
                continue;
            }

            // Stage the decoded texels and record the upload.
            let staging_info = vk::BufferCreateInfo::builder()
                .size(rgba.len() as u64)
                .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let staging = unsafe { dispatch.create_buffer(&staging_info) }?;
            let requirements = unsafe { dispatch.get_buffer_memory_requirements(staging) };
            let type_index = memory_helper
                .find_host_index(
                    requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                )
                .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
            let allocate_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(requirements.size)
                .memory_type_index(type_index);
            let staging_memory = unsafe { dispatch.allocate_memory(&allocate_info) }?;
            unsafe {
                dispatch.bind_buffer_memory(staging, staging_memory, 0)?;
                let mapped = dispatch.map_memory(staging_memory, 0, vk::WHOLE_SIZE)?;
                std::ptr::copy_nonoverlapping(rgba.as_ptr(), mapped, rgba.len());
                dispatch.unmap_memory(staging_memory);

                let upload = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: region.image_subresource,
                    image_offset: region.image_offset,
                    image_extent: region.image_extent,
                };
                dispatch.cmd_copy_buffer_to_image(
                    cb,
                    staging,
                    dst_image,
                    vk::ImageLayout::GENERAL,
                    &[upload],
                );
            }
            let mut state = self.lock_state();
            if let Some(info) = state.tables.command_buffers.get_mut(&cb) {
                info.staging_buffers.push((staging, staging_memory));
            }
        }
        Ok(())
    }

    fn reclaim_staging(
        &self,
        dispatch: &Arc<dyn hal::DeviceDispatch>,
        info: &CommandBufferInfo,
    ) {
        for &(buffer, memory) in &info.staging_buffers {
            unsafe {
                dispatch.destroy_buffer(buffer);
                dispatch.free_memory(memory);
            }
        }
    }
}

/// Destroys transient staging resources; a helper so the reset paths
/// stay one-liners.
fn staging_guard(
    dispatch: &Arc<dyn hal::DeviceDispatch>,
    staging: Vec<(vk::Buffer, vk::DeviceMemory)>,
) {
    for (buffer, memory) in staging {
        unsafe {
            dispatch.destroy_buffer(buffer);
            dispatch.free_memory(memory);
        }
    }
}
