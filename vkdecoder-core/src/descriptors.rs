//! Descriptor pools, sets, and writes.
//!
//! The pool does its own capacity accounting so exhaustion is reported
//! as `OUT_OF_POOL_MEMORY` before the driver sees the allocation. Every
//! write is recorded in the set's 2-D table with weak liveness
//! references to the resources it names; stale writes silently fall out
//! of snapshots. In batched mode the guest pre-reserves pool-ids (boxed
//! set tokens without a driver object) and commits allocations plus
//! writes in one call on the queue.

use ash::vk::{self, Handle};

use crate::global::Global;
use crate::id::ObjectType;
use crate::resource::{
    DescriptorPoolInfo, DescriptorSetInfo, DescriptorSetLayoutInfo,
    DescriptorUpdateTemplateInfo, DescriptorWrite, DescriptorWritePayload, LayoutBinding,
    PoolState, TemplateEntry,
};
use crate::Features;

impl Global {
    pub fn on_create_descriptor_set_layout(
        &self,
        boxed_device: vk::Device,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        self.api_log("vkCreateDescriptorSetLayout");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(b.stage_flags)
                    .build()
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
        let raw = unsafe { dispatch.create_descriptor_set_layout(&create_info) }?;

        let boxed = vk::DescriptorSetLayout::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::DescriptorSetLayout,
            None,
        ));
        self.lock_state().tables.add_descriptor_set_layout(
            raw,
            DescriptorSetLayoutInfo {
                device,
                boxed,
                bindings: bindings.to_vec(),
            },
        );
        self.snapshot.lock().record_create_descriptor_set_layout(
            boxed.as_raw(),
            boxed_device.as_raw(),
            bindings.to_vec(),
        );
        Ok(boxed)
    }

    pub fn on_destroy_descriptor_set_layout(
        &self,
        boxed_device: vk::Device,
        boxed: vk::DescriptorSetLayout,
    ) {
        self.api_log("vkDestroyDescriptorSetLayout");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        if self
            .lock_state()
            .tables
            .descriptor_set_layouts
            .remove(&raw)
            .is_some()
        {
            unsafe { dispatch.destroy_descriptor_set_layout(raw) };
        }
        self.snapshot.lock().forget(boxed.as_raw());
        self.registry.delete_boxed(boxed.as_raw());
    }

    pub fn on_create_descriptor_pool(
        &self,
        boxed_device: vk::Device,
        flags: vk::DescriptorPoolCreateFlags,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, vk::Result> {
        self.api_log("vkCreateDescriptorPool");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let raw = unsafe { dispatch.create_descriptor_pool(&create_info) }?;

        let boxed = vk::DescriptorPool::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::DescriptorPool,
            None,
        ));

        // Batched mode pre-reserves one boxed set token per slot; the
        // driver set arrives at commit time.
        let pool_ids = if self
            .features
            .contains(Features::BATCHED_DESCRIPTOR_SET_UPDATE)
        {
            (0..max_sets)
                .map(|_| self.registry.new_boxed(0, ObjectType::DescriptorSet, None))
                .collect()
        } else {
            Vec::new()
        };

        self.lock_state().tables.add_descriptor_pool(
            raw,
            DescriptorPoolInfo {
                device,
                boxed,
                flags,
                max_sets,
                used_sets: 0,
                pools: pool_sizes
                    .iter()
                    .map(|size| PoolState {
                        ty: size.ty,
                        capacity: size.descriptor_count,
                        used: 0,
                    })
                    .collect(),
                alloced_sets_to_boxed: Default::default(),
                pool_ids,
            },
        );
        self.snapshot.lock().record_create_descriptor_pool(
            boxed.as_raw(),
            boxed_device.as_raw(),
            flags,
            max_sets,
            pool_sizes.to_vec(),
        );
        Ok(boxed)
    }

    pub fn on_destroy_descriptor_pool(&self, boxed_device: vk::Device, boxed: vk::DescriptorPool) {
        self.api_log("vkDestroyDescriptorPool");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let removed = {
            let mut state = self.lock_state();
            let removed = state.tables.descriptor_pools.remove(&raw);
            if let Some(info) = &removed {
                for set in info.alloced_sets_to_boxed.keys() {
                    state.tables.descriptor_sets.remove(set);
                }
            }
            removed
        };
        if let Some(info) = removed {
            for (_, boxed_set) in info.alloced_sets_to_boxed {
                self.registry.delete_boxed(boxed_set.as_raw());
            }
            for pool_id in info.pool_ids {
                self.registry.delete_boxed(pool_id);
            }
            unsafe { dispatch.destroy_descriptor_pool(raw) };
        }
        self.snapshot.lock().forget(boxed.as_raw());
        self.registry.delete_boxed(boxed.as_raw());
    }

    /// Every per-type `used` counter returns to zero and all sets of
    /// the pool vanish; pre-reserved pool-ids survive for reuse.
    pub fn on_reset_descriptor_pool(
        &self,
        boxed_device: vk::Device,
        boxed: vk::DescriptorPool,
    ) -> Result<(), vk::Result> {
        self.api_log("vkResetDescriptorPool");
        let raw = self.registry.unbox(boxed);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        unsafe { dispatch.reset_descriptor_pool(raw) }?;

        let batched = self
            .features
            .contains(Features::BATCHED_DESCRIPTOR_SET_UPDATE);
        let stale_boxed = {
            let mut state = self.lock_state();
            let Some(info) = state.tables.descriptor_pools.get_mut(&raw) else {
                return Ok(());
            };
            info.used_sets = 0;
            for pool in info.pools.iter_mut() {
                pool.used = 0;
            }
            let drained: Vec<(vk::DescriptorSet, vk::DescriptorSet)> =
                info.alloced_sets_to_boxed.drain().collect();
            for (set, _) in &drained {
                state.tables.descriptor_sets.remove(set);
            }
            drained
        };
        for (_, boxed_set) in stale_boxed {
            if batched {
                // Pool-ids keep their token; detach the dead driver set.
                self.registry.update_raw(boxed_set.as_raw(), 0);
            } else {
                self.registry.delete_boxed(boxed_set.as_raw());
            }
        }
        Ok(())
    }

    pub fn on_allocate_descriptor_sets(
        &self,
        boxed_device: vk::Device,
        boxed_pool: vk::DescriptorPool,
        boxed_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        self.api_log("vkAllocateDescriptorSets");
        let device = self.registry.unbox(boxed_device);
        let pool = self.registry.unbox(boxed_pool);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let layouts: Vec<vk::DescriptorSetLayout> = boxed_layouts
            .iter()
            .map(|&b| self.registry.unbox(b))
            .collect();

        // Simulate before touching the driver so exhaustion rolls back
        // cleanly.
        let layout_bindings: Vec<Vec<LayoutBinding>> = {
            let mut state = self.lock_state();
            let bindings: Vec<Vec<LayoutBinding>> = layouts
                .iter()
                .map(|layout| {
                    state
                        .tables
                        .descriptor_set_layouts
                        .get(layout)
                        .map(|info| info.bindings.clone())
                        .unwrap_or_default()
                })
                .collect();
            let pool_info = state
                .tables
                .descriptor_pools
                .get_mut(&pool)
                .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)?;
            simulate_and_commit(pool_info, &bindings)?;
            bindings
        };

        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let raw_sets = match unsafe { dispatch.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => sets,
            Err(err) => {
                let mut state = self.lock_state();
                if let Some(pool_info) = state.tables.descriptor_pools.get_mut(&pool) {
                    rollback(pool_info, &layout_bindings);
                }
                return Err(err);
            }
        };

        let mut boxed_sets = Vec::with_capacity(raw_sets.len());
        let mut state = self.lock_state();
        for ((&raw_set, bindings), (&layout, &boxed_layout)) in raw_sets
            .iter()
            .zip(&layout_bindings)
            .zip(layouts.iter().zip(boxed_layouts))
        {
            let boxed_set = vk::DescriptorSet::from_raw(self.registry.new_boxed(
                raw_set.as_raw(),
                ObjectType::DescriptorSet,
                None,
            ));
            state.tables.add_descriptor_set(
                raw_set,
                DescriptorSetInfo {
                    device,
                    pool,
                    unboxed_layout: layout,
                    boxed_layout,
                    bindings: bindings.clone(),
                    all_writes: DescriptorSetInfo::new_write_table(bindings),
                },
            );
            if let Some(pool_info) = state.tables.descriptor_pools.get_mut(&pool) {
                pool_info.alloced_sets_to_boxed.insert(raw_set, boxed_set);
            }
            boxed_sets.push(boxed_set);
        }
        Ok(boxed_sets)
    }

    pub fn on_free_descriptor_sets(
        &self,
        boxed_device: vk::Device,
        boxed_pool: vk::DescriptorPool,
        boxed_sets: &[vk::DescriptorSet],
    ) -> Result<(), vk::Result> {
        self.api_log("vkFreeDescriptorSets");
        let pool = self.registry.unbox(boxed_pool);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let raw_sets: Vec<vk::DescriptorSet> = boxed_sets
            .iter()
            .filter_map(|&b| self.registry.try_unbox(b))
            .collect();

        {
            let mut state = self.lock_state();
            for raw_set in &raw_sets {
                let Some(set_info) = state.tables.descriptor_sets.remove(raw_set) else {
                    continue;
                };
                if let Some(pool_info) = state.tables.descriptor_pools.get_mut(&pool) {
                    pool_info.alloced_sets_to_boxed.remove(raw_set);
                    pool_info.used_sets = pool_info.used_sets.saturating_sub(1);
                    for binding in &set_info.bindings {
                        release_binding(pool_info, binding);
                    }
                }
            }
        }
        let free_allowed = {
            let state = self.lock_state();
            state
                .tables
                .descriptor_pools
                .get(&pool)
                .map_or(false, |p| {
                    p.flags
                        .contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                })
        };
        if free_allowed {
            unsafe { dispatch.free_descriptor_sets(pool, &raw_sets) }?;
        }
        for boxed_set in boxed_sets {
            self.registry.delete_boxed(boxed_set.as_raw());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `writes` and everything they point to must be valid; handles in
    /// the payloads are boxed guest tokens.
    pub unsafe fn on_update_descriptor_sets(
        &self,
        boxed_device: vk::Device,
        writes: &[vk::WriteDescriptorSet],
    ) -> Result<(), vk::Result> {
        self.api_log("vkUpdateDescriptorSets");
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::new();
        let mut texel_views: Vec<Vec<vk::BufferView>> = Vec::new();
        let mut driver_writes: Vec<vk::WriteDescriptorSet> = Vec::new();

        for write in writes {
            let dst_set = self.registry.unbox(write.dst_set);
            let mut forwarded = *write;
            forwarded.dst_set = dst_set;
            match write.descriptor_type {
                vk::DescriptorType::SAMPLER
                | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                | vk::DescriptorType::SAMPLED_IMAGE
                | vk::DescriptorType::STORAGE_IMAGE
                | vk::DescriptorType::INPUT_ATTACHMENT => {
                    let mut infos = Vec::with_capacity(write.descriptor_count as usize);
                    for i in 0..write.descriptor_count as usize {
                        let info = *write.p_image_info.add(i);
                        infos.push(self.translate_image_descriptor(
                            &*dispatch,
                            write.descriptor_type,
                            info,
                        )?);
                    }
                    self.record_image_writes(dst_set, write, &infos);
                    forwarded.p_image_info = infos.as_ptr();
                    image_infos.push(infos);
                }
                vk::DescriptorType::UNIFORM_BUFFER
                | vk::DescriptorType::STORAGE_BUFFER
                | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                    let mut infos = Vec::with_capacity(write.descriptor_count as usize);
                    for i in 0..write.descriptor_count as usize {
                        let mut info = *write.p_buffer_info.add(i);
                        info.buffer = self
                            .registry
                            .try_unbox(info.buffer)
                            .unwrap_or(vk::Buffer::null());
                        infos.push(info);
                    }
                    self.record_buffer_writes(dst_set, write, &infos);
                    forwarded.p_buffer_info = infos.as_ptr();
                    buffer_infos.push(infos);
                }
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                    let views: Vec<vk::BufferView> = (0..write.descriptor_count as usize)
                        .map(|i| unsafe { *write.p_texel_buffer_view.add(i) })
                        .collect();
                    self.record_texel_writes(dst_set, write, &views);
                    forwarded.p_texel_buffer_view = views.as_ptr();
                    texel_views.push(views);
                }
                other => {
                    // Inline uniform block and acceleration structure
                    // writes pass through; their snapshot handling is the
                    // save pass's concern.
                    log::warn!("descriptor write type {other:?} forwarded without tracking");
                }
            }
            driver_writes.push(forwarded);
        }

        dispatch.update_descriptor_sets(&driver_writes, &[]);
        Ok(())
    }

    /// Pre-reserved pool-id tokens for batched mode, in reservation
    /// order.
    pub fn on_collect_descriptor_pool_ids(
        &self,
        _boxed_device: vk::Device,
        boxed_pool: vk::DescriptorPool,
        max_count: usize,
    ) -> Vec<u64> {
        let pool = self.registry.unbox(boxed_pool);
        let state = self.lock_state();
        state
            .tables
            .descriptor_pools
            .get(&pool)
            .map(|info| {
                info.pool_ids
                    .iter()
                    .take(max_count)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Batched allocation + update: resolve or allocate each named set,
    /// patch every write's destination, and issue one driver update.
    ///
    /// # Safety
    ///
    /// `writes` and everything they point to must be valid.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn on_queue_commit_descriptor_set_updates(
        &self,
        boxed_queue: vk::Queue,
        boxed_pools: &[vk::DescriptorPool],
        boxed_set_layouts: &[vk::DescriptorSetLayout],
        pool_ids: &[u64],
        which_pool: &[u32],
        pending_alloc: &[bool],
        write_start_indices: &[u32],
        writes: &[vk::WriteDescriptorSet],
    ) -> Result<(), vk::Result> {
        self.api_log("vkQueueCommitDescriptorSetUpdates");
        let device_boxed = {
            let raw_queue = self.registry.unbox(boxed_queue);
            let state = self.lock_state();
            state.tables.queues[&raw_queue].device
        };
        let dispatch = self.registry.device_dispatch(boxed_queue.as_raw());

        let set_count = pool_ids.len();
        let mut resolved_sets = Vec::with_capacity(set_count);
        for i in 0..set_count {
            let boxed_set = pool_ids[i];
            let existing = vk::DescriptorSet::from_raw(boxed_set);
            let raw = self
                .registry
                .try_unbox(existing)
                .filter(|set| set.as_raw() != 0);
            let raw_set = match (raw, pending_alloc.get(i).copied().unwrap_or(true)) {
                (Some(set), false) => set,
                _ => {
                    let pool_index = which_pool.get(i).copied().unwrap_or(0) as usize;
                    let boxed_pool = boxed_pools
                        .get(pool_index)
                        .copied()
                        .ok_or(vk::Result::ERROR_UNKNOWN)?;
                    let pool = self.registry.unbox(boxed_pool);
                    let layout = self.registry.unbox(boxed_set_layouts[i]);
                    let layouts = [layout];
                    let allocate_info = vk::DescriptorSetAllocateInfo::builder()
                        .descriptor_pool(pool)
                        .set_layouts(&layouts);
                    let raw_set = dispatch.allocate_descriptor_sets(&allocate_info)?[0];
                    self.registry.update_raw(boxed_set, raw_set.as_raw());

                    let mut state = self.lock_state();
                    let bindings = state
                        .tables
                        .descriptor_set_layouts
                        .get(&layout)
                        .map(|l| l.bindings.clone())
                        .unwrap_or_default();
                    state.tables.add_descriptor_set(
                        raw_set,
                        DescriptorSetInfo {
                            device: device_boxed,
                            pool,
                            unboxed_layout: layout,
                            boxed_layout: boxed_set_layouts[i],
                            bindings: bindings.clone(),
                            all_writes: DescriptorSetInfo::new_write_table(&bindings),
                        },
                    );
                    if let Some(pool_info) = state.tables.descriptor_pools.get_mut(&pool) {
                        pool_info
                            .alloced_sets_to_boxed
                            .insert(raw_set, vk::DescriptorSet::from_raw(boxed_set));
                        pool_info.used_sets += 1;
                        for binding in &bindings {
                            reserve_binding(pool_info, binding);
                        }
                    }
                    raw_set
                }
            };
            resolved_sets.push(raw_set);
        }

        // Patch destinations and reuse the tracked-update path per set
        // range.
        let mut patched: Vec<vk::WriteDescriptorSet> = writes.to_vec();
        for i in 0..set_count {
            let start = write_start_indices.get(i).copied().unwrap_or(0) as usize;
            let end = write_start_indices
                .get(i + 1)
                .copied()
                .map(|v| v as usize)
                .unwrap_or(writes.len());
            for write in patched.iter_mut().take(end).skip(start) {
                // The batched wire format leaves dstSet unresolved; the
                // boxed token is reinstalled so the shared path unboxes
                // it.
                write.dst_set = vk::DescriptorSet::from_raw(pool_ids[i]);
            }
        }
        drop(resolved_sets);
        let boxed_device = {
            let state = self.lock_state();
            state
                .tables
                .devices
                .get(&device_boxed)
                .map(|d| d.boxed)
                .ok_or(vk::Result::ERROR_UNKNOWN)?
        };
        self.on_update_descriptor_sets(boxed_device, &patched)
    }

    /// Template updates are linearized at create time; applying one is a
    /// plain batched write against the recorded entries.
    pub fn on_create_descriptor_update_template(
        &self,
        boxed_device: vk::Device,
        entries: &[TemplateEntry],
    ) -> vk::DescriptorUpdateTemplate {
        self.api_log("vkCreateDescriptorUpdateTemplate");
        let device = self.registry.unbox(boxed_device);
        let boxed = self
            .registry
            .new_boxed(0, ObjectType::DescriptorUpdateTemplate, None);
        // The template never reaches the driver; writes are expanded
        // decoder-side, so the token maps to itself.
        self.registry.update_raw(boxed, boxed);
        let handle = vk::DescriptorUpdateTemplate::from_raw(boxed);
        self.lock_state().tables.add_descriptor_update_template(
            handle,
            DescriptorUpdateTemplateInfo {
                device,
                boxed: handle,
                entries: entries.to_vec(),
            },
        );
        handle
    }

    pub fn on_destroy_descriptor_update_template(
        &self,
        _boxed_device: vk::Device,
        boxed: vk::DescriptorUpdateTemplate,
    ) {
        self.api_log("vkDestroyDescriptorUpdateTemplate");
        self.lock_state()
            .tables
            .descriptor_update_templates
            .remove(&boxed);
        self.registry.delete_boxed(boxed.as_raw());
    }

    /// # Safety
    ///
    /// `data` must hold the template's descriptor payload at the offsets
    /// and strides recorded at template creation.
    pub unsafe fn on_update_descriptor_set_with_template(
        &self,
        boxed_device: vk::Device,
        boxed_set: vk::DescriptorSet,
        boxed_template: vk::DescriptorUpdateTemplate,
        data: &[u8],
    ) -> Result<(), vk::Result> {
        self.api_log("vkUpdateDescriptorSetWithTemplate");
        let entries = {
            let state = self.lock_state();
            state
                .tables
                .descriptor_update_templates
                .get(&boxed_template)
                .map(|t| t.entries.clone())
                .ok_or(vk::Result::ERROR_UNKNOWN)?
        };

        let mut image_storage: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut buffer_storage: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::new();
        let mut texel_storage: Vec<Vec<vk::BufferView>> = Vec::new();
        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::new();

        for entry in &entries {
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(boxed_set)
                .dst_binding(entry.dst_binding)
                .dst_array_element(entry.dst_array_element)
                .descriptor_type(entry.descriptor_type)
                .build();
            write.descriptor_count = entry.descriptor_count;
            match entry.descriptor_type {
                vk::DescriptorType::SAMPLER
                | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                | vk::DescriptorType::SAMPLED_IMAGE
                | vk::DescriptorType::STORAGE_IMAGE
                | vk::DescriptorType::INPUT_ATTACHMENT => {
                    let infos: Vec<vk::DescriptorImageInfo> = (0..entry.descriptor_count as usize)
                        .map(|i| {
                            let offset = entry.offset + i * entry.stride;
                            unsafe {
                                std::ptr::read_unaligned(
                                    data.as_ptr().add(offset).cast::<vk::DescriptorImageInfo>(),
                                )
                            }
                        })
                        .collect();
                    image_storage.push(infos);
                    write.p_image_info = image_storage.last().unwrap().as_ptr();
                }
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                    let views: Vec<vk::BufferView> = (0..entry.descriptor_count as usize)
                        .map(|i| {
                            let offset = entry.offset + i * entry.stride;
                            unsafe {
                                std::ptr::read_unaligned(
                                    data.as_ptr().add(offset).cast::<vk::BufferView>(),
                                )
                            }
                        })
                        .collect();
                    texel_storage.push(views);
                    write.p_texel_buffer_view = texel_storage.last().unwrap().as_ptr();
                }
                _ => {
                    let infos: Vec<vk::DescriptorBufferInfo> = (0..entry.descriptor_count as usize)
                        .map(|i| {
                            let offset = entry.offset + i * entry.stride;
                            unsafe {
                                std::ptr::read_unaligned(
                                    data.as_ptr()
                                        .add(offset)
                                        .cast::<vk::DescriptorBufferInfo>(),
                                )
                            }
                        })
                        .collect();
                    buffer_storage.push(infos);
                    write.p_buffer_info = buffer_storage.last().unwrap().as_ptr();
                }
            }
            writes.push(write);
        }

        self.on_update_descriptor_sets(boxed_device, &writes)
    }

    /// Translates one image descriptor: unbox the view and sampler, and
    /// swap a transparent-black border sampler for its opaque-black
    /// variant when the view carries emulated alpha.
    fn translate_image_descriptor(
        &self,
        dispatch: &dyn hal::DeviceDispatch,
        descriptor_type: vk::DescriptorType,
        mut info: vk::DescriptorImageInfo,
    ) -> Result<vk::DescriptorImageInfo, vk::Result> {
        let view = self
            .registry
            .try_unbox(info.image_view)
            .unwrap_or(vk::ImageView::null());
        let sampler = self
            .registry
            .try_unbox(info.sampler)
            .unwrap_or(vk::Sampler::null());
        info.image_view = view;
        info.sampler = sampler;

        if descriptor_type != vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            || sampler == vk::Sampler::null()
        {
            return Ok(info);
        }

        let needs_swap = {
            let state = self.lock_state();
            let view_alpha = state
                .tables
                .image_views
                .get(&view)
                .map_or(false, |v| v.need_emulated_alpha);
            let border = state
                .tables
                .samplers
                .get(&sampler)
                .map(|s| s.create_params.border_color);
            view_alpha
                && matches!(
                    border,
                    Some(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
                        | Some(vk::BorderColor::INT_TRANSPARENT_BLACK)
                )
        };
        if !needs_swap {
            return Ok(info);
        }

        // Lazily create and cache the opaque-black variant.
        let existing = {
            let state = self.lock_state();
            state
                .tables
                .samplers
                .get(&sampler)
                .map(|s| s.emulated_border_sampler)
        };
        let substitute = match existing {
            Some(s) if s != vk::Sampler::null() => s,
            _ => {
                let params = {
                    let state = self.lock_state();
                    state.tables.samplers.get(&sampler).map(|s| s.create_params)
                };
                let Some(mut params) = params else {
                    return Ok(info);
                };
                params.border_color = match params.border_color {
                    vk::BorderColor::FLOAT_TRANSPARENT_BLACK => {
                        vk::BorderColor::FLOAT_OPAQUE_BLACK
                    }
                    _ => vk::BorderColor::INT_OPAQUE_BLACK,
                };
                let created = unsafe { dispatch.create_sampler(&params.to_vk()) }?;
                let mut state = self.lock_state();
                if let Some(s) = state.tables.samplers.get_mut(&sampler) {
                    s.emulated_border_sampler = created;
                }
                created
            }
        };
        info.sampler = substitute;
        Ok(info)
    }

    fn record_image_writes(
        &self,
        dst_set: vk::DescriptorSet,
        write: &vk::WriteDescriptorSet,
        infos: &[vk::DescriptorImageInfo],
    ) {
        let mut state = self.lock_state();
        let mut records = Vec::with_capacity(infos.len());
        for info in infos {
            let mut alives = Vec::new();
            let mut color_buffer = None;
            if let Some(view) = state.tables.image_views.get(&info.image_view) {
                alives.push(view.alive.watch());
                color_buffer = view.bound_color_buffer;
            }
            if let Some(sampler) = state.tables.samplers.get(&info.sampler) {
                alives.push(sampler.alive.watch());
            }
            records.push(DescriptorWrite {
                descriptor_type: write.descriptor_type,
                dst_array_element: 0,
                payload: DescriptorWritePayload::Image(*info),
                alives,
                bound_color_buffer: color_buffer,
            });
        }
        store_writes(
            &mut state.tables.descriptor_sets,
            dst_set,
            write.dst_binding,
            write.dst_array_element,
            records,
        );
    }

    fn record_buffer_writes(
        &self,
        dst_set: vk::DescriptorSet,
        write: &vk::WriteDescriptorSet,
        infos: &[vk::DescriptorBufferInfo],
    ) {
        let mut state = self.lock_state();
        let mut records = Vec::with_capacity(infos.len());
        for info in infos {
            let mut alives = Vec::new();
            if let Some(buffer) = state.tables.buffers.get(&info.buffer) {
                alives.push(buffer.alive.watch());
            }
            records.push(DescriptorWrite {
                descriptor_type: write.descriptor_type,
                dst_array_element: 0,
                payload: DescriptorWritePayload::Buffer(*info),
                alives,
                bound_color_buffer: None,
            });
        }
        store_writes(
            &mut state.tables.descriptor_sets,
            dst_set,
            write.dst_binding,
            write.dst_array_element,
            records,
        );
    }

    fn record_texel_writes(
        &self,
        dst_set: vk::DescriptorSet,
        write: &vk::WriteDescriptorSet,
        views: &[vk::BufferView],
    ) {
        let mut state = self.lock_state();
        let records = views
            .iter()
            .map(|&view| DescriptorWrite {
                descriptor_type: write.descriptor_type,
                dst_array_element: 0,
                payload: DescriptorWritePayload::BufferView(view),
                alives: Vec::new(),
                bound_color_buffer: None,
            })
            .collect();
        store_writes(
            &mut state.tables.descriptor_sets,
            dst_set,
            write.dst_binding,
            write.dst_array_element,
            records,
        );
    }
}

/// Stores writes starting at `(binding, array_element)`, spilling into
/// following bindings when the count crosses a binding boundary.
fn store_writes(
    sets: &mut crate::FastHashMap<vk::DescriptorSet, DescriptorSetInfo>,
    dst_set: vk::DescriptorSet,
    dst_binding: u32,
    dst_array_element: u32,
    records: Vec<DescriptorWrite>,
) {
    let Some(set_info) = sets.get_mut(&dst_set) else {
        return;
    };
    let mut binding = dst_binding as usize;
    let mut element = dst_array_element as usize;
    for mut record in records {
        while binding < set_info.all_writes.len() && element >= set_info.all_writes[binding].len() {
            binding += 1;
            element = 0;
        }
        let Some(slot) = set_info
            .all_writes
            .get_mut(binding)
            .and_then(|b| b.get_mut(element))
        else {
            log::warn!("descriptor write outside the layout's shape dropped");
            return;
        };
        record.dst_array_element = element as u32;
        *slot = Some(record);
        element += 1;
    }
}

fn reserve_binding(pool: &mut DescriptorPoolInfo, binding: &LayoutBinding) {
    for entry in pool.pools.iter_mut() {
        if entry.ty == binding.descriptor_type
            && entry.capacity - entry.used >= binding.descriptor_count
        {
            entry.used += binding.descriptor_count;
            return;
        }
    }
}

fn release_binding(pool: &mut DescriptorPoolInfo, binding: &LayoutBinding) {
    for entry in pool.pools.iter_mut() {
        if entry.ty == binding.descriptor_type && entry.used >= binding.descriptor_count {
            entry.used -= binding.descriptor_count;
            return;
        }
    }
}

/// Simulates the allocation against the pool counters and commits it,
/// or fails with `OUT_OF_POOL_MEMORY` leaving the counters untouched.
fn simulate_and_commit(
    pool: &mut DescriptorPoolInfo,
    layouts: &[Vec<LayoutBinding>],
) -> Result<(), vk::Result> {
    let mut tentative = pool.pools.clone();
    let mut tentative_sets = pool.used_sets;
    for bindings in layouts {
        if tentative_sets >= pool.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        tentative_sets += 1;
        for binding in bindings {
            let slot = tentative.iter_mut().find(|entry| {
                entry.ty == binding.descriptor_type
                    && entry.capacity - entry.used >= binding.descriptor_count
            });
            match slot {
                Some(entry) => entry.used += binding.descriptor_count,
                None => return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            }
        }
    }
    pool.pools = tentative;
    pool.used_sets = tentative_sets;
    Ok(())
}

fn rollback(pool: &mut DescriptorPoolInfo, layouts: &[Vec<LayoutBinding>]) {
    for bindings in layouts {
        pool.used_sets = pool.used_sets.saturating_sub(1);
        for binding in bindings {
            release_binding(pool, binding);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(capacities: &[(vk::DescriptorType, u32)], max_sets: u32) -> DescriptorPoolInfo {
        DescriptorPoolInfo {
            device: vk::Device::null(),
            boxed: vk::DescriptorPool::null(),
            flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            max_sets,
            used_sets: 0,
            pools: capacities
                .iter()
                .map(|&(ty, capacity)| PoolState {
                    ty,
                    capacity,
                    used: 0,
                })
                .collect(),
            alloced_sets_to_boxed: Default::default(),
            pool_ids: Vec::new(),
        }
    }

    fn uniform_binding(count: u32) -> Vec<LayoutBinding> {
        vec![LayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count,
            stage_flags: vk::ShaderStageFlags::ALL,
        }]
    }

    #[test]
    fn pool_capacity_exhausts_and_recovers() {
        let mut pool = pool_with(&[(vk::DescriptorType::UNIFORM_BUFFER, 2)], 16);
        assert!(simulate_and_commit(&mut pool, &[uniform_binding(1)]).is_ok());
        assert!(simulate_and_commit(&mut pool, &[uniform_binding(1)]).is_ok());
        assert_eq!(
            simulate_and_commit(&mut pool, &[uniform_binding(1)]),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        );
        release_binding(&mut pool, &uniform_binding(1)[0]);
        pool.used_sets -= 1;
        assert!(simulate_and_commit(&mut pool, &[uniform_binding(1)]).is_ok());
    }

    #[test]
    fn failed_simulation_leaves_counters_untouched() {
        let mut pool = pool_with(&[(vk::DescriptorType::UNIFORM_BUFFER, 3)], 16);
        // One set fits, the second overflows; the whole call must not
        // consume anything.
        let result = simulate_and_commit(&mut pool, &[uniform_binding(2), uniform_binding(2)]);
        assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        assert_eq!(pool.pools[0].used, 0);
        assert_eq!(pool.used_sets, 0);
    }

    #[test]
    fn max_sets_bounds_allocations() {
        let mut pool = pool_with(&[(vk::DescriptorType::UNIFORM_BUFFER, 100)], 1);
        assert!(simulate_and_commit(&mut pool, &[uniform_binding(1)]).is_ok());
        assert_eq!(
            simulate_and_commit(&mut pool, &[uniform_binding(1)]),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        );
    }
}
