//! Buffers, images, image views, and samplers.
//!
//! Image creation is where compressed-texture emulation begins: a
//! format the device cannot sample swaps the create info for the
//! uncompressed output image and instantiates the per-mip alias set.

use ash::vk::{self, Handle};

use crate::decompress::CompressedImageInfo;
use crate::error::VkResultExt;
use crate::global::Global;
use crate::id::ObjectType;
use crate::resource::{
    AndroidNativeBufferInfo, BufferInfo, ImageCreateParams, ImageInfo, ImageViewInfo, Liveness,
    SamplerCreateParams, SamplerInfo,
};
use crate::snapshot::ImageViewParams;

impl Global {
    pub fn on_create_buffer(
        &self,
        boxed_device: vk::Device,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, vk::Result> {
        self.api_log("vkCreateBuffer");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { dispatch.create_buffer(&create_info) }.map_err(|err| {
            err.log_oom("vkCreateBuffer", Some(size));
            err
        })?;

        let boxed =
            vk::Buffer::from_raw(self.registry.new_boxed(raw.as_raw(), ObjectType::Buffer, None));
        let mut state = self.lock_state();
        state.tables.add_buffer(
            raw,
            BufferInfo {
                device,
                boxed,
                usage,
                size,
                memory: vk::DeviceMemory::null(),
                memory_offset: 0,
                bound_color_buffer: None,
                alive: Liveness::new(),
            },
        );
        drop(state);
        self.snapshot
            .lock()
            .record_create_buffer(boxed.as_raw(), boxed_device.as_raw(), size, usage);
        Ok(boxed)
    }

    pub fn on_destroy_buffer(&self, boxed_device: vk::Device, boxed: vk::Buffer) {
        self.api_log("vkDestroyBuffer");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let removed = self.lock_state().tables.buffers.remove(&raw);
        if removed.is_some() {
            unsafe { dispatch.destroy_buffer(raw) };
        }
        self.snapshot.lock().forget(boxed.as_raw());
        self.registry.delete_boxed(boxed.as_raw());
    }

    pub fn on_bind_buffer_memory(
        &self,
        boxed_device: vk::Device,
        boxed_buffer: vk::Buffer,
        boxed_memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.api_log("vkBindBufferMemory");
        let buffer = self.registry.unbox(boxed_buffer);
        let memory = self.registry.unbox(boxed_memory);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        unsafe { dispatch.bind_buffer_memory(buffer, memory, offset) }?;

        let mut state = self.lock_state();
        let color_buffer = state
            .tables
            .memories
            .get(&memory)
            .and_then(|m| m.bound_color_buffer);
        if let Some(info) = state.tables.buffers.get_mut(&buffer) {
            info.memory = memory;
            info.memory_offset = offset;
            info.bound_color_buffer = color_buffer;
        }
        drop(state);
        self.snapshot.lock().record_bind_buffer_memory(
            boxed_buffer.as_raw(),
            boxed_device.as_raw(),
            boxed_memory.as_raw(),
            offset,
        );
        Ok(())
    }

    pub fn on_get_buffer_memory_requirements(
        &self,
        boxed_device: vk::Device,
        boxed_buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        let buffer = self.registry.unbox(boxed_buffer);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        unsafe { dispatch.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    ///
    /// `create_info` and everything it points to must be valid.
    pub unsafe fn on_create_image(
        &self,
        boxed_device: vk::Device,
        create_info: &vk::ImageCreateInfo,
        anb_color_buffer: Option<u32>,
    ) -> Result<vk::Image, vk::Result> {
        self.api_log("vkCreateImage");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let params = ImageCreateParams::from_vk(create_info);

        let needs_decompression = {
            let state = self.lock_state();
            let device_info = state
                .tables
                .devices
                .get(&device)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            let probe = CompressedImageInfo::new(params);
            device_info.need_emulated_decompression(&probe)
        };

        let (raw, cmp) = if needs_decompression {
            let mut cmp = CompressedImageInfo::new(params);
            let raw = dispatch.create_image(&cmp.output_create_params().to_vk())?;
            if let Err(err) = cmp.create_mipmap_images(&*dispatch) {
                log::error!("compressed mip alias creation failed: {err:?}");
                cmp.destroy(&*dispatch);
                dispatch.destroy_image(raw);
                return Err(err);
            }
            (raw, Some(cmp))
        } else {
            let raw = dispatch.create_image(&params.to_vk()).map_err(|err| {
                err.log_oom("vkCreateImage", None);
                err
            })?;
            (raw, None)
        };

        let boxed =
            vk::Image::from_raw(self.registry.new_boxed(raw.as_raw(), ObjectType::Image, None));
        let mut state = self.lock_state();
        state.tables.add_image(
            raw,
            ImageInfo {
                device,
                boxed,
                create_params: params,
                anb: anb_color_buffer.map(|color_buffer| AndroidNativeBufferInfo { color_buffer }),
                cmp,
                bound_color_buffer: anb_color_buffer,
                layout: params.initial_layout,
                memory: vk::DeviceMemory::null(),
                memory_offset: 0,
            },
        );
        drop(state);
        self.snapshot
            .lock()
            .record_create_image(boxed.as_raw(), boxed_device.as_raw(), params);
        Ok(boxed)
    }

    pub fn on_destroy_image(&self, boxed_device: vk::Device, boxed: vk::Image) {
        self.api_log("vkDestroyImage");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let removed = self.lock_state().tables.images.remove(&raw);
        if let Some(mut info) = removed {
            if let Some(cmp) = info.cmp.as_mut() {
                cmp.destroy(&*dispatch);
            }
            unsafe { dispatch.destroy_image(raw) };
        }
        self.snapshot.lock().forget(boxed.as_raw());
        self.registry.delete_boxed(boxed.as_raw());
    }

    /// The uncompressed output image defines the size the guest must
    /// allocate; alias requirements are folded in so the shared memory
    /// block covers every shadow image.
    pub fn on_get_image_memory_requirements(
        &self,
        boxed_device: vk::Device,
        boxed_image: vk::Image,
    ) -> vk::MemoryRequirements {
        let image = self.registry.unbox(boxed_image);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let mut requirements = unsafe { dispatch.get_image_memory_requirements(image) };

        let state = self.lock_state();
        if let Some(cmp) = state.tables.images.get(&image).and_then(|i| i.cmp.as_ref()) {
            for &alias in &cmp.mipmap_images {
                let alias_req = unsafe { dispatch.get_image_memory_requirements(alias) };
                requirements.size = requirements.size.max(alias_req.size);
                requirements.alignment = requirements.alignment.max(alias_req.alignment);
                requirements.memory_type_bits &= alias_req.memory_type_bits;
            }
        }
        requirements
    }

    pub fn on_bind_image_memory(
        &self,
        boxed_device: vk::Device,
        boxed_image: vk::Image,
        boxed_memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.api_log("vkBindImageMemory");
        let image = self.registry.unbox(boxed_image);
        let memory = self.registry.unbox(boxed_memory);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        unsafe { dispatch.bind_image_memory(image, memory, offset) }?;

        let mut state = self.lock_state();
        let color_buffer = state
            .tables
            .memories
            .get(&memory)
            .and_then(|m| m.bound_color_buffer);
        if let Some(info) = state.tables.images.get_mut(&image) {
            info.memory = memory;
            info.memory_offset = offset;
            if info.bound_color_buffer.is_none() {
                info.bound_color_buffer = color_buffer;
            }
            if let Some(cmp) = info.cmp.as_mut() {
                cmp.bind_compressed_mipmaps_memory(&*dispatch, memory, offset)?;
            }
        }
        drop(state);
        self.snapshot.lock().record_bind_image_memory(
            boxed_image.as_raw(),
            boxed_device.as_raw(),
            boxed_memory.as_raw(),
            offset,
        );
        Ok(())
    }

    /// Multi-bind is forwarded, but its snapshot story is unresolved;
    /// flag the save as unreliable rather than guessing.
    pub fn on_bind_image_memory2(
        &self,
        boxed_device: vk::Device,
        binds: &[(vk::Image, vk::DeviceMemory, vk::DeviceSize)],
    ) -> Result<(), vk::Result> {
        self.api_log("vkBindImageMemory2");
        if binds.len() > 1 {
            self.vm_ops.set_skip_snapshot_save(true);
            let infos: Vec<vk::BindImageMemoryInfo> = binds
                .iter()
                .map(|&(boxed_image, boxed_memory, offset)| {
                    vk::BindImageMemoryInfo::builder()
                        .image(self.registry.unbox(boxed_image))
                        .memory(self.registry.unbox(boxed_memory))
                        .memory_offset(offset)
                        .build()
                })
                .collect();
            let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
            unsafe { dispatch.bind_image_memory2(&infos) }?;
            let mut state = self.lock_state();
            for (info, &(_, _, offset)) in infos.iter().zip(binds) {
                if let Some(image_info) = state.tables.images.get_mut(&info.image) {
                    image_info.memory = info.memory;
                    image_info.memory_offset = offset;
                }
            }
            return Ok(());
        }
        match binds.first() {
            Some(&(image, memory, offset)) => {
                self.on_bind_image_memory(boxed_device, image, memory, offset)
            }
            None => Ok(()),
        }
    }

    /// # Safety
    ///
    /// `create_info` and everything it points to must be valid; the
    /// image handle inside is a boxed guest token.
    pub unsafe fn on_create_image_view(
        &self,
        boxed_device: vk::Device,
        create_info: &vk::ImageViewCreateInfo,
    ) -> Result<vk::ImageView, vk::Result> {
        self.api_log("vkCreateImageView");
        let device = self.registry.unbox(boxed_device);
        let boxed_image = create_info.image;
        let image = self.registry.unbox(boxed_image);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let (format, need_emulated_alpha, color_buffer) = {
            let state = self.lock_state();
            match state.tables.images.get(&image) {
                Some(info) => match info.cmp.as_ref() {
                    Some(cmp) => (
                        cmp.output_format,
                        cmp.class() == crate::decompress::CompressedClass::Etc2Rgb,
                        info.bound_color_buffer,
                    ),
                    None => (create_info.format, false, info.bound_color_buffer),
                },
                None => (create_info.format, false, None),
            }
        };

        let forwarded = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(create_info.view_type)
            .format(format)
            .components(create_info.components)
            .subresource_range(create_info.subresource_range);
        let raw = unsafe { dispatch.create_image_view(&forwarded) }?;

        let boxed = vk::ImageView::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::ImageView,
            None,
        ));
        let mut state = self.lock_state();
        state.tables.add_image_view(
            raw,
            ImageViewInfo {
                device,
                boxed,
                image,
                format,
                need_emulated_alpha,
                bound_color_buffer: color_buffer,
                alive: Liveness::new(),
            },
        );
        drop(state);
        self.snapshot.lock().record_create_image_view(
            boxed.as_raw(),
            boxed_device.as_raw(),
            ImageViewParams {
                image: boxed_image.as_raw(),
                view_type: create_info.view_type,
                format: create_info.format,
                aspect_mask: create_info.subresource_range.aspect_mask,
                base_mip_level: create_info.subresource_range.base_mip_level,
                level_count: create_info.subresource_range.level_count,
                base_array_layer: create_info.subresource_range.base_array_layer,
                layer_count: create_info.subresource_range.layer_count,
            },
        );
        Ok(boxed)
    }

    pub fn on_destroy_image_view(&self, boxed_device: vk::Device, boxed: vk::ImageView) {
        self.api_log("vkDestroyImageView");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        if self.lock_state().tables.image_views.remove(&raw).is_some() {
            unsafe { dispatch.destroy_image_view(raw) };
        }
        self.snapshot.lock().forget(boxed.as_raw());
        self.registry.delete_boxed(boxed.as_raw());
    }

    /// # Safety
    ///
    /// `create_info` and everything it points to must be valid.
    pub unsafe fn on_create_sampler(
        &self,
        boxed_device: vk::Device,
        create_info: &vk::SamplerCreateInfo,
    ) -> Result<vk::Sampler, vk::Result> {
        self.api_log("vkCreateSampler");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let params = SamplerCreateParams::from_vk(create_info);

        let raw = unsafe { dispatch.create_sampler(&params.to_vk()) }?;

        let boxed = vk::Sampler::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::Sampler,
            None,
        ));
        let mut state = self.lock_state();
        state.tables.add_sampler(
            raw,
            SamplerInfo {
                device,
                boxed,
                create_params: params,
                need_emulated_alpha: false,
                emulated_border_sampler: vk::Sampler::null(),
                alive: Liveness::new(),
            },
        );
        drop(state);
        self.snapshot
            .lock()
            .record_create_sampler(boxed.as_raw(), boxed_device.as_raw(), params);
        Ok(boxed)
    }

    pub fn on_destroy_sampler(&self, boxed_device: vk::Device, boxed: vk::Sampler) {
        self.api_log("vkDestroySampler");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let removed = self.lock_state().tables.samplers.remove(&raw);
        if let Some(info) = removed {
            crate::device::destroy_sampler_exclusive(&dispatch, raw, info);
        }
        self.snapshot.lock().forget(boxed.as_raw());
        self.registry.delete_boxed(boxed.as_raw());
    }
}
