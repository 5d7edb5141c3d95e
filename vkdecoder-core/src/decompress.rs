//! Compressed-texture emulation.
//!
//! When the guest creates an image in a block-compressed format the host
//! driver cannot sample, the decoder substitutes a shadow graph: the
//! driver image is created in an equivalent uncompressed format (the
//! "output" image the guest ends up sampling), and one storage-format
//! alias per mip level carries the raw block data. Copies are rewritten
//! to land in the aliases; a compute pass decompresses alias -> output
//! when a barrier makes the image readable.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::resource::ImageCreateParams;
use crate::FastHashMap;

pub fn is_etc2(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::ETC2_R8G8B8_UNORM_BLOCK
            | vk::Format::ETC2_R8G8B8_SRGB_BLOCK
            | vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK
            | vk::Format::ETC2_R8G8B8A1_SRGB_BLOCK
            | vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK
            | vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK
            | vk::Format::EAC_R11_UNORM_BLOCK
            | vk::Format::EAC_R11_SNORM_BLOCK
            | vk::Format::EAC_R11G11_UNORM_BLOCK
            | vk::Format::EAC_R11G11_SNORM_BLOCK
    )
}

pub fn is_astc(format: vk::Format) -> bool {
    format.as_raw() >= vk::Format::ASTC_4X4_UNORM_BLOCK.as_raw()
        && format.as_raw() <= vk::Format::ASTC_12X12_SRGB_BLOCK.as_raw()
}

/// Compressed format classes sharing one decompression kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressedClass {
    Etc2Rgb,
    Etc2Rgba,
    EacR11,
    EacRg11,
    Astc,
}

fn classify(format: vk::Format) -> Option<CompressedClass> {
    use vk::Format as F;
    Some(match format {
        F::ETC2_R8G8B8_UNORM_BLOCK | F::ETC2_R8G8B8_SRGB_BLOCK => CompressedClass::Etc2Rgb,
        F::ETC2_R8G8B8A1_UNORM_BLOCK
        | F::ETC2_R8G8B8A1_SRGB_BLOCK
        | F::ETC2_R8G8B8A8_UNORM_BLOCK
        | F::ETC2_R8G8B8A8_SRGB_BLOCK => CompressedClass::Etc2Rgba,
        F::EAC_R11_UNORM_BLOCK | F::EAC_R11_SNORM_BLOCK => CompressedClass::EacR11,
        F::EAC_R11G11_UNORM_BLOCK | F::EAC_R11G11_SNORM_BLOCK => CompressedClass::EacRg11,
        _ if is_astc(format) => CompressedClass::Astc,
        _ => return None,
    })
}

/// Texel block footprint of a compressed format.
pub fn block_extent(format: vk::Format) -> (u32, u32) {
    use vk::Format as F;
    if is_etc2(format) {
        return (4, 4);
    }
    match format {
        F::ASTC_4X4_UNORM_BLOCK | F::ASTC_4X4_SRGB_BLOCK => (4, 4),
        F::ASTC_5X4_UNORM_BLOCK | F::ASTC_5X4_SRGB_BLOCK => (5, 4),
        F::ASTC_5X5_UNORM_BLOCK | F::ASTC_5X5_SRGB_BLOCK => (5, 5),
        F::ASTC_6X5_UNORM_BLOCK | F::ASTC_6X5_SRGB_BLOCK => (6, 5),
        F::ASTC_6X6_UNORM_BLOCK | F::ASTC_6X6_SRGB_BLOCK => (6, 6),
        F::ASTC_8X5_UNORM_BLOCK | F::ASTC_8X5_SRGB_BLOCK => (8, 5),
        F::ASTC_8X6_UNORM_BLOCK | F::ASTC_8X6_SRGB_BLOCK => (8, 6),
        F::ASTC_8X8_UNORM_BLOCK | F::ASTC_8X8_SRGB_BLOCK => (8, 8),
        F::ASTC_10X5_UNORM_BLOCK | F::ASTC_10X5_SRGB_BLOCK => (10, 5),
        F::ASTC_10X6_UNORM_BLOCK | F::ASTC_10X6_SRGB_BLOCK => (10, 6),
        F::ASTC_10X8_UNORM_BLOCK | F::ASTC_10X8_SRGB_BLOCK => (10, 8),
        F::ASTC_10X10_UNORM_BLOCK | F::ASTC_10X10_SRGB_BLOCK => (10, 10),
        F::ASTC_12X10_UNORM_BLOCK | F::ASTC_12X10_SRGB_BLOCK => (12, 10),
        F::ASTC_12X12_UNORM_BLOCK | F::ASTC_12X12_SRGB_BLOCK => (12, 12),
        _ => (1, 1),
    }
}

/// Bytes per texel block.
pub fn block_size(format: vk::Format) -> u32 {
    use vk::Format as F;
    match format {
        F::ETC2_R8G8B8_UNORM_BLOCK
        | F::ETC2_R8G8B8_SRGB_BLOCK
        | F::ETC2_R8G8B8A1_UNORM_BLOCK
        | F::ETC2_R8G8B8A1_SRGB_BLOCK
        | F::EAC_R11_UNORM_BLOCK
        | F::EAC_R11_SNORM_BLOCK => 8,
        _ => 16,
    }
}

fn is_srgb(format: vk::Format) -> bool {
    use vk::Format as F;
    matches!(
        format,
        F::ETC2_R8G8B8_SRGB_BLOCK | F::ETC2_R8G8B8A1_SRGB_BLOCK | F::ETC2_R8G8B8A8_SRGB_BLOCK
    ) || (is_astc(format) && format.as_raw() % 2 == vk::Format::ASTC_4X4_SRGB_BLOCK.as_raw() % 2)
}

/// Uncompressed format the guest ends up sampling.
pub fn output_format(format: vk::Format) -> vk::Format {
    match classify(format) {
        Some(CompressedClass::EacR11) => vk::Format::R16_UNORM,
        Some(CompressedClass::EacRg11) => vk::Format::R16G16_UNORM,
        Some(_) if is_srgb(format) => vk::Format::R8G8B8A8_SRGB,
        Some(_) => vk::Format::R8G8B8A8_UNORM,
        None => format,
    }
}

/// Storage format whose texel carries one compressed block.
pub fn mipmap_format(format: vk::Format) -> vk::Format {
    match block_size(format) {
        8 => vk::Format::R32G32_UINT,
        _ => vk::Format::R32G32B32A32_UINT,
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

fn mip_dim(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

/// Shadow state for one emulated compressed image.
///
/// The driver image on the record is the *output* image; `mipmap_images`
/// alias its memory and hold raw block data, one per mip level.
pub struct CompressedImageInfo {
    pub compressed_format: vk::Format,
    pub output_format: vk::Format,
    pub mipmap_format: vk::Format,
    pub block_width: u32,
    pub block_height: u32,
    pub create_params: ImageCreateParams,
    pub mipmap_images: Vec<vk::Image>,
    /// (mipmap view, output view) pairs built for the compute pass.
    pub storage_views: Vec<(vk::ImageView, vk::ImageView)>,
    pub mipmaps_bound: bool,
}

impl CompressedImageInfo {
    pub fn new(create_params: ImageCreateParams) -> Self {
        let format = create_params.format;
        let (block_width, block_height) = block_extent(format);
        Self {
            compressed_format: format,
            output_format: output_format(format),
            mipmap_format: mipmap_format(format),
            block_width,
            block_height,
            create_params,
            mipmap_images: Vec::new(),
            storage_views: Vec::new(),
            mipmaps_bound: false,
        }
    }

    pub fn is_etc2(&self) -> bool {
        is_etc2(self.compressed_format)
    }

    pub fn is_astc(&self) -> bool {
        is_astc(self.compressed_format)
    }

    pub fn class(&self) -> CompressedClass {
        classify(self.compressed_format).expect("compressed image with uncompressed format")
    }

    /// Create info actually sent to the driver: uncompressed output
    /// format, storage usage for the compute pass, mutable since the
    /// aliases reinterpret the memory.
    pub fn output_create_params(&self) -> ImageCreateParams {
        let mut params = self.create_params;
        params.format = self.output_format;
        params.flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        params.usage |= vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST;
        params
    }

    /// Create info for the block-data alias of one mip level: one texel
    /// per compressed block.
    pub fn mipmap_create_params(&self, level: u32) -> ImageCreateParams {
        let mut params = self.create_params;
        params.format = self.mipmap_format;
        params.mip_levels = 1;
        params.extent = vk::Extent3D {
            width: div_ceil(mip_dim(self.create_params.extent.width, level), self.block_width),
            height: div_ceil(
                mip_dim(self.create_params.extent.height, level),
                self.block_height,
            ),
            depth: mip_dim(self.create_params.extent.depth, level),
        };
        params.usage =
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC;
        params.flags = vk::ImageCreateFlags::empty();
        params
    }

    pub fn create_mipmap_images(
        &mut self,
        dispatch: &dyn hal::DeviceDispatch,
    ) -> Result<(), vk::Result> {
        debug_assert!(self.mipmap_images.is_empty());
        for level in 0..self.create_params.mip_levels {
            let params = self.mipmap_create_params(level).to_vk();
            let image = unsafe { dispatch.create_image(&params) }?;
            self.mipmap_images.push(image);
        }
        Ok(())
    }

    /// Binds every mip alias over the output image's memory.
    pub fn bind_compressed_mipmaps_memory(
        &mut self,
        dispatch: &dyn hal::DeviceDispatch,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        for &image in &self.mipmap_images {
            unsafe { dispatch.bind_image_memory(image, memory, offset) }?;
        }
        self.mipmaps_bound = true;
        Ok(())
    }

    /// Rewrites buffer<->image copy regions against the per-mip aliases.
    /// Returns `(mipmap image, region)` pairs; block-compressed texel
    /// coordinates shrink by the block footprint since one alias texel is
    /// one block.
    pub fn rewrite_buffer_image_regions(
        &self,
        regions: &[vk::BufferImageCopy],
    ) -> Vec<(vk::Image, vk::BufferImageCopy)> {
        regions
            .iter()
            .filter_map(|region| {
                let level = region.image_subresource.mip_level as usize;
                let image = *self.mipmap_images.get(level)?;
                let mut rewritten = *region;
                rewritten.image_subresource.mip_level = 0;
                rewritten.image_offset.x /= self.block_width as i32;
                rewritten.image_offset.y /= self.block_height as i32;
                rewritten.image_extent.width =
                    div_ceil(region.image_extent.width, self.block_width);
                rewritten.image_extent.height =
                    div_ceil(region.image_extent.height, self.block_height);
                Some((image, rewritten))
            })
            .collect()
    }

    /// Same rewrite for image->image copies where this image is the
    /// source (`src == true`) or destination.
    pub fn rewrite_image_copy(
        &self,
        region: &vk::ImageCopy,
        src: bool,
    ) -> Option<(vk::Image, vk::ImageCopy)> {
        let subresource = if src {
            &region.src_subresource
        } else {
            &region.dst_subresource
        };
        let level = subresource.mip_level as usize;
        let image = *self.mipmap_images.get(level)?;
        let mut rewritten = *region;
        let (offset, sub) = if src {
            (&mut rewritten.src_offset, &mut rewritten.src_subresource)
        } else {
            (&mut rewritten.dst_offset, &mut rewritten.dst_subresource)
        };
        sub.mip_level = 0;
        offset.x /= self.block_width as i32;
        offset.y /= self.block_height as i32;
        rewritten.extent.width = div_ceil(region.extent.width, self.block_width);
        rewritten.extent.height = div_ceil(region.extent.height, self.block_height);
        Some((image, rewritten))
    }

    /// Grid size for the decompression dispatch of one mip level, given
    /// the kernel's 8x8 workgroup.
    pub fn dispatch_extent(&self, level: u32) -> (u32, u32, u32) {
        let width = mip_dim(self.create_params.extent.width, level);
        let height = mip_dim(self.create_params.extent.height, level);
        (
            div_ceil(width, 8 * self.block_width) * self.block_width,
            div_ceil(height, 8 * self.block_height) * self.block_height,
            self.create_params.array_layers,
        )
    }

    pub fn destroy(&mut self, dispatch: &dyn hal::DeviceDispatch) {
        for (mip_view, out_view) in self.storage_views.drain(..) {
            unsafe {
                dispatch.destroy_image_view(mip_view);
                dispatch.destroy_image_view(out_view);
            }
        }
        for image in self.mipmap_images.drain(..) {
            unsafe { dispatch.destroy_image(image) };
        }
    }
}

const SPEC_BLOCK_WIDTH: u32 = 0;
const SPEC_BLOCK_HEIGHT: u32 = 1;
const SPEC_CLASS: u32 = 2;

fn class_id(class: CompressedClass) -> u32 {
    match class {
        CompressedClass::Etc2Rgb => 0,
        CompressedClass::Etc2Rgba => 1,
        CompressedClass::EacR11 => 2,
        CompressedClass::EacRg11 => 3,
        CompressedClass::Astc => 4,
    }
}

/// Per-device cache of decompression pipelines, one per format class.
/// The kernels themselves come from the emulation facade's
/// [`DecompressionKernels`](crate::emulation::DecompressionKernels)
/// provider; the manager owns the layouts, the descriptor pool, and the
/// per-class pipeline cache.
pub struct DecompressionPipelineManager {
    dispatch: Arc<dyn hal::DeviceDispatch>,
    kernels: Arc<dyn crate::emulation::DecompressionKernels>,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    descriptor_pool: vk::DescriptorPool,
    pipelines: Mutex<FastHashMap<CompressedClass, vk::Pipeline>>,
}

const MAX_DECOMP_SETS: u32 = 256;

impl DecompressionPipelineManager {
    pub fn new(
        dispatch: Arc<dyn hal::DeviceDispatch>,
        kernels: Arc<dyn crate::emulation::DecompressionKernels>,
    ) -> Result<Self, vk::Result> {
        let bindings = [
            // binding 0: compressed block data (alias image)
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build(),
            // binding 1: decompressed output
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build(),
        ];
        let set_layout = unsafe {
            dispatch.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings),
            )
        }?;

        let push_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(16)
            .build();
        let set_layouts = [set_layout];
        let push_ranges = [push_range];
        let pipeline_layout = unsafe {
            dispatch.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&push_ranges),
            )
        }?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: MAX_DECOMP_SETS * 2,
        }];
        let descriptor_pool = unsafe {
            dispatch.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(MAX_DECOMP_SETS)
                    .pool_sizes(&pool_sizes),
            )
        }?;

        Ok(Self {
            dispatch,
            kernels,
            set_layout,
            pipeline_layout,
            descriptor_pool,
            pipelines: Mutex::new(FastHashMap::default()),
        })
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn pipeline_for(&self, class: CompressedClass) -> Result<vk::Pipeline, vk::Result> {
        if let Some(&pipeline) = self.pipelines.lock().get(&class) {
            return Ok(pipeline);
        }

        let Some(code) = self.kernels.kernel_spirv(class) else {
            log::error!("no decompression kernel provided for {class:?}");
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        };
        let module = unsafe {
            self.dispatch
                .create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(&code))
        }?;

        let (block_width, block_height) = match class {
            CompressedClass::Astc => (0, 0), // runtime-sized via push constants
            CompressedClass::Etc2Rgb
            | CompressedClass::Etc2Rgba
            | CompressedClass::EacR11
            | CompressedClass::EacRg11 => (4, 4),
        };
        let spec_data: [u32; 3] = [block_width, block_height, class_id(class)];
        let map_entries = [
            vk::SpecializationMapEntry {
                constant_id: SPEC_BLOCK_WIDTH,
                offset: 0,
                size: 4,
            },
            vk::SpecializationMapEntry {
                constant_id: SPEC_BLOCK_HEIGHT,
                offset: 4,
                size: 4,
            },
            vk::SpecializationMapEntry {
                constant_id: SPEC_CLASS,
                offset: 8,
                size: 4,
            },
        ];
        let spec_info = vk::SpecializationInfo::builder()
            .map_entries(&map_entries)
            .data(bytemuck::cast_slice(&spec_data))
            .build();

        let entry_point = std::ffi::CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .specialization_info(&spec_info)
            .build();
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(self.pipeline_layout)
            .build();

        let result = unsafe {
            self.dispatch
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info])
        };
        unsafe { self.dispatch.destroy_shader_module(module) };
        let pipeline = result?[0];
        self.pipelines.lock().insert(class, pipeline);
        Ok(pipeline)
    }

    /// Allocates and fills a descriptor set pointing the kernel at one
    /// mip alias and the matching output subresource.
    pub fn allocate_decompression_set(
        &self,
        mipmap_view: vk::ImageView,
        output_view: vk::ImageView,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let set_layouts = [self.set_layout];
        let set = unsafe {
            self.dispatch.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(self.descriptor_pool)
                    .set_layouts(&set_layouts),
            )
        }?[0];

        let mip_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: mipmap_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let out_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: output_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&mip_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&out_info)
                .build(),
        ];
        unsafe { self.dispatch.update_descriptor_sets(&writes, &[]) };
        Ok(set)
    }

    pub fn destroy(&self) {
        let dispatch = &*self.dispatch;
        for (_, pipeline) in self.pipelines.lock().drain() {
            unsafe { dispatch.destroy_pipeline(pipeline) };
        }
        unsafe {
            dispatch.destroy_descriptor_pool(self.descriptor_pool);
            dispatch.destroy_pipeline_layout(self.pipeline_layout);
            dispatch.destroy_descriptor_set_layout(self.set_layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn params(format: vk::Format, width: u32, height: u32, mips: u32) -> ImageCreateParams {
        ImageCreateParams {
            flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: mips,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    #[test]
    fn etc2_output_is_rgba() {
        let info = CompressedImageInfo::new(params(
            vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
            256,
            256,
            1,
        ));
        assert_eq!(info.output_format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(info.mipmap_format, vk::Format::R32G32_UINT);
        assert_eq!((info.block_width, info.block_height), (4, 4));
        assert_eq!(info.class(), CompressedClass::Etc2Rgb);
    }

    #[test]
    fn mip_alias_geometry_rounds_up() {
        let info = CompressedImageInfo::new(params(
            vk::Format::ASTC_6X6_UNORM_BLOCK,
            100,
            50,
            3,
        ));
        // Level 0: 100x50 texels -> 17x9 blocks.
        let level0 = info.mipmap_create_params(0);
        assert_eq!(level0.extent.width, 17);
        assert_eq!(level0.extent.height, 9);
        // Level 2: 25x12 texels -> 5x2 blocks.
        let level2 = info.mipmap_create_params(2);
        assert_eq!(level2.extent.width, 5);
        assert_eq!(level2.extent.height, 2);
        assert_eq!(level2.format, vk::Format::R32G32B32A32_UINT);
    }

    #[test]
    fn copy_region_rewrite_scales_by_block() {
        let info = CompressedImageInfo::new(params(
            vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK,
            64,
            64,
            2,
        ));
        let mut with_mips = info;
        with_mips.mipmap_images = vec![vk::Image::from_raw(101), vk::Image::from_raw(102)];
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 8, y: 16, z: 0 },
            image_extent: vk::Extent3D {
                width: 32,
                height: 30,
                depth: 1,
            },
        };
        let rewritten = with_mips.rewrite_buffer_image_regions(&[region]);
        assert_eq!(rewritten.len(), 1);
        let (image, r) = rewritten[0];
        assert_eq!(image, vk::Image::from_raw(102));
        assert_eq!(r.image_subresource.mip_level, 0);
        assert_eq!(r.image_offset, vk::Offset3D { x: 2, y: 4, z: 0 });
        assert_eq!(r.image_extent.width, 8);
        assert_eq!(r.image_extent.height, 8);
    }
}
