//! Snapshot save and load.
//!
//! A snapshot is the recorded stream of creation commands (replayed
//! through the normal entry points on load, with the registry handing
//! back the original boxed ids) plus byte-content patches: mapped
//! memory, image and buffer contents pulled through transient GPU
//! copies, surviving descriptor writes, and the set of unsignalled
//! fences. Intermediate state is never reconstructed; layouts are
//! reinstated with a synthetic barrier after upload.

use std::io;

use ash::vk::{self, Handle};
use thiserror::Error;

use crate::global::Global;
use crate::memory::{BlobFlags, BlobMem, BlobParams, MemoryAllocateParams, MemoryImport};
use crate::resource::{
    DescriptorWritePayload, ImageCreateParams, LayoutBinding, MemoryCaching, SamplerCreateParams,
};
use crate::stream::Stream;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot stream error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot is corrupt: {0}")]
    Corrupt(String),
    #[error("driver call failed during snapshot: {0:?}")]
    Driver(vk::Result),
}

impl From<vk::Result> for SnapshotError {
    fn from(result: vk::Result) -> Self {
        Self::Driver(result)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageViewParams {
    pub image: u64,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct PushConstantRangeParams {
    pub stage_flags: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Default)]
pub struct SubpassParams {
    pub color_refs: Vec<(u32, vk::ImageLayout)>,
    pub depth_ref: Option<(u32, vk::ImageLayout)>,
    pub input_refs: Vec<(u32, vk::ImageLayout)>,
}

#[derive(Clone, Debug)]
pub enum SnapshotCommand {
    CreateInstance {
        api_version: u32,
        extensions: Vec<String>,
        application_name: String,
        engine_name: String,
        context_id: u32,
    },
    EnumeratePhysicalDevices,
    CreateDevice {
        physical_device: u64,
        extensions: Vec<String>,
        queues: Vec<(u32, u32)>,
        context_id: Option<u32>,
    },
    AllocateMemory {
        device: u64,
        params: MemoryAllocateParams,
    },
    CreateBuffer {
        device: u64,
        size: u64,
        usage: vk::BufferUsageFlags,
    },
    BindBufferMemory {
        device: u64,
        memory: u64,
        offset: u64,
    },
    CreateImage {
        device: u64,
        params: ImageCreateParams,
    },
    BindImageMemory {
        device: u64,
        memory: u64,
        offset: u64,
    },
    CreateImageView {
        device: u64,
        params: ImageViewParams,
    },
    CreateSampler {
        device: u64,
        params: SamplerCreateParams,
    },
    CreateSemaphore {
        device: u64,
        timeline_initial_value: Option<u64>,
    },
    CreateFence {
        device: u64,
        signaled: bool,
    },
    CreateCommandPool {
        device: u64,
        flags: vk::CommandPoolCreateFlags,
        queue_family_index: u32,
    },
    AllocateCommandBuffer {
        device: u64,
        pool: u64,
        level: vk::CommandBufferLevel,
    },
    CreateDescriptorSetLayout {
        device: u64,
        bindings: Vec<LayoutBinding>,
    },
    CreateDescriptorPool {
        device: u64,
        flags: vk::DescriptorPoolCreateFlags,
        max_sets: u32,
        sizes: Vec<vk::DescriptorPoolSize>,
    },
    CreateShaderModule {
        device: u64,
        code: Vec<u32>,
    },
    CreatePipelineCache {
        device: u64,
    },
    CreatePipelineLayout {
        device: u64,
        set_layouts: Vec<u64>,
        push_ranges: Vec<PushConstantRangeParams>,
    },
    CreateComputePipeline {
        device: u64,
        module: u64,
        entry_point: String,
        layout: u64,
    },
    CreateRenderPass {
        device: u64,
        attachments: Vec<vk::AttachmentDescription>,
        subpasses: Vec<SubpassParams>,
    },
    CreateFramebuffer {
        device: u64,
        render_pass: u64,
        attachments: Vec<u64>,
        dims: [u32; 3],
    },
}

/// Creation-ordered command log. Destroying an object removes its
/// commands, so the log replays exactly the live object graph.
pub struct SnapshotLog {
    enabled: bool,
    entries: Vec<(u64, SnapshotCommand)>,
}

macro_rules! record_fns {
    ($($fn_name:ident ( $($arg:ident : $ty:ty),* ) => $cmd:expr;)*) => {
        impl SnapshotLog {
            $(
                #[allow(clippy::too_many_arguments)]
                pub(crate) fn $fn_name(&mut self, subject: u64, $($arg: $ty),*) {
                    if self.enabled {
                        self.entries.push((subject, $cmd));
                    }
                }
            )*
        }
    };
}

impl SnapshotLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn forget(&mut self, subject: u64) {
        if self.enabled {
            self.entries.retain(|(s, _)| *s != subject);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

record_fns! {
    record_create_instance(
        api_version: u32, extensions: Vec<String>, application_name: String,
        engine_name: String, context_id: u32
    ) => SnapshotCommand::CreateInstance {
        api_version, extensions, application_name, engine_name, context_id
    };
    record_enumerate_physical_devices() => SnapshotCommand::EnumeratePhysicalDevices;
    record_create_device(
        physical_device: u64, extensions: Vec<String>, queues: Vec<(u32, u32)>,
        context_id: Option<u32>
    ) => SnapshotCommand::CreateDevice { physical_device, extensions, queues, context_id };
    record_allocate_memory(device: u64, params: &MemoryAllocateParams) =>
        SnapshotCommand::AllocateMemory { device, params: *params };
    record_create_buffer(device: u64, size: u64, usage: vk::BufferUsageFlags) =>
        SnapshotCommand::CreateBuffer { device, size, usage };
    record_bind_buffer_memory(device: u64, memory: u64, offset: u64) =>
        SnapshotCommand::BindBufferMemory { device, memory, offset };
    record_create_image(device: u64, params: ImageCreateParams) =>
        SnapshotCommand::CreateImage { device, params };
    record_bind_image_memory(device: u64, memory: u64, offset: u64) =>
        SnapshotCommand::BindImageMemory { device, memory, offset };
    record_create_image_view(device: u64, params: ImageViewParams) =>
        SnapshotCommand::CreateImageView { device, params };
    record_create_sampler(device: u64, params: SamplerCreateParams) =>
        SnapshotCommand::CreateSampler { device, params };
    record_create_semaphore(device: u64, timeline_initial_value: Option<u64>) =>
        SnapshotCommand::CreateSemaphore { device, timeline_initial_value };
    record_create_fence(device: u64, signaled: bool) =>
        SnapshotCommand::CreateFence { device, signaled };
    record_create_command_pool(
        device: u64, flags: vk::CommandPoolCreateFlags, queue_family_index: u32
    ) => SnapshotCommand::CreateCommandPool { device, flags, queue_family_index };
    record_allocate_command_buffer(device: u64, pool: u64, level: vk::CommandBufferLevel) =>
        SnapshotCommand::AllocateCommandBuffer { device, pool, level };
    record_create_descriptor_set_layout(device: u64, bindings: Vec<LayoutBinding>) =>
        SnapshotCommand::CreateDescriptorSetLayout { device, bindings };
    record_create_descriptor_pool(
        device: u64, flags: vk::DescriptorPoolCreateFlags, max_sets: u32,
        sizes: Vec<vk::DescriptorPoolSize>
    ) => SnapshotCommand::CreateDescriptorPool { device, flags, max_sets, sizes };
    record_create_shader_module(device: u64, code: Vec<u32>) =>
        SnapshotCommand::CreateShaderModule { device, code };
    record_create_pipeline_cache(device: u64) => SnapshotCommand::CreatePipelineCache { device };
    record_create_pipeline_layout(
        device: u64, set_layouts: Vec<u64>, push_ranges: Vec<PushConstantRangeParams>
    ) => SnapshotCommand::CreatePipelineLayout { device, set_layouts, push_ranges };
    record_create_compute_pipeline(
        device: u64, module: u64, entry_point: String, layout: u64
    ) => SnapshotCommand::CreateComputePipeline { device, module, entry_point, layout };
    record_create_render_pass(
        device: u64, attachments: Vec<vk::AttachmentDescription>, subpasses: Vec<SubpassParams>
    ) => SnapshotCommand::CreateRenderPass { device, attachments, subpasses };
    record_create_framebuffer(
        device: u64, render_pass: u64, attachments: Vec<u64>, dims: [u32; 3]
    ) => SnapshotCommand::CreateFramebuffer { device, render_pass, attachments, dims };
}

mod opcode {
    pub const CREATE_INSTANCE: u8 = 1;
    pub const ENUMERATE_PHYSICAL_DEVICES: u8 = 2;
    pub const CREATE_DEVICE: u8 = 3;
    pub const ALLOCATE_MEMORY: u8 = 4;
    pub const CREATE_BUFFER: u8 = 5;
    pub const BIND_BUFFER_MEMORY: u8 = 6;
    pub const CREATE_IMAGE: u8 = 7;
    pub const BIND_IMAGE_MEMORY: u8 = 8;
    pub const CREATE_IMAGE_VIEW: u8 = 9;
    pub const CREATE_SAMPLER: u8 = 10;
    pub const CREATE_SEMAPHORE: u8 = 11;
    pub const CREATE_FENCE: u8 = 12;
    pub const CREATE_COMMAND_POOL: u8 = 13;
    pub const ALLOCATE_COMMAND_BUFFER: u8 = 14;
    pub const CREATE_DESCRIPTOR_SET_LAYOUT: u8 = 15;
    pub const CREATE_DESCRIPTOR_POOL: u8 = 16;
    pub const CREATE_SHADER_MODULE: u8 = 17;
    pub const CREATE_PIPELINE_CACHE: u8 = 18;
    pub const CREATE_PIPELINE_LAYOUT: u8 = 19;
    pub const CREATE_COMPUTE_PIPELINE: u8 = 20;
    pub const CREATE_RENDER_PASS: u8 = 21;
    pub const CREATE_FRAMEBUFFER: u8 = 22;
}

fn put_string_list(stream: &mut dyn Stream, list: &[String]) -> io::Result<()> {
    stream.put_be32(list.len() as u32)?;
    for item in list {
        stream.put_string(item)?;
    }
    Ok(())
}

fn get_string_list(stream: &mut dyn Stream) -> io::Result<Vec<String>> {
    let count = stream.get_be32()? as usize;
    (0..count).map(|_| stream.get_string()).collect()
}

fn put_image_params(stream: &mut dyn Stream, params: &ImageCreateParams) -> io::Result<()> {
    stream.put_be32(params.flags.as_raw())?;
    stream.put_be32(params.image_type.as_raw() as u32)?;
    stream.put_be32(params.format.as_raw() as u32)?;
    stream.put_be32(params.extent.width)?;
    stream.put_be32(params.extent.height)?;
    stream.put_be32(params.extent.depth)?;
    stream.put_be32(params.mip_levels)?;
    stream.put_be32(params.array_layers)?;
    stream.put_be32(params.samples.as_raw())?;
    stream.put_be32(params.tiling.as_raw() as u32)?;
    stream.put_be32(params.usage.as_raw())?;
    stream.put_be32(params.sharing_mode.as_raw() as u32)?;
    stream.put_be32(params.initial_layout.as_raw() as u32)
}

fn get_image_params(stream: &mut dyn Stream) -> io::Result<ImageCreateParams> {
    Ok(ImageCreateParams {
        flags: vk::ImageCreateFlags::from_raw(stream.get_be32()?),
        image_type: vk::ImageType::from_raw(stream.get_be32()? as i32),
        format: vk::Format::from_raw(stream.get_be32()? as i32),
        extent: vk::Extent3D {
            width: stream.get_be32()?,
            height: stream.get_be32()?,
            depth: stream.get_be32()?,
        },
        mip_levels: stream.get_be32()?,
        array_layers: stream.get_be32()?,
        samples: vk::SampleCountFlags::from_raw(stream.get_be32()?),
        tiling: vk::ImageTiling::from_raw(stream.get_be32()? as i32),
        usage: vk::ImageUsageFlags::from_raw(stream.get_be32()?),
        sharing_mode: vk::SharingMode::from_raw(stream.get_be32()? as i32),
        initial_layout: vk::ImageLayout::from_raw(stream.get_be32()? as i32),
    })
}

fn put_sampler_params(stream: &mut dyn Stream, params: &SamplerCreateParams) -> io::Result<()> {
    stream.put_be32(params.flags.as_raw())?;
    stream.put_be32(params.mag_filter.as_raw() as u32)?;
    stream.put_be32(params.min_filter.as_raw() as u32)?;
    stream.put_be32(params.mipmap_mode.as_raw() as u32)?;
    stream.put_be32(params.address_mode_u.as_raw() as u32)?;
    stream.put_be32(params.address_mode_v.as_raw() as u32)?;
    stream.put_be32(params.address_mode_w.as_raw() as u32)?;
    stream.put_be32(params.mip_lod_bias.to_bits())?;
    stream.put_byte(params.anisotropy_enable as u8)?;
    stream.put_be32(params.max_anisotropy.to_bits())?;
    stream.put_byte(params.compare_enable as u8)?;
    stream.put_be32(params.compare_op.as_raw() as u32)?;
    stream.put_be32(params.min_lod.to_bits())?;
    stream.put_be32(params.max_lod.to_bits())?;
    stream.put_be32(params.border_color.as_raw() as u32)?;
    stream.put_byte(params.unnormalized_coordinates as u8)
}

fn get_sampler_params(stream: &mut dyn Stream) -> io::Result<SamplerCreateParams> {
    Ok(SamplerCreateParams {
        flags: vk::SamplerCreateFlags::from_raw(stream.get_be32()?),
        mag_filter: vk::Filter::from_raw(stream.get_be32()? as i32),
        min_filter: vk::Filter::from_raw(stream.get_be32()? as i32),
        mipmap_mode: vk::SamplerMipmapMode::from_raw(stream.get_be32()? as i32),
        address_mode_u: vk::SamplerAddressMode::from_raw(stream.get_be32()? as i32),
        address_mode_v: vk::SamplerAddressMode::from_raw(stream.get_be32()? as i32),
        address_mode_w: vk::SamplerAddressMode::from_raw(stream.get_be32()? as i32),
        mip_lod_bias: f32::from_bits(stream.get_be32()?),
        anisotropy_enable: stream.get_byte()? != 0,
        max_anisotropy: f32::from_bits(stream.get_be32()?),
        compare_enable: stream.get_byte()? != 0,
        compare_op: vk::CompareOp::from_raw(stream.get_be32()? as i32),
        min_lod: f32::from_bits(stream.get_be32()?),
        max_lod: f32::from_bits(stream.get_be32()?),
        border_color: vk::BorderColor::from_raw(stream.get_be32()? as i32),
        unnormalized_coordinates: stream.get_byte()? != 0,
    })
}

fn put_memory_params(stream: &mut dyn Stream, params: &MemoryAllocateParams) -> io::Result<()> {
    stream.put_be64(params.allocation_size)?;
    stream.put_be32(params.guest_memory_type_index)?;
    match params.import {
        MemoryImport::None => stream.put_byte(0)?,
        MemoryImport::ColorBuffer(handle) => {
            stream.put_byte(1)?;
            stream.put_be32(handle)?;
        }
        MemoryImport::Buffer(handle) => {
            stream.put_byte(2)?;
            stream.put_be32(handle)?;
        }
        MemoryImport::Blob(blob) => {
            stream.put_byte(3)?;
            stream.put_byte(matches!(blob.mem, BlobMem::Host3d) as u8)?;
            stream.put_be32(blob.flags.bits())?;
            stream.put_be64(blob.id)?;
        }
    }
    stream.put_byte(params.export_requested as u8)?;
    stream.put_byte(params.protected as u8)?;
    stream.put_byte(match params.caching {
        MemoryCaching::Cached => 0,
        MemoryCaching::Uncached => 1,
        MemoryCaching::WriteCombined => 2,
    })
}

fn get_memory_params(stream: &mut dyn Stream) -> io::Result<MemoryAllocateParams> {
    let allocation_size = stream.get_be64()?;
    let guest_memory_type_index = stream.get_be32()?;
    let import = match stream.get_byte()? {
        0 => MemoryImport::None,
        1 => MemoryImport::ColorBuffer(stream.get_be32()?),
        2 => MemoryImport::Buffer(stream.get_be32()?),
        3 => MemoryImport::Blob(BlobParams {
            mem: if stream.get_byte()? != 0 {
                BlobMem::Host3d
            } else {
                BlobMem::Guest
            },
            flags: BlobFlags::from_bits_truncate(stream.get_be32()?),
            id: stream.get_be64()?,
        }),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown memory import tag {other}"),
            ))
        }
    };
    Ok(MemoryAllocateParams {
        allocation_size,
        guest_memory_type_index,
        import,
        export_requested: stream.get_byte()? != 0,
        protected: stream.get_byte()? != 0,
        caching: match stream.get_byte()? {
            1 => MemoryCaching::Uncached,
            2 => MemoryCaching::WriteCombined,
            _ => MemoryCaching::Cached,
        },
    })
}

fn put_bindings(stream: &mut dyn Stream, bindings: &[LayoutBinding]) -> io::Result<()> {
    stream.put_be32(bindings.len() as u32)?;
    for binding in bindings {
        stream.put_be32(binding.binding)?;
        stream.put_be32(binding.descriptor_type.as_raw() as u32)?;
        stream.put_be32(binding.descriptor_count)?;
        stream.put_be32(binding.stage_flags.as_raw())?;
    }
    Ok(())
}

fn get_bindings(stream: &mut dyn Stream) -> io::Result<Vec<LayoutBinding>> {
    let count = stream.get_be32()? as usize;
    (0..count)
        .map(|_| {
            Ok(LayoutBinding {
                binding: stream.get_be32()?,
                descriptor_type: vk::DescriptorType::from_raw(stream.get_be32()? as i32),
                descriptor_count: stream.get_be32()?,
                stage_flags: vk::ShaderStageFlags::from_raw(stream.get_be32()?),
            })
        })
        .collect()
}

fn put_command(stream: &mut dyn Stream, subject: u64, command: &SnapshotCommand) -> io::Result<()> {
    stream.put_be64(subject)?;
    match command {
        SnapshotCommand::CreateInstance {
            api_version,
            extensions,
            application_name,
            engine_name,
            context_id,
        } => {
            stream.put_byte(opcode::CREATE_INSTANCE)?;
            stream.put_be32(*api_version)?;
            put_string_list(stream, extensions)?;
            stream.put_string(application_name)?;
            stream.put_string(engine_name)?;
            stream.put_be32(*context_id)?;
        }
        SnapshotCommand::EnumeratePhysicalDevices => {
            stream.put_byte(opcode::ENUMERATE_PHYSICAL_DEVICES)?;
        }
        SnapshotCommand::CreateDevice {
            physical_device,
            extensions,
            queues,
            context_id,
        } => {
            stream.put_byte(opcode::CREATE_DEVICE)?;
            stream.put_be64(*physical_device)?;
            put_string_list(stream, extensions)?;
            stream.put_be32(queues.len() as u32)?;
            for &(family, count) in queues {
                stream.put_be32(family)?;
                stream.put_be32(count)?;
            }
            stream.put_byte(context_id.is_some() as u8)?;
            stream.put_be32(context_id.unwrap_or(0))?;
        }
        SnapshotCommand::AllocateMemory { device, params } => {
            stream.put_byte(opcode::ALLOCATE_MEMORY)?;
            stream.put_be64(*device)?;
            put_memory_params(stream, params)?;
        }
        SnapshotCommand::CreateBuffer {
            device,
            size,
            usage,
        } => {
            stream.put_byte(opcode::CREATE_BUFFER)?;
            stream.put_be64(*device)?;
            stream.put_be64(*size)?;
            stream.put_be32(usage.as_raw())?;
        }
        SnapshotCommand::BindBufferMemory {
            device,
            memory,
            offset,
        } => {
            stream.put_byte(opcode::BIND_BUFFER_MEMORY)?;
            stream.put_be64(*device)?;
            stream.put_be64(*memory)?;
            stream.put_be64(*offset)?;
        }
        SnapshotCommand::CreateImage { device, params } => {
            stream.put_byte(opcode::CREATE_IMAGE)?;
            stream.put_be64(*device)?;
            put_image_params(stream, params)?;
        }
        SnapshotCommand::BindImageMemory {
            device,
            memory,
            offset,
        } => {
            stream.put_byte(opcode::BIND_IMAGE_MEMORY)?;
            stream.put_be64(*device)?;
            stream.put_be64(*memory)?;
            stream.put_be64(*offset)?;
        }
        SnapshotCommand::CreateImageView { device, params } => {
            stream.put_byte(opcode::CREATE_IMAGE_VIEW)?;
            stream.put_be64(*device)?;
            stream.put_be64(params.image)?;
            stream.put_be32(params.view_type.as_raw() as u32)?;
            stream.put_be32(params.format.as_raw() as u32)?;
            stream.put_be32(params.aspect_mask.as_raw())?;
            stream.put_be32(params.base_mip_level)?;
            stream.put_be32(params.level_count)?;
            stream.put_be32(params.base_array_layer)?;
            stream.put_be32(params.layer_count)?;
        }
        SnapshotCommand::CreateSampler { device, params } => {
            stream.put_byte(opcode::CREATE_SAMPLER)?;
            stream.put_be64(*device)?;
            put_sampler_params(stream, params)?;
        }
        SnapshotCommand::CreateSemaphore {
            device,
            timeline_initial_value,
        } => {
            stream.put_byte(opcode::CREATE_SEMAPHORE)?;
            stream.put_be64(*device)?;
            stream.put_byte(timeline_initial_value.is_some() as u8)?;
            stream.put_be64(timeline_initial_value.unwrap_or(0))?;
        }
        SnapshotCommand::CreateFence { device, signaled } => {
            stream.put_byte(opcode::CREATE_FENCE)?;
            stream.put_be64(*device)?;
            stream.put_byte(*signaled as u8)?;
        }
        SnapshotCommand::CreateCommandPool {
            device,
            flags,
            queue_family_index,
        } => {
            stream.put_byte(opcode::CREATE_COMMAND_POOL)?;
            stream.put_be64(*device)?;
            stream.put_be32(flags.as_raw())?;
            stream.put_be32(*queue_family_index)?;
        }
        SnapshotCommand::AllocateCommandBuffer {
            device,
            pool,
            level,
        } => {
            stream.put_byte(opcode::ALLOCATE_COMMAND_BUFFER)?;
            stream.put_be64(*device)?;
            stream.put_be64(*pool)?;
            stream.put_be32(level.as_raw() as u32)?;
        }
        SnapshotCommand::CreateDescriptorSetLayout { device, bindings } => {
            stream.put_byte(opcode::CREATE_DESCRIPTOR_SET_LAYOUT)?;
            stream.put_be64(*device)?;
            put_bindings(stream, bindings)?;
        }
        SnapshotCommand::CreateDescriptorPool {
            device,
            flags,
            max_sets,
            sizes,
        } => {
            stream.put_byte(opcode::CREATE_DESCRIPTOR_POOL)?;
            stream.put_be64(*device)?;
            stream.put_be32(flags.as_raw())?;
            stream.put_be32(*max_sets)?;
            stream.put_be32(sizes.len() as u32)?;
            for size in sizes {
                stream.put_be32(size.ty.as_raw() as u32)?;
                stream.put_be32(size.descriptor_count)?;
            }
        }
        SnapshotCommand::CreateShaderModule { device, code } => {
            stream.put_byte(opcode::CREATE_SHADER_MODULE)?;
            stream.put_be64(*device)?;
            stream.put_be32(code.len() as u32)?;
            for word in code {
                stream.put_be32(*word)?;
            }
        }
        SnapshotCommand::CreatePipelineCache { device } => {
            stream.put_byte(opcode::CREATE_PIPELINE_CACHE)?;
            stream.put_be64(*device)?;
        }
        SnapshotCommand::CreatePipelineLayout {
            device,
            set_layouts,
            push_ranges,
        } => {
            stream.put_byte(opcode::CREATE_PIPELINE_LAYOUT)?;
            stream.put_be64(*device)?;
            stream.put_be32(set_layouts.len() as u32)?;
            for layout in set_layouts {
                stream.put_be64(*layout)?;
            }
            stream.put_be32(push_ranges.len() as u32)?;
            for range in push_ranges {
                stream.put_be32(range.stage_flags.as_raw())?;
                stream.put_be32(range.offset)?;
                stream.put_be32(range.size)?;
            }
        }
        SnapshotCommand::CreateComputePipeline {
            device,
            module,
            entry_point,
            layout,
        } => {
            stream.put_byte(opcode::CREATE_COMPUTE_PIPELINE)?;
            stream.put_be64(*device)?;
            stream.put_be64(*module)?;
            stream.put_string(entry_point)?;
            stream.put_be64(*layout)?;
        }
        SnapshotCommand::CreateRenderPass {
            device,
            attachments,
            subpasses,
        } => {
            stream.put_byte(opcode::CREATE_RENDER_PASS)?;
            stream.put_be64(*device)?;
            stream.put_be32(attachments.len() as u32)?;
            for a in attachments {
                stream.put_be32(a.flags.as_raw())?;
                stream.put_be32(a.format.as_raw() as u32)?;
                stream.put_be32(a.samples.as_raw())?;
                stream.put_be32(a.load_op.as_raw() as u32)?;
                stream.put_be32(a.store_op.as_raw() as u32)?;
                stream.put_be32(a.stencil_load_op.as_raw() as u32)?;
                stream.put_be32(a.stencil_store_op.as_raw() as u32)?;
                stream.put_be32(a.initial_layout.as_raw() as u32)?;
                stream.put_be32(a.final_layout.as_raw() as u32)?;
            }
            stream.put_be32(subpasses.len() as u32)?;
            for subpass in subpasses {
                let put_refs = |stream: &mut dyn Stream,
                                refs: &[(u32, vk::ImageLayout)]|
                 -> io::Result<()> {
                    stream.put_be32(refs.len() as u32)?;
                    for &(attachment, layout) in refs {
                        stream.put_be32(attachment)?;
                        stream.put_be32(layout.as_raw() as u32)?;
                    }
                    Ok(())
                };
                put_refs(stream, &subpass.color_refs)?;
                put_refs(stream, &subpass.input_refs)?;
                stream.put_byte(subpass.depth_ref.is_some() as u8)?;
                if let Some((attachment, layout)) = subpass.depth_ref {
                    stream.put_be32(attachment)?;
                    stream.put_be32(layout.as_raw() as u32)?;
                }
            }
        }
        SnapshotCommand::CreateFramebuffer {
            device,
            render_pass,
            attachments,
            dims,
        } => {
            stream.put_byte(opcode::CREATE_FRAMEBUFFER)?;
            stream.put_be64(*device)?;
            stream.put_be64(*render_pass)?;
            stream.put_be32(attachments.len() as u32)?;
            for a in attachments {
                stream.put_be64(*a)?;
            }
            for d in dims {
                stream.put_be32(*d)?;
            }
        }
    }
    Ok(())
}

fn get_command(stream: &mut dyn Stream) -> io::Result<(u64, SnapshotCommand)> {
    let subject = stream.get_be64()?;
    let op = stream.get_byte()?;
    let command = match op {
        opcode::CREATE_INSTANCE => SnapshotCommand::CreateInstance {
            api_version: stream.get_be32()?,
            extensions: get_string_list(stream)?,
            application_name: stream.get_string()?,
            engine_name: stream.get_string()?,
            context_id: stream.get_be32()?,
        },
        opcode::ENUMERATE_PHYSICAL_DEVICES => SnapshotCommand::EnumeratePhysicalDevices,
        opcode::CREATE_DEVICE => {
            let physical_device = stream.get_be64()?;
            let extensions = get_string_list(stream)?;
            let queue_count = stream.get_be32()? as usize;
            let queues = (0..queue_count)
                .map(|_| Ok((stream.get_be32()?, stream.get_be32()?)))
                .collect::<io::Result<Vec<_>>>()?;
            let has_context = stream.get_byte()? != 0;
            let context_value = stream.get_be32()?;
            SnapshotCommand::CreateDevice {
                physical_device,
                extensions,
                queues,
                context_id: has_context.then_some(context_value),
            }
        }
        opcode::ALLOCATE_MEMORY => SnapshotCommand::AllocateMemory {
            device: stream.get_be64()?,
            params: get_memory_params(stream)?,
        },
        opcode::CREATE_BUFFER => SnapshotCommand::CreateBuffer {
            device: stream.get_be64()?,
            size: stream.get_be64()?,
            usage: vk::BufferUsageFlags::from_raw(stream.get_be32()?),
        },
        opcode::BIND_BUFFER_MEMORY => SnapshotCommand::BindBufferMemory {
            device: stream.get_be64()?,
            memory: stream.get_be64()?,
            offset: stream.get_be64()?,
        },
        opcode::CREATE_IMAGE => SnapshotCommand::CreateImage {
            device: stream.get_be64()?,
            params: get_image_params(stream)?,
        },
        opcode::BIND_IMAGE_MEMORY => SnapshotCommand::BindImageMemory {
            device: stream.get_be64()?,
            memory: stream.get_be64()?,
            offset: stream.get_be64()?,
        },
        opcode::CREATE_IMAGE_VIEW => SnapshotCommand::CreateImageView {
            device: stream.get_be64()?,
            params: ImageViewParams {
                image: stream.get_be64()?,
                view_type: vk::ImageViewType::from_raw(stream.get_be32()? as i32),
                format: vk::Format::from_raw(stream.get_be32()? as i32),
                aspect_mask: vk::ImageAspectFlags::from_raw(stream.get_be32()?),
                base_mip_level: stream.get_be32()?,
                level_count: stream.get_be32()?,
                base_array_layer: stream.get_be32()?,
                layer_count: stream.get_be32()?,
            },
        },
        opcode::CREATE_SAMPLER => SnapshotCommand::CreateSampler {
            device: stream.get_be64()?,
            params: get_sampler_params(stream)?,
        },
        opcode::CREATE_SEMAPHORE => {
            let device = stream.get_be64()?;
            let is_timeline = stream.get_byte()? != 0;
            let value = stream.get_be64()?;
            SnapshotCommand::CreateSemaphore {
                device,
                timeline_initial_value: is_timeline.then_some(value),
            }
        }
        opcode::CREATE_FENCE => SnapshotCommand::CreateFence {
            device: stream.get_be64()?,
            signaled: stream.get_byte()? != 0,
        },
        opcode::CREATE_COMMAND_POOL => SnapshotCommand::CreateCommandPool {
            device: stream.get_be64()?,
            flags: vk::CommandPoolCreateFlags::from_raw(stream.get_be32()?),
            queue_family_index: stream.get_be32()?,
        },
        opcode::ALLOCATE_COMMAND_BUFFER => SnapshotCommand::AllocateCommandBuffer {
            device: stream.get_be64()?,
            pool: stream.get_be64()?,
            level: vk::CommandBufferLevel::from_raw(stream.get_be32()? as i32),
        },
        opcode::CREATE_DESCRIPTOR_SET_LAYOUT => SnapshotCommand::CreateDescriptorSetLayout {
            device: stream.get_be64()?,
            bindings: get_bindings(stream)?,
        },
        opcode::CREATE_DESCRIPTOR_POOL => {
            let device = stream.get_be64()?;
            let flags = vk::DescriptorPoolCreateFlags::from_raw(stream.get_be32()?);
            let max_sets = stream.get_be32()?;
            let size_count = stream.get_be32()? as usize;
            let sizes = (0..size_count)
                .map(|_| {
                    Ok(vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::from_raw(stream.get_be32()? as i32),
                        descriptor_count: stream.get_be32()?,
                    })
                })
                .collect::<io::Result<Vec<_>>>()?;
            SnapshotCommand::CreateDescriptorPool {
                device,
                flags,
                max_sets,
                sizes,
            }
        }
        opcode::CREATE_SHADER_MODULE => {
            let device = stream.get_be64()?;
            let word_count = stream.get_be32()? as usize;
            let code = (0..word_count)
                .map(|_| stream.get_be32())
                .collect::<io::Result<Vec<_>>>()?;
            SnapshotCommand::CreateShaderModule { device, code }
        }
        opcode::CREATE_PIPELINE_CACHE => SnapshotCommand::CreatePipelineCache {
            device: stream.get_be64()?,
        },
        opcode::CREATE_PIPELINE_LAYOUT => {
            let device = stream.get_be64()?;
            let layout_count = stream.get_be32()? as usize;
            let set_layouts = (0..layout_count)
                .map(|_| stream.get_be64())
                .collect::<io::Result<Vec<_>>>()?;
            let range_count = stream.get_be32()? as usize;
            let push_ranges = (0..range_count)
                .map(|_| {
                    Ok(PushConstantRangeParams {
                        stage_flags: vk::ShaderStageFlags::from_raw(stream.get_be32()?),
                        offset: stream.get_be32()?,
                        size: stream.get_be32()?,
                    })
                })
                .collect::<io::Result<Vec<_>>>()?;
            SnapshotCommand::CreatePipelineLayout {
                device,
                set_layouts,
                push_ranges,
            }
        }
        opcode::CREATE_COMPUTE_PIPELINE => SnapshotCommand::CreateComputePipeline {
            device: stream.get_be64()?,
            module: stream.get_be64()?,
            entry_point: stream.get_string()?,
            layout: stream.get_be64()?,
        },
        opcode::CREATE_RENDER_PASS => {
            let device = stream.get_be64()?;
            let attachment_count = stream.get_be32()? as usize;
            let attachments = (0..attachment_count)
                .map(|_| {
                    Ok(vk::AttachmentDescription {
                        flags: vk::AttachmentDescriptionFlags::from_raw(stream.get_be32()?),
                        format: vk::Format::from_raw(stream.get_be32()? as i32),
                        samples: vk::SampleCountFlags::from_raw(stream.get_be32()?),
                        load_op: vk::AttachmentLoadOp::from_raw(stream.get_be32()? as i32),
                        store_op: vk::AttachmentStoreOp::from_raw(stream.get_be32()? as i32),
                        stencil_load_op: vk::AttachmentLoadOp::from_raw(stream.get_be32()? as i32),
                        stencil_store_op: vk::AttachmentStoreOp::from_raw(
                            stream.get_be32()? as i32
                        ),
                        initial_layout: vk::ImageLayout::from_raw(stream.get_be32()? as i32),
                        final_layout: vk::ImageLayout::from_raw(stream.get_be32()? as i32),
                    })
                })
                .collect::<io::Result<Vec<_>>>()?;
            let subpass_count = stream.get_be32()? as usize;
            let mut subpasses = Vec::with_capacity(subpass_count);
            for _ in 0..subpass_count {
                let get_refs = |stream: &mut dyn Stream| -> io::Result<Vec<(u32, vk::ImageLayout)>> {
                    let count = stream.get_be32()? as usize;
                    (0..count)
                        .map(|_| {
                            Ok((
                                stream.get_be32()?,
                                vk::ImageLayout::from_raw(stream.get_be32()? as i32),
                            ))
                        })
                        .collect()
                };
                let color_refs = get_refs(stream)?;
                let input_refs = get_refs(stream)?;
                let depth_ref = if stream.get_byte()? != 0 {
                    Some((
                        stream.get_be32()?,
                        vk::ImageLayout::from_raw(stream.get_be32()? as i32),
                    ))
                } else {
                    None
                };
                subpasses.push(SubpassParams {
                    color_refs,
                    depth_ref,
                    input_refs,
                });
            }
            SnapshotCommand::CreateRenderPass {
                device,
                attachments,
                subpasses,
            }
        }
        opcode::CREATE_FRAMEBUFFER => {
            let device = stream.get_be64()?;
            let render_pass = stream.get_be64()?;
            let attachment_count = stream.get_be32()? as usize;
            let attachments = (0..attachment_count)
                .map(|_| stream.get_be64())
                .collect::<io::Result<Vec<_>>>()?;
            let dims = [stream.get_be32()?, stream.get_be32()?, stream.get_be32()?];
            SnapshotCommand::CreateFramebuffer {
                device,
                render_pass,
                attachments,
                dims,
            }
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown snapshot opcode {other}"),
            ))
        }
    };
    Ok((subject, command))
}

/// Bytes per texel of the formats the content dumper handles; anything
/// exotic falls back to 4.
fn bytes_per_texel(format: vk::Format) -> u64 {
    use vk::Format as F;
    match format {
        F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT => 1,
        F::R8G8_UNORM | F::R16_UNORM | F::R16_SFLOAT | F::D16_UNORM => 2,
        F::R16G16B16A16_SFLOAT | F::R16G16B16A16_UNORM | F::R32G32_SFLOAT => 8,
        F::R32G32B32A32_SFLOAT | F::R32G32B32A32_UINT => 16,
        _ => 4,
    }
}

fn image_byte_size(params: &ImageCreateParams) -> u64 {
    let mut total = 0u64;
    for level in 0..params.mip_levels {
        let w = (params.extent.width >> level).max(1) as u64;
        let h = (params.extent.height >> level).max(1) as u64;
        let d = (params.extent.depth >> level).max(1) as u64;
        total += w * h * d * params.array_layers as u64 * bytes_per_texel(params.format);
    }
    total
}

impl Global {
    /// Writes the full decoded state. The embedder must guarantee no
    /// concurrent decoder traffic for the duration.
    pub fn snapshot_save(&self, stream: &mut dyn Stream) -> Result<(), SnapshotError> {
        self.api_log("snapshot save");

        // Device and instance context maps.
        let (device_contexts, instance_contexts) = {
            let state = self.lock_state();
            let mut devices: Vec<(u64, u32)> = state
                .tables
                .devices
                .values()
                .map(|d| (d.boxed.as_raw(), d.virtio_gpu_context_id.unwrap_or(0)))
                .collect();
            devices.sort_unstable();
            let mut instances: Vec<(u64, u32)> = state
                .tables
                .instances
                .values()
                .map(|i| (i.boxed.as_raw(), i.context_id))
                .collect();
            instances.sort_unstable();
            (devices, instances)
        };
        stream.put_be64(device_contexts.len() as u64)?;
        for (boxed, context) in device_contexts {
            stream.put_be64(boxed)?;
            stream.put_be32(context)?;
        }
        stream.put_be64(instance_contexts.len() as u64)?;
        for (boxed, context) in instance_contexts {
            stream.put_be64(boxed)?;
            stream.put_be32(context)?;
        }

        // Replay blob: creation commands plus handle-allocation order.
        {
            let snapshot = self.snapshot.lock();
            if !snapshot.is_enabled() {
                return Err(SnapshotError::Corrupt(
                    "snapshot save without the snapshot feature enabled".into(),
                ));
            }
            stream.put_be32(snapshot.entries.len() as u32)?;
            for (subject, command) in &snapshot.entries {
                put_command(stream, *subject, command)?;
            }
        }
        let order = self.registry.allocation_order();
        stream.put_be64(order.len() as u64)?;
        for boxed in order {
            stream.put_be64(boxed)?;
        }

        // Mapped memory bytes.
        let mapped: Vec<(u64, u64, *const u8)> = {
            let state = self.lock_state();
            let mut mapped: Vec<(u64, u64, *const u8)> = state
                .tables
                .memories
                .values()
                .filter(|m| !m.ptr.is_null())
                .map(|m| (m.boxed.as_raw(), m.size, m.ptr.0 as *const u8))
                .collect();
            mapped.sort_unstable_by_key(|&(boxed, _, _)| boxed);
            mapped
        };
        stream.put_be32(mapped.len() as u32)?;
        for (boxed, size, ptr) in mapped {
            stream.put_be64(boxed)?;
            stream.put_be64(size)?;
            let bytes = unsafe { std::slice::from_raw_parts(ptr, size as usize) };
            stream.write(bytes)?;
        }

        // Image contents, sorted by boxed handle.
        let images: Vec<(u64, vk::Image)> = {
            let state = self.lock_state();
            let mut images: Vec<(u64, vk::Image)> = state
                .tables
                .images
                .iter()
                .map(|(&raw, info)| (info.boxed.as_raw(), raw))
                .collect();
            images.sort_unstable_by_key(|&(boxed, _)| boxed);
            images
        };
        for (_, raw) in images {
            let (bound, layout, device_boxed, params, memory, offset) = {
                let state = self.lock_state();
                let info = &state.tables.images[&raw];
                let device_boxed = state.tables.devices[&info.device].boxed;
                (
                    info.memory != vk::DeviceMemory::null(),
                    info.layout,
                    device_boxed,
                    info.create_params,
                    info.memory,
                    info.memory_offset,
                )
            };
            if !bound {
                continue;
            }
            stream.put_be32(layout.as_raw() as u32)?;
            let content = self.read_gpu_content(
                device_boxed,
                GpuContent::Image {
                    image: raw,
                    params,
                    layout,
                },
                memory,
                offset,
                image_byte_size(&params),
            )?;
            stream.put_bytes(&content)?;
        }

        // Buffer contents, sorted by boxed handle.
        let buffers: Vec<(u64, vk::Buffer)> = {
            let state = self.lock_state();
            let mut buffers: Vec<(u64, vk::Buffer)> = state
                .tables
                .buffers
                .iter()
                .map(|(&raw, info)| (info.boxed.as_raw(), raw))
                .collect();
            buffers.sort_unstable_by_key(|&(boxed, _)| boxed);
            buffers
        };
        for (_, raw) in buffers {
            let (bound, device_boxed, size, memory, offset) = {
                let state = self.lock_state();
                let info = &state.tables.buffers[&raw];
                let device_boxed = state.tables.devices[&info.device].boxed;
                (
                    info.memory != vk::DeviceMemory::null(),
                    device_boxed,
                    info.size,
                    info.memory,
                    info.memory_offset,
                )
            };
            if !bound {
                continue;
            }
            let content = self.read_gpu_content(
                device_boxed,
                GpuContent::Buffer { buffer: raw, size },
                memory,
                offset,
                size,
            )?;
            stream.put_bytes(&content)?;
        }

        // Descriptor pools: surviving writes per preallocated pool-id.
        self.save_descriptor_pools(stream)?;

        // Unsignalled fences.
        let unsignalled: Vec<u64> = {
            let state = self.lock_state();
            let mut list = Vec::new();
            for (&raw, info) in state.tables.fences.iter() {
                let device_boxed = state.tables.devices[&info.device].boxed;
                let dispatch = self.registry.device_dispatch(device_boxed.as_raw());
                let signalled = unsafe { dispatch.get_fence_status(raw) }.unwrap_or(true);
                if !signalled {
                    list.push(info.boxed.as_raw());
                }
            }
            list.sort_unstable();
            list
        };
        stream.put_be64(unsignalled.len() as u64)?;
        for boxed in unsignalled {
            stream.put_be64(boxed)?;
        }
        Ok(())
    }

    /// Rebuilds the decoded state from a previous save. All prior guest
    /// state must already be gone.
    pub fn snapshot_load(&self, stream: &mut dyn Stream) -> Result<(), SnapshotError> {
        self.api_log("snapshot load");

        let device_context_count = stream.get_be64()? as usize;
        let device_contexts: Vec<(u64, u32)> = (0..device_context_count)
            .map(|_| Ok::<_, io::Error>((stream.get_be64()?, stream.get_be32()?)))
            .collect::<Result<_, _>>()?;
        let instance_context_count = stream.get_be64()? as usize;
        let instance_contexts: Vec<(u64, u32)> = (0..instance_context_count)
            .map(|_| Ok::<_, io::Error>((stream.get_be64()?, stream.get_be32()?)))
            .collect::<Result<_, _>>()?;

        let command_count = stream.get_be32()? as usize;
        let commands: Vec<(u64, SnapshotCommand)> = (0..command_count)
            .map(|_| get_command(stream))
            .collect::<Result<_, _>>()?;
        let order_count = stream.get_be64()? as usize;
        let order: Vec<u64> = (0..order_count)
            .map(|_| stream.get_be64())
            .collect::<Result<_, _>>()?;

        self.registry.begin_replay(order);
        for (subject, command) in &commands {
            self.replay_command(*subject, command)?;
        }
        if self.registry.replay_remaining() != 0 {
            log::warn!(
                "snapshot replay left {} handle ids unclaimed",
                self.registry.replay_remaining()
            );
        }

        // Reapply context attribution.
        {
            let mut state = self.lock_state();
            for (boxed, context) in &instance_contexts {
                let raw = self.registry.unbox(vk::Instance::from_raw(*boxed));
                if let Some(info) = state.tables.instances.get_mut(&raw) {
                    info.context_id = *context;
                }
            }
            for (boxed, context) in &device_contexts {
                let raw = self.registry.unbox(vk::Device::from_raw(*boxed));
                if let Some(info) = state.tables.devices.get_mut(&raw) {
                    if *context != 0 {
                        info.virtio_gpu_context_id = Some(*context);
                    }
                }
            }
        }

        // Mapped memory bytes.
        let mapped_count = stream.get_be32()? as usize;
        for _ in 0..mapped_count {
            let boxed = stream.get_be64()?;
            let size = stream.get_be64()? as usize;
            let mut bytes = vec![0u8; size];
            stream.read(&mut bytes)?;
            let raw = self.registry.unbox(vk::DeviceMemory::from_raw(boxed));
            let state = self.lock_state();
            match state.tables.memories.get(&raw) {
                Some(info) if !info.ptr.is_null() && info.size as usize >= size => unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), info.ptr.0, size);
                },
                Some(info) => {
                    return Err(SnapshotError::Corrupt(format!(
                        "mapped memory size mismatch: saved {size}, live {}",
                        info.size
                    )))
                }
                None => {
                    return Err(SnapshotError::Corrupt(
                        "mapped memory entry names an unknown allocation".into(),
                    ))
                }
            }
        }

        // Image contents and layouts.
        let images: Vec<(u64, vk::Image)> = {
            let state = self.lock_state();
            let mut images: Vec<(u64, vk::Image)> = state
                .tables
                .images
                .iter()
                .map(|(&raw, info)| (info.boxed.as_raw(), raw))
                .collect();
            images.sort_unstable_by_key(|&(boxed, _)| boxed);
            images
        };
        for (_, raw) in images {
            let (bound, device_boxed, params, memory, offset) = {
                let state = self.lock_state();
                let info = &state.tables.images[&raw];
                let device_boxed = state.tables.devices[&info.device].boxed;
                (
                    info.memory != vk::DeviceMemory::null(),
                    device_boxed,
                    info.create_params,
                    info.memory,
                    info.memory_offset,
                )
            };
            if !bound {
                continue;
            }
            let layout = vk::ImageLayout::from_raw(stream.get_be32()? as i32);
            let content = stream.get_bytes()?;
            self.write_gpu_content(
                device_boxed,
                GpuContent::Image {
                    image: raw,
                    params,
                    layout,
                },
                memory,
                offset,
                &content,
            )?;
            let mut state = self.lock_state();
            if let Some(info) = state.tables.images.get_mut(&raw) {
                info.layout = layout;
            }
        }

        // Buffer contents.
        let buffers: Vec<(u64, vk::Buffer)> = {
            let state = self.lock_state();
            let mut buffers: Vec<(u64, vk::Buffer)> = state
                .tables
                .buffers
                .iter()
                .map(|(&raw, info)| (info.boxed.as_raw(), raw))
                .collect();
            buffers.sort_unstable_by_key(|&(boxed, _)| boxed);
            buffers
        };
        for (_, raw) in buffers {
            let (bound, device_boxed, size, memory, offset) = {
                let state = self.lock_state();
                let info = &state.tables.buffers[&raw];
                let device_boxed = state.tables.devices[&info.device].boxed;
                (
                    info.memory != vk::DeviceMemory::null(),
                    device_boxed,
                    info.size,
                    info.memory,
                    info.memory_offset,
                )
            };
            if !bound {
                continue;
            }
            let content = stream.get_bytes()?;
            self.write_gpu_content(
                device_boxed,
                GpuContent::Buffer { buffer: raw, size },
                memory,
                offset,
                &content,
            )?;
        }

        self.load_descriptor_pools(stream)?;

        // Every fence was recreated signalled; reset the saved
        // unsignalled set.
        let fence_count = stream.get_be64()? as usize;
        for _ in 0..fence_count {
            let boxed = vk::Fence::from_raw(stream.get_be64()?);
            let device_boxed = {
                let raw = self.registry.unbox(boxed);
                let state = self.lock_state();
                let device = state.tables.fences[&raw].device;
                state.tables.devices[&device].boxed
            };
            self.on_reset_fences(device_boxed, &[boxed])?;
        }
        Ok(())
    }

    fn replay_command(&self, subject: u64, command: &SnapshotCommand) -> Result<(), SnapshotError> {
        match command {
            SnapshotCommand::CreateInstance {
                api_version,
                extensions,
                application_name,
                engine_name,
                context_id,
            } => {
                let extension_cstrings: Vec<std::ffi::CString> = extensions
                    .iter()
                    .map(|e| std::ffi::CString::new(e.as_str()).unwrap())
                    .collect();
                let extension_ptrs: Vec<*const std::os::raw::c_char> =
                    extension_cstrings.iter().map(|e| e.as_ptr()).collect();
                let app_name = std::ffi::CString::new(application_name.as_str()).unwrap();
                let engine = std::ffi::CString::new(engine_name.as_str()).unwrap();
                let app_info = vk::ApplicationInfo::builder()
                    .application_name(&app_name)
                    .engine_name(&engine)
                    .api_version(*api_version);
                let create_info = vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_extension_names(&extension_ptrs);
                unsafe { self.on_create_instance(&create_info, *context_id) }?;
            }
            SnapshotCommand::EnumeratePhysicalDevices => {
                let mut count = 0u32;
                let result =
                    self.on_enumerate_physical_devices(vk::Instance::from_raw(subject), &mut count, None);
                if result != vk::Result::SUCCESS {
                    return Err(SnapshotError::Driver(result));
                }
            }
            SnapshotCommand::CreateDevice {
                physical_device,
                extensions,
                queues,
                context_id,
            } => {
                let extension_cstrings: Vec<std::ffi::CString> = extensions
                    .iter()
                    .map(|e| std::ffi::CString::new(e.as_str()).unwrap())
                    .collect();
                let extension_ptrs: Vec<*const std::os::raw::c_char> =
                    extension_cstrings.iter().map(|e| e.as_ptr()).collect();
                let priorities = vec![1.0f32; 16];
                let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queues
                    .iter()
                    .map(|&(family, count)| {
                        vk::DeviceQueueCreateInfo::builder()
                            .queue_family_index(family)
                            .queue_priorities(&priorities[..count.clamp(1, 16) as usize])
                            .build()
                    })
                    .collect();
                let create_info = vk::DeviceCreateInfo::builder()
                    .queue_create_infos(&queue_infos)
                    .enabled_extension_names(&extension_ptrs);
                unsafe {
                    self.on_create_device(
                        vk::PhysicalDevice::from_raw(*physical_device),
                        &create_info,
                        *context_id,
                    )
                }?;
            }
            SnapshotCommand::AllocateMemory { device, params } => {
                self.on_allocate_memory(vk::Device::from_raw(*device), params)?;
            }
            SnapshotCommand::CreateBuffer {
                device,
                size,
                usage,
            } => {
                self.on_create_buffer(vk::Device::from_raw(*device), *size, *usage)?;
            }
            SnapshotCommand::BindBufferMemory {
                device,
                memory,
                offset,
            } => {
                self.on_bind_buffer_memory(
                    vk::Device::from_raw(*device),
                    vk::Buffer::from_raw(subject),
                    vk::DeviceMemory::from_raw(*memory),
                    *offset,
                )?;
            }
            SnapshotCommand::CreateImage { device, params } => {
                unsafe {
                    self.on_create_image(vk::Device::from_raw(*device), &params.to_vk(), None)
                }?;
            }
            SnapshotCommand::BindImageMemory {
                device,
                memory,
                offset,
            } => {
                self.on_bind_image_memory(
                    vk::Device::from_raw(*device),
                    vk::Image::from_raw(subject),
                    vk::DeviceMemory::from_raw(*memory),
                    *offset,
                )?;
            }
            SnapshotCommand::CreateImageView { device, params } => {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(vk::Image::from_raw(params.image))
                    .view_type(params.view_type)
                    .format(params.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: params.aspect_mask,
                        base_mip_level: params.base_mip_level,
                        level_count: params.level_count,
                        base_array_layer: params.base_array_layer,
                        layer_count: params.layer_count,
                    });
                unsafe { self.on_create_image_view(vk::Device::from_raw(*device), &create_info) }?;
            }
            SnapshotCommand::CreateSampler { device, params } => {
                unsafe { self.on_create_sampler(vk::Device::from_raw(*device), &params.to_vk()) }?;
            }
            SnapshotCommand::CreateSemaphore {
                device,
                timeline_initial_value,
            } => {
                self.on_create_semaphore(
                    vk::Device::from_raw(*device),
                    false,
                    *timeline_initial_value,
                )?;
            }
            SnapshotCommand::CreateFence { device, signaled } => {
                // Fences are always recreated signalled; the saved
                // unsignalled set is reset at the end of the load.
                let _ = signaled;
                let create_info =
                    vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
                self.on_create_fence(vk::Device::from_raw(*device), &create_info, false)?;
            }
            SnapshotCommand::CreateCommandPool {
                device,
                flags,
                queue_family_index,
            } => {
                self.on_create_command_pool(
                    vk::Device::from_raw(*device),
                    *flags,
                    *queue_family_index,
                )?;
            }
            SnapshotCommand::AllocateCommandBuffer {
                device,
                pool,
                level,
            } => {
                self.on_allocate_command_buffers(
                    vk::Device::from_raw(*device),
                    vk::CommandPool::from_raw(*pool),
                    *level,
                    1,
                )?;
            }
            SnapshotCommand::CreateDescriptorSetLayout { device, bindings } => {
                self.on_create_descriptor_set_layout(vk::Device::from_raw(*device), bindings)?;
            }
            SnapshotCommand::CreateDescriptorPool {
                device,
                flags,
                max_sets,
                sizes,
            } => {
                self.on_create_descriptor_pool(
                    vk::Device::from_raw(*device),
                    *flags,
                    *max_sets,
                    sizes,
                )?;
            }
            SnapshotCommand::CreateShaderModule { device, code } => {
                let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
                unsafe {
                    self.on_create_shader_module(vk::Device::from_raw(*device), &create_info)
                }?;
            }
            SnapshotCommand::CreatePipelineCache { device } => {
                self.on_create_pipeline_cache(vk::Device::from_raw(*device))?;
            }
            SnapshotCommand::CreatePipelineLayout {
                device,
                set_layouts,
                push_ranges,
            } => {
                let boxed_layouts: Vec<vk::DescriptorSetLayout> = set_layouts
                    .iter()
                    .map(|&l| vk::DescriptorSetLayout::from_raw(l))
                    .collect();
                let ranges: Vec<vk::PushConstantRange> = push_ranges
                    .iter()
                    .map(|r| vk::PushConstantRange {
                        stage_flags: r.stage_flags,
                        offset: r.offset,
                        size: r.size,
                    })
                    .collect();
                self.on_create_pipeline_layout(
                    vk::Device::from_raw(*device),
                    &boxed_layouts,
                    &ranges,
                )?;
            }
            SnapshotCommand::CreateComputePipeline {
                device,
                module,
                entry_point,
                layout,
            } => {
                self.on_create_compute_pipeline(
                    vk::Device::from_raw(*device),
                    vk::PipelineCache::null(),
                    vk::ShaderModule::from_raw(*module),
                    entry_point,
                    vk::PipelineLayout::from_raw(*layout),
                )?;
            }
            SnapshotCommand::CreateRenderPass {
                device,
                attachments,
                subpasses,
            } => {
                let mut ref_storage: Vec<Vec<vk::AttachmentReference>> = Vec::new();
                let mut depth_storage: Vec<vk::AttachmentReference> = Vec::new();
                let mut vk_subpasses: Vec<vk::SubpassDescription> = Vec::new();
                for subpass in subpasses {
                    let colors: Vec<vk::AttachmentReference> = subpass
                        .color_refs
                        .iter()
                        .map(|&(attachment, layout)| vk::AttachmentReference { attachment, layout })
                        .collect();
                    let inputs: Vec<vk::AttachmentReference> = subpass
                        .input_refs
                        .iter()
                        .map(|&(attachment, layout)| vk::AttachmentReference { attachment, layout })
                        .collect();
                    ref_storage.push(colors);
                    ref_storage.push(inputs);
                    if let Some((attachment, layout)) = subpass.depth_ref {
                        depth_storage.push(vk::AttachmentReference { attachment, layout });
                    }
                }
                let mut ref_iter = ref_storage.chunks(2);
                let mut depth_iter = depth_storage.iter();
                for subpass in subpasses {
                    let chunk = ref_iter.next().unwrap();
                    let mut desc = vk::SubpassDescription::builder()
                        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                        .color_attachments(&chunk[0])
                        .input_attachments(&chunk[1]);
                    if subpass.depth_ref.is_some() {
                        desc = desc.depth_stencil_attachment(depth_iter.next().unwrap());
                    }
                    vk_subpasses.push(desc.build());
                }
                let create_info = vk::RenderPassCreateInfo::builder()
                    .attachments(attachments)
                    .subpasses(&vk_subpasses);
                unsafe { self.on_create_render_pass(vk::Device::from_raw(*device), &create_info) }?;
            }
            SnapshotCommand::CreateFramebuffer {
                device,
                render_pass,
                attachments,
                dims,
            } => {
                let boxed_attachments: Vec<vk::ImageView> = attachments
                    .iter()
                    .map(|&a| vk::ImageView::from_raw(a))
                    .collect();
                self.on_create_framebuffer(
                    vk::Device::from_raw(*device),
                    vk::RenderPass::from_raw(*render_pass),
                    &boxed_attachments,
                    dims[0],
                    dims[1],
                    dims[2],
                )?;
            }
        }
        Ok(())
    }

    fn save_descriptor_pools(&self, stream: &mut dyn Stream) -> Result<(), SnapshotError> {
        let pools: Vec<(u64, vk::DescriptorPool)> = {
            let state = self.lock_state();
            let mut pools: Vec<(u64, vk::DescriptorPool)> = state
                .tables
                .descriptor_pools
                .iter()
                .map(|(&raw, info)| (info.boxed.as_raw(), raw))
                .collect();
            pools.sort_unstable_by_key(|&(boxed, _)| boxed);
            pools
        };
        for (_, raw_pool) in pools {
            let state = self.lock_state();
            let pool_info = &state.tables.descriptor_pools[&raw_pool];
            for &pool_id in &pool_info.pool_ids {
                let raw_set = self
                    .registry
                    .try_unbox(vk::DescriptorSet::from_raw(pool_id))
                    .filter(|s| s.as_raw() != 0);
                let Some(raw_set) = raw_set else {
                    stream.put_byte(0)?;
                    continue;
                };
                let Some(set_info) = state.tables.descriptor_sets.get(&raw_set) else {
                    stream.put_byte(0)?;
                    continue;
                };
                stream.put_byte(1)?;
                stream.put_be64(set_info.boxed_layout.as_raw())?;

                let mut survivors = Vec::new();
                for (binding, writes) in set_info.all_writes.iter().enumerate() {
                    for (element, write) in writes.iter().enumerate() {
                        let Some(write) = write else { continue };
                        match write.payload {
                            DescriptorWritePayload::InlineUniformBlock(_)
                            | DescriptorWritePayload::AccelerationStructure => {
                                panic!(
                                    "descriptor write kind {:?} cannot be saved",
                                    write.kind()
                                );
                            }
                            _ => {}
                        }
                        if write.all_dependencies_alive() {
                            survivors.push((binding as u32, element as u32, write.clone()));
                        }
                    }
                }
                stream.put_be64(survivors.len() as u64)?;
                for (binding, element, write) in survivors {
                    stream.put_be32(binding)?;
                    stream.put_be32(element)?;
                    stream.put_be32(write.kind() as u32)?;
                    stream.put_be32(write.descriptor_type.as_raw() as u32)?;
                    match write.payload {
                        DescriptorWritePayload::Image(info) => {
                            let boxed_sampler = state
                                .tables
                                .samplers
                                .get(&info.sampler)
                                .map_or(0, |s| s.boxed.as_raw());
                            let boxed_view = state
                                .tables
                                .image_views
                                .get(&info.image_view)
                                .map_or(0, |v| v.boxed.as_raw());
                            stream.put_be64(boxed_sampler)?;
                            stream.put_be64(boxed_view)?;
                            stream.put_be32(info.image_layout.as_raw() as u32)?;
                        }
                        DescriptorWritePayload::Buffer(info) => {
                            let boxed_buffer = state
                                .tables
                                .buffers
                                .get(&info.buffer)
                                .map_or(0, |b| b.boxed.as_raw());
                            stream.put_be64(boxed_buffer)?;
                            stream.put_be64(info.offset)?;
                            stream.put_be64(info.range)?;
                        }
                        DescriptorWritePayload::BufferView(view) => {
                            // Texel views carry no table entry; the raw
                            // handle rides along verbatim.
                            stream.put_be64(view.as_raw())?;
                        }
                        DescriptorWritePayload::InlineUniformBlock(_)
                        | DescriptorWritePayload::AccelerationStructure => unreachable!(),
                    }
                }
            }
        }
        Ok(())
    }

    fn load_descriptor_pools(&self, stream: &mut dyn Stream) -> Result<(), SnapshotError> {
        let pools: Vec<(u64, vk::DescriptorPool)> = {
            let state = self.lock_state();
            let mut pools: Vec<(u64, vk::DescriptorPool)> = state
                .tables
                .descriptor_pools
                .iter()
                .map(|(&raw, info)| (info.boxed.as_raw(), raw))
                .collect();
            pools.sort_unstable_by_key(|&(boxed, _)| boxed);
            pools
        };
        for (boxed_pool, raw_pool) in pools {
            let (pool_ids, device) = {
                let state = self.lock_state();
                let info = &state.tables.descriptor_pools[&raw_pool];
                (info.pool_ids.clone(), info.device)
            };
            let queue_boxed = {
                let state = self.lock_state();
                let device_info = &state.tables.devices[&device];
                let first_queue = device_info
                    .queues
                    .values()
                    .flat_map(|v| v.iter())
                    .next()
                    .copied();
                first_queue.map(|q| state.tables.queues[&q].boxed)
            };

            for pool_id in pool_ids {
                if stream.get_byte()? == 0 {
                    continue;
                }
                let boxed_layout = vk::DescriptorSetLayout::from_raw(stream.get_be64()?);
                let write_count = stream.get_be64()? as usize;

                let mut image_storage: Vec<[vk::DescriptorImageInfo; 1]> = Vec::new();
                let mut buffer_storage: Vec<[vk::DescriptorBufferInfo; 1]> = Vec::new();
                let mut view_storage: Vec<[vk::BufferView; 1]> = Vec::new();
                let mut staged: Vec<(u32, u32, u32, vk::DescriptorType, usize)> = Vec::new();

                for _ in 0..write_count {
                    let binding = stream.get_be32()?;
                    let element = stream.get_be32()?;
                    let kind = stream.get_be32()?;
                    let descriptor_type = vk::DescriptorType::from_raw(stream.get_be32()? as i32);
                    match kind {
                        1 => {
                            let sampler = vk::Sampler::from_raw(stream.get_be64()?);
                            let view = vk::ImageView::from_raw(stream.get_be64()?);
                            let layout = vk::ImageLayout::from_raw(stream.get_be32()? as i32);
                            image_storage.push([vk::DescriptorImageInfo {
                                sampler,
                                image_view: view,
                                image_layout: layout,
                            }]);
                            staged.push((
                                binding,
                                element,
                                kind,
                                descriptor_type,
                                image_storage.len() - 1,
                            ));
                        }
                        2 => {
                            let buffer = vk::Buffer::from_raw(stream.get_be64()?);
                            let offset = stream.get_be64()?;
                            let range = stream.get_be64()?;
                            buffer_storage.push([vk::DescriptorBufferInfo {
                                buffer,
                                offset,
                                range,
                            }]);
                            staged.push((
                                binding,
                                element,
                                kind,
                                descriptor_type,
                                buffer_storage.len() - 1,
                            ));
                        }
                        3 => {
                            view_storage.push([vk::BufferView::from_raw(stream.get_be64()?)]);
                            staged.push((
                                binding,
                                element,
                                kind,
                                descriptor_type,
                                view_storage.len() - 1,
                            ));
                        }
                        other => {
                            return Err(SnapshotError::Corrupt(format!(
                                "descriptor write kind {other} cannot be loaded"
                            )))
                        }
                    }
                }

                let writes: Vec<vk::WriteDescriptorSet> = staged
                    .iter()
                    .map(|&(binding, element, kind, descriptor_type, index)| {
                        let mut write = vk::WriteDescriptorSet::builder()
                            .dst_binding(binding)
                            .dst_array_element(element)
                            .descriptor_type(descriptor_type)
                            .build();
                        write.descriptor_count = 1;
                        match kind {
                            1 => write.p_image_info = image_storage[index].as_ptr(),
                            2 => write.p_buffer_info = buffer_storage[index].as_ptr(),
                            _ => write.p_texel_buffer_view = view_storage[index].as_ptr(),
                        }
                        write
                    })
                    .collect();

                let Some(queue_boxed) = queue_boxed else {
                    return Err(SnapshotError::Corrupt(
                        "descriptor restore requires a device queue".into(),
                    ));
                };
                unsafe {
                    self.on_queue_commit_descriptor_set_updates(
                        queue_boxed,
                        &[vk::DescriptorPool::from_raw(boxed_pool)],
                        &[boxed_layout],
                        &[pool_id],
                        &[0],
                        &[true],
                        &[0],
                        &writes,
                    )
                }?;
            }
        }
        Ok(())
    }
}

/// What a transient GPU copy reads or writes.
enum GpuContent {
    Image {
        image: vk::Image,
        params: ImageCreateParams,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: vk::Buffer,
        size: u64,
    },
}

impl Global {
    /// Reads object contents: directly through the mapped pointer when
    /// the backing memory is host visible, otherwise via a transient
    /// queue + command pool + staging buffer round trip.
    fn read_gpu_content(
        &self,
        boxed_device: vk::Device,
        content: GpuContent,
        memory: vk::DeviceMemory,
        memory_offset: u64,
        byte_size: u64,
    ) -> Result<Vec<u8>, SnapshotError> {
        let host_ptr = {
            let state = self.lock_state();
            state
                .tables
                .memories
                .get(&memory)
                .filter(|m| !m.ptr.is_null())
                .map(|m| m.ptr.0 as *const u8)
        };
        if let Some(ptr) = host_ptr {
            let bytes = unsafe {
                std::slice::from_raw_parts(ptr.add(memory_offset as usize), byte_size as usize)
            };
            return Ok(bytes.to_vec());
        }
        self.transient_copy(boxed_device, content, None, byte_size)
    }

    fn write_gpu_content(
        &self,
        boxed_device: vk::Device,
        content: GpuContent,
        memory: vk::DeviceMemory,
        memory_offset: u64,
        bytes: &[u8],
    ) -> Result<(), SnapshotError> {
        let host_ptr = {
            let state = self.lock_state();
            state
                .tables
                .memories
                .get(&memory)
                .filter(|m| !m.ptr.is_null())
                .map(|m| m.ptr.0)
        };
        if let Some(ptr) = host_ptr {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    ptr.add(memory_offset as usize),
                    bytes.len(),
                );
            }
            // Layout restoration still needs a synthetic barrier when
            // the content is an image.
            if let GpuContent::Image { image, layout, .. } = content {
                self.synthetic_layout_barrier(boxed_device, image, layout)?;
            }
            return Ok(());
        }
        self.transient_copy(boxed_device, content, Some(bytes), bytes.len() as u64)
            .map(|_| ())
    }

    /// One-shot staging copy through the device's first queue.
    fn transient_copy(
        &self,
        boxed_device: vk::Device,
        content: GpuContent,
        upload: Option<&[u8]>,
        byte_size: u64,
    ) -> Result<Vec<u8>, SnapshotError> {
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let device = self.registry.unbox(boxed_device);
        let (queue, family, memory_helper) = {
            let state = self.lock_state();
            let device_info = &state.tables.devices[&device];
            let (family, queue) = device_info
                .queues
                .iter()
                .flat_map(|(&family, queues)| queues.first().map(|&q| (family, q)))
                .next()
                .ok_or_else(|| SnapshotError::Corrupt("device has no queues".into()))?;
            let helper = state.tables.physical_devices[&device_info.physical_device]
                .memory
                .clone();
            (queue, family, helper)
        };

        unsafe {
            let pool = dispatch.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(family),
            )?;
            let cb = dispatch.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?[0];

            let staging = dispatch.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(byte_size.max(4))
                    .usage(
                        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
            )?;
            let requirements = dispatch.get_buffer_memory_requirements(staging);
            let type_index = memory_helper
                .find_host_index(
                    requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                )
                .ok_or_else(|| {
                    SnapshotError::Corrupt("no host-visible staging memory type".into())
                })?;
            let staging_memory = dispatch.allocate_memory(
                &vk::MemoryAllocateInfo::builder()
                    .allocation_size(requirements.size)
                    .memory_type_index(type_index),
            )?;
            dispatch.bind_buffer_memory(staging, staging_memory, 0)?;
            let mapped = dispatch.map_memory(staging_memory, 0, vk::WHOLE_SIZE)?;
            if let Some(bytes) = upload {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped, bytes.len());
            }

            dispatch.begin_command_buffer(
                cb,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            match content {
                GpuContent::Buffer { buffer, size } => {
                    let region = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size,
                    };
                    if upload.is_some() {
                        dispatch.cmd_copy_buffer(cb, staging, buffer, &[region]);
                    } else {
                        dispatch.cmd_copy_buffer(cb, buffer, staging, &[region]);
                    }
                }
                GpuContent::Image {
                    image,
                    params,
                    layout,
                } => {
                    let mut regions = Vec::new();
                    let mut buffer_offset = 0u64;
                    for level in 0..params.mip_levels {
                        let w = (params.extent.width >> level).max(1);
                        let h = (params.extent.height >> level).max(1);
                        let d = (params.extent.depth >> level).max(1);
                        regions.push(vk::BufferImageCopy {
                            buffer_offset,
                            buffer_row_length: 0,
                            buffer_image_height: 0,
                            image_subresource: vk::ImageSubresourceLayers {
                                aspect_mask: vk::ImageAspectFlags::COLOR,
                                mip_level: level,
                                base_array_layer: 0,
                                layer_count: params.array_layers,
                            },
                            image_offset: vk::Offset3D::default(),
                            image_extent: vk::Extent3D {
                                width: w,
                                height: h,
                                depth: d,
                            },
                        });
                        buffer_offset += u64::from(w) * u64::from(h) * u64::from(d)
                            * u64::from(params.array_layers)
                            * bytes_per_texel(params.format);
                    }
                    let barrier = |old: vk::ImageLayout, new: vk::ImageLayout| {
                        vk::ImageMemoryBarrier::builder()
                            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                            .dst_access_mask(
                                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                            )
                            .old_layout(old)
                            .new_layout(new)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .image(image)
                            .subresource_range(vk::ImageSubresourceRange {
                                aspect_mask: vk::ImageAspectFlags::COLOR,
                                base_mip_level: 0,
                                level_count: params.mip_levels,
                                base_array_layer: 0,
                                layer_count: params.array_layers,
                            })
                            .build()
                    };
                    if let Some(bytes) = upload {
                        dispatch.cmd_pipeline_barrier(
                            cb,
                            vk::PipelineStageFlags::TOP_OF_PIPE,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &[barrier(
                                vk::ImageLayout::UNDEFINED,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            )],
                        );
                        // A zero-byte upload is a pure layout patch.
                        if !bytes.is_empty() {
                            dispatch.cmd_copy_buffer_to_image(
                                cb,
                                staging,
                                image,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                &regions,
                            );
                        }
                        dispatch.cmd_pipeline_barrier(
                            cb,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &[barrier(vk::ImageLayout::TRANSFER_DST_OPTIMAL, layout)],
                        );
                    } else {
                        dispatch.cmd_pipeline_barrier(
                            cb,
                            vk::PipelineStageFlags::TOP_OF_PIPE,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &[barrier(layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)],
                        );
                        dispatch.cmd_copy_image_to_buffer(
                            cb,
                            image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            staging,
                            &regions,
                        );
                        dispatch.cmd_pipeline_barrier(
                            cb,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &[barrier(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, layout)],
                        );
                    }
                }
            }
            dispatch.end_command_buffer(cb)?;

            let fence = dispatch.create_fence(&vk::FenceCreateInfo::builder())?;
            let cbs = [cb];
            let submit = vk::SubmitInfo::builder().command_buffers(&cbs).build();
            dispatch.queue_submit(queue, &[submit], fence)?;
            dispatch.wait_for_fences(&[fence], true, u64::MAX)?;

            let mut out = vec![0u8; byte_size as usize];
            if upload.is_none() {
                std::ptr::copy_nonoverlapping(mapped as *const u8, out.as_mut_ptr(), out.len());
            }

            dispatch.destroy_fence(fence);
            dispatch.unmap_memory(staging_memory);
            dispatch.destroy_buffer(staging);
            dispatch.free_memory(staging_memory);
            dispatch.free_command_buffers(pool, &cbs);
            dispatch.destroy_command_pool(pool);
            Ok(out)
        }
    }

    fn synthetic_layout_barrier(
        &self,
        boxed_device: vk::Device,
        image: vk::Image,
        layout: vk::ImageLayout,
    ) -> Result<(), SnapshotError> {
        if layout == vk::ImageLayout::UNDEFINED || layout == vk::ImageLayout::PREINITIALIZED {
            return Ok(());
        }
        let params = {
            let state = self.lock_state();
            match state.tables.images.get(&image) {
                Some(info) => info.create_params,
                None => return Ok(()),
            }
        };
        // Reuse the transient path with a zero-byte upload: it records
        // only the layout transitions.
        self.transient_copy(
            boxed_device,
            GpuContent::Image {
                image,
                params,
                layout,
            },
            Some(&[]),
            0,
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemStream;

    #[test]
    fn command_codec_round_trip() {
        let commands = vec![
            (
                0x10u64,
                SnapshotCommand::CreateInstance {
                    api_version: vk::API_VERSION_1_1,
                    extensions: vec!["VK_KHR_external_memory_capabilities".into()],
                    application_name: "app".into(),
                    engine_name: String::new(),
                    context_id: 7,
                },
            ),
            (
                0x11,
                SnapshotCommand::CreateImage {
                    device: 0x20,
                    params: ImageCreateParams {
                        flags: vk::ImageCreateFlags::empty(),
                        image_type: vk::ImageType::TYPE_2D,
                        format: vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
                        extent: vk::Extent3D {
                            width: 256,
                            height: 256,
                            depth: 1,
                        },
                        mip_levels: 2,
                        array_layers: 1,
                        samples: vk::SampleCountFlags::TYPE_1,
                        tiling: vk::ImageTiling::OPTIMAL,
                        usage: vk::ImageUsageFlags::SAMPLED,
                        sharing_mode: vk::SharingMode::EXCLUSIVE,
                        initial_layout: vk::ImageLayout::UNDEFINED,
                    },
                },
            ),
            (
                0x12,
                SnapshotCommand::BindBufferMemory {
                    device: 0x20,
                    memory: 0x30,
                    offset: 4096,
                },
            ),
            (
                0x13,
                SnapshotCommand::CreateSemaphore {
                    device: 0x20,
                    timeline_initial_value: Some(5),
                },
            ),
        ];

        let mut stream = MemStream::new();
        for (subject, command) in &commands {
            put_command(&mut stream, *subject, command).unwrap();
        }
        for (subject, command) in &commands {
            let (got_subject, got) = get_command(&mut stream).unwrap();
            assert_eq!(got_subject, *subject);
            // Spot-check a field per arm rather than deriving Eq on vk
            // mirror types.
            match (command, &got) {
                (
                    SnapshotCommand::CreateInstance { context_id: a, .. },
                    SnapshotCommand::CreateInstance { context_id: b, .. },
                ) => assert_eq!(a, b),
                (
                    SnapshotCommand::CreateImage { params: a, .. },
                    SnapshotCommand::CreateImage { params: b, .. },
                ) => assert_eq!(a, b),
                (
                    SnapshotCommand::BindBufferMemory { offset: a, .. },
                    SnapshotCommand::BindBufferMemory { offset: b, .. },
                ) => assert_eq!(a, b),
                (
                    SnapshotCommand::CreateSemaphore {
                        timeline_initial_value: a,
                        ..
                    },
                    SnapshotCommand::CreateSemaphore {
                        timeline_initial_value: b,
                        ..
                    },
                ) => assert_eq!(a, b),
                _ => panic!("command arms diverged in the codec"),
            }
        }
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn forget_removes_every_entry_of_subject() {
        let mut log = SnapshotLog::new(true);
        log.record_create_buffer(1, 2, 64, vk::BufferUsageFlags::TRANSFER_DST);
        log.record_bind_buffer_memory(1, 2, 3, 0);
        log.record_create_buffer(9, 2, 64, vk::BufferUsageFlags::TRANSFER_DST);
        assert_eq!(log.len(), 3);
        log.forget(1);
        assert_eq!(log.len(), 1);
    }
}
