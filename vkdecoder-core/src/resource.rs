//! Per-object state records.
//!
//! One record type per Vulkan object kind, stored in the [`hub`]'s
//! per-kind tables keyed by the **driver** handle. Every record knows its
//! boxed handle and (except instances and physical devices) its owning
//! device, which is what the teardown pass walks.
//!
//! [`hub`]: crate::hub

use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::{Condvar, Mutex};

use hal::external::{ExternalHandle, SharedMemory};

use crate::decompress::CompressedImageInfo;
use crate::sync::ExternalFencePool;
use crate::track::{DeviceOpTracker, DeviceOpWaitable};
use crate::{FastHashMap, FastHashSet};

/// Externally-managed compositor resource id (ColorBuffer or Buffer).
pub type EmulationHandle = u32;

/// Shared "is this object still alive" flag.
///
/// The owning record holds the [`Liveness`]; descriptor writes that name
/// the object hold [`LivenessWatch`]es, so a snapshot can drop writes
/// whose dependencies were freed without keeping those objects alive.
#[derive(Clone, Default)]
pub struct Liveness(Arc<()>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(()))
    }

    pub fn watch(&self) -> LivenessWatch {
        LivenessWatch(Arc::downgrade(&self.0))
    }
}

#[derive(Clone)]
pub struct LivenessWatch(Weak<()>);

impl LivenessWatch {
    pub fn alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Host pointer stored in a table record. The decoder owns the mapping
/// discipline, so sharing the raw pointer across threads is sound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPtr(pub *mut u8);

unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// Privately owned, alignment-guaranteed host allocation backing a
/// host-visible import when the driver mapping cannot be shared.
pub struct PrivateMemory {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

unsafe impl Send for PrivateMemory {}
unsafe impl Sync for PrivateMemory {}

impl PrivateMemory {
    pub fn new(alignment: usize, size: usize) -> Option<Self> {
        let layout = std::alloc::Layout::from_size_align(size, alignment).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        (!ptr.is_null()).then_some(Self { ptr, layout })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for PrivateMemory {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

pub struct InstanceInfo {
    pub enabled_extensions: Vec<String>,
    pub api_version: u32,
    pub boxed: vk::Instance,
    pub is_angle: bool,
    pub application_name: String,
    pub engine_name: String,
    pub context_id: u32,
    pub dispatch: Arc<dyn hal::InstanceDispatch>,
}

/// Guest-facing view of the physical device's memory types: the guest
/// sees a synthesized table, and allocation requests are remapped
/// guest-index to host-index.
#[derive(Clone)]
pub struct EmulatedMemoryProperties {
    pub host: vk::PhysicalDeviceMemoryProperties,
    pub guest: vk::PhysicalDeviceMemoryProperties,
    guest_to_host: [u32; vk::MAX_MEMORY_TYPES],
}

impl EmulatedMemoryProperties {
    /// The guest table mirrors the host table with capability bits the
    /// emulation cannot honor (protected memory) stripped.
    pub fn new(host: vk::PhysicalDeviceMemoryProperties) -> Self {
        let mut guest = host;
        let mut guest_to_host = [u32::MAX; vk::MAX_MEMORY_TYPES];
        for i in 0..host.memory_type_count as usize {
            guest.memory_types[i].property_flags &= !vk::MemoryPropertyFlags::PROTECTED;
            guest_to_host[i] = i as u32;
        }
        Self {
            host,
            guest,
            guest_to_host,
        }
    }

    pub fn guest_index_to_host(&self, guest_index: u32) -> Option<u32> {
        if guest_index >= self.guest.memory_type_count {
            return None;
        }
        let host = self.guest_to_host[guest_index as usize];
        (host != u32::MAX).then_some(host)
    }

    pub fn host_flags(&self, host_index: u32) -> vk::MemoryPropertyFlags {
        self.host.memory_types[host_index as usize].property_flags
    }

    /// First host type index allowed by `type_bits` whose flags contain
    /// `required`.
    pub fn find_host_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.host.memory_type_count)
            .find(|&i| type_bits & (1 << i) != 0 && self.host_flags(i).contains(required))
    }
}

/// Guest-facing queue family table. When the virtual-queue feature is on,
/// single-queue families report one extra queue that the decoder
/// multiplexes onto the physical one.
#[derive(Clone)]
pub struct EmulatedQueueFamilies {
    pub host: Vec<vk::QueueFamilyProperties>,
    pub guest: Vec<vk::QueueFamilyProperties>,
}

impl EmulatedQueueFamilies {
    pub fn new(host: Vec<vk::QueueFamilyProperties>, virtual_queue: bool) -> Self {
        let mut guest = host.clone();
        if virtual_queue {
            for family in guest.iter_mut() {
                if family.queue_count == 1 {
                    family.queue_count = 2;
                }
            }
        }
        Self { host, guest }
    }

    pub fn host_queue_count(&self, family_index: u32) -> u32 {
        self.host
            .get(family_index as usize)
            .map_or(0, |f| f.queue_count)
    }
}

pub struct PhysicalDeviceInfo {
    pub instance: vk::Instance,
    pub boxed: vk::PhysicalDevice,
    /// Driver properties with `apiVersion` clamped to 1.3.
    pub props: vk::PhysicalDeviceProperties,
    pub memory: EmulatedMemoryProperties,
    pub queue_families: EmulatedQueueFamilies,
}

pub struct DeviceInfo {
    pub physical_device: vk::PhysicalDevice,
    pub boxed: vk::Device,
    pub enabled_extensions: Vec<String>,
    pub emulate_etc2: bool,
    pub emulate_astc: bool,
    pub use_astc_cpu_decompression: bool,
    /// Unboxed queue handles per family index, virtual twins included.
    pub queues: FastHashMap<u32, Vec<vk::Queue>>,
    pub external_fence_pool: Arc<ExternalFencePool>,
    pub op_tracker: Arc<DeviceOpTracker>,
    /// Present when this device emulates any compressed format.
    pub decompression_pipelines: Option<Arc<crate::decompress::DecompressionPipelineManager>>,
    pub virtio_gpu_context_id: Option<u32>,
    pub supported_semaphore_handle_types: vk::ExternalSemaphoreHandleTypeFlags,
    pub supported_fence_handle_types: vk::ExternalFenceHandleTypeFlags,
}

impl DeviceInfo {
    pub fn need_gpu_decompression(&self, cmp: &CompressedImageInfo) -> bool {
        (cmp.is_etc2() && self.emulate_etc2)
            || (cmp.is_astc() && self.emulate_astc && !self.use_astc_cpu_decompression)
    }

    pub fn need_emulated_decompression(&self, cmp: &CompressedImageInfo) -> bool {
        (cmp.is_etc2() && self.emulate_etc2) || (cmp.is_astc() && self.emulate_astc)
    }
}

pub struct QueueInfo {
    pub device: vk::Device,
    pub boxed: vk::Queue,
    pub family_index: u32,
    /// Serializes driver access to the underlying physical queue; a
    /// virtual queue shares the mutex of its physical twin.
    pub queue_mutex: Arc<Mutex<()>>,
    /// Deferred submissions; present only on queues sharing a physical
    /// queue, and shared between the twins.
    pub pending_ops: Option<Arc<Mutex<crate::queue::PendingOps>>>,
    pub using_shared_physical_queue: bool,
}

impl QueueInfo {
    /// A virtual queue handle is the physical handle with this bit set.
    /// Driver handles are pointers or pool indices in practice, so the
    /// low bit is expected to be clear; creation aborts otherwise.
    pub const VIRTUAL_QUEUE_BIT: u64 = 0x1;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryCaching {
    Cached,
    Uncached,
    WriteCombined,
}

pub struct MemoryInfo {
    pub device: vk::Device,
    pub boxed: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Mapped host pointer covering the whole allocation; null when the
    /// memory is not host visible. Mapping the full range up front keeps
    /// the map API trivial.
    pub ptr: MappedPtr,
    /// Whether the decoder created the mapping and must unmap it.
    pub need_unmap: bool,
    pub directly_mapped: bool,
    pub virtio_gpu_mapped: bool,
    pub caching: MemoryCaching,
    pub guest_phys_addr: u64,
    pub page_aligned_hva: MappedPtr,
    pub size_to_page: u64,
    /// Host memory-type index the allocation actually used.
    pub memory_index: u32,
    pub shared_memory: Option<Arc<SharedMemory>>,
    pub private_memory: Option<Arc<PrivateMemory>>,
    pub blob_id: u64,
    pub bound_buffer: Option<EmulationHandle>,
    pub bound_color_buffer: Option<EmulationHandle>,
}

pub struct BufferInfo {
    pub device: vk::Device,
    pub boxed: vk::Buffer,
    pub usage: vk::BufferUsageFlags,
    pub size: vk::DeviceSize,
    pub memory: vk::DeviceMemory,
    pub memory_offset: vk::DeviceSize,
    pub bound_color_buffer: Option<EmulationHandle>,
    pub alive: Liveness,
}

/// Owned, pointer-free mirror of `VkImageCreateInfo`, kept on the record
/// and reused by the snapshot log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCreateParams {
    pub flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub initial_layout: vk::ImageLayout,
}

impl ImageCreateParams {
    pub fn from_vk(info: &vk::ImageCreateInfo) -> Self {
        Self {
            flags: info.flags,
            image_type: info.image_type,
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels,
            array_layers: info.array_layers,
            samples: info.samples,
            tiling: info.tiling,
            usage: info.usage,
            sharing_mode: info.sharing_mode,
            initial_layout: info.initial_layout,
        }
    }

    pub fn to_vk(&self) -> vk::ImageCreateInfo {
        vk::ImageCreateInfo::builder()
            .flags(self.flags)
            .image_type(self.image_type)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(self.sharing_mode)
            .initial_layout(self.initial_layout)
            .build()
    }
}

/// Android-native-buffer binding recorded on an image; the heavy lifting
/// lives in the emulation layer, the decoder only tracks the association.
#[derive(Clone, Copy, Debug)]
pub struct AndroidNativeBufferInfo {
    pub color_buffer: EmulationHandle,
}

pub struct ImageInfo {
    pub device: vk::Device,
    pub boxed: vk::Image,
    pub create_params: ImageCreateParams,
    pub anb: Option<AndroidNativeBufferInfo>,
    pub cmp: Option<CompressedImageInfo>,
    pub bound_color_buffer: Option<EmulationHandle>,
    // TODO(subresource layouts): a single layout per image loses per-mip
    // transitions; track per-subresource once a client needs it.
    pub layout: vk::ImageLayout,
    pub memory: vk::DeviceMemory,
    pub memory_offset: vk::DeviceSize,
}

pub struct ImageViewInfo {
    pub device: vk::Device,
    pub boxed: vk::ImageView,
    pub image: vk::Image,
    pub format: vk::Format,
    pub need_emulated_alpha: bool,
    pub bound_color_buffer: Option<EmulationHandle>,
    pub alive: Liveness,
}

/// Owned mirror of `VkSamplerCreateInfo`, enough to rebuild the sampler
/// and its opaque-black border variant.
#[derive(Clone, Copy, Debug)]
pub struct SamplerCreateParams {
    pub flags: vk::SamplerCreateFlags,
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enable: bool,
    pub compare_op: vk::CompareOp,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl SamplerCreateParams {
    pub fn from_vk(info: &vk::SamplerCreateInfo) -> Self {
        Self {
            flags: info.flags,
            mag_filter: info.mag_filter,
            min_filter: info.min_filter,
            mipmap_mode: info.mipmap_mode,
            address_mode_u: info.address_mode_u,
            address_mode_v: info.address_mode_v,
            address_mode_w: info.address_mode_w,
            mip_lod_bias: info.mip_lod_bias,
            anisotropy_enable: info.anisotropy_enable != 0,
            max_anisotropy: info.max_anisotropy,
            compare_enable: info.compare_enable != 0,
            compare_op: info.compare_op,
            min_lod: info.min_lod,
            max_lod: info.max_lod,
            border_color: info.border_color,
            unnormalized_coordinates: info.unnormalized_coordinates != 0,
        }
    }

    pub fn to_vk(&self) -> vk::SamplerCreateInfo {
        vk::SamplerCreateInfo::builder()
            .flags(self.flags)
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode_u)
            .address_mode_v(self.address_mode_v)
            .address_mode_w(self.address_mode_w)
            .mip_lod_bias(self.mip_lod_bias)
            .anisotropy_enable(self.anisotropy_enable)
            .max_anisotropy(self.max_anisotropy)
            .compare_enable(self.compare_enable)
            .compare_op(self.compare_op)
            .min_lod(self.min_lod)
            .max_lod(self.max_lod)
            .border_color(self.border_color)
            .unnormalized_coordinates(self.unnormalized_coordinates)
            .build()
    }
}

pub struct SamplerInfo {
    pub device: vk::Device,
    pub boxed: vk::Sampler,
    pub create_params: SamplerCreateParams,
    pub need_emulated_alpha: bool,
    /// Lazily-created opaque-black variant substituted for
    /// transparent-black borders on alpha-emulated views.
    pub emulated_border_sampler: vk::Sampler,
    pub alive: Liveness,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    /// Newly created or reset; never submitted since.
    NotWaitable,
    /// A submission was made, or the fence was created signaled.
    Waitable,
    /// A waiter has acknowledged the waitable state.
    Waiting,
}

/// Gate releasing `wait_for_fences` callers once a submission is actually
/// in flight. Lives outside the global mutex so signalling never contends
/// with table traffic.
pub struct FenceGate {
    state: Mutex<FenceState>,
    cv: Condvar,
}

impl FenceGate {
    pub fn new(state: FenceState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            cv: Condvar::new(),
        })
    }

    pub fn state(&self) -> FenceState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: FenceState) {
        *self.state.lock() = state;
        if state != FenceState::NotWaitable {
            self.cv.notify_all();
        }
    }

    /// Blocks until the fence leaves `NotWaitable` or the timeout
    /// passes; returns whether it became waitable. Guests routinely pass
    /// `u64::MAX` nanoseconds, so the wait avoids building a deadline
    /// instant that could overflow.
    pub fn wait_waitable(&self, timeout: std::time::Duration) -> bool {
        let mut state = self.state.lock();
        while *state == FenceState::NotWaitable {
            if self.cv.wait_for(&mut state, timeout).timed_out()
                && *state == FenceState::NotWaitable
            {
                return false;
            }
        }
        if *state == FenceState::Waitable {
            *state = FenceState::Waiting;
        }
        true
    }
}

pub struct FenceInfo {
    pub device: vk::Device,
    pub boxed: vk::Fence,
    pub gate: Arc<FenceGate>,
    /// Eligible for the external fence recycling pool.
    pub external: bool,
    pub latest_use: Option<DeviceOpWaitable>,
}

pub struct SemaphoreInfo {
    pub device: vk::Device,
    pub boxed: vk::Semaphore,
    pub is_timeline: bool,
    /// Monotonic; binary semaphores use 0 -> 1.
    pub last_signal_value: u64,
    pub external_handle: Option<ExternalHandle>,
    pub latest_use: Option<DeviceOpWaitable>,
}

/// Owned mirror of one `VkDescriptorSetLayoutBinding` (immutable
/// samplers are not carried; the decoder does not rewrite them).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

pub struct DescriptorSetLayoutInfo {
    pub device: vk::Device,
    pub boxed: vk::DescriptorSetLayout,
    pub bindings: Vec<LayoutBinding>,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolState {
    pub ty: vk::DescriptorType,
    pub capacity: u32,
    pub used: u32,
}

pub struct DescriptorPoolInfo {
    pub device: vk::Device,
    pub boxed: vk::DescriptorPool,
    pub flags: vk::DescriptorPoolCreateFlags,
    pub max_sets: u32,
    pub used_sets: u32,
    pub pools: Vec<PoolState>,
    /// Driver set -> boxed set for every set currently allocated here.
    pub alloced_sets_to_boxed: FastHashMap<vk::DescriptorSet, vk::DescriptorSet>,
    /// Pool-ids pre-reserved by the guest in batched mode, in reservation
    /// order.
    pub pool_ids: Vec<u64>,
}

#[derive(Clone)]
pub enum DescriptorWritePayload {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
    BufferView(vk::BufferView),
    InlineUniformBlock(Vec<u8>),
    AccelerationStructure,
}

/// Numeric write kinds, fixed by the snapshot wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DescriptorWriteKind {
    Empty = 0,
    ImageInfo = 1,
    BufferInfo = 2,
    BufferView = 3,
    InlineUniformBlock = 4,
    AccelerationStructure = 5,
}

#[derive(Clone)]
pub struct DescriptorWrite {
    pub descriptor_type: vk::DescriptorType,
    pub dst_array_element: u32,
    pub payload: DescriptorWritePayload,
    /// Liveness of every resource this write names; the write survives a
    /// snapshot only if all of them are still held.
    pub alives: Vec<LivenessWatch>,
    pub bound_color_buffer: Option<EmulationHandle>,
}

impl DescriptorWrite {
    pub fn kind(&self) -> DescriptorWriteKind {
        match self.payload {
            DescriptorWritePayload::Image(_) => DescriptorWriteKind::ImageInfo,
            DescriptorWritePayload::Buffer(_) => DescriptorWriteKind::BufferInfo,
            DescriptorWritePayload::BufferView(_) => DescriptorWriteKind::BufferView,
            DescriptorWritePayload::InlineUniformBlock(_) => {
                DescriptorWriteKind::InlineUniformBlock
            }
            DescriptorWritePayload::AccelerationStructure => {
                DescriptorWriteKind::AccelerationStructure
            }
        }
    }

    pub fn all_dependencies_alive(&self) -> bool {
        self.alives.iter().all(LivenessWatch::alive)
    }
}

pub struct DescriptorSetInfo {
    pub device: vk::Device,
    pub pool: vk::DescriptorPool,
    pub unboxed_layout: vk::DescriptorSetLayout,
    pub boxed_layout: vk::DescriptorSetLayout,
    pub bindings: Vec<LayoutBinding>,
    /// `all_writes[binding][array_element]`, sized from the layout.
    pub all_writes: Vec<Vec<Option<DescriptorWrite>>>,
}

impl DescriptorSetInfo {
    pub fn new_write_table(bindings: &[LayoutBinding]) -> Vec<Vec<Option<DescriptorWrite>>> {
        let max_binding = bindings.iter().map(|b| b.binding).max().map_or(0, |b| b + 1);
        let mut table = vec![Vec::new(); max_binding as usize];
        for binding in bindings {
            table[binding.binding as usize] = vec![None; binding.descriptor_count as usize];
        }
        table
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TemplateEntry {
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_count: u32,
    pub descriptor_type: vk::DescriptorType,
    pub offset: usize,
    pub stride: usize,
}

pub struct DescriptorUpdateTemplateInfo {
    pub device: vk::Device,
    pub boxed: vk::DescriptorUpdateTemplate,
    pub entries: Vec<TemplateEntry>,
}

pub struct ShaderModuleInfo {
    pub device: vk::Device,
    pub boxed: vk::ShaderModule,
}

pub struct PipelineCacheInfo {
    pub device: vk::Device,
    pub boxed: vk::PipelineCache,
}

pub struct PipelineLayoutInfo {
    pub device: vk::Device,
    pub boxed: vk::PipelineLayout,
}

pub struct PipelineInfo {
    pub device: vk::Device,
    pub boxed: vk::Pipeline,
}

pub struct RenderPassInfo {
    pub device: vk::Device,
    pub boxed: vk::RenderPass,
}

pub struct FramebufferInfo {
    pub device: vk::Device,
    pub boxed: vk::Framebuffer,
    pub attached_color_buffers: Vec<EmulationHandle>,
}

/// Accumulates record-time side effects that queue submission consumes:
/// which ColorBuffers the commands acquire or release, terminal layouts
/// from pipeline barriers, and the compute state to restore after an
/// emulated decompression pass.
pub struct CommandBufferInfo {
    pub device: vk::Device,
    pub boxed: vk::CommandBuffer,
    pub pool: vk::CommandPool,
    pub compute_pipeline: vk::Pipeline,
    pub first_set: u32,
    pub descriptor_layout: vk::PipelineLayout,
    pub current_descriptor_sets: Vec<vk::DescriptorSet>,
    pub all_descriptor_sets: FastHashSet<vk::DescriptorSet>,
    pub dynamic_offsets: Vec<u32>,
    pub acquired_color_buffers: FastHashSet<EmulationHandle>,
    pub released_color_buffers: FastHashSet<EmulationHandle>,
    pub color_buffer_layouts: FastHashMap<EmulationHandle, vk::ImageLayout>,
    pub image_layouts: FastHashMap<vk::Image, vk::ImageLayout>,
    /// Transient buffers backing CPU-decompressed uploads; reclaimed on
    /// reset.
    pub staging_buffers: Vec<(vk::Buffer, vk::DeviceMemory)>,
}

impl CommandBufferInfo {
    pub fn new(device: vk::Device, boxed: vk::CommandBuffer, pool: vk::CommandPool) -> Self {
        Self {
            device,
            boxed,
            pool,
            compute_pipeline: vk::Pipeline::null(),
            first_set: 0,
            descriptor_layout: vk::PipelineLayout::null(),
            current_descriptor_sets: Vec::new(),
            all_descriptor_sets: FastHashSet::default(),
            dynamic_offsets: Vec::new(),
            acquired_color_buffers: FastHashSet::default(),
            released_color_buffers: FastHashSet::default(),
            color_buffer_layouts: FastHashMap::default(),
            image_layouts: FastHashMap::default(),
            staging_buffers: Vec::new(),
        }
    }

    /// Drops the accumulated tracking state; staging resources are the
    /// caller's to reclaim first.
    pub fn reset(&mut self) {
        self.compute_pipeline = vk::Pipeline::null();
        self.first_set = 0;
        self.descriptor_layout = vk::PipelineLayout::null();
        self.current_descriptor_sets.clear();
        self.all_descriptor_sets.clear();
        self.dynamic_offsets.clear();
        self.acquired_color_buffers.clear();
        self.released_color_buffers.clear();
        self.color_buffer_layouts.clear();
        self.image_layouts.clear();
    }
}

pub struct CommandPoolInfo {
    pub device: vk::Device,
    pub boxed: vk::CommandPool,
    pub command_buffers: FastHashSet<vk::CommandBuffer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_watch_expires_with_owner() {
        let alive = Liveness::new();
        let watch = alive.watch();
        assert!(watch.alive());
        drop(alive);
        assert!(!watch.alive());
    }

    #[test]
    fn write_table_shape_follows_bindings() {
        let bindings = [
            LayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2,
                stage_flags: vk::ShaderStageFlags::COMPUTE,
            },
            LayoutBinding {
                binding: 2,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
            },
        ];
        let table = DescriptorSetInfo::new_write_table(&bindings);
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].len(), 2);
        assert_eq!(table[1].len(), 0);
        assert_eq!(table[2].len(), 1);
    }
}
