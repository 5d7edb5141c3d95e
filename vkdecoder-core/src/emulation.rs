//! Interfaces to the surrounding emulation stack.
//!
//! These collaborators exist outside the decoder: the compositor-side
//! ColorBuffer registry, the per-context external object manager the
//! hypervisor reads blob descriptors from, and the VM address-space
//! layer. The decoder only calls them; tests substitute fakes.

use ash::vk;

use hal::external::ExternalHandle;

use crate::decompress::CompressedClass;
use crate::resource::{EmulationHandle, MappedPtr, MemoryCaching};

/// What the emulation knows about a ColorBuffer or Buffer resource the
/// guest wants to import as device memory.
#[derive(Clone, Copy, Debug)]
pub struct AllocationInfo {
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    pub dedicated: bool,
    /// Host mapping of the resource, when it is host visible.
    pub mapped_ptr: MappedPtr,
}

/// CPU fallback decoder for ASTC images. The actual codec is a library
/// concern; the decoder only routes block data through it.
pub trait AstcDecompressor: Send + Sync {
    fn decompress(
        &self,
        width: u32,
        height: u32,
        block_width: u32,
        block_height: u32,
        compressed: &[u8],
        out_rgba: &mut [u8],
    ) -> Result<(), String>;
}

/// Source of the compute kernels that decode compressed blocks on the
/// GPU. The kernels are build products of the embedder's shader
/// toolchain, so they arrive through the facade like the ASTC codec
/// does; without a provider the decoder does not advertise emulated
/// support for the GPU path.
///
/// Each kernel runs with local size 8x8x1, reads block data from the
/// storage image at binding 0, writes texels to binding 1, and receives
/// block width/height and the class id through specialization constants
/// 0, 1, and 2.
pub trait DecompressionKernels: Send + Sync {
    fn kernel_spirv(&self, class: CompressedClass) -> Option<Vec<u32>>;
}

/// The compositor-facing emulation facade.
pub trait Emulation: Send + Sync {
    fn color_buffer_allocation_info(&self, handle: EmulationHandle) -> Option<AllocationInfo>;
    fn buffer_allocation_info(&self, handle: EmulationHandle) -> Option<AllocationInfo>;
    fn dup_color_buffer_external_handle(&self, handle: EmulationHandle)
        -> Option<ExternalHandle>;
    fn dup_buffer_external_handle(&self, handle: EmulationHandle) -> Option<ExternalHandle>;

    /// The guest is about to read or write this ColorBuffer through
    /// Vulkan; drop any compositor-side caches.
    fn invalidate_color_buffer(&self, handle: EmulationHandle);
    /// Vulkan work touching this ColorBuffer finished; publish contents
    /// back to the compositor.
    fn flush_color_buffer(&self, handle: EmulationHandle);
    fn set_color_buffer_current_layout(&self, handle: EmulationHandle, layout: vk::ImageLayout);

    /// Whether ASTC should be decompressed on the CPU instead of the
    /// compute path when emulation is needed.
    fn prefer_astc_cpu_decompression(&self) -> bool {
        false
    }
    /// `minImportedHostPointerAlignment` of the host, for the
    /// host-pointer allocation path.
    fn external_memory_host_min_alignment(&self) -> u64 {
        4096
    }
    fn astc_decompressor(&self) -> Option<std::sync::Arc<dyn AstcDecompressor>> {
        None
    }
    /// Compute kernels for on-GPU decompression; `None` disables the
    /// GPU emulation path entirely.
    fn decompression_kernels(&self) -> Option<std::sync::Arc<dyn DecompressionKernels>> {
        None
    }

    /// Last-resort notification before the process aborts on
    /// `VK_ERROR_DEVICE_LOST`.
    fn on_device_lost(&self);
}

/// Publishes blob and sync descriptors keyed by
/// `(virtio-gpu context id, host blob id)` for other processes to claim.
pub trait ExternalObjectManager: Send + Sync {
    fn add_blob_descriptor(
        &self,
        context_id: u32,
        blob_id: u64,
        handle: ExternalHandle,
        caching: MemoryCaching,
    );
    fn remove_blob_descriptor(&self, context_id: u32, blob_id: u64);
    /// Claims a descriptor the guest prepared ahead of a
    /// create-with-guest-handle allocation.
    fn pop_blob_descriptor(&self, context_id: u32, blob_id: u64) -> Option<ExternalHandle>;
    fn add_sync_descriptor(&self, context_id: u32, sync_id: u64, handle: ExternalHandle);
    fn add_mapping(&self, context_id: u32, blob_id: u64, ptr: MappedPtr, size: u64);
}

/// Hypervisor address-space and snapshot-policy operations.
pub trait VmOps: Send + Sync {
    /// Maps `hva..hva+size` into guest physical space at `gpa`.
    fn map_user_memory(&self, gpa: u64, hva: MappedPtr, size: u64) -> bool;
    fn unmap_user_memory(&self, gpa: u64, size: u64);
    /// Asks the VM to tear the mapping down itself if the guest dies
    /// without freeing; pre-address-space-driver builds rely on it.
    fn register_deallocation_callback(&self, _gpa: u64) {}
    fn set_snapshot_uses_vulkan(&self);
    /// Marks the current snapshot save as unreliable; set when state the
    /// decoder cannot serialize is live.
    fn set_skip_snapshot_save(&self, skip: bool);
}

/// Inert collaborators for embedders that run the decoder standalone.
pub struct NoopEmulation;

impl Emulation for NoopEmulation {
    fn color_buffer_allocation_info(&self, _handle: EmulationHandle) -> Option<AllocationInfo> {
        None
    }
    fn buffer_allocation_info(&self, _handle: EmulationHandle) -> Option<AllocationInfo> {
        None
    }
    fn dup_color_buffer_external_handle(
        &self,
        _handle: EmulationHandle,
    ) -> Option<ExternalHandle> {
        None
    }
    fn dup_buffer_external_handle(&self, _handle: EmulationHandle) -> Option<ExternalHandle> {
        None
    }
    fn invalidate_color_buffer(&self, _handle: EmulationHandle) {}
    fn flush_color_buffer(&self, _handle: EmulationHandle) {}
    fn set_color_buffer_current_layout(&self, _handle: EmulationHandle, _layout: vk::ImageLayout) {
    }
    fn on_device_lost(&self) {}
}

pub struct NoopExternalObjects;

impl ExternalObjectManager for NoopExternalObjects {
    fn add_blob_descriptor(
        &self,
        _context_id: u32,
        _blob_id: u64,
        handle: ExternalHandle,
        _caching: MemoryCaching,
    ) {
        handle.close();
    }
    fn remove_blob_descriptor(&self, _context_id: u32, _blob_id: u64) {}
    fn pop_blob_descriptor(&self, _context_id: u32, _blob_id: u64) -> Option<ExternalHandle> {
        None
    }
    fn add_sync_descriptor(&self, _context_id: u32, _sync_id: u64, handle: ExternalHandle) {
        handle.close();
    }
    fn add_mapping(&self, _context_id: u32, _blob_id: u64, _ptr: MappedPtr, _size: u64) {}
}

pub struct NoopVmOps;

impl VmOps for NoopVmOps {
    fn map_user_memory(&self, _gpa: u64, _hva: MappedPtr, _size: u64) -> bool {
        true
    }
    fn unmap_user_memory(&self, _gpa: u64, _size: u64) {}
    fn set_snapshot_uses_vulkan(&self) {}
    fn set_skip_snapshot_save(&self, _skip: bool) {}
}
