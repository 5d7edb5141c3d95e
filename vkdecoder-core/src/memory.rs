//! Memory allocation, import/export, and guest mapping.
//!
//! The guest names memory types by its synthesized index space; every
//! allocation remaps to the host index. Imports are mutually exclusive:
//! a ColorBuffer or Buffer from the compositor, a blob descriptor the
//! guest prepared, a process-shared system blob, or a host-pointer
//! allocation. Host-visible allocations are mapped whole at allocation
//! time, which keeps `vkMapMemory` a table lookup.

use std::sync::Arc;

use ash::vk::{self, Handle};

use hal::external::{ExternalHandle, SharedMemory};

use crate::error::VkResultExt;
use crate::global::Global;
use crate::id::ObjectType;
use crate::resource::{MappedPtr, MemoryCaching, MemoryInfo, PrivateMemory};
use crate::{align_up, Features, HOST_PAGE_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobMem {
    Guest,
    Host3d,
}

bitflags::bitflags!(
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct BlobFlags: u32 {
        const MAPPABLE = 0x1;
        const SHAREABLE = 0x2;
        const CREATE_GUEST_HANDLE = 0x4;
    }
);

#[derive(Clone, Copy, Debug)]
pub struct BlobParams {
    pub mem: BlobMem,
    pub flags: BlobFlags,
    pub id: u64,
}

/// The mutually-exclusive import side channels of `vkAllocateMemory`.
#[derive(Clone, Copy, Debug, Default)]
pub enum MemoryImport {
    #[default]
    None,
    ColorBuffer(u32),
    Buffer(u32),
    Blob(BlobParams),
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryAllocateParams {
    pub allocation_size: vk::DeviceSize,
    pub guest_memory_type_index: u32,
    pub import: MemoryImport,
    pub export_requested: bool,
    pub protected: bool,
    pub caching: MemoryCaching,
}

impl Default for MemoryAllocateParams {
    fn default() -> Self {
        Self {
            allocation_size: 0,
            guest_memory_type_index: 0,
            import: MemoryImport::None,
            export_requested: false,
            protected: false,
            caching: MemoryCaching::Cached,
        }
    }
}

impl Global {
    pub fn on_allocate_memory(
        &self,
        boxed_device: vk::Device,
        params: &MemoryAllocateParams,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        self.api_log("vkAllocateMemory");
        if params.protected {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let (memory_helper, context_id) = {
            let state = self.lock_state();
            let device_info = state
                .tables
                .devices
                .get(&device)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            let pd_info = state
                .tables
                .physical_devices
                .get(&device_info.physical_device)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            (pd_info.memory.clone(), device_info.virtio_gpu_context_id)
        };

        let mut host_index = match memory_helper.guest_index_to_host(params.guest_memory_type_index)
        {
            Some(index) => index,
            None => {
                log::error!(
                    "allocation names guest memory type {} outside the synthesized table",
                    params.guest_memory_type_index
                );
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
        };

        // Without direct mapping the allocation is the unit of guest
        // copies; round to the page so a byte-wise copy cannot touch a
        // neighboring allocation.
        let mut size = if self.features.contains(Features::GL_DIRECT_MEM) {
            params.allocation_size
        } else {
            align_up(params.allocation_size, HOST_PAGE_SIZE)
        };

        let mut mapped_ptr = MappedPtr::null();
        let mut bound_color_buffer = None;
        let mut bound_buffer = None;
        let mut blob_id = 0u64;
        let mut shared_memory: Option<Arc<SharedMemory>> = None;
        let mut private_memory: Option<Arc<PrivateMemory>> = None;
        let mut import_handle: Option<ExternalHandle> = None;
        let mut host_pointer_import: Option<*mut u8> = None;

        match params.import {
            MemoryImport::None => {}
            MemoryImport::ColorBuffer(handle) => {
                let info = self
                    .emulation
                    .color_buffer_allocation_info(handle)
                    .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
                size = info.size;
                host_index = info.memory_type_index;
                mapped_ptr = info.mapped_ptr;
                bound_color_buffer = Some(handle);
                import_handle = Some(
                    self.emulation
                        .dup_color_buffer_external_handle(handle)
                        .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?,
                );
            }
            MemoryImport::Buffer(handle) => {
                let info = self
                    .emulation
                    .buffer_allocation_info(handle)
                    .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
                size = info.size;
                host_index = info.memory_type_index;
                mapped_ptr = info.mapped_ptr;
                bound_buffer = Some(handle);
                import_handle = Some(
                    self.emulation
                        .dup_buffer_external_handle(handle)
                        .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?,
                );
            }
            MemoryImport::Blob(blob) => {
                blob_id = blob.id;
                if blob.flags.contains(BlobFlags::CREATE_GUEST_HANDLE) {
                    let context = context_id.unwrap_or(0);
                    import_handle = Some(
                        self.external_objects
                            .pop_blob_descriptor(context, blob.id)
                            .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?,
                    );
                } else if self.features.contains(Features::SYSTEM_BLOB)
                    && blob.flags.contains(BlobFlags::SHAREABLE)
                {
                    // System blobs live in process-shared memory so other
                    // processes can map them by descriptor.
                    let segment_size = align_up(size, HOST_PAGE_SIZE) as usize;
                    let segment = SharedMemory::new(segment_size)
                        .map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
                    mapped_ptr = MappedPtr(segment.as_ptr());
                    host_pointer_import = Some(segment.as_ptr());
                    let published = segment
                        .handle()
                        .dup()
                        .map_err(|_| vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
                    self.external_objects.add_blob_descriptor(
                        context_id.unwrap_or(0),
                        blob.id,
                        published,
                        params.caching,
                    );
                    shared_memory = Some(Arc::new(segment));
                }
            }
        }

        let host_visible = memory_helper
            .host_flags(host_index)
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        // Host-pointer path: back the allocation with our own aligned
        // block and import it through the external-memory-host limits.
        if matches!(params.import, MemoryImport::None)
            && host_visible
            && host_pointer_import.is_none()
            && import_handle.is_none()
            && self.features.contains(Features::ALLOCATE_HOST_MEMORY)
        {
            let alignment = self.emulation.external_memory_host_min_alignment();
            let rounded = align_up(size, alignment);
            let block = PrivateMemory::new(alignment as usize, rounded as usize)
                .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
            size = rounded;
            mapped_ptr = MappedPtr(block.as_ptr());
            host_pointer_import = Some(block.as_ptr());
            private_memory = Some(Arc::new(block));
        }

        // Assemble the driver call.
        let mut fd_import_info;
        let mut host_ptr_info;
        let mut export_info;
        let mut allocate_info = vk::MemoryAllocateInfo::builder().allocation_size(size);

        if let Some(ptr) = host_pointer_import {
            let props = unsafe {
                dispatch.get_memory_host_pointer_properties(
                    vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
                    ptr as *const std::ffi::c_void,
                )
            }?;
            host_index = memory_helper
                .find_host_index(
                    props.memory_type_bits,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                )
                .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
            host_ptr_info = vk::ImportMemoryHostPointerInfoEXT::builder()
                .handle_type(vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT)
                .host_pointer(ptr.cast());
            allocate_info = allocate_info.push_next(&mut host_ptr_info);
        } else if let Some(handle) = import_handle {
            match handle {
                ExternalHandle::Fd(fd) => {
                    fd_import_info = vk::ImportMemoryFdInfoKHR::builder()
                        .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
                        .fd(fd);
                    allocate_info = allocate_info.push_next(&mut fd_import_info);
                }
                other => {
                    log::error!("unsupported external memory handle {other:?} on this platform");
                    other.close();
                    return Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE);
                }
            }
        } else if params.export_requested
            && host_visible
            && self.features.contains(Features::EXTERNAL_BLOB)
        {
            export_info = vk::ExportMemoryAllocateInfo::builder()
                .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
            allocate_info = allocate_info.push_next(&mut export_info);
        }
        allocate_info = allocate_info.memory_type_index(host_index);

        let raw = unsafe { dispatch.allocate_memory(&allocate_info) }.map_err(|err| {
            err.log_oom("vkAllocateMemory", Some(size));
            err
        })?;

        let mut need_unmap = false;
        if host_visible && mapped_ptr.is_null() {
            match unsafe { dispatch.map_memory(raw, 0, vk::WHOLE_SIZE) } {
                Ok(ptr) => {
                    mapped_ptr = MappedPtr(ptr);
                    need_unmap = true;
                }
                Err(err) => {
                    log::error!("eager map of host-visible allocation failed: {err:?}");
                    unsafe { dispatch.free_memory(raw) };
                    return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
                }
            }
        }

        let boxed = vk::DeviceMemory::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::DeviceMemory,
            None,
        ));
        let mut state = self.lock_state();
        state.tables.add_memory(
            raw,
            MemoryInfo {
                device,
                boxed,
                size,
                ptr: mapped_ptr,
                need_unmap,
                directly_mapped: false,
                virtio_gpu_mapped: false,
                caching: params.caching,
                guest_phys_addr: 0,
                page_aligned_hva: MappedPtr::null(),
                size_to_page: 0,
                memory_index: host_index,
                shared_memory,
                private_memory,
                blob_id,
                bound_buffer,
                bound_color_buffer,
            },
        );
        drop(state);
        self.snapshot
            .lock()
            .record_allocate_memory(boxed.as_raw(), boxed_device.as_raw(), params);
        Ok(boxed)
    }

    pub fn on_free_memory(&self, boxed_device: vk::Device, boxed: vk::DeviceMemory) {
        self.api_log("vkFreeMemory");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let info = {
            let mut state = self.lock_state();
            state.tables.memories.remove(&raw)
        };
        if let Some(info) = info {
            crate::device::destroy_memory_exclusive(self, &dispatch, raw, info);
        }
        self.snapshot.lock().forget(boxed.as_raw());
        self.registry.delete_boxed(boxed.as_raw());
    }

    /// The host pointer was established at allocation time; mapping is a
    /// bounds-checked offset.
    pub fn on_map_memory(
        &self,
        _boxed_device: vk::Device,
        boxed: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut u8, vk::Result> {
        self.api_log("vkMapMemory");
        let raw = self.registry.unbox(boxed);
        let state = self.lock_state();
        let info = state
            .tables
            .memories
            .get(&raw)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if info.ptr.is_null() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let span = if size == vk::WHOLE_SIZE {
            info.size.saturating_sub(offset)
        } else {
            size
        };
        if offset.checked_add(span).map_or(true, |end| end > info.size) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(unsafe { info.ptr.0.add(offset as usize) })
    }

    pub fn on_unmap_memory(&self, _boxed_device: vk::Device, _boxed: vk::DeviceMemory) {
        // The decoder owns the whole-size mapping until free.
    }

    /// Exports the allocation as an opaque fd for cross-process sharing.
    pub fn on_get_memory_fd(
        &self,
        boxed_device: vk::Device,
        boxed: vk::DeviceMemory,
    ) -> Result<i32, vk::Result> {
        let raw = self.registry.unbox(boxed);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let info = vk::MemoryGetFdInfoKHR::builder()
            .memory(raw)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .build();
        unsafe { dispatch.get_memory_fd(&info) }
    }

    /// Maps the allocation's host pointer into guest physical address
    /// space at the address the guest chose. Returns the guest address
    /// adjusted for sub-page offset.
    pub fn on_map_memory_into_address_space(
        &self,
        boxed_device: vk::Device,
        boxed: vk::DeviceMemory,
        guest_phys_addr: u64,
    ) -> Result<u64, vk::Result> {
        self.api_log("vkMapMemoryIntoAddressSpace");
        if !self.features.contains(Features::GL_DIRECT_MEM) {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let _ = boxed_device;
        let raw = self.registry.unbox(boxed);

        let mut state = self.lock_state();
        let info = state
            .tables
            .memories
            .get_mut(&raw)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if info.ptr.is_null() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let hva = info.ptr.0 as u64;
        let page_offset = hva & (HOST_PAGE_SIZE - 1);
        let aligned_hva = hva - page_offset;
        let size_to_page = align_up(info.size + page_offset, HOST_PAGE_SIZE);

        info.directly_mapped = true;
        info.guest_phys_addr = guest_phys_addr;
        info.page_aligned_hva = MappedPtr(aligned_hva as *mut u8);
        info.size_to_page = size_to_page;
        let mapped = MappedPtr(aligned_hva as *mut u8);
        drop(state);

        if !self
            .vm_ops
            .map_user_memory(guest_phys_addr, mapped, size_to_page)
        {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        self.vm_ops.register_deallocation_callback(guest_phys_addr);
        Ok(guest_phys_addr + page_offset)
    }

    /// Publishes an existing allocation to the external-object manager
    /// keyed by its blob id: as a descriptor when external blobs are on,
    /// as a host mapping otherwise.
    pub fn on_get_blob(
        &self,
        boxed_device: vk::Device,
        boxed: vk::DeviceMemory,
    ) -> Result<(), vk::Result> {
        self.api_log("vkGetBlob");
        let raw = self.registry.unbox(boxed);
        let device = self.registry.unbox(boxed_device);

        let (blob_id, ptr, size, caching, context_id) = {
            let state = self.lock_state();
            let info = state
                .tables
                .memories
                .get(&raw)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            let context_id = state
                .tables
                .devices
                .get(&device)
                .and_then(|d| d.virtio_gpu_context_id)
                .unwrap_or(0);
            (info.blob_id, info.ptr, info.size, info.caching, context_id)
        };
        if blob_id == 0 {
            return Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE);
        }

        if self.features.contains(Features::EXTERNAL_BLOB) {
            let fd = self.on_get_memory_fd(boxed_device, boxed)?;
            self.external_objects.add_blob_descriptor(
                context_id,
                blob_id,
                ExternalHandle::Fd(fd),
                caching,
            );
        } else if !ptr.is_null() {
            self.external_objects
                .add_mapping(context_id, blob_id, ptr, size);
            let mut state = self.lock_state();
            if let Some(info) = state.tables.memories.get_mut(&raw) {
                info.virtio_gpu_mapped = true;
            }
        } else {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(())
    }
}
