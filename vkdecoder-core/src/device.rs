//! Device lifecycle: creation with queue and emulation setup, and the
//! two-phase teardown.
//!
//! Teardown extracts everything a device owns into a detached bundle
//! under the state mutex, then destroys outside it: wait-idle first, and
//! on wait-idle failure skip every driver destroy (leaking beats
//! crashing in a teardown path). The per-kind destroy helpers here are
//! the same ones the individual `vkDestroy*` entry points use, so the
//! two paths cannot diverge.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::decompress::DecompressionPipelineManager;
use crate::global::Global;
use crate::hub::DeviceBundle;
use crate::id::ObjectType;
use crate::queue::PendingOps;
use crate::registry::Dispatch;
use crate::resource::{DeviceInfo, MemoryInfo, QueueInfo, SamplerInfo, SemaphoreInfo};
use crate::sync::{ExternalFencePool, TEARDOWN_TIMEOUT_NS};
use crate::track::DeviceOpTracker;
use crate::{FastHashMap, Features};

/// Extensions consumed by the decoder or its emulation layers; the
/// driver never sees them.
const STRIPPED_DEVICE_EXTENSIONS: &[&str] = &[
    "VK_EXT_device_memory_report",
    "VK_ANDROID_native_buffer",
    "VK_ANDROID_external_memory_android_hardware_buffer",
];

struct QueueRequest {
    family_index: u32,
    count: u32,
}

impl Global {
    /// # Safety
    ///
    /// `create_info` and everything it points to must be valid.
    pub unsafe fn on_create_device(
        &self,
        boxed_physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo,
        virtio_gpu_context_id: Option<u32>,
    ) -> Result<vk::Device, vk::Result> {
        self.api_log("vkCreateDevice");
        let physical_device = self.registry.unbox(boxed_physical_device);
        let instance_dispatch = self
            .registry
            .instance_dispatch(boxed_physical_device.as_raw());

        let enabled_extensions: Vec<String> = (0..create_info.enabled_extension_count as usize)
            .map(|i| {
                unsafe { CStr::from_ptr(*create_info.pp_enabled_extension_names.add(i)) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        let forwarded_extensions: Vec<std::ffi::CString> = enabled_extensions
            .iter()
            .filter(|name| !STRIPPED_DEVICE_EXTENSIONS.contains(&name.as_str()))
            .map(|name| std::ffi::CString::new(name.as_str()).unwrap())
            .collect();
        let forwarded_extension_ptrs: Vec<*const std::os::raw::c_char> =
            forwarded_extensions.iter().map(|name| name.as_ptr()).collect();

        let queue_requests: Vec<QueueRequest> = (0..create_info.queue_create_info_count as usize)
            .map(|i| {
                let info = unsafe { &*create_info.p_queue_create_infos.add(i) };
                QueueRequest {
                    family_index: info.queue_family_index,
                    count: info.queue_count,
                }
            })
            .collect();

        // Family geometry decides how many queues actually reach the
        // driver; the rest become virtual twins.
        let host_counts: FastHashMap<u32, u32> = {
            let state = self.lock_state();
            let pd_info = state
                .tables
                .physical_devices
                .get(&physical_device)
                .unwrap_or_else(|| panic!("device created from unknown physical device"));
            queue_requests
                .iter()
                .map(|req| {
                    (
                        req.family_index,
                        pd_info.queue_families.host_queue_count(req.family_index),
                    )
                })
                .collect()
        };

        let virtual_queue_enabled = self.features.contains(Features::VIRTUAL_QUEUE);
        let priorities = vec![1.0f32; 16];
        let forwarded_queue_infos: Vec<vk::DeviceQueueCreateInfo> = queue_requests
            .iter()
            .map(|req| {
                let host_count = host_counts[&req.family_index].max(1);
                let forwarded = if virtual_queue_enabled {
                    req.count.min(host_count)
                } else {
                    req.count
                };
                let forwarded = forwarded.clamp(1, priorities.len() as u32);
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(req.family_index)
                    .queue_priorities(&priorities[..forwarded as usize])
                    .build()
            })
            .collect();

        // Mask features the emulation cannot pass through.
        let mut features = if create_info.p_enabled_features.is_null() {
            vk::PhysicalDeviceFeatures::default()
        } else {
            *create_info.p_enabled_features
        };
        if !self
            .features
            .contains(Features::BYPASS_VULKAN_DEVICE_FEATURE_OVERRIDES)
        {
            features.sparse_binding = vk::FALSE;
            features.sparse_residency_buffer = vk::FALSE;
            features.sparse_residency_image2_d = vk::FALSE;
            features.sparse_residency_image3_d = vk::FALSE;
            features.sparse_residency_aliased = vk::FALSE;
            // Emulated compression never reaches the driver as a feature
            // request.
            let driver_features =
                instance_dispatch.get_physical_device_features(physical_device);
            features.texture_compression_etc2 = driver_features.texture_compression_etc2;
            features.texture_compression_astc_ldr = driver_features.texture_compression_astc_ldr;
        }

        let forwarded = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&forwarded_queue_infos)
            .enabled_extension_names(&forwarded_extension_ptrs)
            .enabled_features(&features);

        let (raw_device, dispatch) =
            instance_dispatch.create_device(physical_device, &forwarded)?;

        // Emulation is only promised where it can actually be
        // delivered: the GPU path needs the facade's kernels, the ASTC
        // CPU path its codec.
        let driver_features = instance_dispatch.get_physical_device_features(physical_device);
        let kernels = self.emulation.decompression_kernels();
        let astc_cpu_available = self.emulation.astc_decompressor().is_some()
            && self.emulation.prefer_astc_cpu_decompression();
        let etc2_missing = driver_features.texture_compression_etc2 == vk::FALSE;
        let astc_missing = driver_features.texture_compression_astc_ldr == vk::FALSE;
        let emulate_etc2 = etc2_missing && kernels.is_some();
        let emulate_astc = astc_missing && (kernels.is_some() || astc_cpu_available);
        let use_astc_cpu_decompression = emulate_astc && astc_cpu_available;
        if (etc2_missing && !emulate_etc2) || (astc_missing && !emulate_astc) {
            log::warn!(
                "driver lacks compressed-format support and no decompression \
                 kernels are provided; compressed content will fail on this device"
            );
        }

        let needs_gpu_decompression =
            emulate_etc2 || (emulate_astc && !use_astc_cpu_decompression);
        let decompression_pipelines = match (needs_gpu_decompression, kernels) {
            (true, Some(kernels)) => {
                match DecompressionPipelineManager::new(dispatch.clone(), kernels) {
                    Ok(manager) => Some(Arc::new(manager)),
                    Err(err) => {
                        log::error!("failed to set up decompression pipelines: {err:?}");
                        None
                    }
                }
            }
            _ => None,
        };

        let (semaphore_types, fence_types) = if self.features.contains(Features::EXTERNAL_SYNC) {
            (
                query_semaphore_handle_types(&*instance_dispatch, physical_device),
                query_fence_handle_types(&*instance_dispatch, physical_device),
            )
        } else {
            (
                vk::ExternalSemaphoreHandleTypeFlags::empty(),
                vk::ExternalFenceHandleTypeFlags::empty(),
            )
        };

        let boxed_device = vk::Device::from_raw(self.registry.new_boxed(
            raw_device.as_raw(),
            ObjectType::Device,
            Some(Dispatch::Device(dispatch.clone())),
        ));

        let mut device_info = DeviceInfo {
            physical_device,
            boxed: boxed_device,
            enabled_extensions: enabled_extensions.clone(),
            emulate_etc2,
            emulate_astc,
            use_astc_cpu_decompression,
            queues: FastHashMap::default(),
            external_fence_pool: ExternalFencePool::new(dispatch.clone()),
            op_tracker: DeviceOpTracker::new(dispatch.clone()),
            decompression_pipelines,
            virtio_gpu_context_id,
            supported_semaphore_handle_types: semaphore_types,
            supported_fence_handle_types: fence_types,
        };

        let mut queue_infos = Vec::new();
        for req in &queue_requests {
            let host_count = host_counts[&req.family_index].max(1);
            let forwarded = if virtual_queue_enabled {
                req.count.min(host_count)
            } else {
                req.count
            };
            let family_queues = device_info.queues.entry(req.family_index).or_default();
            let mut physical_handles = Vec::new();
            for index in 0..forwarded {
                let queue = dispatch.get_device_queue(req.family_index, index);
                physical_handles.push(queue);
                family_queues.push(queue);
            }
            let needs_virtual = virtual_queue_enabled && req.count > forwarded;
            for index in 0..forwarded {
                let physical = physical_handles[index as usize];
                let shared_mutex = Arc::new(Mutex::new(()));
                let share_with_virtual = needs_virtual && index == 0;
                let pending = share_with_virtual
                    .then(|| Arc::new(Mutex::new(PendingOps::default())));
                queue_infos.push((
                    physical,
                    QueueInfo {
                        device: raw_device,
                        boxed: vk::Queue::null(),
                        family_index: req.family_index,
                        queue_mutex: shared_mutex.clone(),
                        pending_ops: pending.clone(),
                        using_shared_physical_queue: share_with_virtual,
                    },
                ));
                if share_with_virtual {
                    if physical.as_raw() & QueueInfo::VIRTUAL_QUEUE_BIT != 0 {
                        panic!(
                            "virtual queue: physical queue handle {:#x} already has the \
                             virtual bit set; the twins cannot be disambiguated",
                            physical.as_raw()
                        );
                    }
                    let virtual_handle =
                        vk::Queue::from_raw(physical.as_raw() | QueueInfo::VIRTUAL_QUEUE_BIT);
                    family_queues.push(virtual_handle);
                    queue_infos.push((
                        virtual_handle,
                        QueueInfo {
                            device: raw_device,
                            boxed: vk::Queue::null(),
                            family_index: req.family_index,
                            queue_mutex: shared_mutex,
                            pending_ops: pending,
                            using_shared_physical_queue: true,
                        },
                    ));
                }
            }
        }

        let mut state = self.lock_state();
        for (raw_queue, mut info) in queue_infos {
            // A driver may return the same VkQueue for repeated
            // (family, index) requests across devices; only track it
            // once.
            if state.tables.queues.contains_key(&raw_queue) {
                continue;
            }
            info.boxed = vk::Queue::from_raw(self.registry.new_boxed(
                raw_queue.as_raw(),
                ObjectType::Queue,
                Some(Dispatch::Device(dispatch.clone())),
            ));
            state.tables.add_queue(raw_queue, info);
        }
        state.tables.add_device(raw_device, device_info);
        drop(state);

        self.snapshot.lock().record_create_device(
            boxed_device.as_raw(),
            boxed_physical_device.as_raw(),
            enabled_extensions,
            queue_requests
                .iter()
                .map(|r| (r.family_index, r.count))
                .collect(),
            virtio_gpu_context_id,
        );
        Ok(boxed_device)
    }

    pub fn on_get_device_queue(
        &self,
        boxed_device: vk::Device,
        family_index: u32,
        queue_index: u32,
    ) -> Result<vk::Queue, vk::Result> {
        self.api_log("vkGetDeviceQueue");
        let device = self.registry.unbox(boxed_device);
        let state = self.lock_state();
        let device_info = state
            .tables
            .devices
            .get(&device)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let raw_queue = device_info
            .queues
            .get(&family_index)
            .and_then(|queues| queues.get(queue_index as usize))
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        Ok(state.tables.queues[&raw_queue].boxed)
    }

    pub fn on_device_wait_idle(&self, boxed_device: vk::Device) -> Result<(), vk::Result> {
        self.api_log("vkDeviceWaitIdle");
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        // Linux ICDs and SwiftShader want the state mutex held across
        // blocking entry points.
        #[cfg(feature = "lock_early")]
        let _early_guard = self.lock_state();
        profiling::scope!("vkDeviceWaitIdle");
        let result = unsafe { dispatch.device_wait_idle() };
        if result == Err(vk::Result::ERROR_DEVICE_LOST) {
            self.handle_device_lost();
        }
        result
    }

    pub fn on_destroy_device(&self, boxed_device: vk::Device) {
        self.api_log("vkDestroyDevice");
        let Some(raw) = self.registry.try_unbox(boxed_device) else {
            return;
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let bundle = {
            let mut state = self.lock_state();
            state.tables.extract_device(raw)
        };
        let Some(bundle) = bundle else {
            return;
        };

        self.destroy_device_bundle(bundle, &dispatch);
        self.registry.process_delayed_removes(raw);
        self.registry.delete_boxed(boxed_device.as_raw());
        self.snapshot.lock().forget(boxed_device.as_raw());
    }

    /// Destroys everything in `bundle` outside the state mutex, in the
    /// fixed kind order.
    pub(crate) fn destroy_device_bundle(
        &self,
        bundle: DeviceBundle,
        dispatch: &Arc<dyn hal::DeviceDispatch>,
    ) {
        let DeviceBundle {
            device,
            info: device_info,
            queues,
            memories,
            buffers,
            images,
            image_views,
            samplers,
            semaphores,
            fences,
            command_buffers,
            command_pools,
            descriptor_pools,
            descriptor_sets,
            descriptor_set_layouts,
            descriptor_update_templates,
            shader_modules,
            pipeline_caches,
            pipeline_layouts,
            pipelines,
            render_passes,
            framebuffers,
        } = bundle;

        let forget_all = |boxed_list: Vec<u64>| {
            let mut snapshot = self.snapshot.lock();
            for boxed in &boxed_list {
                snapshot.forget(*boxed);
            }
            drop(snapshot);
            for boxed in boxed_list {
                self.order.forget(boxed);
                self.registry.delete_boxed(boxed);
            }
        };

        device_info.op_tracker.drain_blocking(TEARDOWN_TIMEOUT_NS);

        let wait_ok = match unsafe { dispatch.device_wait_idle() } {
            Ok(()) => true,
            Err(err) => {
                log::error!(
                    "vkDeviceWaitIdle failed during device teardown ({err:?}); \
                     leaking driver objects instead of destroying them"
                );
                false
            }
        };
        let destroy = wait_ok && !self.env.no_cleanup;

        let mut boxed_handles = Vec::new();

        for (raw, info) in semaphores {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                destroy_semaphore_exclusive(dispatch, raw, info);
            }
        }
        for (raw, info) in samplers {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                destroy_sampler_exclusive(dispatch, raw, info);
            }
        }
        for (raw, info) in buffers {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_buffer(raw) };
            }
        }
        for (raw, info) in image_views {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_image_view(raw) };
            }
        }
        for (raw, mut info) in images {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                if let Some(cmp) = info.cmp.as_mut() {
                    cmp.destroy(&**dispatch);
                }
                unsafe { dispatch.destroy_image(raw) };
            }
        }
        for (raw, info) in memories {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                destroy_memory_exclusive(self, dispatch, raw, info);
            }
        }
        // Command buffers grouped per pool so each pool sees one free.
        let mut per_pool: FastHashMap<vk::CommandPool, Vec<vk::CommandBuffer>> =
            FastHashMap::default();
        for (raw, info) in command_buffers {
            boxed_handles.push(info.boxed.as_raw());
            per_pool.entry(info.pool).or_default().push(raw);
        }
        if destroy {
            for (pool, buffers) in per_pool {
                unsafe { dispatch.free_command_buffers(pool, &buffers) };
            }
        }
        for (raw, info) in command_pools {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_command_pool(raw) };
            }
        }
        // Descriptor sets die with their pools; their boxed tokens are
        // released from the pool's set map below.
        drop(descriptor_sets);
        for (raw, info) in descriptor_pools {
            boxed_handles.push(info.boxed.as_raw());
            for (_, boxed_set) in info.alloced_sets_to_boxed.iter() {
                boxed_handles.push(boxed_set.as_raw());
            }
            if destroy {
                unsafe { dispatch.destroy_descriptor_pool(raw) };
            }
        }
        for (_, info) in descriptor_update_templates {
            boxed_handles.push(info.boxed.as_raw());
        }
        for (raw, info) in descriptor_set_layouts {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_descriptor_set_layout(raw) };
            }
        }
        for (raw, info) in shader_modules {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_shader_module(raw) };
            }
        }
        for (raw, info) in pipelines {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_pipeline(raw) };
            }
        }
        for (raw, info) in pipeline_caches {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_pipeline_cache(raw) };
            }
        }
        for (raw, info) in pipeline_layouts {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_pipeline_layout(raw) };
            }
        }
        for (raw, info) in framebuffers {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_framebuffer(raw) };
            }
        }
        for (raw, info) in render_passes {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_render_pass(raw) };
            }
        }
        if destroy {
            for fence in device_info.external_fence_pool.pop_all() {
                unsafe { dispatch.destroy_fence(fence) };
            }
        } else if !device_info.external_fence_pool.is_empty() {
            panic!("device destroyed with external fences still pooled");
        }
        for (raw, info) in fences {
            boxed_handles.push(info.boxed.as_raw());
            if destroy {
                unsafe { dispatch.destroy_fence(raw) };
            }
        }
        for (_, info) in queues {
            boxed_handles.push(info.boxed.as_raw());
        }
        if destroy {
            if let Some(manager) = device_info.decompression_pipelines.as_ref() {
                manager.destroy();
            }
            unsafe { dispatch.destroy_device() };
        }
        let _ = device;

        forget_all(boxed_handles);
    }
}

pub(crate) fn destroy_semaphore_exclusive(
    dispatch: &Arc<dyn hal::DeviceDispatch>,
    raw: vk::Semaphore,
    info: SemaphoreInfo,
) {
    if let Some(handle) = info.external_handle {
        handle.close();
    }
    unsafe { dispatch.destroy_semaphore(raw) };
}

pub(crate) fn destroy_sampler_exclusive(
    dispatch: &Arc<dyn hal::DeviceDispatch>,
    raw: vk::Sampler,
    info: SamplerInfo,
) {
    if info.emulated_border_sampler != vk::Sampler::null() {
        unsafe { dispatch.destroy_sampler(info.emulated_border_sampler) };
    }
    unsafe { dispatch.destroy_sampler(raw) };
}

pub(crate) fn destroy_memory_exclusive(
    global: &Global,
    dispatch: &Arc<dyn hal::DeviceDispatch>,
    raw: vk::DeviceMemory,
    info: MemoryInfo,
) {
    if info.directly_mapped {
        global
            .vm_ops
            .unmap_user_memory(info.guest_phys_addr, info.size_to_page);
    }
    if info.blob_id != 0 {
        if let Some(context_id) = info_context_id(global, info.device) {
            global
                .external_objects
                .remove_blob_descriptor(context_id, info.blob_id);
        }
    }
    if info.need_unmap && !info.ptr.is_null() {
        unsafe { dispatch.unmap_memory(raw) };
    }
    unsafe { dispatch.free_memory(raw) };
    // Shared and private backings drop with the record.
    drop(info);
}

fn info_context_id(global: &Global, device: vk::Device) -> Option<u32> {
    let state = global.lock_state();
    state
        .tables
        .devices
        .get(&device)
        .and_then(|d| d.virtio_gpu_context_id)
}

fn query_semaphore_handle_types(
    dispatch: &dyn hal::InstanceDispatch,
    physical_device: vk::PhysicalDevice,
) -> vk::ExternalSemaphoreHandleTypeFlags {
    let mut supported = vk::ExternalSemaphoreHandleTypeFlags::empty();
    for candidate in [
        vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
        vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD,
        vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32,
    ] {
        let info = vk::PhysicalDeviceExternalSemaphoreInfo::builder()
            .handle_type(candidate)
            .build();
        let props = unsafe {
            dispatch.get_physical_device_external_semaphore_properties(physical_device, &info)
        };
        if props
            .external_semaphore_features
            .contains(vk::ExternalSemaphoreFeatureFlags::EXPORTABLE)
        {
            supported |= candidate;
        }
    }
    supported
}

fn query_fence_handle_types(
    dispatch: &dyn hal::InstanceDispatch,
    physical_device: vk::PhysicalDevice,
) -> vk::ExternalFenceHandleTypeFlags {
    let mut supported = vk::ExternalFenceHandleTypeFlags::empty();
    for candidate in [
        vk::ExternalFenceHandleTypeFlags::OPAQUE_FD,
        vk::ExternalFenceHandleTypeFlags::SYNC_FD,
        vk::ExternalFenceHandleTypeFlags::OPAQUE_WIN32,
    ] {
        let info = vk::PhysicalDeviceExternalFenceInfo::builder()
            .handle_type(candidate)
            .build();
        let props = unsafe {
            dispatch.get_physical_device_external_fence_properties(physical_device, &info)
        };
        if props
            .external_fence_features
            .contains(vk::ExternalFenceFeatureFlags::EXPORTABLE)
        {
            supported |= candidate;
        }
    }
    supported
}
