//! Instance and physical-device operations.
//!
//! Physical devices are boxed on first enumeration and carry the
//! guest-facing property views: `apiVersion` clamped to 1.3, the
//! synthesized memory-type table, and the queue-family table with
//! virtual-queue counts folded in.

use std::ffi::{CStr, CString};

use ash::vk::{self, Handle};

use crate::global::Global;
use crate::id::ObjectType;
use crate::registry::Dispatch;
use crate::resource::{
    EmulatedMemoryProperties, EmulatedQueueFamilies, InstanceInfo, PhysicalDeviceInfo,
};
use crate::{decompress, Features};

/// Highest API version reported to the guest, regardless of the driver.
const MAX_GUEST_API_VERSION: u32 = vk::API_VERSION_1_3;

unsafe fn read_extension_names(count: u32, names: *const *const std::os::raw::c_char) -> Vec<String> {
    (0..count as usize)
        .map(|i| {
            unsafe { CStr::from_ptr(*names.add(i)) }
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

impl Global {
    /// # Safety
    ///
    /// `create_info` and everything it points to must be valid.
    pub unsafe fn on_create_instance(
        &self,
        create_info: &vk::InstanceCreateInfo,
        context_id: u32,
    ) -> Result<vk::Instance, vk::Result> {
        self.api_log("vkCreateInstance");
        let enabled_extensions = read_extension_names(
            create_info.enabled_extension_count,
            create_info.pp_enabled_extension_names,
        );

        let mut api_version = vk::API_VERSION_1_0;
        let mut application_name = String::new();
        let mut engine_name = String::new();
        if !create_info.p_application_info.is_null() {
            let app_info = &*create_info.p_application_info;
            api_version = app_info.api_version;
            if !app_info.p_application_name.is_null() {
                application_name = CStr::from_ptr(app_info.p_application_name)
                    .to_string_lossy()
                    .into_owned();
            }
            if !app_info.p_engine_name.is_null() {
                engine_name = CStr::from_ptr(app_info.p_engine_name)
                    .to_string_lossy()
                    .into_owned();
            }
        }
        let is_angle = application_name.contains("ANGLE") || engine_name.contains("ANGLE");

        let extension_cstrings: Vec<CString> = enabled_extensions
            .iter()
            .map(|name| CString::new(name.as_str()).unwrap())
            .collect();
        #[allow(unused_mut)]
        let mut extension_ptrs: Vec<*const std::os::raw::c_char> =
            extension_cstrings.iter().map(|name| name.as_ptr()).collect();

        // MoltenVK only enumerates as a portability implementation.
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let portability_name = CString::new("VK_KHR_portability_enumeration").unwrap();
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        extension_ptrs.push(portability_name.as_ptr());

        let app_name_c = CString::new(application_name.as_str()).unwrap();
        let engine_name_c = CString::new(engine_name.as_str()).unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_c)
            .engine_name(&engine_name_c)
            .api_version(api_version.max(vk::API_VERSION_1_1));

        #[allow(unused_mut)]
        let mut forwarded = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs);
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            forwarded = forwarded.flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);
        }

        let (raw, dispatch) = self.entry.create_instance(&forwarded)?;

        let boxed = vk::Instance::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::Instance,
            Some(Dispatch::Instance(dispatch.clone())),
        ));
        let mut state = self.lock_state();
        state.tables.add_instance(
            raw,
            InstanceInfo {
                enabled_extensions: enabled_extensions.clone(),
                api_version,
                boxed,
                is_angle,
                application_name: application_name.clone(),
                engine_name: engine_name.clone(),
                context_id,
                dispatch,
            },
        );
        drop(state);
        self.snapshot.lock().record_create_instance(
            boxed.as_raw(),
            api_version,
            enabled_extensions,
            application_name,
            engine_name,
            context_id,
        );
        Ok(boxed)
    }

    pub fn on_destroy_instance(&self, boxed: vk::Instance) {
        self.api_log("vkDestroyInstance");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };

        // Cleanup callbacks re-enter decoder methods; never hold the
        // state mutex across them.
        self.drain_cleanup_callbacks();

        let (devices, physical_devices, dispatch) = {
            let mut state = self.lock_state();
            let devices = state.tables.devices_of_instance(raw);
            let physical_devices: Vec<vk::PhysicalDevice> = state
                .tables
                .physical_devices
                .iter()
                .filter(|(_, info)| info.instance == raw)
                .map(|(&pd, _)| pd)
                .collect();
            let dispatch = state.tables.instances.get(&raw).map(|i| i.dispatch.clone());
            (devices, physical_devices, dispatch)
        };

        for device in devices {
            let boxed_device = {
                let state = self.lock_state();
                state.tables.devices.get(&device).map(|d| d.boxed)
            };
            if let Some(boxed_device) = boxed_device {
                self.on_destroy_device(boxed_device);
            }
        }

        let mut state = self.lock_state();
        for pd in physical_devices {
            if let Some(info) = state.tables.physical_devices.remove(&pd) {
                self.registry.delete_boxed(info.boxed.as_raw());
            }
        }
        state.tables.instances.remove(&raw);
        drop(state);

        self.snapshot.lock().forget(boxed.as_raw());
        if self.env.no_cleanup {
            log::info!("instance teardown skipped (no-cleanup mode)");
        } else if let Some(dispatch) = dispatch {
            unsafe { dispatch.destroy_instance() };
        }
        self.registry.delete_boxed(boxed.as_raw());
        if self.env.log_calls {
            log::info!(
                "instance destroyed; {} boxed handles remain",
                self.registry.live_count()
            );
        }
    }

    /// Standard count/fill protocol: with `out` smaller than the
    /// available set, fills exactly `out.len()` entries and returns
    /// `INCOMPLETE`.
    pub fn on_enumerate_physical_devices(
        &self,
        boxed_instance: vk::Instance,
        count: &mut u32,
        out: Option<&mut [vk::PhysicalDevice]>,
    ) -> vk::Result {
        self.api_log("vkEnumeratePhysicalDevices");
        let raw_instance = self.registry.unbox(boxed_instance);
        let dispatch = self.registry.instance_dispatch(boxed_instance.as_raw());

        let physical_devices = match unsafe { dispatch.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(err) => return err,
        };

        // Box and record on first sight, preserving driver order.
        let mut boxed_devices = Vec::with_capacity(physical_devices.len());
        let mut boxed_any_new = false;
        {
            let mut state = self.lock_state();
            for &pd in &physical_devices {
                if let Some(info) = state.tables.physical_devices.get(&pd) {
                    boxed_devices.push(info.boxed);
                    continue;
                }
                let mut props = unsafe { dispatch.get_physical_device_properties(pd) };
                if props.api_version > MAX_GUEST_API_VERSION {
                    props.api_version = MAX_GUEST_API_VERSION;
                }
                let memory = EmulatedMemoryProperties::new(unsafe {
                    dispatch.get_physical_device_memory_properties(pd)
                });
                let queue_families = EmulatedQueueFamilies::new(
                    unsafe { dispatch.get_physical_device_queue_family_properties(pd) },
                    self.features.contains(Features::VIRTUAL_QUEUE),
                );
                let boxed_pd = vk::PhysicalDevice::from_raw(self.registry.new_boxed(
                    pd.as_raw(),
                    ObjectType::PhysicalDevice,
                    Some(Dispatch::Instance(dispatch.clone())),
                ));
                state.tables.add_physical_device(
                    pd,
                    PhysicalDeviceInfo {
                        instance: raw_instance,
                        boxed: boxed_pd,
                        props,
                        memory,
                        queue_families,
                    },
                );
                boxed_devices.push(boxed_pd);
                boxed_any_new = true;
            }
        }
        if boxed_any_new {
            // Physical-device boxing is part of the handle stream a
            // snapshot replays; remember that this instance enumerated.
            self.snapshot
                .lock()
                .record_enumerate_physical_devices(boxed_instance.as_raw());
        }

        let available = boxed_devices.len() as u32;
        match out {
            None => {
                *count = available;
                vk::Result::SUCCESS
            }
            Some(out) => {
                let fill = (*count).min(available).min(out.len() as u32);
                out[..fill as usize].copy_from_slice(&boxed_devices[..fill as usize]);
                *count = fill;
                if fill < available {
                    vk::Result::INCOMPLETE
                } else {
                    vk::Result::SUCCESS
                }
            }
        }
    }

    pub fn on_get_physical_device_properties(
        &self,
        boxed_pd: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        let raw = self.registry.unbox(boxed_pd);
        let state = self.lock_state();
        let info = state
            .tables
            .physical_devices
            .get(&raw)
            .unwrap_or_else(|| panic!("physical device {raw:?} was never enumerated"));
        info.props
    }

    /// The guest sees the synthesized memory-type table, not the host's.
    pub fn on_get_physical_device_memory_properties(
        &self,
        boxed_pd: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        let raw = self.registry.unbox(boxed_pd);
        let state = self.lock_state();
        let info = state
            .tables
            .physical_devices
            .get(&raw)
            .unwrap_or_else(|| panic!("physical device {raw:?} was never enumerated"));
        info.memory.guest
    }

    pub fn on_get_physical_device_queue_family_properties(
        &self,
        boxed_pd: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        let raw = self.registry.unbox(boxed_pd);
        let state = self.lock_state();
        let info = state
            .tables
            .physical_devices
            .get(&raw)
            .unwrap_or_else(|| panic!("physical device {raw:?} was never enumerated"));
        info.queue_families.guest.clone()
    }

    /// True when the decoder can decompress this compressed format,
    /// either with the facade's GPU kernels or (for ASTC) its CPU codec.
    fn can_emulate_format(&self, format: vk::Format) -> bool {
        let gpu = self.emulation.decompression_kernels().is_some();
        if decompress::is_etc2(format) {
            return gpu;
        }
        if decompress::is_astc(format) {
            return gpu || self.emulation.astc_decompressor().is_some();
        }
        false
    }

    /// Forwards driver format support, overlaying sample/transfer bits
    /// for compressed formats the decoder decompresses itself.
    pub fn on_get_physical_device_format_properties(
        &self,
        boxed_pd: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties {
        let raw = self.registry.unbox(boxed_pd);
        let dispatch = self.registry.instance_dispatch(boxed_pd.as_raw());
        let mut props = unsafe { dispatch.get_physical_device_format_properties(raw, format) };

        if self.can_emulate_format(format) {
            let sampled = vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
                | vk::FormatFeatureFlags::TRANSFER_SRC
                | vk::FormatFeatureFlags::TRANSFER_DST;
            if !props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
            {
                props.optimal_tiling_features |= sampled;
            }
        }
        props
    }

    /// Driver features with emulated compression advertised (where the
    /// decoder can deliver it) and capabilities it cannot honor masked
    /// off.
    pub fn on_get_physical_device_features(
        &self,
        boxed_pd: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceFeatures {
        let raw = self.registry.unbox(boxed_pd);
        let dispatch = self.registry.instance_dispatch(boxed_pd.as_raw());
        let mut features = unsafe { dispatch.get_physical_device_features(raw) };
        let gpu = self.emulation.decompression_kernels().is_some();
        if gpu {
            features.texture_compression_etc2 = vk::TRUE;
        }
        if gpu || self.emulation.astc_decompressor().is_some() {
            features.texture_compression_astc_ldr = vk::TRUE;
        }
        if !self
            .features
            .contains(Features::BYPASS_VULKAN_DEVICE_FEATURE_OVERRIDES)
        {
            features.sparse_binding = vk::FALSE;
            features.sparse_residency_buffer = vk::FALSE;
            features.sparse_residency_image2_d = vk::FALSE;
            features.sparse_residency_image3_d = vk::FALSE;
            features.sparse_residency_aliased = vk::FALSE;
        }
        features
    }
}
