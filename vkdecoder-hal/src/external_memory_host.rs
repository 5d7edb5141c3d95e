//! `VK_EXT_external_memory_host` device function pointers.
//!
//! The pinned `ash` version does not ship a typed wrapper for this
//! extension (it was only added in later `ash` releases), so we load the
//! raw function pointer ourselves, mirroring the pattern `ash` uses for
//! its other `khr`/`ext` extension wrapper structs.

use std::ffi::CStr;
use std::mem;

use ash::vk;
use ash::{Device, Instance};

#[derive(Clone)]
pub struct ExternalMemoryHost {
    handle: vk::Device,
    fp: vk::ExtExternalMemoryHostFn,
}

impl ExternalMemoryHost {
    pub fn new(instance: &Instance, device: &Device) -> Self {
        let handle = device.handle();
        let fp = vk::ExtExternalMemoryHostFn::load(|name| unsafe {
            mem::transmute(instance.get_device_proc_addr(handle, name.as_ptr()))
        });
        Self { handle, fp }
    }

    /// <https://www.khronos.org/registry/vulkan/specs/1.3-extensions/man/html/vkGetMemoryHostPointerPropertiesEXT.html>
    #[inline]
    pub unsafe fn get_memory_host_pointer_properties(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        host_pointer: *const std::ffi::c_void,
    ) -> ash::prelude::VkResult<vk::MemoryHostPointerPropertiesEXT> {
        let mut properties = vk::MemoryHostPointerPropertiesEXT::default();
        (self.fp.get_memory_host_pointer_properties_ext)(
            self.handle,
            handle_type,
            host_pointer,
            &mut properties,
        )
        .result_with_success(properties)
    }

    #[inline]
    pub const fn name() -> &'static CStr {
        vk::ExtExternalMemoryHostFn::name()
    }

    #[inline]
    pub fn fp(&self) -> &vk::ExtExternalMemoryHostFn {
        &self.fp
    }

    #[inline]
    pub fn device(&self) -> vk::Device {
        self.handle
    }
}
