//! Opt-in emulation toggles and process-scope environment flags.

bitflags::bitflags!(
    /// Feature toggles controlled by the embedding emulation layer.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Record creation commands and allow save/load of decoded state.
        const SNAPSHOTS = 0x1;
        /// Guest batches descriptor-set updates with pre-reserved pool ids.
        const BATCHED_DESCRIPTOR_SET_UPDATE = 0x2;
        /// Synthesize a second queue per family over one physical queue.
        const VIRTUAL_QUEUE = 0x4;
        /// Back host-visible allocations with `VK_EXT_external_memory_host`.
        const ALLOCATE_HOST_MEMORY = 0x8;
        /// Export/import semaphores and fences across processes.
        const EXTERNAL_SYNC = 0x10;
        /// Export host-visible memory as OS handles (dma-buf where supported).
        const EXTERNAL_BLOB = 0x20;
        /// Allocate blobs from process-shared memory segments.
        const SYSTEM_BLOB = 0x40;
        /// Map host allocations directly into guest physical address space.
        const GL_DIRECT_MEM = 0x80;
        /// virtio-gpu blob resources are available.
        const VIRTIO_GPU_NEXT = 0x100;
        /// Do not mask device features for emulation compatibility.
        const BYPASS_VULKAN_DEVICE_FEATURE_OVERRIDES = 0x200;
        /// Guest only uses Vulkan; skip GL interop bookkeeping.
        const GUEST_VULKAN_ONLY = 0x400;
    }
);

/// Flags read once from the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvConfig {
    /// Leak every object instead of destroying it, for teardown debugging.
    pub no_cleanup: bool,
    /// Log every decoded call and report live handle counts.
    pub log_calls: bool,
    pub verbose: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        fn flag(name: &str) -> bool {
            std::env::var_os(name).is_some_and(|v| v != "0" && !v.is_empty())
        }
        Self {
            no_cleanup: flag("ANDROID_EMU_VK_NO_CLEANUP"),
            log_calls: flag("ANDROID_EMU_VK_LOG_CALLS"),
            verbose: flag("ANDROID_EMUGL_VERBOSE"),
        }
    }

    /// Name of the ICD selected for the process, if overridden.
    pub fn icd() -> Option<String> {
        std::env::var("ANDROID_EMU_VK_ICD").ok()
    }
}
