//! Semaphore and fence tracking, waits, and external sync objects.
//!
//! Fences carry a three-state gate (`NotWaitable` / `Waitable` /
//! `Waiting`): `wait_for_fences` blocks on the gate's condvar until a
//! submission actually reaches the driver, then waits the driver fence
//! outside the global mutex. Timeline semaphores additionally track the
//! last signalled value, which is what wakes deferred submissions.

use std::sync::Arc;
use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use hal::external::ExternalHandle;

use crate::error::VkResultExt;
use crate::global::Global;
use crate::id::ObjectType;
use crate::resource::{FenceGate, FenceInfo, FenceState, SemaphoreInfo};
use crate::track::DeviceDeletable;
use crate::Features;

/// How long a teardown-time drain waits before giving up and leaking.
pub(crate) const TEARDOWN_TIMEOUT_NS: u64 = 5_000_000_000;

/// Recycles externally-signalled fences instead of destroying them.
/// Guests are known to destroy external fences while a consumer still
/// polls the exported payload, so the driver object must outlive the
/// guest handle; keeping a small pool also saves reallocation.
pub struct ExternalFencePool {
    dispatch: Arc<dyn hal::DeviceDispatch>,
    pool: Mutex<Vec<vk::Fence>>,
    max_seen: Mutex<usize>,
}

impl ExternalFencePool {
    pub fn new(dispatch: Arc<dyn hal::DeviceDispatch>) -> Arc<Self> {
        Arc::new(Self {
            dispatch,
            pool: Mutex::new(Vec::new()),
            max_seen: Mutex::new(5),
        })
    }

    pub fn add(&self, fence: vk::Fence) {
        let mut pool = self.pool.lock();
        pool.push(fence);
        let mut max_seen = self.max_seen.lock();
        if pool.len() > *max_seen {
            log::info!("external fence pool grew to {}", pool.len());
            *max_seen = pool.len();
        }
    }

    /// Pops a signalled fence from the pool, resetting it unless the
    /// caller asked for a pre-signalled one.
    pub fn pop(&self, create_signaled: bool) -> Option<vk::Fence> {
        let fence = {
            let mut pool = self.pool.lock();
            let position = pool.iter().position(|&fence| {
                unsafe { self.dispatch.get_fence_status(fence) }.unwrap_or(false)
            })?;
            pool.swap_remove(position)
        };
        if !create_signaled {
            if let Err(err) = unsafe { self.dispatch.reset_fences(&[fence]) } {
                log::error!("failed to reset recycled external fence: {err:?}");
                self.add(fence);
                return None;
            }
        }
        Some(fence)
    }

    pub fn pop_all(&self) -> Vec<vk::Fence> {
        std::mem::take(&mut *self.pool.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }
}

/// Picks the export handle type for a semaphore from the device's
/// supported bits: opaque Win32 over sync-fd over opaque-fd.
pub(crate) fn pick_semaphore_handle_type(
    supported: vk::ExternalSemaphoreHandleTypeFlags,
) -> Option<vk::ExternalSemaphoreHandleTypeFlags> {
    for candidate in [
        vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32,
        vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD,
        vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
    ] {
        if supported.contains(candidate) {
            return Some(candidate);
        }
    }
    None
}

pub(crate) fn pick_fence_handle_type(
    supported: vk::ExternalFenceHandleTypeFlags,
) -> Option<vk::ExternalFenceHandleTypeFlags> {
    for candidate in [
        vk::ExternalFenceHandleTypeFlags::OPAQUE_WIN32,
        vk::ExternalFenceHandleTypeFlags::SYNC_FD,
        vk::ExternalFenceHandleTypeFlags::OPAQUE_FD,
    ] {
        if supported.contains(candidate) {
            return Some(candidate);
        }
    }
    None
}

impl Global {
    /// `exportable` reflects a `VkExportSemaphoreCreateInfo` chained by
    /// the guest; `timeline_initial_value` a `VkSemaphoreTypeCreateInfo`.
    pub fn on_create_semaphore(
        &self,
        boxed_device: vk::Device,
        exportable: bool,
        timeline_initial_value: Option<u64>,
    ) -> Result<vk::Semaphore, vk::Result> {
        self.api_log("vkCreateSemaphore");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(timeline_initial_value.unwrap_or(0));
        let mut create_info = vk::SemaphoreCreateInfo::builder();
        if timeline_initial_value.is_some() {
            create_info = create_info.push_next(&mut type_info);
        }
        let raw = unsafe { dispatch.create_semaphore(&create_info) }
            .map_err(|err| {
                err.log_oom("vkCreateSemaphore", None);
                err
            })?;

        let boxed = vk::Semaphore::from_raw(self.registry.new_boxed(
            raw.as_raw(),
            ObjectType::Semaphore,
            None,
        ));
        let mut state = self.lock_state();
        state.tables.add_semaphore(
            raw,
            SemaphoreInfo {
                device,
                boxed,
                is_timeline: timeline_initial_value.is_some(),
                last_signal_value: timeline_initial_value.unwrap_or(0),
                external_handle: None,
                latest_use: None,
            },
        );
        drop(state);
        if exportable && !self.features.contains(Features::EXTERNAL_SYNC) {
            log::warn!("guest requested exportable semaphore without external sync enabled");
        }
        self.snapshot.lock().record_create_semaphore(
            boxed.as_raw(),
            boxed_device.as_raw(),
            timeline_initial_value,
        );
        Ok(boxed)
    }

    pub fn on_destroy_semaphore(&self, boxed_device: vk::Device, boxed: vk::Semaphore) {
        self.api_log("vkDestroySemaphore");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let mut state = self.lock_state();
        let Some(info) = state.tables.semaphores.remove(&raw) else {
            return;
        };
        let tracker = state
            .tables
            .devices
            .get(&device)
            .map(|d| d.op_tracker.clone());
        drop(state);

        self.snapshot.lock().forget(boxed.as_raw());
        if let Some(handle) = info.external_handle {
            handle.close();
        }
        match (info.latest_use, tracker) {
            // Referenced by an in-flight submission: park it until the
            // waitable fires.
            (Some(waitable), Some(tracker)) if !waitable.is_done(&*dispatch) => {
                tracker.add_pending_garbage(
                    waitable,
                    DeviceDeletable::Semaphore(raw),
                    boxed.as_raw(),
                );
                self.registry
                    .schedule_delayed_remove(device, boxed.as_raw());
            }
            _ => {
                unsafe { dispatch.destroy_semaphore(raw) };
                self.registry.delete_boxed(boxed.as_raw());
            }
        }
    }

    /// Advances the tracked value and re-evaluates deferred submissions,
    /// then forwards to the driver.
    pub fn on_signal_semaphore(
        &self,
        boxed_device: vk::Device,
        boxed: vk::Semaphore,
        value: u64,
    ) -> Result<(), vk::Result> {
        self.api_log("vkSignalSemaphore");
        let raw = self.registry.unbox(boxed);
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let info = vk::SemaphoreSignalInfo::builder()
            .semaphore(raw)
            .value(value)
            .build();
        unsafe { dispatch.signal_semaphore(&info) }?;

        self.advance_semaphore_values(device, &[(raw, value)]);
        self.drain_deferred_submissions(device, &dispatch);
        Ok(())
    }

    pub fn on_get_semaphore_counter_value(
        &self,
        boxed_device: vk::Device,
        boxed: vk::Semaphore,
    ) -> Result<u64, vk::Result> {
        let raw = self.registry.unbox(boxed);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        unsafe { dispatch.get_semaphore_counter_value(raw) }
    }

    pub fn on_wait_semaphores(
        &self,
        boxed_device: vk::Device,
        semaphores: &[(vk::Semaphore, u64)],
        wait_any: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let raws: Vec<vk::Semaphore> = semaphores
            .iter()
            .map(|&(boxed, _)| self.registry.unbox(boxed))
            .collect();
        let values: Vec<u64> = semaphores.iter().map(|&(_, v)| v).collect();
        let flags = if wait_any {
            vk::SemaphoreWaitFlags::ANY
        } else {
            vk::SemaphoreWaitFlags::empty()
        };
        let info = vk::SemaphoreWaitInfo::builder()
            .flags(flags)
            .semaphores(&raws)
            .values(&values)
            .build();
        profiling::scope!("vkWaitSemaphores");
        unsafe { dispatch.wait_semaphores(&info, timeout_ns) }
    }

    /// Exports the semaphore's payload as an OS handle, remembering the
    /// duplicate so destroy can release it.
    pub fn on_get_semaphore_fd(
        &self,
        boxed_device: vk::Device,
        boxed: vk::Semaphore,
    ) -> Result<i32, vk::Result> {
        let raw = self.registry.unbox(boxed);
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let supported = {
            let state = self.lock_state();
            state
                .tables
                .devices
                .get(&device)
                .map(|d| d.supported_semaphore_handle_types)
                .unwrap_or_default()
        };
        let handle_type = pick_semaphore_handle_type(supported)
            .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        if handle_type == vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32 {
            return Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE);
        }

        let info = vk::SemaphoreGetFdInfoKHR::builder()
            .semaphore(raw)
            .handle_type(handle_type)
            .build();
        let fd = unsafe { dispatch.get_semaphore_fd(&info) }?;

        let duplicate = ExternalHandle::Fd(fd)
            .dup()
            .map_err(|_| vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        let mut state = self.lock_state();
        if let Some(info) = state.tables.semaphores.get_mut(&raw) {
            if let Some(old) = info.external_handle.replace(duplicate) {
                old.close();
            }
        }
        Ok(fd)
    }

    /// Exports the semaphore and publishes the descriptor to the
    /// external-object manager under `sync_id`, so another process can
    /// claim it without a round trip through the guest.
    pub fn on_get_semaphore(
        &self,
        boxed_device: vk::Device,
        boxed: vk::Semaphore,
        sync_id: u64,
    ) -> Result<(), vk::Result> {
        self.api_log("vkGetSemaphore");
        if !self.features.contains(Features::EXTERNAL_SYNC) {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let device = self.registry.unbox(boxed_device);
        let fd = self.on_get_semaphore_fd(boxed_device, boxed)?;
        let context_id = {
            let state = self.lock_state();
            state
                .tables
                .devices
                .get(&device)
                .and_then(|d| d.virtio_gpu_context_id)
                .unwrap_or(0)
        };
        let duplicate = ExternalHandle::Fd(fd)
            .dup()
            .map_err(|_| vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        self.external_objects
            .add_sync_descriptor(context_id, sync_id, duplicate);
        Ok(())
    }

    pub fn on_import_semaphore_fd(
        &self,
        boxed_device: vk::Device,
        boxed: vk::Semaphore,
        fd: i32,
    ) -> Result<(), vk::Result> {
        let raw = self.registry.unbox(boxed);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let info = vk::ImportSemaphoreFdInfoKHR::builder()
            .semaphore(raw)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
            .flags(vk::SemaphoreImportFlags::TEMPORARY)
            .fd(fd)
            .build();
        unsafe { dispatch.import_semaphore_fd(&info) }
    }

    pub fn on_create_fence(
        &self,
        boxed_device: vk::Device,
        create_info: &vk::FenceCreateInfo,
        external: bool,
    ) -> Result<vk::Fence, vk::Result> {
        self.api_log("vkCreateFence");
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let signaled = create_info
            .flags
            .contains(vk::FenceCreateFlags::SIGNALED);

        let recycled = if external && self.features.contains(Features::EXTERNAL_SYNC) {
            let pool = {
                let state = self.lock_state();
                state
                    .tables
                    .devices
                    .get(&device)
                    .map(|d| d.external_fence_pool.clone())
            };
            pool.and_then(|p| p.pop(signaled))
        } else {
            None
        };
        let raw = match recycled {
            Some(fence) => fence,
            None => unsafe { dispatch.create_fence(create_info) }.map_err(|err| {
                err.log_oom("vkCreateFence", None);
                err
            })?,
        };

        let boxed =
            vk::Fence::from_raw(self.registry.new_boxed(raw.as_raw(), ObjectType::Fence, None));
        let initial = if signaled {
            FenceState::Waitable
        } else {
            FenceState::NotWaitable
        };
        let mut state = self.lock_state();
        state.tables.add_fence(
            raw,
            FenceInfo {
                device,
                boxed,
                gate: FenceGate::new(initial),
                external,
                latest_use: None,
            },
        );
        drop(state);
        self.snapshot
            .lock()
            .record_create_fence(boxed.as_raw(), boxed_device.as_raw(), signaled);
        Ok(boxed)
    }

    pub fn on_destroy_fence(&self, boxed_device: vk::Device, boxed: vk::Fence) {
        self.api_log("vkDestroyFence");
        let Some(raw) = self.registry.try_unbox(boxed) else {
            return;
        };
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let mut state = self.lock_state();
        let Some(info) = state.tables.fences.remove(&raw) else {
            return;
        };
        let device_info = state.tables.devices.get(&device);
        let pool = device_info.map(|d| d.external_fence_pool.clone());
        let tracker = device_info.map(|d| d.op_tracker.clone());
        drop(state);

        self.snapshot.lock().forget(boxed.as_raw());
        match (info.latest_use, tracker) {
            (Some(waitable), Some(tracker)) if !waitable.is_done(&*dispatch) => {
                tracker.add_pending_garbage(waitable, DeviceDeletable::Fence(raw), boxed.as_raw());
                self.registry
                    .schedule_delayed_remove(device, boxed.as_raw());
            }
            _ => {
                if info.external {
                    // The exported payload may still be polled by another
                    // process; recycle rather than destroy.
                    if let Some(pool) = pool {
                        pool.add(raw);
                    }
                } else {
                    unsafe { dispatch.destroy_fence(raw) };
                }
                self.registry.delete_boxed(boxed.as_raw());
            }
        }
    }

    pub fn on_reset_fences(
        &self,
        boxed_device: vk::Device,
        boxed_fences: &[vk::Fence],
    ) -> Result<(), vk::Result> {
        self.api_log("vkResetFences");
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let raws: Vec<vk::Fence> = boxed_fences
            .iter()
            .map(|&b| self.registry.unbox(b))
            .collect();
        unsafe { dispatch.reset_fences(&raws) }?;

        let state = self.lock_state();
        for raw in &raws {
            if let Some(info) = state.tables.fences.get(raw) {
                info.gate.set_state(FenceState::NotWaitable);
            }
        }
        Ok(())
    }

    /// A missing record is treated as a pre-signalled fence: snapshot
    /// load recreates every fence signalled, and a guest may race its
    /// own destroy.
    pub fn on_get_fence_status(
        &self,
        boxed_device: vk::Device,
        boxed: vk::Fence,
    ) -> Result<bool, vk::Result> {
        let Some(raw) = self.registry.try_unbox(boxed) else {
            log::error!("vkGetFenceStatus on unknown fence; reporting success");
            return Ok(true);
        };
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let not_submitted = {
            let state = self.lock_state();
            state
                .tables
                .fences
                .get(&raw)
                .is_some_and(|info| info.gate.state() == FenceState::NotWaitable)
        };
        if not_submitted {
            return Ok(false);
        }
        unsafe { dispatch.get_fence_status(raw) }
    }

    /// Gates on each fence's condvar until it is waitable, then waits
    /// the driver fences outside the global mutex.
    pub fn on_wait_for_fences(
        &self,
        boxed_device: vk::Device,
        boxed_fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        self.api_log("vkWaitForFences");
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());
        let raws: Vec<vk::Fence> = boxed_fences
            .iter()
            .map(|&b| self.registry.unbox(b))
            .collect();

        let gates: Vec<Arc<FenceGate>> = {
            let state = self.lock_state();
            raws.iter()
                .filter_map(|raw| state.tables.fences.get(raw).map(|f| f.gate.clone()))
                .collect()
        };
        for gate in &gates {
            if !gate.wait_waitable(Duration::from_nanos(timeout_ns)) {
                return Err(vk::Result::TIMEOUT);
            }
        }

        profiling::scope!("vkWaitForFences");
        unsafe { dispatch.wait_for_fences(&raws, wait_all, timeout_ns) }
    }

    /// Exports the fence payload, routed through the per-device
    /// supported-handle-type bits.
    pub fn on_get_fence_fd(
        &self,
        boxed_device: vk::Device,
        boxed: vk::Fence,
    ) -> Result<i32, vk::Result> {
        let raw = self.registry.unbox(boxed);
        let device = self.registry.unbox(boxed_device);
        let dispatch = self.registry.device_dispatch(boxed_device.as_raw());

        let supported = {
            let state = self.lock_state();
            state
                .tables
                .devices
                .get(&device)
                .map(|d| d.supported_fence_handle_types)
                .unwrap_or_default()
        };
        let handle_type =
            pick_fence_handle_type(supported).ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        if handle_type == vk::ExternalFenceHandleTypeFlags::OPAQUE_WIN32 {
            return Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE);
        }
        let info = vk::FenceGetFdInfoKHR::builder()
            .fence(raw)
            .handle_type(handle_type)
            .build();
        unsafe { dispatch.get_fence_fd(&info) }
    }

    /// Marks the fence as belonging to an in-flight submission and wakes
    /// `wait_for_fences` callers.
    pub(crate) fn mark_fence_waitable(&self, raw: vk::Fence) {
        let state = self.lock_state();
        if let Some(info) = state.tables.fences.get(&raw) {
            info.gate.set_state(FenceState::Waitable);
        }
    }

    /// Raises `last_signal_value` for each `(semaphore, value)` pair;
    /// attempts to lower a value are ignored.
    pub(crate) fn advance_semaphore_values(
        &self,
        _device: vk::Device,
        signals: &[(vk::Semaphore, u64)],
    ) {
        let mut state = self.lock_state();
        for &(raw, value) in signals {
            if let Some(info) = state.tables.semaphores.get_mut(&raw) {
                if value > info.last_signal_value {
                    info.last_signal_value = value;
                }
            }
        }
    }

    /// Finalizes boxed handles whose deferred destroys have completed.
    pub(crate) fn poll_device_garbage(&self, device: vk::Device) {
        let tracker = {
            let state = self.lock_state();
            state
                .tables
                .devices
                .get(&device)
                .map(|d| d.op_tracker.clone())
        };
        if let Some(tracker) = tracker {
            for boxed in tracker.poll() {
                self.registry.delete_boxed(boxed);
            }
        }
    }
}
