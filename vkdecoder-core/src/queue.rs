//! Queue submission: gathering, dispatch, and wait-before-signal
//! deferral.
//!
//! Every unique physical `VkQueue` owns a mutex serializing driver
//! access; a virtual queue is the physical handle with the low bit set
//! and shares that mutex plus the pending-submission list. A submission
//! on a shared queue whose timeline waits are not yet satisfiable is
//! deep-copied and parked; every advance of a semaphore's signalled
//! value re-walks the pending lists and dispatches newly-ready heads,
//! strictly FIFO per queue.

use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::global::Global;
use crate::resource::{EmulationHandle, QueueInfo};
use crate::track::DeviceDeletable;

/// One semaphore operation of a deferred submission, payload by value.
#[derive(Clone, Copy, Debug)]
pub struct OwnedSemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage_mask: vk::PipelineStageFlags2,
}

/// Deep copy of one `VkSubmitInfo2`, with every handle unboxed.
#[derive(Clone, Debug, Default)]
pub struct OwnedSubmit2 {
    pub flags: vk::SubmitFlags,
    pub waits: Vec<OwnedSemaphoreSubmit>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signals: Vec<OwnedSemaphoreSubmit>,
}

pub struct DeferredSubmitCall {
    pub submits: Vec<OwnedSubmit2>,
    pub fence: vk::Fence,
    /// The decoder manufactured the fence; reclaim it after dispatch.
    pub fence_is_internal: bool,
}

/// FIFO of submissions deferred on one physical queue; shared between
/// the physical queue and its virtual twin.
#[derive(Default)]
pub struct PendingOps {
    pub calls: Vec<DeferredSubmitCall>,
}

/// Unboxed wait/signal/command-buffer view of one submission call, used
/// for the safety check and the bookkeeping that follows dispatch.
#[derive(Default)]
struct GatheredSubmit {
    waits: Vec<(vk::Semaphore, u64)>,
    signals: Vec<(vk::Semaphore, u64)>,
    command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Default)]
struct SideEffects {
    acquired_color_buffers: Vec<EmulationHandle>,
    released_color_buffers: Vec<EmulationHandle>,
    color_buffer_layouts: Vec<(EmulationHandle, vk::ImageLayout)>,
    image_layouts: Vec<(vk::Image, vk::ImageLayout)>,
}

struct ResolvedQueue {
    physical: vk::Queue,
    device: vk::Device,
    queue_mutex: Arc<Mutex<()>>,
    pending_ops: Option<Arc<Mutex<PendingOps>>>,
    shared: bool,
}

/// Walks a `pNext` chain looking for a structure type.
///
/// # Safety
///
/// `chain` must point to a well-formed Vulkan structure chain.
unsafe fn find_in_chain(
    mut chain: *const vk::BaseInStructure,
    s_type: vk::StructureType,
) -> *const vk::BaseInStructure {
    while !chain.is_null() {
        if (*chain).s_type == s_type {
            return chain;
        }
        chain = (*chain).p_next;
    }
    std::ptr::null()
}

impl Global {
    fn resolve_queue(&self, boxed_queue: vk::Queue) -> ResolvedQueue {
        let raw = self.registry.unbox(boxed_queue);
        let state = self.lock_state();
        let info = state
            .tables
            .queues
            .get(&raw)
            .unwrap_or_else(|| panic!("submission on untracked queue {raw:?}"));
        // Only twins sharing a physical queue carry the marker bit;
        // anywhere else the handle is the driver's verbatim.
        let physical = if info.using_shared_physical_queue {
            vk::Queue::from_raw(raw.as_raw() & !QueueInfo::VIRTUAL_QUEUE_BIT)
        } else {
            raw
        };
        ResolvedQueue {
            physical,
            device: info.device,
            queue_mutex: info.queue_mutex.clone(),
            pending_ops: info.pending_ops.clone(),
            shared: info.using_shared_physical_queue,
        }
    }

    /// Collects the record-time side effects of the named command
    /// buffers and resets nothing; the accumulators live until the
    /// command buffer is reset or re-begun.
    fn gather_side_effects(&self, command_buffers: &[vk::CommandBuffer]) -> SideEffects {
        let state = self.lock_state();
        let mut effects = SideEffects::default();
        for raw in command_buffers {
            let Some(info) = state.tables.command_buffers.get(raw) else {
                continue;
            };
            effects
                .acquired_color_buffers
                .extend(info.acquired_color_buffers.iter().copied());
            effects
                .released_color_buffers
                .extend(info.released_color_buffers.iter().copied());
            effects
                .color_buffer_layouts
                .extend(info.color_buffer_layouts.iter().map(|(&cb, &l)| (cb, l)));
            effects
                .image_layouts
                .extend(info.image_layouts.iter().map(|(&img, &l)| (img, l)));
            // ColorBuffers referenced through bound descriptor sets are
            // invalidated like explicitly-acquired ones.
            for set in &info.all_descriptor_sets {
                if let Some(set_info) = state.tables.descriptor_sets.get(set) {
                    for writes in &set_info.all_writes {
                        for write in writes.iter().flatten() {
                            if let Some(cb) = write.bound_color_buffer {
                                effects.acquired_color_buffers.push(cb);
                            }
                        }
                    }
                }
            }
        }
        effects
    }

    /// True when every wait of the call is already satisfied or is
    /// signalled within the same call at a sufficient value.
    fn waits_satisfiable(&self, gathered: &[GatheredSubmit]) -> bool {
        let state = self.lock_state();
        let signalled_in_call: Vec<(vk::Semaphore, u64)> = gathered
            .iter()
            .flat_map(|s| s.signals.iter().copied())
            .collect();
        for submit in gathered {
            for &(semaphore, wait_value) in &submit.waits {
                let current = state
                    .tables
                    .semaphores
                    .get(&semaphore)
                    .map_or(0, |info| info.last_signal_value);
                if current >= wait_value {
                    continue;
                }
                let self_satisfied = signalled_in_call
                    .iter()
                    .any(|&(s, v)| s == semaphore && v >= wait_value);
                if !self_satisfied {
                    return false;
                }
            }
        }
        true
    }

    /// Post-dispatch bookkeeping shared by direct and deferred paths.
    fn finish_dispatched_submission(
        &self,
        device: vk::Device,
        dispatch: &Arc<dyn hal::DeviceDispatch>,
        physical: vk::Queue,
        gathered: &[GatheredSubmit],
        effects: &SideEffects,
        fence: vk::Fence,
        internal_fence: bool,
    ) {
        // Latest-use tracking rides an empty follow-up submission so the
        // tracker owns its fence lifetime.
        let waitable = match {
            let state = self.lock_state();
            state.tables.devices.get(&device).map(|d| d.op_tracker.clone())
        } {
            Some(tracker) => match tracker.begin_op() {
                Ok(waitable) => {
                    let result =
                        unsafe { dispatch.queue_submit(physical, &[], waitable.fence()) };
                    if let Err(err) = result {
                        log::warn!("op-tracker submission failed: {err:?}");
                    }
                    Some((tracker, waitable))
                }
                Err(err) => {
                    log::warn!("op-tracker fence creation failed: {err:?}");
                    None
                }
            },
            None => None,
        };

        let signals: Vec<(vk::Semaphore, u64)> = gathered
            .iter()
            .flat_map(|s| s.signals.iter().copied())
            .collect();
        self.advance_semaphore_values(device, &signals);

        {
            let mut state = self.lock_state();
            if let Some((_, ref waitable)) = waitable {
                for submit in gathered {
                    for &(semaphore, _) in submit.waits.iter().chain(submit.signals.iter()) {
                        if let Some(info) = state.tables.semaphores.get_mut(&semaphore) {
                            info.latest_use = Some(waitable.clone());
                        }
                    }
                }
                if fence != vk::Fence::null() && !internal_fence {
                    if let Some(info) = state.tables.fences.get_mut(&fence) {
                        info.latest_use = Some(waitable.clone());
                    }
                }
            }
            for &(image, layout) in &effects.image_layouts {
                if let Some(info) = state.tables.images.get_mut(&image) {
                    info.layout = layout;
                }
            }
        }
        for &(cb, layout) in &effects.color_buffer_layouts {
            self.emulation.set_color_buffer_current_layout(cb, layout);
        }

        if fence != vk::Fence::null() {
            self.mark_fence_waitable(fence);
        }

        // Released ColorBuffers must be flushed with their contents
        // final, so wait for this submission before handing them over.
        if !effects.released_color_buffers.is_empty() {
            if let Err(err) =
                unsafe { dispatch.wait_for_fences(&[fence], true, u64::MAX) }
            {
                log::error!("wait for release-flush fence failed: {err:?}");
            }
            for &cb in &effects.released_color_buffers {
                self.emulation.flush_color_buffer(cb);
            }
            if internal_fence {
                unsafe { dispatch.destroy_fence(fence) };
            }
        } else if internal_fence {
            if let Some((tracker, w)) = &waitable {
                tracker.add_pending_garbage(w.clone(), DeviceDeletable::Fence(fence), 0);
            } else {
                unsafe {
                    // No tracker to park it on; the submission was just
                    // dispatched, so a blocking wait is bounded.
                    let _ = dispatch.wait_for_fences(&[fence], true, u64::MAX);
                    dispatch.destroy_fence(fence);
                }
            }
        }

        self.poll_device_garbage(device);
    }

    /// # Safety
    ///
    /// `submits` and everything they point to must be valid; semaphore,
    /// command-buffer, and fence handles are boxed guest tokens.
    pub unsafe fn on_queue_submit(
        &self,
        boxed_queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        boxed_fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        self.api_log("vkQueueSubmit");
        let queue = self.resolve_queue(boxed_queue);
        let dispatch = self.registry.device_dispatch(boxed_queue.as_raw());

        // Deep-copy into owned storage with unboxed handles.
        struct Submit1Holder {
            waits: Vec<vk::Semaphore>,
            wait_stages: Vec<vk::PipelineStageFlags>,
            command_buffers: Vec<vk::CommandBuffer>,
            signals: Vec<vk::Semaphore>,
            timeline: Option<(Vec<u64>, Vec<u64>)>,
        }
        let mut holders = Vec::with_capacity(submits.len());
        let mut gathered = Vec::with_capacity(submits.len());
        for submit in submits {
            let waits: Vec<vk::Semaphore> = (0..submit.wait_semaphore_count as usize)
                .map(|i| self.registry.unbox(unsafe { *submit.p_wait_semaphores.add(i) }))
                .collect();
            let wait_stages: Vec<vk::PipelineStageFlags> = (0..submit.wait_semaphore_count
                as usize)
                .map(|i| unsafe { *submit.p_wait_dst_stage_mask.add(i) })
                .collect();
            let command_buffers: Vec<vk::CommandBuffer> = (0..submit.command_buffer_count
                as usize)
                .map(|i| self.registry.unbox(unsafe { *submit.p_command_buffers.add(i) }))
                .collect();
            let signals: Vec<vk::Semaphore> = (0..submit.signal_semaphore_count as usize)
                .map(|i| self.registry.unbox(unsafe { *submit.p_signal_semaphores.add(i) }))
                .collect();

            let timeline_info = find_in_chain(
                submit.p_next.cast(),
                vk::StructureType::TIMELINE_SEMAPHORE_SUBMIT_INFO,
            )
            .cast::<vk::TimelineSemaphoreSubmitInfo>();
            let timeline = (!timeline_info.is_null()).then(|| {
                let info = unsafe { &*timeline_info };
                let wait_values = (0..info.wait_semaphore_value_count as usize)
                    .map(|i| unsafe { *info.p_wait_semaphore_values.add(i) })
                    .collect::<Vec<_>>();
                let signal_values = (0..info.signal_semaphore_value_count as usize)
                    .map(|i| unsafe { *info.p_signal_semaphore_values.add(i) })
                    .collect::<Vec<_>>();
                (wait_values, signal_values)
            });

            let wait_pairs = waits
                .iter()
                .enumerate()
                .map(|(i, &s)| {
                    let value = timeline
                        .as_ref()
                        .and_then(|(w, _)| w.get(i).copied())
                        .unwrap_or(1);
                    (s, value.max(1))
                })
                .collect();
            let signal_pairs = signals
                .iter()
                .enumerate()
                .map(|(i, &s)| {
                    let value = timeline
                        .as_ref()
                        .and_then(|(_, sv)| sv.get(i).copied())
                        .unwrap_or(1);
                    (s, value.max(1))
                })
                .collect();
            gathered.push(GatheredSubmit {
                waits: wait_pairs,
                signals: signal_pairs,
                command_buffers: command_buffers.clone(),
            });
            holders.push(Submit1Holder {
                waits,
                wait_stages,
                command_buffers,
                signals,
                timeline,
            });
        }

        let all_command_buffers: Vec<vk::CommandBuffer> = gathered
            .iter()
            .flat_map(|g| g.command_buffers.iter().copied())
            .collect();
        let effects = self.gather_side_effects(&all_command_buffers);
        for &cb in &effects.acquired_color_buffers {
            self.emulation.invalidate_color_buffer(cb);
        }

        // Submissions always carry a fence so release-flushes and the
        // fence gate have something to observe.
        let (fence, internal_fence) = match self.registry.try_unbox(boxed_fence) {
            Some(fence) => (fence, false),
            None => (
                dispatch.create_fence(&vk::FenceCreateInfo::builder().build())?,
                true,
            ),
        };

        let queue_guard = queue.queue_mutex.lock();

        if queue.shared && !self.waits_satisfiable(&gathered) {
            // Plain VkSubmitInfo cannot be parked: its timeline values
            // live in an unowned pNext chain.
            if internal_fence {
                dispatch.destroy_fence(fence);
            }
            log::error!("cannot defer queue submission expressed as VkSubmitInfo");
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }

        // Rebuild driver-facing structs from owned storage. Two passes:
        // the holder vector is complete, so interior pointers are
        // stable.
        let mut timeline_infos: Vec<vk::TimelineSemaphoreSubmitInfo> = Vec::new();
        for holder in &holders {
            if let Some((ref wait_values, ref signal_values)) = holder.timeline {
                timeline_infos.push(
                    vk::TimelineSemaphoreSubmitInfo::builder()
                        .wait_semaphore_values(wait_values)
                        .signal_semaphore_values(signal_values)
                        .build(),
                );
            }
        }
        let mut timeline_iter = timeline_infos.iter();
        let vk_submits: Vec<vk::SubmitInfo> = holders
            .iter()
            .map(|holder| {
                let mut info = vk::SubmitInfo::builder()
                    .wait_semaphores(&holder.waits)
                    .wait_dst_stage_mask(&holder.wait_stages)
                    .command_buffers(&holder.command_buffers)
                    .signal_semaphores(&holder.signals)
                    .build();
                if holder.timeline.is_some() {
                    let timeline = timeline_iter.next().unwrap();
                    info.p_next = (timeline as *const vk::TimelineSemaphoreSubmitInfo).cast();
                }
                info
            })
            .collect();

        let result = {
            profiling::scope!("vkQueueSubmit");
            dispatch.queue_submit(queue.physical, &vk_submits, fence)
        };
        if let Err(err) = result {
            if internal_fence {
                dispatch.destroy_fence(fence);
            }
            if err == vk::Result::ERROR_DEVICE_LOST {
                self.handle_device_lost();
            }
            return Err(err);
        }

        self.finish_dispatched_submission(
            queue.device,
            &dispatch,
            queue.physical,
            &gathered,
            &effects,
            fence,
            internal_fence,
        );
        drop(queue_guard);
        // Draining re-acquires queue mutexes, so it must run unlocked.
        self.drain_deferred_submissions(queue.device, &dispatch);
        Ok(())
    }

    /// # Safety
    ///
    /// `submits` and everything they point to must be valid; semaphore,
    /// command-buffer, and fence handles are boxed guest tokens.
    pub unsafe fn on_queue_submit2(
        &self,
        boxed_queue: vk::Queue,
        submits: &[vk::SubmitInfo2],
        boxed_fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        self.api_log("vkQueueSubmit2");
        let queue = self.resolve_queue(boxed_queue);
        let dispatch = self.registry.device_dispatch(boxed_queue.as_raw());

        let mut owned: Vec<OwnedSubmit2> = Vec::with_capacity(submits.len());
        let mut any_chained = false;
        for submit in submits {
            if !submit.p_next.is_null() {
                any_chained = true;
            }
            let read_sem_infos = |ptr: *const vk::SemaphoreSubmitInfo,
                                  count: u32|
             -> Vec<OwnedSemaphoreSubmit> {
                (0..count as usize)
                    .map(|i| {
                        let info = unsafe { &*ptr.add(i) };
                        if !info.p_next.is_null() {
                            log::warn!("semaphore submit info pNext dropped");
                        }
                        OwnedSemaphoreSubmit {
                            semaphore: self.registry.unbox(info.semaphore),
                            value: info.value.max(1),
                            stage_mask: info.stage_mask,
                        }
                    })
                    .collect()
            };
            let command_buffers: Vec<vk::CommandBuffer> = (0..submit.command_buffer_info_count
                as usize)
                .map(|i| {
                    let info = unsafe { &*submit.p_command_buffer_infos.add(i) };
                    self.registry.unbox(info.command_buffer)
                })
                .collect();
            owned.push(OwnedSubmit2 {
                flags: submit.flags,
                waits: read_sem_infos(
                    submit.p_wait_semaphore_infos,
                    submit.wait_semaphore_info_count,
                ),
                command_buffers,
                signals: read_sem_infos(
                    submit.p_signal_semaphore_infos,
                    submit.signal_semaphore_info_count,
                ),
            });
        }

        let gathered: Vec<GatheredSubmit> = owned
            .iter()
            .map(|submit| GatheredSubmit {
                waits: submit.waits.iter().map(|w| (w.semaphore, w.value)).collect(),
                signals: submit
                    .signals
                    .iter()
                    .map(|s| (s.semaphore, s.value))
                    .collect(),
                command_buffers: submit.command_buffers.clone(),
            })
            .collect();

        let all_command_buffers: Vec<vk::CommandBuffer> = gathered
            .iter()
            .flat_map(|g| g.command_buffers.iter().copied())
            .collect();
        let effects = self.gather_side_effects(&all_command_buffers);
        for &cb in &effects.acquired_color_buffers {
            self.emulation.invalidate_color_buffer(cb);
        }

        let (fence, internal_fence) = match self.registry.try_unbox(boxed_fence) {
            Some(fence) => (fence, false),
            None => (
                dispatch.create_fence(&vk::FenceCreateInfo::builder().build())?,
                true,
            ),
        };

        let queue_guard = queue.queue_mutex.lock();

        if queue.shared && !self.waits_satisfiable(&gathered) {
            if any_chained {
                log::error!("deferred submission with unsupported pNext chain");
                if internal_fence {
                    dispatch.destroy_fence(fence);
                }
                return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
            }
            let pending = queue
                .pending_ops
                .as_ref()
                .expect("shared queue without a pending list");
            pending.lock().calls.push(DeferredSubmitCall {
                submits: owned,
                fence,
                fence_is_internal: internal_fence,
            });
            // Treated as sent: the fence gate opens now, the driver
            // fence signals when the deferred call actually lands.
            if !internal_fence {
                self.mark_fence_waitable(fence);
            }
            log::debug!("submission deferred on queue {:?}", queue.physical);
            return Ok(());
        }

        let result = {
            profiling::scope!("vkQueueSubmit2");
            submit_owned2(&*dispatch, queue.physical, &owned, fence)
        };
        if let Err(err) = result {
            if internal_fence {
                dispatch.destroy_fence(fence);
            }
            if err == vk::Result::ERROR_DEVICE_LOST {
                self.handle_device_lost();
            }
            return Err(err);
        }

        self.finish_dispatched_submission(
            queue.device,
            &dispatch,
            queue.physical,
            &gathered,
            &effects,
            fence,
            internal_fence,
        );
        drop(queue_guard);
        self.drain_deferred_submissions(queue.device, &dispatch);
        Ok(())
    }

    pub fn on_queue_wait_idle(&self, boxed_queue: vk::Queue) -> Result<(), vk::Result> {
        self.api_log("vkQueueWaitIdle");
        let queue = self.resolve_queue(boxed_queue);
        let dispatch = self.registry.device_dispatch(boxed_queue.as_raw());
        let _guard = queue.queue_mutex.lock();
        #[cfg(feature = "lock_early")]
        let _early_guard = self.lock_state();
        profiling::scope!("vkQueueWaitIdle");
        unsafe { dispatch.queue_wait_idle(queue.physical) }
    }

    /// Dispatches every deferred submission whose waits are now
    /// satisfied. Only list heads are considered so per-queue FIFO order
    /// is preserved; draining runs to exhaustion because each dispatch
    /// can satisfy further waits.
    pub(crate) fn drain_deferred_submissions(
        &self,
        device: vk::Device,
        dispatch: &Arc<dyn hal::DeviceDispatch>,
    ) {
        // One entry per physical queue; the virtual twin shares the
        // pending list, so skip handles with the virtual bit.
        let shared_queues: Vec<(vk::Queue, Arc<Mutex<()>>, Arc<Mutex<PendingOps>>)> = {
            let state = self.lock_state();
            state
                .tables
                .queues
                .iter()
                .filter(|(raw, info)| {
                    info.device == device
                        && info.pending_ops.is_some()
                        && raw.as_raw() & QueueInfo::VIRTUAL_QUEUE_BIT == 0
                })
                .map(|(&raw, info)| {
                    (
                        raw,
                        info.queue_mutex.clone(),
                        info.pending_ops.clone().unwrap(),
                    )
                })
                .collect()
        };

        for (physical, queue_mutex, pending) in shared_queues {
            loop {
                let queue_guard = queue_mutex.lock();
                let call = {
                    let mut pending = pending.lock();
                    let head_ready = pending.calls.first().is_some_and(|call| {
                        let gathered: Vec<GatheredSubmit> = call
                            .submits
                            .iter()
                            .map(|submit| GatheredSubmit {
                                waits: submit
                                    .waits
                                    .iter()
                                    .map(|w| (w.semaphore, w.value))
                                    .collect(),
                                signals: submit
                                    .signals
                                    .iter()
                                    .map(|s| (s.semaphore, s.value))
                                    .collect(),
                                command_buffers: submit.command_buffers.clone(),
                            })
                            .collect();
                        self.waits_satisfiable(&gathered)
                    });
                    if head_ready {
                        Some(pending.calls.remove(0))
                    } else {
                        None
                    }
                };
                let Some(call) = call else {
                    drop(queue_guard);
                    break;
                };

                let result = {
                    profiling::scope!("vkQueueSubmit2");
                    unsafe { submit_owned2(&**dispatch, physical, &call.submits, call.fence) }
                };
                drop(queue_guard);
                match result {
                    Ok(()) => {
                        let signals: Vec<(vk::Semaphore, u64)> = call
                            .submits
                            .iter()
                            .flat_map(|s| s.signals.iter().map(|sig| (sig.semaphore, sig.value)))
                            .collect();
                        self.advance_semaphore_values(device, &signals);
                        if call.fence_is_internal {
                            let tracker = {
                                let state = self.lock_state();
                                state
                                    .tables
                                    .devices
                                    .get(&device)
                                    .map(|d| d.op_tracker.clone())
                            };
                            if let Some(tracker) = tracker {
                                tracker.add_pending_garbage(
                                    crate::track::waitable_for_fence(call.fence),
                                    DeviceDeletable::Fence(call.fence),
                                    0,
                                );
                            }
                        } else if call.fence != vk::Fence::null() {
                            self.mark_fence_waitable(call.fence);
                        }
                        log::debug!("deferred submission dispatched on {physical:?}");
                    }
                    Err(err) => {
                        log::error!("deferred submission failed: {err:?}");
                        if err == vk::Result::ERROR_DEVICE_LOST {
                            self.handle_device_lost();
                        }
                    }
                }
            }
        }
    }
}

/// Rebuilds driver-facing `VkSubmitInfo2` structures from owned copies
/// and submits them. Two passes keep the interior pointers stable.
unsafe fn submit_owned2(
    dispatch: &dyn hal::DeviceDispatch,
    queue: vk::Queue,
    owned: &[OwnedSubmit2],
    fence: vk::Fence,
) -> Result<(), vk::Result> {
    struct Submit2Holder {
        waits: SmallVec<[vk::SemaphoreSubmitInfo; 4]>,
        command_buffers: SmallVec<[vk::CommandBufferSubmitInfo; 4]>,
        signals: SmallVec<[vk::SemaphoreSubmitInfo; 4]>,
    }

    let holders: Vec<Submit2Holder> = owned
        .iter()
        .map(|submit| Submit2Holder {
            waits: submit
                .waits
                .iter()
                .map(|w| {
                    vk::SemaphoreSubmitInfo::builder()
                        .semaphore(w.semaphore)
                        .value(w.value)
                        .stage_mask(w.stage_mask)
                        .build()
                })
                .collect(),
            command_buffers: submit
                .command_buffers
                .iter()
                .map(|&cb| {
                    vk::CommandBufferSubmitInfo::builder()
                        .command_buffer(cb)
                        .build()
                })
                .collect(),
            signals: submit
                .signals
                .iter()
                .map(|s| {
                    vk::SemaphoreSubmitInfo::builder()
                        .semaphore(s.semaphore)
                        .value(s.value)
                        .stage_mask(s.stage_mask)
                        .build()
                })
                .collect(),
        })
        .collect();

    let vk_submits: Vec<vk::SubmitInfo2> = holders
        .iter()
        .zip(owned)
        .map(|(holder, submit)| {
            vk::SubmitInfo2::builder()
                .flags(submit.flags)
                .wait_semaphore_infos(&holder.waits)
                .command_buffer_infos(&holder.command_buffers)
                .signal_semaphore_infos(&holder.signals)
                .build()
        })
        .collect();

    dispatch.queue_submit2(queue, &vk_submits, fence)
}
