//! "Is this submission done yet" tracking.
//!
//! Every tracked submission gets a [`DeviceOpWaitable`] backed by an
//! internal fence. Objects referenced by in-flight work record the
//! waitable as their latest use; their destruction is parked as pending
//! garbage and executed on a later poll, once the waitable reports done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

struct WaitableInner {
    fence: vk::Fence,
    done: AtomicBool,
}

#[derive(Clone)]
pub struct DeviceOpWaitable(Arc<WaitableInner>);

impl DeviceOpWaitable {
    pub fn fence(&self) -> vk::Fence {
        self.0.fence
    }

    pub fn is_done(&self, dispatch: &dyn hal::DeviceDispatch) -> bool {
        if self.0.done.load(Ordering::Acquire) {
            return true;
        }
        let signalled = unsafe { dispatch.get_fence_status(self.0.fence) }.unwrap_or(false);
        if signalled {
            self.0.done.store(true, Ordering::Release);
        }
        signalled
    }

    fn mark_done(&self) {
        self.0.done.store(true, Ordering::Release);
    }
}

/// Wraps an already-submitted fence as a waitable, for garbage whose
/// readiness is that fence itself.
pub(crate) fn waitable_for_fence(fence: vk::Fence) -> DeviceOpWaitable {
    DeviceOpWaitable(Arc::new(WaitableInner {
        fence,
        done: AtomicBool::new(false),
    }))
}

/// Driver objects whose destruction was deferred behind a waitable.
pub enum DeviceDeletable {
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
}

struct PendingGarbage {
    waitable: DeviceOpWaitable,
    object: DeviceDeletable,
    boxed: u64,
}

#[derive(Default)]
struct TrackerInner {
    pending: Vec<PendingGarbage>,
    /// Signalled internal fences ready for reuse.
    free_fences: Vec<vk::Fence>,
    /// Internal fences attached to still-running submissions.
    active: Vec<DeviceOpWaitable>,
}

pub struct DeviceOpTracker {
    dispatch: Arc<dyn hal::DeviceDispatch>,
    inner: Mutex<TrackerInner>,
}

impl DeviceOpTracker {
    pub fn new(dispatch: Arc<dyn hal::DeviceDispatch>) -> Arc<Self> {
        Arc::new(Self {
            dispatch,
            inner: Mutex::new(TrackerInner::default()),
        })
    }

    /// Issues a waitable for a submission about to go to the driver. The
    /// returned fence must be signalled by that submission.
    pub fn begin_op(&self) -> Result<DeviceOpWaitable, vk::Result> {
        let recycled = self.inner.lock().free_fences.pop();
        let fence = match recycled {
            Some(fence) => {
                unsafe { self.dispatch.reset_fences(&[fence]) }?;
                fence
            }
            None => unsafe {
                self.dispatch
                    .create_fence(&vk::FenceCreateInfo::builder().build())?
            },
        };
        let waitable = DeviceOpWaitable(Arc::new(WaitableInner {
            fence,
            done: AtomicBool::new(false),
        }));
        self.inner.lock().active.push(waitable.clone());
        Ok(waitable)
    }

    /// Parks `object` until `waitable` fires. `boxed` is the guest token
    /// to finalize in the registry afterwards (0 for none).
    pub fn add_pending_garbage(
        &self,
        waitable: DeviceOpWaitable,
        object: DeviceDeletable,
        boxed: u64,
    ) {
        self.inner.lock().pending.push(PendingGarbage {
            waitable,
            object,
            boxed,
        });
    }

    /// Destroys garbage whose waitables have fired and recycles finished
    /// internal fences. Returns the boxed tokens now safe to finalize.
    pub fn poll(&self) -> Vec<u64> {
        let mut inner = self.inner.lock();
        let dispatch = &*self.dispatch;

        let mut kept_active = Vec::with_capacity(inner.active.len());
        let mut newly_free = Vec::new();
        for waitable in inner.active.drain(..) {
            if waitable.is_done(dispatch) {
                waitable.mark_done();
                newly_free.push(waitable);
            } else {
                kept_active.push(waitable);
            }
        }
        inner.active = kept_active;

        let mut finalized = Vec::new();
        let mut kept_pending = Vec::with_capacity(inner.pending.len());
        for garbage in inner.pending.drain(..) {
            if garbage.waitable.is_done(dispatch) {
                match garbage.object {
                    DeviceDeletable::Semaphore(sem) => unsafe {
                        dispatch.destroy_semaphore(sem)
                    },
                    DeviceDeletable::Fence(fence) => unsafe { dispatch.destroy_fence(fence) },
                }
                if garbage.boxed != 0 {
                    finalized.push(garbage.boxed);
                }
            } else {
                kept_pending.push(garbage);
            }
        }
        inner.pending = kept_pending;

        // Recycle only after the garbage pass so nothing can observe a
        // reset fence through a stale waitable.
        for waitable in newly_free {
            inner.free_fences.push(waitable.fence());
        }
        finalized
    }

    /// Waits for every outstanding waitable, flushes all garbage, and
    /// destroys the internal fences. Used at device teardown. If the
    /// wait fails or times out, nothing is destroyed: the submissions
    /// may still be running, so everything leaks instead (same policy
    /// as a failed device wait-idle during teardown).
    pub fn drain_blocking(&self, timeout_ns: u64) -> Vec<u64> {
        let fences: Vec<vk::Fence> = self
            .inner
            .lock()
            .active
            .iter()
            .map(DeviceOpWaitable::fence)
            .collect();
        if !fences.is_empty() {
            if let Err(err) = unsafe { self.dispatch.wait_for_fences(&fences, true, timeout_ns) } {
                let pending = self.inner.lock().pending.len();
                log::error!(
                    "device-op tracker drain: wait failed with {err:?}; \
                     leaking {pending} pending objects and the tracker fences"
                );
                return Vec::new();
            }
        }
        for waitable in self.inner.lock().active.iter() {
            waitable.mark_done();
        }
        let finalized = self.poll();
        let mut inner = self.inner.lock();
        for fence in inner.free_fences.drain(..) {
            unsafe { self.dispatch.destroy_fence(fence) };
        }
        finalized
    }

    pub fn pending_garbage_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
