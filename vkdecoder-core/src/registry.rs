//! The boxed-handle registry.
//!
//! Bidirectional map between the opaque tokens the guest holds and the
//! driver handles they stand for. Dispatchable entries also carry the
//! dispatch table installed for the object, so a boxed `VkQueue` or
//! `VkCommandBuffer` is self-sufficient for issuing driver calls.
//!
//! The registry is serialized by its own internal mutex, which is a leaf
//! in the lock order: it is taken with the global state mutex held and
//! never the other way around.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::id::{self, ObjectType, TypedVkHandle};
use crate::FastHashMap;

/// Dispatch table attached to a dispatchable registry entry.
#[derive(Clone)]
pub enum Dispatch {
    Instance(Arc<dyn hal::InstanceDispatch>),
    Device(Arc<dyn hal::DeviceDispatch>),
}

struct Entry {
    epoch: u32,
    tag: ObjectType,
    raw: u64,
    dispatch: Option<Dispatch>,
}

#[derive(Default)]
struct Inner {
    entries: FastHashMap<u32, Entry>,
    next_index: u32,
    free: Vec<(u32, u32)>,
    /// Boxed ids in allocation order, kept when snapshots are enabled.
    allocation_log: Option<Vec<u64>>,
    /// Boxed ids to hand back out, in order, while a snapshot is loading.
    replay: VecDeque<u64>,
    /// Boxed ids whose removal was deferred until the owning device is
    /// known to be idle, keyed by device.
    delayed_removes: FastHashMap<vk::Device, Vec<u64>>,
}

pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(track_allocation_order: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                allocation_log: track_allocation_order.then(Vec::new),
                ..Default::default()
            }),
        }
    }

    /// Boxes a driver handle. For dispatchable kinds the caller must
    /// provide the dispatch table; for the rest `dispatch` is `None`.
    pub fn new_boxed(&self, raw: u64, tag: ObjectType, dispatch: Option<Dispatch>) -> u64 {
        debug_assert_eq!(dispatch.is_some(), tag.is_dispatchable());
        let mut inner = self.inner.lock();

        let boxed = if let Some(replayed) = inner.replay.pop_front() {
            let (index, epoch, replay_tag) = id::unzip(replayed);
            if replay_tag != Some(tag) {
                panic!(
                    "snapshot replay allocated a {tag:?} where the original stream \
                     allocated {replay_tag:?}"
                );
            }
            inner.next_index = inner.next_index.max(index);
            let old = inner.entries.insert(
                index,
                Entry {
                    epoch,
                    tag,
                    raw,
                    dispatch,
                },
            );
            assert!(old.is_none(), "replayed handle slot {index} already live");
            replayed
        } else {
            let (index, epoch) = match inner.free.pop() {
                Some(slot) => slot,
                None => {
                    inner.next_index += 1;
                    (inner.next_index, 1)
                }
            };
            inner.entries.insert(
                index,
                Entry {
                    epoch,
                    tag,
                    raw,
                    dispatch,
                },
            );
            id::zip(index, epoch, tag)
        };

        if let Some(ref mut order) = inner.allocation_log {
            order.push(boxed);
        }
        boxed
    }

    fn lookup(&self, boxed: u64, expected: ObjectType) -> Option<u64> {
        let (index, epoch, tag) = id::unzip(boxed);
        if tag != Some(expected) {
            return None;
        }
        let inner = self.inner.lock();
        let entry = inner.entries.get(&index)?;
        (entry.epoch == epoch && entry.tag == expected).then_some(entry.raw)
    }

    /// Unboxes a guest token into the driver handle it stands for.
    /// A tag mismatch means the guest handed us one object kind where
    /// another was required, which is unrecoverable.
    pub fn unbox<T: TypedVkHandle>(&self, boxed: T) -> T {
        match self.try_unbox(boxed) {
            Some(raw) => raw,
            None => panic!(
                "invalid boxed {:?} {:#x}: not a live handle of that type",
                T::TAG,
                boxed.as_raw()
            ),
        }
    }

    /// Non-fatal unbox for optional parameters; null stays null.
    pub fn try_unbox<T: TypedVkHandle>(&self, boxed: T) -> Option<T> {
        if boxed.as_raw() == 0 {
            return None;
        }
        self.lookup(boxed.as_raw(), T::TAG).map(T::from_raw)
    }

    /// The dispatch table installed for a boxed dispatchable handle.
    pub fn dispatch(&self, boxed: u64) -> Dispatch {
        let (index, epoch, _) = id::unzip(boxed);
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&index)
            .filter(|e| e.epoch == epoch)
            .unwrap_or_else(|| panic!("no dispatch entry for boxed {boxed:#x}"));
        entry
            .dispatch
            .clone()
            .unwrap_or_else(|| panic!("boxed {boxed:#x} ({:?}) is not dispatchable", entry.tag))
    }

    pub fn device_dispatch(&self, boxed: u64) -> Arc<dyn hal::DeviceDispatch> {
        match self.dispatch(boxed) {
            Dispatch::Device(d) => d,
            Dispatch::Instance(_) => panic!("boxed {boxed:#x} carries an instance table"),
        }
    }

    pub fn instance_dispatch(&self, boxed: u64) -> Arc<dyn hal::InstanceDispatch> {
        match self.dispatch(boxed) {
            Dispatch::Instance(d) => d,
            Dispatch::Device(_) => panic!("boxed {boxed:#x} carries a device table"),
        }
    }

    /// Rebinds a boxed token to a new driver handle. Used for
    /// pre-reserved descriptor-set pool-ids, whose driver object appears
    /// only at commit time, and again after a pool reset.
    pub fn update_raw(&self, boxed: u64, raw: u64) {
        let (index, epoch, _) = id::unzip(boxed);
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&index) {
            Some(entry) if entry.epoch == epoch => entry.raw = raw,
            _ => panic!("update of stale boxed handle {boxed:#x}"),
        }
    }

    /// Finalizes a boxed handle, releasing its slot for reuse.
    pub fn delete_boxed(&self, boxed: u64) {
        let (index, epoch, _) = id::unzip(boxed);
        let mut inner = self.inner.lock();
        match inner.entries.get(&index) {
            Some(entry) if entry.epoch == epoch => {
                inner.entries.remove(&index);
                inner.free.push((index, epoch.wrapping_add(1).max(1)));
                if let Some(ref mut order) = inner.allocation_log {
                    order.retain(|&b| b != boxed);
                }
            }
            _ => log::warn!("delete of stale boxed handle {boxed:#x} ignored"),
        }
    }

    /// Queues a boxed handle for removal once `device` is known idle.
    pub fn schedule_delayed_remove(&self, device: vk::Device, boxed: u64) {
        self.inner
            .lock()
            .delayed_removes
            .entry(device)
            .or_default()
            .push(boxed);
    }

    pub fn process_delayed_removes(&self, device: vk::Device) {
        let pending = self.inner.lock().delayed_removes.remove(&device);
        for boxed in pending.unwrap_or_default() {
            self.delete_boxed(boxed);
        }
    }

    /// Number of live entries; reported in call-logging mode so leaks
    /// show up as a nonzero count at teardown.
    pub fn live_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Boxed ids in the order they were allocated, for the snapshot
    /// replay blob. Empty when allocation-order tracking is off.
    pub fn allocation_order(&self) -> Vec<u64> {
        self.inner
            .lock()
            .allocation_log
            .clone()
            .unwrap_or_default()
    }

    /// Installs the boxed ids a snapshot load is about to reuse, in their
    /// original allocation order. Subsequent `new_boxed` calls consume
    /// them until the queue is empty.
    pub fn begin_replay(&self, boxed_ids: Vec<u64>) {
        let mut inner = self.inner.lock();
        assert!(
            inner.replay.is_empty(),
            "handle replay started while a previous replay is unfinished"
        );
        inner.replay = boxed_ids.into();
    }

    pub fn replay_remaining(&self) -> usize {
        self.inner.lock().replay.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_unbox_round_trip() {
        let registry = Registry::new(false);
        let raw = vk::Image::from_raw(0xdead_beef);
        let boxed = vk::Image::from_raw(registry.new_boxed(raw.as_raw(), ObjectType::Image, None));
        assert_eq!(registry.unbox(boxed), raw);
        assert_eq!(registry.live_count(), 1);
        registry.delete_boxed(boxed.as_raw());
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.try_unbox(boxed), None);
    }

    #[test]
    fn null_unboxes_to_none() {
        let registry = Registry::new(false);
        assert_eq!(registry.try_unbox(vk::Buffer::null()), None);
    }

    #[test]
    #[should_panic(expected = "not a live handle of that type")]
    fn tag_mismatch_is_fatal() {
        let registry = Registry::new(false);
        let boxed = registry.new_boxed(1, ObjectType::Image, None);
        // Reinterpret the image token as a buffer token.
        registry.unbox(vk::Buffer::from_raw(boxed));
    }

    #[test]
    fn slot_reuse_bumps_epoch() {
        let registry = Registry::new(false);
        let first = registry.new_boxed(1, ObjectType::Fence, None);
        registry.delete_boxed(first);
        let second = registry.new_boxed(2, ObjectType::Fence, None);
        assert_ne!(first, second);
        assert_eq!(registry.try_unbox(vk::Fence::from_raw(first)), None);
        assert_eq!(
            registry.unbox(vk::Fence::from_raw(second)),
            vk::Fence::from_raw(2)
        );
    }

    #[test]
    fn replay_reinstates_original_ids() {
        let registry = Registry::new(true);
        let a = registry.new_boxed(10, ObjectType::Buffer, None);
        let b = registry.new_boxed(11, ObjectType::Image, None);
        let order = registry.allocation_order();
        assert_eq!(order, vec![a, b]);

        let fresh = Registry::new(true);
        fresh.begin_replay(order);
        let a2 = fresh.new_boxed(20, ObjectType::Buffer, None);
        let b2 = fresh.new_boxed(21, ObjectType::Image, None);
        assert_eq!(a2, a);
        assert_eq!(b2, b);
        assert_eq!(
            fresh.unbox(vk::Image::from_raw(b2)),
            vk::Image::from_raw(21)
        );
    }
}
