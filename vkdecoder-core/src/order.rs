//! Host-side happens-before barriers.
//!
//! Two guest threads sharing a dispatchable object order their commands
//! by sequence number without a driver round-trip: the later thread
//! waits until the earlier one has advanced the object's sequence
//! counter. Waiters give up after five seconds so a missing increment
//! cannot wedge the decoder.

use std::sync::Arc;
use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};

use crate::global::Global;
use crate::FastHashMap;

const HOST_SYNC_DEADLINE: Duration = Duration::from_secs(5);

struct OrderPoint {
    sequence: Mutex<u32>,
    cv: Condvar,
}

/// Per-dispatchable-object sequence counters, keyed by boxed handle.
#[derive(Default)]
pub struct OrderMaintenance {
    points: Mutex<FastHashMap<u64, Arc<OrderPoint>>>,
}

impl OrderMaintenance {
    fn point(&self, key: u64) -> Arc<OrderPoint> {
        self.points
            .lock()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(OrderPoint {
                    sequence: Mutex::new(0),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }

    /// Waits for the predecessor of `sequence_number`, then claims it.
    fn sync(&self, key: u64, sequence_number: u32) {
        let point = self.point(key);
        let deadline = std::time::Instant::now() + HOST_SYNC_DEADLINE;
        let mut current = point.sequence.lock();
        while *current != sequence_number.wrapping_sub(1) {
            if point.cv.wait_until(&mut current, deadline).timed_out() {
                log::error!(
                    "host sync timed out waiting for sequence {} on {key:#x} (at {})",
                    sequence_number.wrapping_sub(1),
                    *current
                );
                break;
            }
        }
        *current = sequence_number;
        point.cv.notify_all();
    }

    pub(crate) fn forget(&self, key: u64) {
        self.points.lock().remove(&key);
    }
}

impl Global {
    pub fn on_command_buffer_host_sync(
        &self,
        boxed_cb: vk::CommandBuffer,
        need_host_sync: bool,
        sequence_number: u32,
    ) {
        self.api_log("vkCommandBufferHostSync");
        if need_host_sync {
            self.order.sync(boxed_cb.as_raw(), sequence_number);
        }
    }

    pub fn on_queue_host_sync(
        &self,
        boxed_queue: vk::Queue,
        need_host_sync: bool,
        sequence_number: u32,
    ) {
        self.api_log("vkQueueHostSync");
        if need_host_sync {
            self.order.sync(boxed_queue.as_raw(), sequence_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_order_two_threads() {
        let order = Arc::new(OrderMaintenance::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let order2 = order.clone();
        let log2 = log.clone();
        let second = std::thread::spawn(move || {
            // Sequence 2 must wait for sequence 1.
            order2.sync(7, 2);
            log2.lock().push(2);
        });
        std::thread::sleep(Duration::from_millis(50));
        log.lock().push(1);
        order.sync(7, 1);
        second.join().unwrap();

        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn timed_out_sync_does_not_wedge() {
        let order = OrderMaintenance::default();
        // Nothing ever claims sequence 41; the waiter must come back.
        let start = std::time::Instant::now();
        order.sync(9, 42);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
