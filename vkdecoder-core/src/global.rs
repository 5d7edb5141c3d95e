//! The decoder's global state root.
//!
//! One [`Global`] per process in production, mirroring the Vulkan
//! loader's own process-global nature; tests build their own instance
//! per case so they can tear the world down between runs.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};

use crate::emulation::{Emulation, ExternalObjectManager, VmOps};
use crate::features::{EnvConfig, Features};
use crate::hub::ObjectTables;
use crate::order::OrderMaintenance;
use crate::registry::Registry;
use crate::snapshot::SnapshotLog;

pub(crate) struct State {
    pub tables: ObjectTables,
}

pub struct Global {
    pub(crate) features: Features,
    pub(crate) env: EnvConfig,
    pub(crate) entry: Arc<dyn hal::EntryDispatch>,
    pub(crate) emulation: Arc<dyn Emulation>,
    pub(crate) external_objects: Arc<dyn ExternalObjectManager>,
    pub(crate) vm_ops: Arc<dyn VmOps>,
    pub(crate) registry: Registry,
    pub(crate) state: Mutex<State>,
    pub(crate) snapshot: Mutex<SnapshotLog>,
    pub(crate) order: OrderMaintenance,
    cleanup_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

static PROCESS_INSTANCE: OnceCell<Arc<Global>> = OnceCell::new();

impl Global {
    pub fn new(
        entry: Arc<dyn hal::EntryDispatch>,
        emulation: Arc<dyn Emulation>,
        external_objects: Arc<dyn ExternalObjectManager>,
        vm_ops: Arc<dyn VmOps>,
        features: Features,
    ) -> Arc<Self> {
        let env = EnvConfig::from_env();
        let snapshots = features.contains(Features::SNAPSHOTS);
        if snapshots {
            vm_ops.set_snapshot_uses_vulkan();
        }
        Arc::new(Self {
            features,
            env,
            entry,
            emulation,
            external_objects,
            vm_ops,
            registry: Registry::new(snapshots),
            state: Mutex::new(State {
                tables: ObjectTables::default(),
            }),
            snapshot: Mutex::new(SnapshotLog::new(snapshots)),
            order: OrderMaintenance::default(),
            cleanup_callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Installs the process-wide decoder instance. Later calls return the
    /// already-installed one.
    pub fn install_process_instance(global: Arc<Global>) -> Arc<Global> {
        PROCESS_INSTANCE.get_or_init(|| global).clone()
    }

    pub fn process_instance() -> Option<Arc<Global>> {
        PROCESS_INSTANCE.get().cloned()
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    /// Number of live table entries across every object kind; in
    /// call-logging mode a nonzero count at teardown is a leak report.
    pub fn tracked_object_count(&self) -> usize {
        self.lock_state().tables.total_entries()
    }

    pub fn live_boxed_count(&self) -> usize {
        self.registry.live_count()
    }

    /// Registers a callback to run when the owning guest process goes
    /// away; drained outside the state mutex because callbacks re-enter
    /// decoder methods.
    pub fn register_process_cleanup_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        self.cleanup_callbacks.lock().push(callback);
    }

    pub(crate) fn drain_cleanup_callbacks(&self) {
        let callbacks = std::mem::take(&mut *self.cleanup_callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    pub(crate) fn api_log(&self, entry_point: &str) {
        if self.env.log_calls {
            log::info!(
                "{entry_point} (live handles: {})",
                self.registry.live_count()
            );
        } else {
            #[cfg(feature = "api_log_info")]
            log::info!("{entry_point}");
            #[cfg(not(feature = "api_log_info"))]
            log::trace!("{entry_point}");
        }
    }

    /// Device-lost is unrecoverable: let the embedder flush its logs,
    /// then abort with a diagnostic.
    pub(crate) fn handle_device_lost(&self) -> ! {
        self.emulation.on_device_lost();
        panic!("VK_ERROR_DEVICE_LOST reported by the driver");
    }
}
