//! The single owning value: Content Store, Discovery Client handle,
//! configuration, and server-observable state, threaded by reference into
//! every request handler and control-plane method. Constructed once in
//! `main` and never duplicated into a global.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::config::DaemonConfig;
use crate::control::ControlPlane;
use crate::discovery::DiscoveryBackend;
use crate::store::ContentStore;

/// Observable daemon status (spec §5/§7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Starting,
    Loading,
    Running,
    DisabledMetered,
}

pub struct Daemon {
    pub store: Mutex<ContentStore>,
    pub discovery: Arc<dyn DiscoveryBackend>,
    pub config: DaemonConfig,
    pub instance_name: String,
    pub status: Mutex<Status>,
    pub download_saving: AtomicU64,
    /// Serializes `register` calls: one runs to completion before the next
    /// is begun, per spec.md §5's ordering guarantee.
    register_lock: Mutex<()>,
    /// Set once the control plane's D-Bus object is registered, so that
    /// status transitions occurring outside a dispatched `ControlPlane`
    /// method (sweep eviction, metered flip) can still emit
    /// `PropertiesChanged` for `Status`.
    control_iface: OnceCell<zbus::InterfaceRef<ControlPlane>>,
}

impl Daemon {
    pub fn new(store: ContentStore, discovery: Arc<dyn DiscoveryBackend>, config: DaemonConfig) -> Self {
        Self {
            store: Mutex::new(store),
            discovery,
            instance_name: crate::discovery::random_instance_name(),
            config,
            status: Mutex::new(Status::Starting),
            download_saving: AtomicU64::new(0),
            register_lock: Mutex::new(()),
            control_iface: OnceCell::new(),
        }
    }

    /// Called once, after the control plane's D-Bus object is serving, so
    /// later status transitions can notify subscribers.
    pub fn set_control_iface(&self, iface: zbus::InterfaceRef<ControlPlane>) {
        let _ = self.control_iface.set(iface);
    }

    /// Assign `status` and emit `PropertiesChanged` for it if the control
    /// plane is up. A no-op signal emission (e.g. before the D-Bus object
    /// is registered) is not an error.
    pub async fn set_status(&self, status: Status) {
        *self.status.lock().await = status;
        if let Some(iface_ref) = self.control_iface.get() {
            let iface = iface_ref.get().await;
            if let Err(err) = iface.status_changed(iface_ref.signal_context()).await {
                log::debug!("failed to emit Status PropertiesChanged: {}", err);
            }
        }
    }

    /// `DownloadSaving` converted to GB and multiplied by the configured
    /// carbon cost.
    pub fn carbon_saving(&self) -> f64 {
        let bytes = self.download_saving.load(std::sync::atomic::Ordering::Relaxed);
        let gb = bytes as f64 / 1_000_000_000.0;
        gb * self.config.carbon_cost
    }

    /// Re-derive the advertised set and ask the discovery backend to
    /// commit it, updating `Status` to reflect the outcome. Holding
    /// `register_lock` for the whole call linearizes re-advertisement: a
    /// `register` runs to completion before the next is begun, and a
    /// pending one is deferred rather than reordered.
    pub async fn reregister(&self) {
        let _guard = self.register_lock.lock().await;

        let hashes = {
            let store = self.store.lock().await;
            store.advertised_hashes()
        };

        match self
            .discovery
            .register(&self.instance_name, self.config.port, &hashes)
            .await
        {
            Ok(crate::discovery::RegisterOutcome::Registered) => {
                self.set_status(Status::Running).await;
            }
            Ok(crate::discovery::RegisterOutcome::DisabledMetered) => {
                self.set_status(Status::DisabledMetered).await;
            }
            Err(err) => {
                log::warn!("registration failed, will retry on next trigger: {}", err);
            }
        }
    }
}
