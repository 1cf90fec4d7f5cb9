//! Host-facing facade over the zone map store and the two collaborators.
//!
//! Every operation on a master id runs under that master's lock (see
//! [`ZoneMapStore::lock`]), so an activation never interleaves with a
//! reconciliation pass for the same master. Different masters proceed
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::catalog::{self, ZoneCatalog};
use crate::device::{ControllerDriver, DeviceDirectory, DeviceId, MasterActiveState};
use crate::error::MasterError;
use crate::state::SharedState;
use crate::store::ZoneMapStore;

pub struct MasterService {
    store: ZoneMapStore,
    pub(crate) directory: Arc<dyn DeviceDirectory>,
    pub(crate) driver: Arc<dyn ControllerDriver>,
    shared: SharedState,
    /// Last state written to the directory per master.
    published: Mutex<HashMap<DeviceId, MasterActiveState>>,
}

impl MasterService {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        driver: Arc<dyn ControllerDriver>,
        shared: SharedState,
    ) -> Self {
        Self {
            store: ZoneMapStore::new(),
            directory,
            driver,
            shared,
            published: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ZoneMapStore {
        &self.store
    }

    /// Ids of every started master.
    pub async fn master_ids(&self) -> Vec<DeviceId> {
        self.store.ids().await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// (Re)build the catalog for `master` from its configured controllers and
    /// publish the summary properties. Any previous catalog is discarded.
    pub async fn on_master_start(
        &self,
        master: DeviceId,
        configured: &[DeviceId],
    ) -> Result<Arc<ZoneCatalog>, MasterError> {
        let _guard = self.store.lock(master).await;

        let built = catalog::assemble(master, configured, self.directory.as_ref()).await;
        self.shared.write().await.record_catalog(&built);
        self.published.lock().await.remove(&master);
        self.store.put(built).await;

        let stored = self.catalog_for(master).await?;
        if !configured.is_empty() {
            catalog::publish_summary(&stored, self.directory.as_ref()).await?;
        }

        info!(master, zones = stored.len(), "master ready");
        Ok(stored)
    }

    /// Turn everything off (best effort) and forget the catalog. A no-op for
    /// a master that was never started.
    pub async fn on_master_stop(&self, master: DeviceId) {
        let _guard = self.store.lock(master).await;

        if self.store.get(master).await.is_none() {
            debug!(master, "stop requested for master that is not running");
            return;
        }

        if let Err(e) = self.deactivate_locked(master).await {
            warn!(master, "all-off during stop failed: {e}");
        }

        self.store.remove(master).await;
        self.published.lock().await.remove(&master);
        self.shared.write().await.remove_master(master);
        info!(master, "master stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Run logical `zone` on `master`; zone 0 turns everything off.
    pub async fn activate_zone(
        &self,
        master: DeviceId,
        zone: u32,
    ) -> Result<MasterActiveState, MasterError> {
        let _guard = self.store.lock(master).await;
        let res = self.activate_locked(master, zone).await;
        self.note_failure(master, &res).await;
        res
    }

    pub async fn deactivate_all(&self, master: DeviceId) -> Result<(), MasterError> {
        let _guard = self.store.lock(master).await;
        let res = self.deactivate_locked(master).await;
        self.note_failure(master, &res).await;
        res
    }

    pub async fn reconcile(&self, master: DeviceId) -> Result<MasterActiveState, MasterError> {
        let _guard = self.store.lock(master).await;
        let res = self.reconcile_locked(master).await;
        self.note_failure(master, &res).await;
        res
    }

    /// Reconcile each master in turn. Failures are collected, never fatal to
    /// the rest of the batch.
    pub async fn reconcile_all(&self, masters: &[DeviceId]) -> Vec<(DeviceId, MasterError)> {
        let mut failures = Vec::new();
        for &master in masters {
            if let Err(e) = self.reconcile(master).await {
                failures.push((master, e));
            }
        }
        failures
    }

    /// A controller reported a change; refresh every master bound to it.
    pub async fn on_controller_changed(
        &self,
        controller: DeviceId,
    ) -> Vec<(DeviceId, MasterError)> {
        let masters = self.store.masters_referencing(controller).await;
        debug!(controller, ?masters, "controller changed");
        self.reconcile_all(&masters).await
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    pub(crate) async fn catalog_for(
        &self,
        master: DeviceId,
    ) -> Result<Arc<ZoneCatalog>, MasterError> {
        self.store
            .get(master)
            .await
            .ok_or(MasterError::UnknownMaster(master))
    }

    /// Write `state` for `master` unless it is what was last written.
    pub(crate) async fn publish(
        &self,
        master: DeviceId,
        state: MasterActiveState,
    ) -> Result<(), MasterError> {
        if self.published.lock().await.get(&master) == Some(&state) {
            return Ok(());
        }

        debug!(
            master,
            zone = state.active_zone,
            slave = state.active_slave_id,
            slave_zone = state.active_slave_zone,
            "setting active zone status"
        );
        self.directory.set_active_state(master, state).await?;

        self.published.lock().await.insert(master, state);
        self.shared.write().await.record_state(master, state);
        Ok(())
    }

    /// Zero the published state as a side effect of a failed command. The
    /// command's own error is what the caller sees.
    pub(crate) async fn reset_state(&self, master: DeviceId) {
        if let Err(e) = self.publish(master, MasterActiveState::IDLE).await {
            error!(master, "failed to clear active state: {e}");
        }
    }

    async fn note_failure<T>(&self, master: DeviceId, res: &Result<T, MasterError>) {
        if let Err(e) = res {
            error!(master, "{e}");
            self.shared
                .write()
                .await
                .record_error(format!("master {master}: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
