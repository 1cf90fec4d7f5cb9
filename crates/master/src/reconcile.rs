//! Status reconciliation: work out what a master is running from what its
//! slaves report, without commanding anything.

use tracing::{debug, warn};

use crate::catalog::ZoneCatalog;
use crate::device::{Device, DeviceId, MasterActiveState};
use crate::error::MasterError;
use crate::service::MasterService;

impl MasterService {
    /// The slave currently running a zone, if any.
    ///
    /// Slaves are scanned in catalog order and the last one reporting an
    /// active zone wins. More than one active slave is logged but not treated
    /// as an error.
    pub(crate) async fn active_slave(
        &self,
        catalog: &ZoneCatalog,
    ) -> Result<Option<Device>, MasterError> {
        let master = catalog.master_id();
        let mut active: Option<Device> = None;
        let mut running: Vec<DeviceId> = Vec::new();

        for slave_id in catalog.controllers() {
            let Some(slave) = self.directory.resolve(slave_id).await? else {
                warn!(master, slave = slave_id, "controller not found (may have been deleted)");
                continue;
            };

            debug!(master, slave = %slave.name, zone = slave.active_zone, "active zone on slave");
            if slave.is_active() {
                running.push(slave.id);
                active = Some(slave);
            }
        }

        if running.len() > 1 {
            warn!(
                master,
                controllers = ?running,
                "multiple controllers report an active zone; using the last"
            );
        }

        Ok(active)
    }

    pub(crate) async fn reconcile_locked(
        &self,
        master: DeviceId,
    ) -> Result<MasterActiveState, MasterError> {
        let catalog = self.catalog_for(master).await?;
        debug!(master, "update status on master device");

        let state = match self.active_slave(&catalog).await? {
            None => MasterActiveState::IDLE,
            Some(slave) => {
                let zone = catalog.logical_zone_for(slave.id, slave.active_zone);
                if zone.is_none() {
                    warn!(
                        master,
                        slave = slave.id,
                        slave_zone = slave.active_zone,
                        "active slave zone has no logical zone"
                    );
                }
                MasterActiveState::running(zone.unwrap_or(0), slave.id, slave.active_zone)
            }
        };

        self.publish(master, state).await?;
        Ok(state)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
