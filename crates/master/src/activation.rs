//! Zone activation: turn one logical zone on, or everything off, while keeping
//! at most one physical controller running per master.
//!
//! ```text
//! activate(z) ──▶ resolve entry z ──▶ other slave active? ──yes──▶ stop(other)
//!                                             │                       │
//!                                             no                      ▼
//!                                             └──────────────▶ start(slave, zone)
//! ```
//!
//! A failed stop aborts before any start is issued, so two controllers are
//! never commanded on together.

use tracing::{debug, error, warn};

use crate::catalog::ZoneCatalog;
use crate::device::{Device, DeviceId, MasterActiveState};
use crate::error::{DriverError, MasterError};
use crate::service::MasterService;

impl MasterService {
    pub(crate) async fn activate_locked(
        &self,
        master: DeviceId,
        zone: u32,
    ) -> Result<MasterActiveState, MasterError> {
        if zone == 0 {
            self.deactivate_locked(master).await?;
            return Ok(MasterActiveState::IDLE);
        }

        let catalog = self.catalog_for(master).await?;
        debug!(master, zone, "turning on master zone");

        let Some(entry) = catalog.get(zone) else {
            self.reset_state(master).await;
            return Err(MasterError::ZoneOutOfRange {
                master,
                zone,
                count: catalog.len(),
            });
        };

        let Some(target) = self.directory.resolve(entry.controller_id).await? else {
            self.reset_state(master).await;
            return Err(MasterError::SlaveNotFound(entry.controller_id));
        };

        debug!(
            master,
            zone_name = %entry.zone_name,
            slave = target.id,
            slave_zone = entry.physical_zone_id,
            "starting zone on slave"
        );

        let stopped_other = self.prepare_for_next_zone(&catalog, &target).await?;

        if let Err(e) = self.driver.start(&target, entry.physical_zone_id).await {
            // Whatever ran before has been stopped; don't keep reporting it.
            if stopped_other {
                self.reset_state(master).await;
            }
            return Err(e.into());
        }

        let state = MasterActiveState::running(zone, target.id, entry.physical_zone_id);
        self.publish(master, state).await?;
        Ok(state)
    }

    /// Stop the currently active slave if it is not `next`. Returns whether a
    /// stop was issued.
    async fn prepare_for_next_zone(
        &self,
        catalog: &ZoneCatalog,
        next: &Device,
    ) -> Result<bool, MasterError> {
        let Some(active) = self.active_slave(catalog).await? else {
            return Ok(false);
        };

        if active.id == next.id {
            return Ok(false);
        }

        debug!(
            master = catalog.master_id(),
            active = active.id,
            next = next.id,
            "stopping active slave before switching"
        );
        self.driver.stop(&active).await?;
        Ok(true)
    }

    pub(crate) async fn deactivate_locked(&self, master: DeviceId) -> Result<(), MasterError> {
        let catalog = self.catalog_for(master).await?;
        debug!(master, "turning off all zones");

        let mut first_failure: Option<DriverError> = None;

        for slave_id in catalog.controllers() {
            let slave = match self.directory.resolve(slave_id).await {
                Ok(Some(d)) => d,
                Ok(None) => {
                    warn!(master, slave = slave_id, "controller not found (may have been deleted)");
                    continue;
                }
                Err(e) => {
                    error!(master, slave = slave_id, "controller lookup failed: {e}");
                    continue;
                }
            };

            debug!(master, slave = %slave.name, "stopping zones on controller");
            if let Err(e) = self.driver.stop(&slave).await {
                warn!(master, slave = slave_id, "stop failed: {e}");
                first_failure.get_or_insert(e);
            }
        }

        self.publish(master, MasterActiveState::IDLE).await?;

        match first_failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
