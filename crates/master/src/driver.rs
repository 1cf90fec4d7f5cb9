//! Controller drivers: how a start/stop command reaches a physical controller.
//!
//! Both drivers record the zone they commanded as the slave's reported active
//! zone, which is what the reconciler later reads back.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::db::{Db, SlaveConfig};
use crate::device::{ControllerDriver, Device, DeviceId};
use crate::error::DriverError;
use crate::valve::ValveBoard;

async fn report_active_zone(db: &Db, device: DeviceId, zone: u32) -> Result<(), DriverError> {
    db.set_device_active_zone(device, zone)
        .await
        .map_err(|e| DriverError::new(device, format!("{e:#}")))
}

// ---------------------------------------------------------------------------
// Simulated controller (no hardware at all)
// ---------------------------------------------------------------------------

pub struct SimulatedDriver {
    db: Db,
}

impl SimulatedDriver {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ControllerDriver for SimulatedDriver {
    async fn start(&self, device: &Device, zone: u32) -> Result<(), DriverError> {
        info!(slave = device.id, zone, "[sim] start zone");
        report_active_zone(&self.db, device.id, zone).await
    }

    async fn stop(&self, device: &Device) -> Result<(), DriverError> {
        info!(slave = device.id, "[sim] stop all zones");
        report_active_zone(&self.db, device.id, 0).await
    }
}

// ---------------------------------------------------------------------------
// Local relay boards, one per slave
// ---------------------------------------------------------------------------

pub struct RelayDriver {
    boards: Mutex<HashMap<DeviceId, ValveBoard>>,
    db: Db,
}

impl RelayDriver {
    /// Build a board for every enabled slave with wired zones. Zones without a
    /// `gpio_pin` are left off the board.
    ///
    /// Boards come up with every relay released, so each wired slave's
    /// reported active zone is reset to 0 to match.
    pub async fn new(slaves: &[SlaveConfig], active_low: bool, db: Db) -> anyhow::Result<Self> {
        let mut boards = HashMap::new();
        for s in slaves.iter().filter(|s| s.enabled) {
            let wiring: Vec<(u32, u8)> = s
                .zones
                .iter()
                .enumerate()
                .filter_map(|(i, z)| {
                    let pin = u8::try_from(z.gpio_pin?).ok()?;
                    Some((i as u32 + 1, pin))
                })
                .collect();
            if wiring.is_empty() {
                continue;
            }
            boards.insert(s.id, ValveBoard::new(s.id, &wiring, active_low)?);
        }

        for id in boards.keys() {
            db.set_device_active_zone(*id, 0)
                .await
                .with_context(|| format!("failed to reset active zone of controller {id}"))?;
        }

        Ok(Self {
            boards: Mutex::new(boards),
            db,
        })
    }

    fn with_board<T>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&mut ValveBoard) -> T,
    ) -> Result<T, DriverError> {
        let mut boards = self
            .boards
            .lock()
            .map_err(|_| DriverError::new(device, "relay boards poisoned"))?;
        let board = boards
            .get_mut(&device)
            .ok_or_else(|| DriverError::new(device, "no relay board for controller"))?;
        Ok(f(board))
    }
}

#[async_trait]
impl ControllerDriver for RelayDriver {
    async fn start(&self, device: &Device, zone: u32) -> Result<(), DriverError> {
        if !self.with_board(device.id, |b| b.select(zone))? {
            return Err(DriverError::new(device.id, format!("zone {zone} has no relay")));
        }
        info!(slave = device.id, zone, "relay zone on");
        report_active_zone(&self.db, device.id, zone).await
    }

    async fn stop(&self, device: &Device) -> Result<(), DriverError> {
        self.with_board(device.id, ValveBoard::all_off)?;
        info!(slave = device.id, "relays off");
        report_active_zone(&self.db, device.id, 0).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SlaveZoneConfig;
    use crate::device::DeviceDirectory;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn wired_slave(id: DeviceId, pins: &[Option<i64>]) -> SlaveConfig {
        SlaveConfig {
            id,
            name: format!("controller-{id}"),
            enabled: true,
            configured: true,
            zones: pins
                .iter()
                .enumerate()
                .map(|(i, p)| SlaveZoneConfig {
                    name: format!("zone {}", i + 1),
                    max_duration_min: 10,
                    gpio_pin: *p,
                })
                .collect(),
        }
    }

    async fn device(db: &Db, id: DeviceId) -> Device {
        db.resolve(id).await.unwrap().unwrap()
    }

    // -- simulated ----------------------------------------------------------

    #[tokio::test]
    async fn simulated_start_and_stop_report_active_zone() {
        let db = test_db().await;
        db.upsert_slave(&wired_slave(10, &[None, None])).await.unwrap();
        let drv = SimulatedDriver::new(db.clone());

        drv.start(&device(&db, 10).await, 2).await.unwrap();
        assert_eq!(device(&db, 10).await.active_zone, 2);

        drv.stop(&device(&db, 10).await).await.unwrap();
        assert_eq!(device(&db, 10).await.active_zone, 0);
    }

    #[tokio::test]
    async fn simulated_stop_is_idempotent() {
        let db = test_db().await;
        db.upsert_slave(&wired_slave(10, &[None])).await.unwrap();
        let drv = SimulatedDriver::new(db.clone());
        let d = device(&db, 10).await;

        drv.stop(&d).await.unwrap();
        drv.stop(&d).await.unwrap();
    }

    #[tokio::test]
    async fn simulated_unknown_device_is_driver_error() {
        let db = test_db().await;
        let drv = SimulatedDriver::new(db.clone());
        let ghost = Device {
            id: 99,
            name: "ghost".into(),
            enabled: true,
            configured: true,
            zones: vec![],
            active_zone: 0,
        };

        let err = drv.stop(&ghost).await.unwrap_err();
        assert_eq!(err.device, 99);
    }

    // -- relay --------------------------------------------------------------

    #[cfg(not(feature = "gpio"))]
    #[tokio::test]
    async fn relay_start_selects_zone_and_reports_it() {
        let db = test_db().await;
        let cfg = wired_slave(10, &[Some(17), Some(27)]);
        db.upsert_slave(&cfg).await.unwrap();
        let drv = RelayDriver::new(&[cfg], true, db.clone()).await.unwrap();

        drv.start(&device(&db, 10).await, 2).await.unwrap();

        assert_eq!(device(&db, 10).await.active_zone, 2);
        let boards = drv.boards.lock().unwrap();
        assert!(boards[&10].zones[&2]);
        assert!(!boards[&10].zones[&1]);
    }

    #[cfg(not(feature = "gpio"))]
    #[tokio::test]
    async fn relay_stop_releases_everything() {
        let db = test_db().await;
        let cfg = wired_slave(10, &[Some(17), Some(27)]);
        db.upsert_slave(&cfg).await.unwrap();
        let drv = RelayDriver::new(&[cfg], true, db.clone()).await.unwrap();
        let d = device(&db, 10).await;

        drv.start(&d, 1).await.unwrap();
        drv.stop(&d).await.unwrap();

        assert_eq!(device(&db, 10).await.active_zone, 0);
        assert!(drv.boards.lock().unwrap()[&10].zones.values().all(|on| !on));
    }

    #[tokio::test]
    async fn relay_without_board_fails() {
        let db = test_db().await;
        let cfg = wired_slave(10, &[None]);
        db.upsert_slave(&cfg).await.unwrap();
        let drv = RelayDriver::new(&[cfg], true, db.clone()).await.unwrap();

        let err = drv.start(&device(&db, 10).await, 1).await.unwrap_err();
        assert_eq!(err.device, 10);
        assert_eq!(device(&db, 10).await.active_zone, 0);
    }

    #[cfg(not(feature = "gpio"))]
    #[tokio::test]
    async fn relay_unwired_zone_fails_without_reporting() {
        let db = test_db().await;
        let cfg = wired_slave(10, &[Some(17), None]);
        db.upsert_slave(&cfg).await.unwrap();
        let drv = RelayDriver::new(&[cfg], true, db.clone()).await.unwrap();

        assert!(drv.start(&device(&db, 10).await, 2).await.is_err());
        assert_eq!(device(&db, 10).await.active_zone, 0);
    }

    #[cfg(not(feature = "gpio"))]
    #[tokio::test]
    async fn relay_startup_clears_stale_active_zone() {
        let db = test_db().await;
        let cfg = wired_slave(10, &[Some(17), Some(27)]);
        db.upsert_slave(&cfg).await.unwrap();
        // left over from a run that died with zone 2 open
        db.set_device_active_zone(10, 2).await.unwrap();

        let drv = RelayDriver::new(&[cfg], true, db.clone()).await.unwrap();

        assert_eq!(device(&db, 10).await.active_zone, 0);
        assert!(drv.boards.lock().unwrap()[&10].zones.values().all(|on| !on));
    }

    #[cfg(not(feature = "gpio"))]
    #[tokio::test]
    async fn master_over_restarted_relays_reconciles_idle() {
        use crate::db::MasterConfig;
        use crate::service::MasterService;
        use crate::state::SystemState;
        use std::sync::Arc;

        let db = test_db().await;
        let cfg = wired_slave(10, &[Some(17), Some(27)]);
        db.upsert_slave(&cfg).await.unwrap();
        db.upsert_master(&MasterConfig {
            id: 1,
            name: "Whole Property".into(),
            controllers: vec![10],
        })
        .await
        .unwrap();
        db.set_device_active_zone(10, 2).await.unwrap();

        let drv = RelayDriver::new(&[cfg], true, db.clone()).await.unwrap();
        let svc = MasterService::new(Arc::new(db.clone()), Arc::new(drv), SystemState::shared());
        svc.on_master_start(1, &[10]).await.unwrap();

        assert!(svc.reconcile(1).await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn relay_skips_disabled_slaves() {
        let db = test_db().await;
        let mut cfg = wired_slave(10, &[Some(17)]);
        cfg.enabled = false;
        let drv = RelayDriver::new(&[cfg], true, db).await.unwrap();
        assert!(drv.boards.lock().unwrap().is_empty());
    }
}
