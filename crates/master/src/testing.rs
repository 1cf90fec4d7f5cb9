//! In-memory collaborators for unit tests: a fake device directory and a
//! driver that records every command it receives.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::device::{
    ControllerDriver, Device, DeviceDirectory, DeviceId, MasterActiveState, PhysicalZone,
    StateField,
};
use crate::error::{DirectoryError, DriverError};

pub(crate) const MASTER: DeviceId = 1;
pub(crate) const SLAVE_A: DeviceId = 10;
pub(crate) const SLAVE_B: DeviceId = 20;

// ── Fake directory ──────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceId, Device>,
    props: HashMap<DeviceId, BTreeMap<String, String>>,
    states: HashMap<DeviceId, MasterActiveState>,
    state_writes: usize,
    broken: HashSet<DeviceId>,
    fail_next_write: Option<StateField>,
}

#[derive(Default)]
pub(crate) struct FakeDirectory {
    inner: Mutex<Inner>,
}

pub(crate) fn slave(id: DeviceId, zone_names: &[&str]) -> Device {
    Device {
        id,
        name: format!("controller-{id}"),
        enabled: true,
        configured: true,
        zones: zone_names
            .iter()
            .enumerate()
            .map(|(i, n)| PhysicalZone {
                name: n.to_string(),
                max_duration_min: 10 * (i as u32 + 1),
            })
            .collect(),
        active_zone: 0,
    }
}

impl FakeDirectory {
    pub(crate) fn add(&self, device: Device) {
        self.inner.lock().unwrap().devices.insert(device.id, device);
    }

    pub(crate) fn delete(&self, id: DeviceId) {
        self.inner.lock().unwrap().devices.remove(&id);
    }

    pub(crate) fn update(&self, id: DeviceId, f: impl FnOnce(&mut Device)) {
        if let Some(d) = self.inner.lock().unwrap().devices.get_mut(&id) {
            f(d);
        }
    }

    pub(crate) fn set_active_zone(&self, id: DeviceId, zone: u32) {
        self.update(id, |d| d.active_zone = zone);
    }

    /// Make `resolve(id)` fail with a backend error.
    pub(crate) fn break_device(&self, id: DeviceId) {
        self.inner.lock().unwrap().broken.insert(id);
    }

    pub(crate) fn state(&self, id: DeviceId) -> MasterActiveState {
        self.inner
            .lock()
            .unwrap()
            .states
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn force_state(&self, id: DeviceId, state: MasterActiveState) {
        self.inner.lock().unwrap().states.insert(id, state);
    }

    pub(crate) fn props(&self, id: DeviceId) -> Option<BTreeMap<String, String>> {
        self.inner.lock().unwrap().props.get(&id).cloned()
    }

    /// Make the next `set_state` on `field` fail once.
    pub(crate) fn fail_next_state_write(&self, field: StateField) {
        self.inner.lock().unwrap().fail_next_write = Some(field);
    }

    pub(crate) fn state_writes(&self) -> usize {
        self.inner.lock().unwrap().state_writes
    }
}

#[async_trait]
impl DeviceDirectory for FakeDirectory {
    async fn resolve(&self, id: DeviceId) -> Result<Option<Device>, DirectoryError> {
        let inner = self.inner.lock().unwrap();
        if inner.broken.contains(&id) {
            return Err(anyhow::anyhow!("directory backend unavailable").into());
        }
        Ok(inner.devices.get(&id).cloned())
    }

    async fn set_properties(
        &self,
        id: DeviceId,
        props: &BTreeMap<String, String>,
    ) -> Result<(), DirectoryError> {
        self.inner.lock().unwrap().props.insert(id, props.clone());
        Ok(())
    }

    async fn set_state(
        &self,
        id: DeviceId,
        field: StateField,
        value: i64,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_write == Some(field) {
            inner.fail_next_write = None;
            return Err(anyhow::anyhow!("write of {} rejected", field.as_str()).into());
        }
        inner.state_writes += 1;
        let st = inner.states.entry(id).or_default();
        match field {
            StateField::ActiveZone => st.active_zone = value as u32,
            StateField::ActiveSlaveId => st.active_slave_id = value,
            StateField::ActiveSlaveZone => st.active_slave_zone = value as u32,
        }
        Ok(())
    }
}

// ── Recording driver ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverCall {
    Start(DeviceId, u32),
    Stop(DeviceId),
}

/// Records commands and mirrors successful ones into the fake directory, the
/// way a real slave would report its active zone afterwards.
pub(crate) struct RecordingDriver {
    directory: Arc<FakeDirectory>,
    calls: Mutex<Vec<DriverCall>>,
    failing: Mutex<HashSet<DeviceId>>,
}

impl RecordingDriver {
    pub(crate) fn new(directory: Arc<FakeDirectory>) -> Self {
        Self {
            directory,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub(crate) fn fail_on(&self, id: DeviceId) {
        self.failing.lock().unwrap().insert(id);
    }

    fn is_failing(&self, id: DeviceId) -> bool {
        self.failing.lock().unwrap().contains(&id)
    }
}

#[async_trait]
impl ControllerDriver for RecordingDriver {
    async fn start(&self, device: &Device, zone: u32) -> Result<(), DriverError> {
        self.calls
            .lock()
            .unwrap()
            .push(DriverCall::Start(device.id, zone));
        if self.is_failing(device.id) {
            return Err(DriverError::new(device.id, "no response"));
        }
        self.directory.set_active_zone(device.id, zone);
        Ok(())
    }

    async fn stop(&self, device: &Device) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(DriverCall::Stop(device.id));
        if self.is_failing(device.id) {
            return Err(DriverError::new(device.id, "no response"));
        }
        self.directory.set_active_zone(device.id, 0);
        Ok(())
    }
}

/// Slave A with "Front" and "Back", slave B with "Drip", plus the master
/// record itself.
pub(crate) fn front_back_drip() -> (Arc<FakeDirectory>, Arc<RecordingDriver>) {
    let directory = Arc::new(FakeDirectory::default());
    directory.add(slave(MASTER, &[]));
    directory.add(slave(SLAVE_A, &["Front", "Back"]));
    directory.add(slave(SLAVE_B, &["Drip"]));
    let driver = Arc::new(RecordingDriver::new(Arc::clone(&directory)));
    (directory, driver)
}

/// A service over [`front_back_drip`] with the master started on A then B.
pub(crate) async fn started() -> (
    crate::service::MasterService,
    Arc<FakeDirectory>,
    Arc<RecordingDriver>,
) {
    let (directory, driver) = front_back_drip();
    let service = crate::service::MasterService::new(
        Arc::clone(&directory) as Arc<dyn DeviceDirectory>,
        Arc::clone(&driver) as Arc<dyn ControllerDriver>,
        crate::state::SystemState::shared(),
    );
    service
        .on_master_start(MASTER, &[SLAVE_A, SLAVE_B])
        .await
        .unwrap();
    (service, directory, driver)
}
