//! Device records and the two collaborator seams the master core talks to:
//! the [`DeviceDirectory`] (registry + persisted state) and the
//! [`ControllerDriver`] (physical start/stop commands).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DriverError};

pub type DeviceId = i64;

// ---------------------------------------------------------------------------
// Device records
// ---------------------------------------------------------------------------

/// One zone as reported by a physical controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalZone {
    pub name: String,
    pub max_duration_min: u32,
}

/// Snapshot of a device as the directory knows it right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub enabled: bool,
    pub configured: bool,
    /// Physical zones in controller order; zone `n` lives at index `n - 1`.
    pub zones: Vec<PhysicalZone>,
    /// Currently running physical zone, 0 when idle.
    pub active_zone: u32,
}

impl Device {
    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn is_usable(&self) -> bool {
        self.enabled && self.configured
    }

    pub fn is_active(&self) -> bool {
        self.active_zone != 0
    }
}

// ---------------------------------------------------------------------------
// Master active state
// ---------------------------------------------------------------------------

/// What a master device reports as running.
///
/// Zero in every field means idle. `active_zone == 0` with non-zero slave
/// fields is the observable "physical zone running with no logical mapping"
/// case produced by reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterActiveState {
    pub active_zone: u32,
    pub active_slave_id: DeviceId,
    pub active_slave_zone: u32,
}

impl MasterActiveState {
    pub const IDLE: Self = Self {
        active_zone: 0,
        active_slave_id: 0,
        active_slave_zone: 0,
    };

    pub fn running(active_zone: u32, active_slave_id: DeviceId, active_slave_zone: u32) -> Self {
        Self {
            active_zone,
            active_slave_id,
            active_slave_zone,
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::IDLE
    }
}

/// Individually addressable fields of [`MasterActiveState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    ActiveZone,
    ActiveSlaveId,
    ActiveSlaveZone,
}

impl StateField {
    pub fn as_str(self) -> &'static str {
        match self {
            StateField::ActiveZone => "activeZone",
            StateField::ActiveSlaveId => "activeSlaveId",
            StateField::ActiveSlaveZone => "activeSlaveZone",
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Registry of devices plus their persisted properties and state.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Look up a device. `Ok(None)` means the device does not exist (deleted).
    async fn resolve(&self, id: DeviceId) -> Result<Option<Device>, DirectoryError>;

    /// Replace the summary properties stored on a device.
    async fn set_properties(
        &self,
        id: DeviceId,
        props: &BTreeMap<String, String>,
    ) -> Result<(), DirectoryError>;

    async fn set_state(
        &self,
        id: DeviceId,
        field: StateField,
        value: i64,
    ) -> Result<(), DirectoryError>;

    /// Write all three active-state fields. Backends that can do this
    /// atomically should override it.
    ///
    /// The default writes field by field. If a write fails after an earlier
    /// one landed, every field is zeroed (best effort) so the master never
    /// reports a half-written state.
    async fn set_active_state(
        &self,
        id: DeviceId,
        state: MasterActiveState,
    ) -> Result<(), DirectoryError> {
        let writes = [
            (StateField::ActiveZone, i64::from(state.active_zone)),
            (StateField::ActiveSlaveId, state.active_slave_id),
            (StateField::ActiveSlaveZone, i64::from(state.active_slave_zone)),
        ];

        for (done, (field, value)) in writes.iter().enumerate() {
            if let Err(e) = self.set_state(id, *field, *value).await {
                if done > 0 {
                    for (field, _) in &writes {
                        let _ = self.set_state(id, *field, 0).await;
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Sends commands to a physical controller.
#[async_trait]
pub trait ControllerDriver: Send + Sync {
    /// Start `zone` (1-based) on the controller.
    async fn start(&self, device: &Device, zone: u32) -> Result<(), DriverError>;

    /// Stop whatever the controller is running. Must succeed on an idle
    /// controller.
    async fn stop(&self, device: &Device) -> Result<(), DriverError>;
}
