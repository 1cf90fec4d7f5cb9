//! Error types shared by the catalog, activation and reconciliation paths.

use thiserror::Error;

use crate::device::DeviceId;

/// Failures surfaced by master-device operations.
///
/// Every variant leaves the master's published active state either unchanged or
/// explicitly zeroed; callers decide whether to retry.
#[derive(Debug, Error)]
pub enum MasterError {
    /// No catalog is stored for this master (never started, or already stopped).
    #[error("unknown master device {0}")]
    UnknownMaster(DeviceId),

    #[error("zone {zone} out of range for master {master} ({count} zones)")]
    ZoneOutOfRange {
        master: DeviceId,
        zone: u32,
        count: usize,
    },

    /// A slave referenced by the catalog no longer resolves.
    #[error("slave controller {0} not found (may have been deleted)")]
    SlaveNotFound(DeviceId),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// A start or stop command could not be delivered to a controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver error on controller {device}: {message}")]
pub struct DriverError {
    pub device: DeviceId,
    pub message: String,
}

impl DriverError {
    pub fn new(device: DeviceId, message: impl Into<String>) -> Self {
        Self {
            device,
            message: message.into(),
        }
    }
}

/// The device directory backend failed (as opposed to a device simply not
/// existing, which is reported as `None`).
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_out_of_range_message_names_master_and_count() {
        let err = MasterError::ZoneOutOfRange {
            master: 7,
            zone: 99,
            count: 3,
        };
        assert_eq!(
            err.to_string(),
            "zone 99 out of range for master 7 (3 zones)"
        );
    }

    #[test]
    fn driver_error_is_transparent_through_master_error() {
        let err: MasterError = DriverError::new(12, "relay board offline").into();
        assert_eq!(
            err.to_string(),
            "driver error on controller 12: relay board offline"
        );
    }

    #[test]
    fn directory_error_wraps_anyhow() {
        let err: DirectoryError = anyhow::anyhow!("database is locked").into();
        let err: MasterError = err.into();
        assert!(matches!(err, MasterError::Directory(_)));
        assert_eq!(err.to_string(), "database is locked");
    }
}
