//! Zone catalog: the ordered table mapping a master's logical zones onto
//! (controller, physical zone) pairs.
//!
//! The logical zone number is the 1-based position in the table and is never
//! stored anywhere else. Entries are appended in the order slaves were
//! configured, then in each slave's own zone order.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceDirectory, DeviceId};
use crate::error::DirectoryError;

pub const PROP_NUM_ZONES: &str = "NumZones";
pub const PROP_ZONE_NAMES: &str = "ZoneNames";
pub const PROP_MAX_DURATIONS: &str = "MaxZoneDurations";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneDescriptor {
    pub controller_id: DeviceId,
    /// 1-based zone number on the owning controller.
    pub physical_zone_id: u32,
    pub zone_name: String,
    pub max_duration_min: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneCatalog {
    master_id: DeviceId,
    entries: Vec<ZoneDescriptor>,
}

impl ZoneCatalog {
    pub fn new(master_id: DeviceId) -> Self {
        Self {
            master_id,
            entries: Vec::new(),
        }
    }

    pub fn master_id(&self) -> DeviceId {
        self.master_id
    }

    pub fn entries(&self) -> &[ZoneDescriptor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor for a 1-based logical zone.
    pub fn get(&self, logical_zone: u32) -> Option<&ZoneDescriptor> {
        let idx = usize::try_from(logical_zone).ok()?.checked_sub(1)?;
        self.entries.get(idx)
    }

    /// Append every zone of `slave`. Refuses the master itself so the table
    /// can never point back at its owner.
    pub fn push_slave(&mut self, slave: &Device) -> bool {
        if slave.id == self.master_id {
            return false;
        }
        for (idx, zone) in slave.zones.iter().enumerate() {
            let entry = ZoneDescriptor {
                controller_id: slave.id,
                physical_zone_id: idx as u32 + 1,
                zone_name: zone.name.clone(),
                max_duration_min: zone.max_duration_min,
            };
            debug!(master = self.master_id, ?entry, "adding zone to catalog");
            self.entries.push(entry);
        }
        true
    }

    /// Distinct controller ids, in order of first appearance.
    pub fn controllers(&self) -> Vec<DeviceId> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|e| e.controller_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn references(&self, controller_id: DeviceId) -> bool {
        self.entries.iter().any(|e| e.controller_id == controller_id)
    }

    /// Reverse lookup: lowest logical zone bound to `(controller_id, physical_zone)`.
    pub fn logical_zone_for(&self, controller_id: DeviceId, physical_zone: u32) -> Option<u32> {
        if physical_zone == 0 {
            return None;
        }
        self.entries
            .iter()
            .position(|e| e.controller_id == controller_id && e.physical_zone_id == physical_zone)
            .map(|idx| idx as u32 + 1)
    }

    /// Summary properties published on the master device.
    pub fn summary_props(&self) -> BTreeMap<String, String> {
        let names: Vec<&str> = self.entries.iter().map(|e| e.zone_name.as_str()).collect();
        let durations: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.max_duration_min.to_string())
            .collect();

        BTreeMap::from([
            (PROP_NUM_ZONES.to_string(), self.entries.len().to_string()),
            (PROP_ZONE_NAMES.to_string(), names.join(", ")),
            (PROP_MAX_DURATIONS.to_string(), durations.join(", ")),
        ])
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Build the catalog for `master_id` from its configured slave list.
///
/// Problems with individual slaves (deleted, disabled, unconfigured, the
/// master itself, a failing directory lookup) are logged and the slave is
/// skipped; they never abort the build.
pub async fn assemble(
    master_id: DeviceId,
    configured: &[DeviceId],
    directory: &dyn DeviceDirectory,
) -> ZoneCatalog {
    let mut catalog = ZoneCatalog::new(master_id);

    if configured.is_empty() {
        warn!(master = master_id, "no controllers configured; master is inert");
        return catalog;
    }

    for &slave_id in configured {
        let slave = match directory.resolve(slave_id).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                warn!(
                    master = master_id,
                    slave = slave_id,
                    "invalid controller (may have been deleted)"
                );
                continue;
            }
            Err(e) => {
                error!(
                    master = master_id,
                    slave = slave_id,
                    "controller lookup failed: {e}"
                );
                continue;
            }
        };

        if !slave.is_usable() {
            warn!(
                master = master_id,
                slave = slave_id,
                enabled = slave.enabled,
                configured = slave.configured,
                "controller is not enabled; skipping"
            );
            continue;
        }

        debug!(master = master_id, slave = %slave.name, "mapping slave controller");
        if !catalog.push_slave(&slave) {
            warn!(master = master_id, "circular device reference; skipping");
        }
    }

    if catalog.is_empty() {
        warn!(master = master_id, "no usable controllers; master is inert");
    } else {
        info!(
            master = master_id,
            zones = catalog.len(),
            controllers = catalog.controllers().len(),
            "zone catalog built"
        );
    }

    catalog
}

/// Write the catalog's summary properties onto the master device.
pub async fn publish_summary(
    catalog: &ZoneCatalog,
    directory: &dyn DeviceDirectory,
) -> Result<(), DirectoryError> {
    directory
        .set_properties(catalog.master_id(), &catalog.summary_props())
        .await
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{front_back_drip, slave, FakeDirectory, MASTER, SLAVE_A, SLAVE_B};

    fn describe(c: &ZoneCatalog) -> Vec<(DeviceId, u32, &str)> {
        c.entries()
            .iter()
            .map(|e| (e.controller_id, e.physical_zone_id, e.zone_name.as_str()))
            .collect()
    }

    // -- assemble -----------------------------------------------------------

    #[tokio::test]
    async fn builds_in_slave_then_zone_order() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        assert_eq!(
            describe(&c),
            vec![(SLAVE_A, 1, "Front"), (SLAVE_A, 2, "Back"), (SLAVE_B, 1, "Drip")]
        );
    }

    #[tokio::test]
    async fn configured_order_is_preserved() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_B, SLAVE_A], &*dir).await;
        assert_eq!(
            describe(&c),
            vec![(SLAVE_B, 1, "Drip"), (SLAVE_A, 1, "Front"), (SLAVE_A, 2, "Back")]
        );
    }

    #[tokio::test]
    async fn zone_count_is_sum_of_slave_zones() {
        let dir = FakeDirectory::default();
        dir.add(slave(30, &["a", "b", "c"]));
        dir.add(slave(31, &["d"]));
        dir.add(slave(32, &["e", "f"]));
        let c = assemble(MASTER, &[30, 31, 32], &dir).await;
        assert_eq!(c.len(), 6);
    }

    #[tokio::test]
    async fn empty_configuration_gives_empty_catalog() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[], &*dir).await;
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn self_reference_is_excluded() {
        let (dir, _) = front_back_drip();
        let with_self = assemble(MASTER, &[SLAVE_A, MASTER, SLAVE_B], &*dir).await;
        let without = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        assert_eq!(with_self, without);
        assert!(!with_self.references(MASTER));
    }

    #[tokio::test]
    async fn self_reference_with_zones_is_still_excluded() {
        let dir = FakeDirectory::default();
        dir.add(slave(MASTER, &["loop"]));
        let c = assemble(MASTER, &[MASTER], &dir).await;
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn deleted_slave_is_skipped() {
        let (dir, _) = front_back_drip();
        dir.delete(SLAVE_A);
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        assert_eq!(describe(&c), vec![(SLAVE_B, 1, "Drip")]);
    }

    #[tokio::test]
    async fn disabled_and_unconfigured_slaves_are_skipped() {
        let (dir, _) = front_back_drip();
        dir.update(SLAVE_A, |d| d.enabled = false);
        dir.update(SLAVE_B, |d| d.configured = false);
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn failing_lookup_skips_only_that_slave() {
        let (dir, _) = front_back_drip();
        dir.break_device(SLAVE_A);
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        assert_eq!(describe(&c), vec![(SLAVE_B, 1, "Drip")]);
    }

    #[tokio::test]
    async fn duplicate_configuration_is_not_deduplicated() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_B, SLAVE_B], &*dir).await;
        assert_eq!(c.len(), 2);
        assert_eq!(c.controllers(), vec![SLAVE_B]);
        // reverse lookup resolves to the first binding
        assert_eq!(c.logical_zone_for(SLAVE_B, 1), Some(1));
    }

    // -- lookups ------------------------------------------------------------

    #[tokio::test]
    async fn get_is_one_based() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        assert!(c.get(0).is_none());
        assert_eq!(c.get(1).unwrap().zone_name, "Front");
        assert_eq!(c.get(3).unwrap().zone_name, "Drip");
        assert!(c.get(4).is_none());
    }

    #[tokio::test]
    async fn reverse_lookup_matches_every_position() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        for (i, d) in c.entries().iter().enumerate() {
            assert_eq!(
                c.logical_zone_for(d.controller_id, d.physical_zone_id),
                Some(i as u32 + 1)
            );
        }
    }

    #[tokio::test]
    async fn reverse_lookup_misses() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        assert_eq!(c.logical_zone_for(SLAVE_A, 0), None);
        assert_eq!(c.logical_zone_for(SLAVE_A, 3), None);
        assert_eq!(c.logical_zone_for(99, 1), None);
    }

    #[tokio::test]
    async fn controllers_are_distinct_in_first_seen_order() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_B, SLAVE_A, SLAVE_B], &*dir).await;
        assert_eq!(c.controllers(), vec![SLAVE_B, SLAVE_A]);
    }

    // -- summary ------------------------------------------------------------

    #[tokio::test]
    async fn summary_props_published_on_master() {
        let (dir, _) = front_back_drip();
        let c = assemble(MASTER, &[SLAVE_A, SLAVE_B], &*dir).await;
        publish_summary(&c, &*dir).await.unwrap();

        let props = dir.props(MASTER).unwrap();
        assert_eq!(props[PROP_NUM_ZONES], "3");
        assert_eq!(props[PROP_ZONE_NAMES], "Front, Back, Drip");
        assert_eq!(props[PROP_MAX_DURATIONS], "10, 20, 10");
    }

    #[test]
    fn summary_of_empty_catalog() {
        let props = ZoneCatalog::new(MASTER).summary_props();
        assert_eq!(props[PROP_NUM_ZONES], "0");
        assert_eq!(props[PROP_ZONE_NAMES], "");
        assert_eq!(props[PROP_MAX_DURATIONS], "");
    }
}
