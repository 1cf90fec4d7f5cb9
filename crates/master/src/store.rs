//! Zone map store: one catalog per started master device, plus the per-master
//! lock that serializes everything done to that master.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::catalog::ZoneCatalog;
use crate::device::DeviceId;

#[derive(Default)]
pub struct ZoneMapStore {
    catalogs: RwLock<HashMap<DeviceId, Arc<ZoneCatalog>>>,
    locks: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
}

impl ZoneMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `catalog` under its master id, replacing (and returning) any
    /// previous one. Readers see either the old or the new catalog in full.
    pub async fn put(&self, catalog: ZoneCatalog) -> Option<Arc<ZoneCatalog>> {
        let id = catalog.master_id();
        self.catalogs.write().await.insert(id, Arc::new(catalog))
    }

    /// Drop the catalog for `id`. Safe to call when nothing is stored.
    pub async fn remove(&self, id: DeviceId) -> Option<Arc<ZoneCatalog>> {
        self.catalogs.write().await.remove(&id)
    }

    pub async fn get(&self, id: DeviceId) -> Option<Arc<ZoneCatalog>> {
        self.catalogs.read().await.get(&id).cloned()
    }

    /// Ids of every master with a stored catalog, sorted.
    pub async fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.catalogs.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Masters whose catalog binds at least one zone of `controller_id`.
    pub async fn masters_referencing(&self, controller_id: DeviceId) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .catalogs
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.references(controller_id))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Acquire the serialization lock for one master. Held for the whole of an
    /// activation, deactivation, reconciliation, start or stop.
    ///
    /// Locks of masters without a catalog are dropped once nobody holds or
    /// waits on them, so ids that never start do not accumulate.
    pub async fn lock(&self, id: DeviceId) -> OwnedMutexGuard<()> {
        let lock = {
            let catalogs = self.catalogs.read().await;
            let mut locks = self.locks.lock().await;
            locks.retain(|k, l| *k == id || catalogs.contains_key(k) || Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn lock_entries(&self) -> usize {
        self.locks.lock().await.len()
    }
}
