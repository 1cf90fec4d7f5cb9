//! Periodic status reconciliation over every started master.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::service::MasterService;

/// Reconcile every started master once. Returns how many failed.
pub async fn poll_once(service: &MasterService) -> usize {
    let masters = service.master_ids().await;
    let failures = service.reconcile_all(&masters).await;
    for (master, e) in &failures {
        warn!(master, "poll reconcile failed: {e}");
    }
    debug!(masters = masters.len(), failed = failures.len(), "poll pass done");
    failures.len()
}

pub async fn run(service: Arc<MasterService>, every: Duration) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately; startup already reconciled
    tick.tick().await;
    loop {
        tick.tick().await;
        poll_once(&service).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MasterActiveState;
    use crate::testing::{started, MASTER, SLAVE_A, SLAVE_B};

    #[tokio::test]
    async fn poll_picks_up_slave_changes() {
        let (svc, dir, drv) = started().await;
        dir.set_active_zone(SLAVE_A, 2);

        assert_eq!(poll_once(&svc).await, 0);

        assert_eq!(dir.state(MASTER), MasterActiveState::running(2, SLAVE_A, 2));
        assert!(drv.calls().is_empty());
    }

    #[tokio::test]
    async fn poll_counts_failures() {
        let (svc, dir, _drv) = started().await;
        dir.break_device(SLAVE_B);
        assert_eq!(poll_once(&svc).await, 1);
    }

    #[tokio::test]
    async fn poll_with_no_masters_does_nothing() {
        let (svc, dir, _drv) = started().await;
        svc.on_master_stop(MASTER).await;
        let writes = dir.state_writes();

        assert_eq!(poll_once(&svc).await, 0);
        assert_eq!(dir.state_writes(), writes);
    }
}
