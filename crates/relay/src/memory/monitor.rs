// Sampling loop driving the governor.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{sample_resident_bytes, GovernorHandle, PressureReport};
use crate::hub::HubHandle;
use crate::metrics;

pub fn spawn_monitor(
    governor: GovernorHandle,
    hub: HubHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if sample_once(&governor, &hub, sample_resident_bytes).is_none() {
                        debug!("resident memory unavailable on this platform");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Take one sample and forward the hub-side cleanup the tier asks for.
pub(crate) fn sample_once(
    governor: &GovernorHandle,
    hub: &HubHandle,
    sampler: impl FnOnce() -> Option<u64>,
) -> Option<PressureReport> {
    let resident_bytes = sampler()?;
    let report = governor.observe(resident_bytes);
    metrics::observe_memory(resident_bytes, report.tier, report.evicted.len());

    if report.compact && !hub.compact() {
        warn!("hub is gone, cannot compact");
    }
    if report.shed_observers > 0 {
        hub.shed_observers(report.shed_observers);
    }
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubCommand;
    use crate::memory::{PressureTier, OBSERVER_SHED_BATCH};

    const MB: u64 = 1024 * 1024;

    #[test]
    fn normal_sample_asks_nothing_of_the_hub() {
        let governor = GovernorHandle::new(100 * MB);
        let (hub, mut inbox) = HubHandle::detached();

        let report = sample_once(&governor, &hub, || Some(10 * MB)).unwrap();
        assert_eq!(report.tier, PressureTier::Normal);
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn high_sample_requests_compaction() {
        let governor = GovernorHandle::new(100 * MB);
        let (hub, mut inbox) = HubHandle::detached();

        sample_once(&governor, &hub, || Some(92 * MB));
        assert!(matches!(inbox.try_recv(), Ok(HubCommand::Compact)));
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn critical_sample_compacts_and_sheds() {
        let governor = GovernorHandle::new(100 * MB);
        let (hub, mut inbox) = HubHandle::detached();

        sample_once(&governor, &hub, || Some(99 * MB));
        assert!(matches!(inbox.try_recv(), Ok(HubCommand::Compact)));
        assert!(matches!(
            inbox.try_recv(),
            Ok(HubCommand::ShedObservers { limit }) if limit == OBSERVER_SHED_BATCH
        ));
    }

    #[test]
    fn missing_sample_is_skipped() {
        let governor = GovernorHandle::new(100 * MB);
        let (hub, _inbox) = HubHandle::detached();
        assert!(sample_once(&governor, &hub, || None).is_none());
        assert!(governor.last_sample().is_none());
    }
}
