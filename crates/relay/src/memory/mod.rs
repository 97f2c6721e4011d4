// Memory-pressure governance.
//
// Components register long-lived resources with a release callback and
// touch them on access. The governor compares sampled resident memory with
// the configured ceiling; each pressure tier evicts resources idle for
// longer than a progressively shorter window.

pub mod monitor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

pub const ELEVATED_RATIO: f64 = 0.80;
pub const HIGH_RATIO: f64 = 0.90;
pub const CRITICAL_RATIO: f64 = 0.95;

/// Observers disconnected per critical-tier pass.
pub const OBSERVER_SHED_BATCH: usize = 10;

pub type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureTier {
    Normal,
    Elevated,
    High,
    Critical,
}

impl PressureTier {
    pub fn from_usage(resident_bytes: u64, ceiling_bytes: u64) -> Self {
        if ceiling_bytes == 0 {
            return Self::Normal;
        }
        let ratio = resident_bytes as f64 / ceiling_bytes as f64;
        if ratio >= CRITICAL_RATIO {
            Self::Critical
        } else if ratio >= HIGH_RATIO {
            Self::High
        } else if ratio >= ELEVATED_RATIO {
            Self::Elevated
        } else {
            Self::Normal
        }
    }

    /// Resources idle for longer than this are evicted at this tier.
    pub fn staleness(self) -> Option<Duration> {
        match self {
            Self::Normal => None,
            Self::Elevated => Some(Duration::from_secs(60 * 60)),
            Self::High => Some(Duration::from_secs(30 * 60)),
            Self::Critical => Some(Duration::from_secs(10 * 60)),
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

/// What the rest of the relay should do after a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PressureReport {
    pub tier: PressureTier,
    pub evicted: Vec<String>,
    /// Shrink in-memory buffers (tier 2 and above).
    pub compact: bool,
    /// Observers to disconnect (tier 3).
    pub shed_observers: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySample {
    pub resident_bytes: u64,
    pub ceiling_bytes: u64,
    pub tier: PressureTier,
    pub sampled_at: DateTime<Utc>,
}

struct ManagedResource {
    last_touched: Instant,
    release: ReleaseFn,
}

/// Resource registry plus tier bookkeeping. Release callbacks are handed
/// back to the caller instead of being run here, so they never execute
/// under the registry lock.
pub struct MemoryGovernor {
    ceiling_bytes: u64,
    resources: HashMap<String, ManagedResource>,
    last_sample: Option<MemorySample>,
}

impl MemoryGovernor {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self { ceiling_bytes, resources: HashMap::new(), last_sample: None }
    }

    /// Returns false when `id` was already registered; the original
    /// callback is kept and the resource is touched.
    pub fn register(&mut self, id: impl Into<String>, release: ReleaseFn) -> bool {
        let id = id.into();
        let now = Instant::now();
        match self.resources.get_mut(&id) {
            Some(existing) => {
                existing.last_touched = now;
                false
            }
            None => {
                self.resources.insert(id, ManagedResource { last_touched: now, release });
                true
            }
        }
    }

    pub fn touch(&mut self, id: &str) -> bool {
        self.touch_at(id, Instant::now())
    }

    fn touch_at(&mut self, id: &str, now: Instant) -> bool {
        match self.resources.get_mut(id) {
            Some(resource) => {
                resource.last_touched = now;
                true
            }
            None => false,
        }
    }

    fn take(&mut self, id: &str) -> Option<ReleaseFn> {
        self.resources.remove(id).map(|resource| resource.release)
    }

    fn take_stale(&mut self, max_idle: Duration, now: Instant) -> Vec<(String, ReleaseFn)> {
        let stale = self
            .resources
            .iter()
            .filter(|(_, resource)| now.saturating_duration_since(resource.last_touched) > max_idle)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        stale
            .into_iter()
            .filter_map(|id| self.resources.remove(&id).map(|resource| (id, resource.release)))
            .collect()
    }

    fn take_all(&mut self) -> Vec<(String, ReleaseFn)> {
        self.resources.drain().map(|(id, resource)| (id, resource.release)).collect()
    }

    fn record_sample(&mut self, resident_bytes: u64) -> PressureTier {
        let tier = PressureTier::from_usage(resident_bytes, self.ceiling_bytes);
        self.last_sample = Some(MemorySample {
            resident_bytes,
            ceiling_bytes: self.ceiling_bytes,
            tier,
            sampled_at: Utc::now(),
        });
        tier
    }

    pub fn registered(&self) -> usize {
        self.resources.len()
    }

    pub fn last_sample(&self) -> Option<MemorySample> {
        self.last_sample
    }
}

/// Cloneable handle around the governor shared by the hub, the store and
/// the monitor task.
#[derive(Clone)]
pub struct GovernorHandle {
    inner: Arc<Mutex<MemoryGovernor>>,
}

impl GovernorHandle {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryGovernor::new(ceiling_bytes))) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryGovernor> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, id: impl Into<String>, release: impl FnOnce() + Send + 'static) -> bool {
        self.lock().register(id, Box::new(release))
    }

    pub fn touch(&self, id: &str) -> bool {
        self.lock().touch(id)
    }

    /// Run the release callback for `id`. Idempotent: the callback runs at
    /// most once no matter how often this is called.
    pub fn unregister(&self, id: &str) -> bool {
        let release = self.lock().take(id);
        match release {
            Some(release) => {
                release();
                true
            }
            None => false,
        }
    }

    /// Feed one memory sample and run the cleanup for its tier.
    pub fn observe(&self, resident_bytes: u64) -> PressureReport {
        self.observe_at(resident_bytes, Instant::now())
    }

    pub(crate) fn observe_at(&self, resident_bytes: u64, now: Instant) -> PressureReport {
        let (tier, released) = {
            let mut governor = self.lock();
            let tier = governor.record_sample(resident_bytes);
            let released = match tier.staleness() {
                Some(max_idle) => governor.take_stale(max_idle, now),
                None => Vec::new(),
            };
            (tier, released)
        };

        if tier > PressureTier::Normal {
            warn!(
                tier = ?tier,
                resident_bytes,
                evicting = released.len(),
                "memory pressure threshold crossed"
            );
        }

        let evicted = run_releases(released);
        PressureReport {
            tier,
            evicted,
            compact: tier >= PressureTier::High,
            shed_observers: if tier == PressureTier::Critical { OBSERVER_SHED_BATCH } else { 0 },
        }
    }

    /// Release every registered resource (shutdown).
    pub fn release_all(&self) -> usize {
        let released = self.lock().take_all();
        run_releases(released).len()
    }

    pub fn registered(&self) -> usize {
        self.lock().registered()
    }

    pub fn last_sample(&self) -> Option<MemorySample> {
        self.lock().last_sample()
    }

    #[cfg(test)]
    pub(crate) fn touch_at(&self, id: &str, now: Instant) -> bool {
        self.lock().touch_at(id, now)
    }
}

fn run_releases(released: Vec<(String, ReleaseFn)>) -> Vec<String> {
    released
        .into_iter()
        .map(|(id, release)| {
            debug!(resource = %id, "releasing managed resource");
            release();
            id
        })
        .collect()
}

/// Resident set size of this process, from `/proc/self/status`.
pub fn sample_resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kibibytes = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kibibytes.saturating_mul(1024))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const MB: u64 = 1024 * 1024;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn tiers_follow_thresholds() {
        assert_eq!(PressureTier::from_usage(79 * MB, 100 * MB), PressureTier::Normal);
        assert_eq!(PressureTier::from_usage(80 * MB, 100 * MB), PressureTier::Elevated);
        assert_eq!(PressureTier::from_usage(91 * MB, 100 * MB), PressureTier::High);
        assert_eq!(PressureTier::from_usage(95 * MB, 100 * MB), PressureTier::Critical);
        assert_eq!(PressureTier::from_usage(95 * MB, 0), PressureTier::Normal);
    }

    #[test]
    fn staleness_shrinks_with_severity() {
        assert_eq!(PressureTier::Normal.staleness(), None);
        assert!(PressureTier::Elevated.staleness() > PressureTier::High.staleness());
        assert!(PressureTier::High.staleness() > PressureTier::Critical.staleness());
        assert_eq!(PressureTier::Critical.staleness(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn unregister_releases_exactly_once() {
        let governor = GovernorHandle::new(100 * MB);
        let (count, release) = counter();
        assert!(governor.register("user:u1", release));

        assert!(governor.unregister("user:u1"));
        assert!(!governor.unregister("user:u1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(governor.registered(), 0);
    }

    #[test]
    fn duplicate_register_keeps_original_callback() {
        let governor = GovernorHandle::new(100 * MB);
        let (first, first_release) = counter();
        let (second, second_release) = counter();
        assert!(governor.register("canvas:main", first_release));
        assert!(!governor.register("canvas:main", second_release));

        governor.unregister("canvas:main");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn normal_pressure_evicts_nothing() {
        let governor = GovernorHandle::new(100 * MB);
        let (count, release) = counter();
        governor.register("user:u1", release);

        let later = Instant::now() + Duration::from_secs(10 * 60 * 60);
        let report = governor.observe_at(10 * MB, later);
        assert_eq!(report.tier, PressureTier::Normal);
        assert!(report.evicted.is_empty());
        assert!(!report.compact);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn elevated_pressure_evicts_only_hour_old_resources() {
        let governor = GovernorHandle::new(100 * MB);
        let now = Instant::now();
        let (old_count, old_release) = counter();
        let (fresh_count, fresh_release) = counter();
        governor.register("old", old_release);
        governor.register("fresh", fresh_release);
        governor.touch_at("fresh", now + Duration::from_secs(50 * 60));

        let report = governor.observe_at(85 * MB, now + Duration::from_secs(61 * 60));
        assert_eq!(report.tier, PressureTier::Elevated);
        assert_eq!(report.evicted, vec!["old".to_string()]);
        assert_eq!(old_count.load(Ordering::SeqCst), 1);
        assert_eq!(fresh_count.load(Ordering::SeqCst), 0);
        assert_eq!(report.shed_observers, 0);
    }

    #[test]
    fn critical_pressure_compacts_and_sheds_observers() {
        let governor = GovernorHandle::new(100 * MB);
        let now = Instant::now();
        let (count, release) = counter();
        governor.register("idle", release);

        let report = governor.observe_at(97 * MB, now + Duration::from_secs(11 * 60));
        assert_eq!(report.tier, PressureTier::Critical);
        assert!(report.compact);
        assert_eq!(report.shed_observers, OBSERVER_SHED_BATCH);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(governor.last_sample().map(|s| s.tier), Some(PressureTier::Critical));
    }

    #[test]
    fn release_all_empties_registry() {
        let governor = GovernorHandle::new(100 * MB);
        let (a, release_a) = counter();
        let (b, release_b) = counter();
        governor.register("a", release_a);
        governor.register("b", release_b);

        assert_eq!(governor.release_all(), 2);
        assert_eq!(governor.registered(), 0);
        assert_eq!(a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_callbacks_may_reenter_the_governor() {
        let governor = GovernorHandle::new(100 * MB);
        let reentrant = governor.clone();
        governor.register("outer", move || {
            reentrant.register("inner", || {});
        });

        assert!(governor.unregister("outer"));
        assert_eq!(governor.registered(), 1);
    }

    #[test]
    fn vm_rss_is_parsed_in_bytes() {
        let status = "Name:\tcanvasync\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }
}
