//! Per-client, per-event sliding window rate limiter.
//!
//! Each `(client identity, event type)` pair gets an independent bucket
//! holding the admit timestamps inside the rule's window plus a one-second
//! burst window. Crossing either ceiling blocks the bucket for the rule's
//! block duration; events arriving while blocked are dropped. Once the
//! block expires the bucket starts from an empty window.
//!
//! The limiter is owned by the hub task, so it needs no interior locking.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Width of the burst sub-window.
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Idle buckets older than this are purged.
const BUCKET_TTL: Duration = Duration::from_secs(300);

/// Minimum interval between purge sweeps.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Admission policy for one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    /// Admits allowed inside `window`.
    pub max_events: u32,
    pub window: Duration,
    /// Admits allowed inside [`BURST_WINDOW`].
    pub burst: u32,
    /// How long a bucket stays blocked after tripping.
    pub block: Duration,
}

impl RateRule {
    pub const fn new(max_events: u32, window_secs: u64, burst: u32, block_secs: u64) -> Self {
        Self {
            max_events,
            window: Duration::from_secs(window_secs),
            burst,
            block: Duration::from_secs(block_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateRuleFile {
    max_events: u32,
    window_secs: u64,
    burst: u32,
    block_secs: u64,
}

impl From<RateRuleFile> for RateRule {
    fn from(file: RateRuleFile) -> Self {
        RateRule::new(file.max_events, file.window_secs, file.burst, file.block_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateTableFile {
    default: Option<RateRuleFile>,
    #[serde(default)]
    events: HashMap<String, RateRuleFile>,
}

/// Rules keyed by event type, with a fallback for unlisted types.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    default: RateRule,
    events: HashMap<String, RateRule>,
}

impl Default for RateTable {
    fn default() -> Self {
        let events = [
            ("join-session", RateRule::new(10, 60, 3, 30)),
            ("drawing-data", RateRule::new(1_200, 10, 200, 5)),
            ("chat-message", RateRule::new(30, 60, 5, 10)),
            ("webrtc-signal", RateRule::new(300, 10, 60, 5)),
            ("canvas-state", RateRule::new(10, 60, 2, 30)),
        ]
        .into_iter()
        .map(|(event, rule)| (event.to_string(), rule))
        .collect();

        Self { default: RateRule::new(200, 10, 50, 5), events }
    }
}

impl RateTable {
    /// Parse a TOML rate table. Listed events override the defaults;
    /// unlisted events keep theirs.
    ///
    /// ```toml
    /// [default]
    /// max_events = 200
    /// window_secs = 10
    /// burst = 50
    /// block_secs = 5
    ///
    /// [events.drawing-data]
    /// max_events = 600
    /// window_secs = 10
    /// burst = 100
    /// block_secs = 5
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let file: RateTableFile = toml::from_str(raw)?;
        let mut table = Self::default();
        if let Some(default) = file.default {
            table.default = default.into();
        }
        for (event, rule) in file.events {
            table.events.insert(event, rule.into());
        }
        Ok(table)
    }

    pub fn with_rule(mut self, event: impl Into<String>, rule: RateRule) -> Self {
        self.events.insert(event.into(), rule);
        self
    }

    pub fn rule_for(&self, event: &str) -> RateRule {
        self.events.get(event).copied().unwrap_or(self.default)
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Dropped. `newly_blocked` is true only for the event that tripped
    /// the block, so callers can log once per block.
    Limited { newly_blocked: bool, retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    client: String,
    event: String,
}

#[derive(Debug)]
struct Bucket {
    admitted: VecDeque<Instant>,
    burst: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self { admitted: VecDeque::new(), burst: VecDeque::new(), blocked_until: None, last_seen: now }
    }
}

pub struct RateLimiter {
    table: RateTable,
    buckets: HashMap<BucketKey, Bucket>,
    last_purge: Instant,
}

impl RateLimiter {
    pub fn new(table: RateTable) -> Self {
        Self { table, buckets: HashMap::new(), last_purge: Instant::now() }
    }

    pub fn check(&mut self, client: &str, event: &str) -> Admission {
        self.check_at(client, event, Instant::now())
    }

    /// Like `check` but with a specific timestamp (for testing).
    pub(crate) fn check_at(&mut self, client: &str, event: &str, now: Instant) -> Admission {
        if now.saturating_duration_since(self.last_purge) >= PURGE_INTERVAL {
            self.purge_stale_at(now);
        }

        let rule = self.table.rule_for(event);
        let key = BucketKey { client: client.to_string(), event: event.to_string() };
        let bucket = self.buckets.entry(key).or_insert_with(|| Bucket::new(now));
        bucket.last_seen = now;

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return Admission::Limited { newly_blocked: false, retry_after: until - now };
            }
            bucket.blocked_until = None;
            bucket.admitted.clear();
            bucket.burst.clear();
        }

        prune_older_than(&mut bucket.admitted, now, rule.window);
        prune_older_than(&mut bucket.burst, now, BURST_WINDOW);

        if bucket.admitted.len() >= rule.max_events as usize
            || bucket.burst.len() >= rule.burst as usize
        {
            bucket.blocked_until = Some(now + rule.block);
            return Admission::Limited { newly_blocked: true, retry_after: rule.block };
        }

        bucket.admitted.push_back(now);
        bucket.burst.push_back(now);
        Admission::Admitted
    }

    /// Drop buckets that have been idle for longer than the TTL.
    pub fn purge_stale(&mut self) -> usize {
        self.purge_stale_at(Instant::now())
    }

    pub(crate) fn purge_stale_at(&mut self, now: Instant) -> usize {
        self.last_purge = now;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let blocked = bucket.blocked_until.is_some_and(|until| until > now);
            blocked || now.saturating_duration_since(bucket.last_seen) < BUCKET_TTL
        });
        before - self.buckets.len()
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn blocked_buckets(&self) -> usize {
        let now = Instant::now();
        self.buckets
            .values()
            .filter(|bucket| bucket.blocked_until.is_some_and(|until| until > now))
            .count()
    }
}

fn prune_older_than(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

/// Stable pre-authentication identity for a transport client: a hash of
/// the peer address and the declared client string. Never the user id.
pub fn client_identity(addr: IpAddr, client: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(addr.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(client.as_bytes());
    let digest = hasher.finalize();
    digest[..12].iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn limiter_with(rule: RateRule) -> RateLimiter {
        RateLimiter::new(RateTable::default().with_rule("test", rule))
    }

    #[test]
    fn burst_limit_admits_exactly_then_blocks_then_resumes() {
        let rule = RateRule::new(100, 10, 3, 5);
        let mut limiter = limiter_with(rule);
        let start = Instant::now();

        for i in 0..3 {
            let at = start + Duration::from_millis(i * 100);
            assert_eq!(limiter.check_at("c1", "test", at), Admission::Admitted);
        }

        let tripped = limiter.check_at("c1", "test", start + Duration::from_millis(400));
        assert_eq!(
            tripped,
            Admission::Limited { newly_blocked: true, retry_after: Duration::from_secs(5) }
        );

        let during = limiter.check_at("c1", "test", start + Duration::from_secs(2));
        assert!(matches!(during, Admission::Limited { newly_blocked: false, .. }));

        let after = start + Duration::from_millis(400) + Duration::from_secs(5);
        assert_eq!(limiter.check_at("c1", "test", after), Admission::Admitted);
    }

    #[test]
    fn window_limit_blocks_even_when_spread_out() {
        let rule = RateRule::new(4, 10, 100, 3);
        let mut limiter = limiter_with(rule);
        let start = Instant::now();

        for i in 0..4 {
            let at = start + Duration::from_secs(i * 2);
            assert!(limiter.check_at("c1", "test", at).is_admitted());
        }
        assert!(!limiter.check_at("c1", "test", start + Duration::from_secs(8)).is_admitted());
    }

    #[test]
    fn window_slides_forward() {
        let rule = RateRule::new(2, 10, 100, 1);
        let mut limiter = limiter_with(rule);
        let start = Instant::now();

        assert!(limiter.check_at("c1", "test", start).is_admitted());
        assert!(limiter.check_at("c1", "test", start + Duration::from_secs(6)).is_admitted());
        // The first admit has left the window by now.
        assert!(limiter.check_at("c1", "test", start + Duration::from_secs(11)).is_admitted());
    }

    #[test]
    fn buckets_are_independent_per_client_and_event() {
        let rule = RateRule::new(100, 10, 1, 5);
        let mut limiter = RateLimiter::new(
            RateTable::default().with_rule("a", rule).with_rule("b", rule),
        );
        let now = Instant::now();

        assert!(limiter.check_at("c1", "a", now).is_admitted());
        assert!(!limiter.check_at("c1", "a", now).is_admitted());
        assert!(limiter.check_at("c1", "b", now).is_admitted());
        assert!(limiter.check_at("c2", "a", now).is_admitted());
        assert_eq!(limiter.tracked_buckets(), 3);
    }

    #[test]
    fn stale_buckets_are_purged_but_blocked_ones_survive() {
        let mut limiter = limiter_with(RateRule::new(100, 10, 1, 600));
        let now = Instant::now();

        assert!(limiter.check_at("idle", "test", now).is_admitted());
        assert!(limiter.check_at("noisy", "test", now).is_admitted());
        assert!(!limiter.check_at("noisy", "test", now).is_admitted());

        let removed = limiter.purge_stale_at(now + BUCKET_TTL + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_buckets(), 1);
    }

    #[test]
    fn unlisted_events_use_default_rule() {
        let table = RateTable::default();
        assert_eq!(table.rule_for("something-else"), RateRule::new(200, 10, 50, 5));
        assert_eq!(table.rule_for("join-session").burst, 3);
    }

    #[test]
    fn toml_table_overrides_listed_events_only() {
        let raw = r#"
            [default]
            max_events = 20
            window_secs = 5
            burst = 4
            block_secs = 2

            [events.drawing-data]
            max_events = 600
            window_secs = 10
            burst = 100
            block_secs = 5
        "#;
        let table = RateTable::from_toml_str(raw).expect("table should parse");
        assert_eq!(table.rule_for("unknown"), RateRule::new(20, 5, 4, 2));
        assert_eq!(table.rule_for("drawing-data"), RateRule::new(600, 10, 100, 5));
        assert_eq!(table.rule_for("chat-message"), RateRule::new(30, 60, 5, 10));
    }

    #[test]
    fn toml_table_rejects_unknown_keys() {
        let raw = "[default]\nmax_events = 1\nwindow_secs = 1\nburst = 1\nblock_secs = 1\nextra = 2\n";
        assert!(RateTable::from_toml_str(raw).is_err());
    }

    #[test]
    fn client_identity_is_stable_and_address_sensitive() {
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let a = client_identity(local, "Mozilla/5.0");
        assert_eq!(a, client_identity(local, "Mozilla/5.0"));
        assert_ne!(a, client_identity(other, "Mozilla/5.0"));
        assert_ne!(a, client_identity(local, "curl/8.0"));
        assert_eq!(a.len(), 24);
    }
}
