//! Adaptive ratchet scheduling.
//!
//! A time-stamped queue of recent message arrivals (60-second window) is
//! sampled every 10 seconds (or on demand) into a messages-per-second rate,
//! classified into a load class, and published as a [`RatchetConfig`]
//! snapshot. Sessions read the snapshot; the sampler never touches session
//! state.
//!
//! Heavier load widens the DH-ratchet cadence: rotating every handful of
//! messages is affordable at 2 msg/s and ruinous at 500.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

/// How far back arrivals are retained.
fn sample_window() -> Duration {
    Duration::seconds(60)
}

/// Minimum interval between reclassifications.
fn refresh_interval() -> Duration {
    Duration::seconds(10)
}

/// Tuning knobs for ratchet cadence within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetConfig {
    /// Trigger a sending DH ratchet every N messages (0 disables).
    pub dh_ratchet_every_n: u32,
    /// Paranoid mode: DH ratchet before every single message.
    pub enable_per_message_ratchet: bool,
    /// Ratchet the sending side as soon as a new peer DH key was consumed.
    pub ratchet_on_new_dh_key: bool,
    /// A chain older than this must rotate regardless of traffic.
    pub max_chain_age: Duration,
    /// Absolute message-count ceiling for one chain.
    pub max_messages_without_ratchet: u32,
}

impl RatchetConfig {
    /// The cadence the given load class calls for.
    pub fn for_class(class: LoadClass) -> Self {
        let (every_n, age_minutes, max_messages) = match class {
            LoadClass::Light => (5, 30, 100),
            LoadClass::Moderate => (10, 45, 200),
            LoadClass::Heavy => (25, 60, 500),
            LoadClass::Extreme => (50, 120, 1000),
        };
        Self {
            dh_ratchet_every_n: every_n,
            enable_per_message_ratchet: false,
            ratchet_on_new_dh_key: true,
            max_chain_age: Duration::minutes(age_minutes),
            max_messages_without_ratchet: max_messages,
        }
    }

    /// Decide whether the sending side must DH-ratchet before the next
    /// message. `index` is the number of messages already sent in the
    /// current chain.
    pub fn should_ratchet(
        &self,
        index: u32,
        last_ratchet_at: DateTime<Utc>,
        received_new_dh_key: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if self.enable_per_message_ratchet {
            return true;
        }
        if received_new_dh_key && self.ratchet_on_new_dh_key {
            return true;
        }
        if index > 0 && self.dh_ratchet_every_n > 0 && index % self.dh_ratchet_every_n == 0 {
            return true;
        }
        if now - last_ratchet_at > self.max_chain_age {
            return true;
        }
        index >= self.max_messages_without_ratchet
    }
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self::for_class(LoadClass::Light)
    }
}

/// Message-rate classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadClass {
    /// < 10 msg/s
    Light,
    /// 10–50 msg/s
    Moderate,
    /// 50–200 msg/s
    Heavy,
    /// ≥ 200 msg/s
    Extreme,
}

impl LoadClass {
    pub fn classify(rate_per_sec: f64) -> Self {
        if rate_per_sec >= 200.0 {
            LoadClass::Extreme
        } else if rate_per_sec >= 50.0 {
            LoadClass::Heavy
        } else if rate_per_sec >= 10.0 {
            LoadClass::Moderate
        } else {
            LoadClass::Light
        }
    }
}

struct PolicySnapshot {
    class: LoadClass,
    config: RatchetConfig,
}

/// Message-rate sampler with an atomically published config snapshot.
///
/// `record_arrival` only touches the arrival queue; `maybe_refresh`
/// reclassifies at most once per [`refresh_interval`]. Readers take the
/// snapshot lock briefly and never block on the queue.
pub struct AdaptivePolicy {
    arrivals: Mutex<VecDeque<DateTime<Utc>>>,
    snapshot: RwLock<PolicySnapshot>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl AdaptivePolicy {
    pub fn new() -> Self {
        Self {
            arrivals: Mutex::new(VecDeque::new()),
            snapshot: RwLock::new(PolicySnapshot {
                class: LoadClass::Light,
                config: RatchetConfig::default(),
            }),
            last_refresh: Mutex::new(None),
        }
    }

    /// Record one message arrival at `now`.
    pub fn record_arrival(&self, now: DateTime<Utc>) {
        let mut arrivals = self.arrivals.lock();
        arrivals.push_back(now);
        let cutoff = now - sample_window();
        while arrivals.front().is_some_and(|t| *t < cutoff) {
            arrivals.pop_front();
        }
    }

    /// Reclassify if the refresh interval elapsed.
    pub fn maybe_refresh(&self, now: DateTime<Utc>) {
        let due = {
            let last = self.last_refresh.lock();
            match *last {
                Some(t) => now - t >= refresh_interval(),
                None => true,
            }
        };
        if due {
            self.refresh(now);
        }
    }

    /// Reclassify immediately and publish the new snapshot.
    pub fn refresh(&self, now: DateTime<Utc>) {
        let rate = {
            let mut arrivals = self.arrivals.lock();
            let cutoff = now - sample_window();
            while arrivals.front().is_some_and(|t| *t < cutoff) {
                arrivals.pop_front();
            }
            match arrivals.front() {
                None => 0.0,
                Some(oldest) => {
                    // Rate over the observed span, clamped to at least one
                    // second so a burst classifies promptly.
                    let span_ms = (now - *oldest).num_milliseconds().max(1000);
                    arrivals.len() as f64 * 1000.0 / span_ms as f64
                }
            }
        };
        let class = LoadClass::classify(rate);
        let mut snapshot = self.snapshot.write();
        if snapshot.class != class {
            tracing::info!(?class, rate, "message load reclassified");
            snapshot.config = RatchetConfig::for_class(class);
            snapshot.class = class;
        }
        *self.last_refresh.lock() = Some(now);
    }

    pub fn current_config(&self) -> RatchetConfig {
        self.snapshot.read().config
    }

    pub fn load_class(&self) -> LoadClass {
        self.snapshot.read().class
    }
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(LoadClass::classify(0.0), LoadClass::Light);
        assert_eq!(LoadClass::classify(9.9), LoadClass::Light);
        assert_eq!(LoadClass::classify(10.0), LoadClass::Moderate);
        assert_eq!(LoadClass::classify(50.0), LoadClass::Heavy);
        assert_eq!(LoadClass::classify(200.0), LoadClass::Extreme);
    }

    #[test]
    fn burst_reclassifies_to_extreme() {
        let policy = AdaptivePolicy::new();
        // 3000 arrivals across 10 seconds → 300 msg/s.
        for i in 0..3000 {
            policy.record_arrival(at(i / 300));
        }
        policy.refresh(at(10));
        assert_eq!(policy.load_class(), LoadClass::Extreme);
        assert_eq!(policy.current_config().dh_ratchet_every_n, 50);
    }

    #[test]
    fn idle_queue_classifies_light() {
        let policy = AdaptivePolicy::new();
        policy.record_arrival(at(0));
        policy.refresh(at(59));
        assert_eq!(policy.load_class(), LoadClass::Light);
    }

    #[test]
    fn old_arrivals_age_out() {
        let policy = AdaptivePolicy::new();
        for i in 0..1000 {
            policy.record_arrival(at(i % 2));
        }
        // 120 seconds later the queue is empty again.
        policy.refresh(at(120));
        assert_eq!(policy.load_class(), LoadClass::Light);
    }

    #[test]
    fn maybe_refresh_respects_interval() {
        let policy = AdaptivePolicy::new();
        policy.maybe_refresh(at(0));
        for i in 0..3000 {
            policy.record_arrival(at(1 + i / 300));
        }
        // Too soon: snapshot unchanged.
        policy.maybe_refresh(at(5));
        assert_eq!(policy.load_class(), LoadClass::Light);
        // Interval elapsed: reclassifies.
        policy.maybe_refresh(at(11));
        assert_eq!(policy.load_class(), LoadClass::Extreme);
    }

    #[test]
    fn should_ratchet_every_n() {
        let cfg = RatchetConfig::for_class(LoadClass::Light);
        let t0 = at(0);
        assert!(!cfg.should_ratchet(0, t0, false, at(1)));
        assert!(!cfg.should_ratchet(4, t0, false, at(1)));
        assert!(cfg.should_ratchet(5, t0, false, at(1)));
        assert!(cfg.should_ratchet(10, t0, false, at(1)));
    }

    #[test]
    fn should_ratchet_on_new_dh_key_and_age() {
        let cfg = RatchetConfig::for_class(LoadClass::Light);
        let t0 = at(0);
        assert!(cfg.should_ratchet(1, t0, true, at(1)));
        let mut no_dh = cfg;
        no_dh.ratchet_on_new_dh_key = false;
        assert!(!no_dh.should_ratchet(1, t0, true, at(1)));
        // 31 minutes exceeds Light's 30-minute chain age.
        assert!(cfg.should_ratchet(1, t0, false, at(31 * 60)));
    }

    #[test]
    fn extreme_config_defers_light_schedule() {
        // Under Light a ratchet is due at message 10; under Extreme it is not.
        let light = RatchetConfig::for_class(LoadClass::Light);
        let extreme = RatchetConfig::for_class(LoadClass::Extreme);
        let t0 = at(0);
        assert!(light.should_ratchet(10, t0, false, at(1)));
        assert!(!extreme.should_ratchet(10, t0, false, at(1)));
        assert!(extreme.should_ratchet(50, t0, false, at(1)));
    }

    #[test]
    fn per_message_mode_always_ratchets() {
        let mut cfg = RatchetConfig::default();
        cfg.enable_per_message_ratchet = true;
        assert!(cfg.should_ratchet(0, at(0), false, at(0)));
    }
}
