//! Timer set used by every actor that needs periodic or one-shot wakeups:
//! the engine's log-stats/save-state/stats-period-end/netlink-rescan timers
//! (periodic) and its leap-second/selection-holdoff/netlink-coalesce timers
//! (one-shot), per §4.9.
//!
//! Timers are named by an arbitrary `K: Eq + Hash + Clone` key the caller
//! defines (typically an enum). Cancellation is idempotent, matching §5's
//! concurrency note that "timer cancel is idempotent".

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A named collection of timers, all driven by the owning actor's own
/// `recv_timeout` loop: the actor asks [`TimerSet::time_until_next`] for how
/// long it may block, and calls [`TimerSet::pop_expired`] whenever that
/// block returns due to timeout.
pub struct TimerSet<K> {
    entries: HashMap<K, Entry>,
}

struct Entry {
    deadline: Instant,
    period: Option<Duration>,
}

impl<K: Eq + Hash + Clone> Default for TimerSet<K> {
    fn default() -> Self {
        TimerSet { entries: HashMap::new() }
    }
}

impl<K: Eq + Hash + Clone> TimerSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer. Re-arming an existing key replaces its deadline.
    pub fn arm_once(&mut self, key: K, delay: Duration) {
        self.entries.insert(key, Entry { deadline: Instant::now() + delay, period: None });
    }

    /// Arm (or re-arm) a one-shot timer with an absolute deadline, used by
    /// the leap-second scheduler which computes deadlines against a fixed
    /// UTC instant rather than "delay from now".
    pub fn arm_once_at(&mut self, key: K, deadline: Instant) {
        self.entries.insert(key, Entry { deadline, period: None });
    }

    /// Arm a periodic timer that re-arms itself every `period` after firing.
    pub fn arm_periodic(&mut self, key: K, period: Duration) {
        self.entries.insert(key, Entry { deadline: Instant::now() + period, period: Some(period) });
    }

    /// Cancel a timer. Idempotent: cancelling an unarmed or already-fired
    /// key is a no-op and returns `false`.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// How long the caller may safely block before the next timer needs
    /// servicing. `None` means no timers are armed (block indefinitely).
    pub fn time_until_next(&self) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .values()
            .map(|e| e.deadline.saturating_duration_since(now))
            .min()
    }

    /// Remove and return every key whose deadline has passed, re-arming
    /// periodic ones for their next period. Keys are returned in no
    /// particular order; callers that care about ordering between
    /// simultaneously-expiring timers should sort the result themselves.
    pub fn pop_expired(&mut self) -> Vec<K> {
        let now = Instant::now();
        let mut fired = Vec::new();
        let mut rearm = Vec::new();

        self.entries.retain(|key, entry| {
            if entry.deadline > now {
                return true;
            }
            fired.push(key.clone());
            if let Some(period) = entry.period {
                rearm.push((key.clone(), now + period, period));
            }
            false
        });

        for (key, deadline, period) in rearm {
            self.entries.insert(key, Entry { deadline, period: Some(period) });
        }

        fired
    }
}

/// Opaque type alias kept for call sites that want to name the timer-set
/// type without repeating the key type; currently just `TimerSet<K>` itself.
pub type TimerHandle<K> = TimerSet<K>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Eq, PartialEq, Hash, Debug)]
    enum T {
        A,
        B,
    }

    #[test]
    fn one_shot_fires_once() {
        let mut timers = TimerSet::new();
        timers.arm_once(T::A, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timers.pop_expired(), vec![T::A]);
        assert!(timers.pop_expired().is_empty());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut timers: TimerSet<T> = TimerSet::new();
        assert!(!timers.cancel(&T::A));
        timers.arm_once(T::A, Duration::from_secs(10));
        assert!(timers.cancel(&T::A));
        assert!(!timers.cancel(&T::A));
    }

    #[test]
    fn periodic_rearms() {
        let mut timers = TimerSet::new();
        timers.arm_periodic(T::B, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timers.pop_expired(), vec![T::B]);
        assert!(timers.is_armed(&T::B));
    }
}
