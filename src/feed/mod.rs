//! Clock feed (C6): periodically samples every registered clock against
//! the system clock (via the PHC abstraction for PHC-backed clocks) and
//! multicasts a `SYNC_EVENT` to subscribers — servos and the clustering
//! input path — so every clock comparison in the daemon shares one
//! sampling cadence instead of each servo polling independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::clock::{Clock, ClockId};
use crate::rt::{mailbox, Rx, Tx};
use crate::time::Timespec;

#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub clock_id: ClockId,
    pub offset_from_system: Timespec,
    pub taken_at: Instant,
}

#[derive(Clone, Debug)]
pub enum FeedEvent {
    /// One sampling pass completed; `samples` covers every clock that
    /// produced a fresh reading this tick (clocks whose sample failed are
    /// simply absent, and subscribers treat an absent clock as "stale").
    SyncEvent { samples: Arc<HashMap<ClockId, Sample>> },
}

pub struct ClockFeed {
    tx: Tx<FeedEvent>,
    clocks: HashMap<ClockId, Arc<dyn Clock>>,
    period: Duration,
}

impl ClockFeed {
    pub fn new(period: Duration) -> (ClockFeed, Rx<FeedEvent>) {
        let (tx, rx) = mailbox("clockfeed");
        (ClockFeed { tx, clocks: HashMap::new(), period }, rx)
    }

    pub fn add_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clocks.insert(clock.id(), clock);
    }

    pub fn remove_clock(&mut self, id: ClockId) {
        self.clocks.remove(&id);
    }

    pub fn tx(&self) -> Tx<FeedEvent> {
        self.tx.clone()
    }

    /// One sampling pass. Exposed separately from a run loop so tests (and
    /// the engine's own deterministic test mode) can drive ticks without a
    /// live thread.
    pub fn tick(&self) -> Arc<HashMap<ClockId, Sample>> {
        let now = Instant::now();
        let mut samples = HashMap::with_capacity(self.clocks.len());
        for (id, clock) in &self.clocks {
            match clock.now() {
                Ok(offset) => {
                    samples.insert(*id, Sample { clock_id: *id, offset_from_system: offset, taken_at: now });
                }
                Err(e) => debug!(clock = clock.short_name(), error = %e, "clock feed sample skipped"),
            }
        }
        Arc::new(samples)
    }

    /// Runs the sampling loop on the calling thread (the clockfeed actor's
    /// own thread per §4.9's scheduling model) until `stop` fires.
    pub fn run(&self, stop: &Rx<()>) {
        loop {
            let samples = self.tick();
            if self.tx.send(FeedEvent::SyncEvent { samples }).is_err() {
                warn!("clockfeed: no subscribers left, stopping");
                return;
            }
            match stop.recv_timeout(self.period) {
                Ok(()) => return,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockCapabilities, ClockError, HoldFrequency};

    struct FixedClock(ClockId, i64);
    impl Clock for FixedClock {
        fn id(&self) -> ClockId {
            self.0
        }
        fn short_name(&self) -> &str {
            "fixed"
        }
        fn long_name(&self) -> String {
            "fixed".to_string()
        }
        fn now(&self) -> Result<Timespec, ClockError> {
            Ok(Timespec::from_nanos(0, self.1))
        }
        fn capabilities(&self) -> ClockCapabilities {
            ClockCapabilities { max_frequency_adjustment_ppb: 0, max_offset_adjustment_ns: 0 }
        }
        fn step(&self, _offset: Timespec) -> Result<Timespec, ClockError> {
            self.now()
        }
        fn set_frequency(&self, _freq_ppb: f64, _hold: HoldFrequency) -> Result<(), ClockError> {
            Ok(())
        }
        fn get_frequency(&self) -> Result<f64, ClockError> {
            Ok(0.0)
        }
        fn disable_kernel_ntp_algorithm(&self) -> Result<(), ClockError> {
            Ok(())
        }
        fn set_leap_second_pending(&self, _insert: bool) -> Result<(), ClockError> {
            Ok(())
        }
        fn clear_leap_second_pending(&self) -> Result<(), ClockError> {
            Ok(())
        }
    }

    #[test]
    fn tick_samples_every_registered_clock() {
        let (mut feed, _rx) = ClockFeed::new(Duration::from_millis(10));
        feed.add_clock(Arc::new(FixedClock(ClockId(1), 100)));
        feed.add_clock(Arc::new(FixedClock(ClockId(2), 200)));
        let samples = feed.tick();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[&ClockId(1)].offset_from_system.nsec, 100);
    }

    #[test]
    fn removed_clock_is_no_longer_sampled() {
        let (mut feed, _rx) = ClockFeed::new(Duration::from_millis(10));
        feed.add_clock(Arc::new(FixedClock(ClockId(1), 100)));
        feed.remove_clock(ClockId(1));
        assert!(feed.tick().is_empty());
    }
}
