//! Servo (C7): a PI(D) controller that drives one slave clock toward one
//! master clock using samples from the clock feed (§4.3).

use std::sync::Arc;

use tracing::warn;

use crate::clock::{Clock, ClockError, ClockId, HoldFrequency};
use crate::feed::Sample;
use crate::time::Timespec;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockControlPolicy {
    NoAdjust,
    SlewOnly,
    SlewAndStep,
    StepOnFirstConvergence,
    StepForward,
}

#[derive(Clone, Copy, Debug)]
pub struct ServoGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct ServoConfig {
    pub gains: ServoGains,
    pub step_threshold_ns: f64,
    pub policy: ClockControlPolicy,
    pub feed_stale_after: std::time::Duration,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            gains: ServoGains { kp: 0.7, ki: 0.3, kd: 0.0 },
            step_threshold_ns: 1_000_000.0,
            policy: ClockControlPolicy::StepOnFirstConvergence,
            feed_stale_after: std::time::Duration::from_secs(2),
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ServoAlarms: u32 {
        const FEED_STALE            = 1 << 0;
        const MASTER_NEAR_EPOCH     = 1 << 1;
        const STEP_BLOCKED          = 1 << 2;
        const FREQ_SATURATED        = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ServoStats {
    pub offset: Timespec,
    pub freq_adj_ppb: f64,
    pub p_term: f64,
    pub i_term: f64,
    pub in_sync: bool,
    pub alarms: ServoAlarms,
    pub master_time: Option<Timespec>,
    pub slave_time: Option<Timespec>,
}

/// One servo instance, pre-allocated by the engine up to `active_clocks +
/// spare` (§5) and left inactive (no `master`/`slave` assigned) until
/// hotplug activates it.
pub struct Servo {
    master: Option<ClockId>,
    slave: Option<ClockId>,
    config: ServoConfig,
    integrator: f64,
    last_error_ns: Option<f64>,
    last_sample_time: Option<std::time::Instant>,
    converged_first_time: bool,
    alarms: ServoAlarms,
}

impl Servo {
    pub fn new(config: ServoConfig) -> Servo {
        Servo {
            master: None,
            slave: None,
            config,
            integrator: 0.0,
            last_error_ns: None,
            last_sample_time: None,
            converged_first_time: false,
            alarms: ServoAlarms::empty(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.master.is_some() && self.slave.is_some()
    }

    pub fn master(&self) -> Option<ClockId> {
        self.master
    }

    pub fn slave(&self) -> Option<ClockId> {
        self.slave
    }

    /// Assigns this previously-spare servo to a master/slave pair; resets
    /// all control-loop state, since a fresh pairing has no history to
    /// continue from.
    pub fn activate(&mut self, master: ClockId, slave: ClockId) {
        self.master = Some(master);
        self.slave = Some(slave);
        self.integrator = 0.0;
        self.last_error_ns = None;
        self.last_sample_time = None;
        self.converged_first_time = false;
        self.alarms = ServoAlarms::empty();
    }

    pub fn deactivate(&mut self) {
        self.master = None;
        self.slave = None;
    }

    /// One control step. `samples` is the clock-feed tick's output;
    /// `slave_clock` is the concrete clock to step/adjust; `master_clock`
    /// is the concrete master clock, consulted for the "master is near
    /// epoch (clock not yet set)" alarm (§4.3).
    pub fn step(&mut self, samples: &std::collections::HashMap<ClockId, Sample>, master_clock: &dyn Clock, slave_clock: &dyn Clock) -> ServoStats {
        let (master, slave) = match (self.master, self.slave) {
            (Some(m), Some(s)) => (m, s),
            _ => return self.stale_stats(),
        };

        let now = std::time::Instant::now();
        let (Some(master_sample), Some(slave_sample)) = (samples.get(&master), samples.get(&slave)) else {
            self.alarms.insert(ServoAlarms::FEED_STALE);
            return self.stale_stats();
        };

        if let Some(last) = self.last_sample_time {
            if now.duration_since(last) > self.config.feed_stale_after * 2 {
                self.alarms.insert(ServoAlarms::FEED_STALE);
            } else {
                self.alarms.remove(ServoAlarms::FEED_STALE);
            }
        }

        match epoch_alarm(master_clock) {
            Ok(true) => self.alarms.insert(ServoAlarms::MASTER_NEAR_EPOCH),
            Ok(false) => self.alarms.remove(ServoAlarms::MASTER_NEAR_EPOCH),
            Err(e) => warn!(error = %e, "failed to query master clock epoch state"),
        }

        let error_ts = master_sample.offset_from_system.subtract(slave_sample.offset_from_system);
        let error_ns = error_ts.as_nanos_f64();

        let caps = slave_clock.capabilities();
        let dt = self
            .last_sample_time
            .map(|last| now.duration_since(last).as_secs_f64())
            .filter(|dt| *dt > 0.0)
            .unwrap_or(1.0);

        let can_step = match self.config.policy {
            ClockControlPolicy::NoAdjust | ClockControlPolicy::SlewOnly => false,
            ClockControlPolicy::SlewAndStep => true,
            ClockControlPolicy::StepForward => error_ns > 0.0,
            ClockControlPolicy::StepOnFirstConvergence => !self.converged_first_time,
        };

        let freq_adj_ppb;
        if error_ns.abs() > self.config.step_threshold_ns {
            if can_step {
                if let Err(e) = slave_clock.step(error_ts) {
                    warn!(error = %e, "servo step failed");
                }
                self.integrator = 0.0;
                self.alarms.remove(ServoAlarms::STEP_BLOCKED);
                self.converged_first_time = true;
                freq_adj_ppb = 0.0;
            } else {
                self.alarms.insert(ServoAlarms::STEP_BLOCKED);
                freq_adj_ppb = self.apply_pid(error_ns, dt, &caps, slave_clock);
            }
        } else {
            self.alarms.remove(ServoAlarms::STEP_BLOCKED);
            self.converged_first_time = true;
            freq_adj_ppb = self.apply_pid(error_ns, dt, &caps, slave_clock);
        }

        self.last_error_ns = Some(error_ns);
        self.last_sample_time = Some(now);

        let in_sync = error_ns.abs() <= self.config.step_threshold_ns && self.alarms.is_empty();
        let p_term = self.config.gains.kp * error_ns;

        ServoStats {
            offset: error_ts,
            freq_adj_ppb,
            p_term,
            i_term: self.integrator,
            in_sync,
            alarms: self.alarms,
            master_time: Some(master_sample.offset_from_system),
            slave_time: Some(slave_sample.offset_from_system),
        }
    }

    fn apply_pid(&mut self, error_ns: f64, dt: f64, caps: &crate::clock::ClockCapabilities, slave_clock: &dyn Clock) -> f64 {
        self.integrator += self.config.gains.ki * error_ns * dt;
        let d_term = match self.last_error_ns {
            Some(last) => self.config.gains.kd * (error_ns - last) / dt,
            None => 0.0,
        };
        let raw = self.config.gains.kp * error_ns + self.integrator + d_term;

        let max = caps.max_frequency_adjustment_ppb as f64;
        let clamped = raw.clamp(-max, max);
        if clamped != raw {
            self.alarms.insert(ServoAlarms::FREQ_SATURATED);
            // Anti-windup: undo the integrator contribution that pushed us
            // past the clamp so it doesn't keep growing unboundedly.
            self.integrator -= raw - clamped;
        } else {
            self.alarms.remove(ServoAlarms::FREQ_SATURATED);
        }

        if let Err(e) = slave_clock.set_frequency(clamped, HoldFrequency::Disable) {
            warn!(error = %e, "servo frequency adjust failed");
        }
        clamped
    }

    fn stale_stats(&self) -> ServoStats {
        ServoStats {
            offset: Timespec::ZERO,
            freq_adj_ppb: 0.0,
            p_term: 0.0,
            i_term: self.integrator,
            in_sync: false,
            alarms: self.alarms,
            master_time: None,
            slave_time: None,
        }
    }
}

pub fn epoch_alarm(clock: &dyn Clock) -> Result<bool, ClockError> {
    match clock.now() {
        Ok(_) => Ok(false),
        Err(ClockError::NotYetSet) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockCapabilities;
    use std::collections::HashMap;
    use std::time::Instant;

    struct FakeSlave;
    impl Clock for FakeSlave {
        fn id(&self) -> ClockId {
            ClockId(99)
        }
        fn short_name(&self) -> &str {
            "slave"
        }
        fn long_name(&self) -> String {
            "slave".to_string()
        }
        fn now(&self) -> Result<Timespec, ClockError> {
            Ok(Timespec::ZERO)
        }
        fn capabilities(&self) -> ClockCapabilities {
            ClockCapabilities { max_frequency_adjustment_ppb: 100_000, max_offset_adjustment_ns: 500_000_000 }
        }
        fn step(&self, _offset: Timespec) -> Result<Timespec, ClockError> {
            Ok(Timespec::ZERO)
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

    struct FakeMaster {
        near_epoch: bool,
    }
    impl Clock for FakeMaster {
        fn id(&self) -> ClockId {
            ClockId(1)
        }
        fn short_name(&self) -> &str {
            "master"
        }
        fn long_name(&self) -> String {
            "master".to_string()
        }
        fn now(&self) -> Result<Timespec, ClockError> {
            if self.near_epoch {
                Err(ClockError::NotYetSet)
            } else {
                Ok(Timespec::ZERO)
            }
        }
        fn capabilities(&self) -> ClockCapabilities {
            ClockCapabilities { max_frequency_adjustment_ppb: 100_000, max_offset_adjustment_ns: 500_000_000 }
        }
        fn step(&self, _offset: Timespec) -> Result<Timespec, ClockError> {
            Ok(Timespec::ZERO)
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

    fn cfg(policy: ClockControlPolicy) -> ServoConfig {
        ServoConfig {
            gains: ServoGains { kp: 0.5, ki: 0.1, kd: 0.0 },
            step_threshold_ns: 1_000_000.0,
            policy,
            feed_stale_after: std::time::Duration::from_secs(1),
        }
    }

    #[test]
    fn inactive_servo_reports_stale() {
        let servo = Servo::new(cfg(ClockControlPolicy::SlewOnly));
        assert!(!servo.is_active());
    }

    #[test]
    fn large_error_steps_when_policy_allows() {
        let mut servo = Servo::new(cfg(ClockControlPolicy::SlewAndStep));
        servo.activate(ClockId(1), ClockId(99));
        let mut samples = HashMap::new();
        samples.insert(ClockId(1), Sample { clock_id: ClockId(1), offset_from_system: Timespec::from_nanos(1, 0), taken_at: Instant::now() });
        samples.insert(ClockId(99), Sample { clock_id: ClockId(99), offset_from_system: Timespec::ZERO, taken_at: Instant::now() });
        let stats = servo.step(&samples, &FakeMaster { near_epoch: false }, &FakeSlave);
        assert!(!stats.alarms.contains(ServoAlarms::STEP_BLOCKED));
    }

    #[test]
    fn large_error_is_blocked_under_slew_only() {
        let mut servo = Servo::new(cfg(ClockControlPolicy::SlewOnly));
        servo.activate(ClockId(1), ClockId(99));
        let mut samples = HashMap::new();
        samples.insert(ClockId(1), Sample { clock_id: ClockId(1), offset_from_system: Timespec::from_nanos(1, 0), taken_at: Instant::now() });
        samples.insert(ClockId(99), Sample { clock_id: ClockId(99), offset_from_system: Timespec::ZERO, taken_at: Instant::now() });
        let stats = servo.step(&samples, &FakeMaster { near_epoch: false }, &FakeSlave);
        assert!(stats.alarms.contains(ServoAlarms::STEP_BLOCKED));
    }

    #[test]
    fn missing_sample_raises_feed_stale() {
        let mut servo = Servo::new(cfg(ClockControlPolicy::SlewOnly));
        servo.activate(ClockId(1), ClockId(99));
        let stats = servo.step(&HashMap::new(), &FakeMaster { near_epoch: false }, &FakeSlave);
        assert!(!stats.in_sync);
    }

    #[test]
    fn master_near_epoch_raises_alarm() {
        let mut servo = Servo::new(cfg(ClockControlPolicy::SlewOnly));
        servo.activate(ClockId(1), ClockId(99));
        let mut samples = HashMap::new();
        samples.insert(ClockId(1), Sample { clock_id: ClockId(1), offset_from_system: Timespec::ZERO, taken_at: Instant::now() });
        samples.insert(ClockId(99), Sample { clock_id: ClockId(99), offset_from_system: Timespec::ZERO, taken_at: Instant::now() });
        let stats = servo.step(&samples, &FakeMaster { near_epoch: true }, &FakeSlave);
        assert!(stats.alarms.contains(ServoAlarms::MASTER_NEAR_EPOCH));
    }

    #[test]
    fn master_epoch_alarm_clears_once_set() {
        let mut servo = Servo::new(cfg(ClockControlPolicy::SlewOnly));
        servo.activate(ClockId(1), ClockId(99));
        let mut samples = HashMap::new();
        samples.insert(ClockId(1), Sample { clock_id: ClockId(1), offset_from_system: Timespec::ZERO, taken_at: Instant::now() });
        samples.insert(ClockId(99), Sample { clock_id: ClockId(99), offset_from_system: Timespec::ZERO, taken_at: Instant::now() });
        servo.step(&samples, &FakeMaster { near_epoch: true }, &FakeSlave);
        let stats = servo.step(&samples, &FakeMaster { near_epoch: false }, &FakeSlave);
        assert!(!stats.alarms.contains(ServoAlarms::MASTER_NEAR_EPOCH));
    }
}
