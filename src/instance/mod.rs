//! Sync instance protocol (C9): the uniform message alphabet and status
//! shape every sync-module type (NTP, chrony, PTP, PPS, freerun) implements
//! (§4.6), so the engine never special-cases instance kind.

use crate::clock::ClockId;
use crate::time::Timespec;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct InstanceId(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceState {
    Listening,
    Slave,
    Master,
    Passive,
    Disabled,
    Faulty,
    Selection,
}

impl InstanceState {
    /// Priority used by the `STATE` selection rule: slave > master >
    /// passive > listening > selection > faulty > disabled (§4.4). Lower is
    /// better.
    pub fn priority(self) -> u8 {
        match self {
            InstanceState::Slave => 0,
            InstanceState::Master => 1,
            InstanceState::Passive => 2,
            InstanceState::Listening => 3,
            InstanceState::Selection => 4,
            InstanceState::Faulty => 5,
            InstanceState::Disabled => 6,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct Alarms: u32 {
        const FEED_STALE        = 1 << 0;
        const NO_SYNC           = 1 << 1;
        const CLOCK_NEAR_EPOCH  = 1 << 2;
        const CLOCK_CTRL_CONFLICT = 1 << 3;
    }
}

/// Control flags set by the engine on an instance via `CONTROL{flags,
/// mask}`. The invariant that exactly one instance may have `selected` or
/// `clock_ctrl` at a time is enforced by the engine, not here — this is
/// just the wire shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub struct ControlFlags {
    pub selected: bool,
    pub clock_ctrl: bool,
    pub timestamp_processing: bool,
    pub clustering_determinant: bool,
    pub leap_second_guard: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub struct ControlMask {
    pub selected: bool,
    pub clock_ctrl: bool,
    pub timestamp_processing: bool,
    pub clustering_determinant: bool,
    pub leap_second_guard: bool,
}

impl ControlFlags {
    /// Applies `incoming` to `self`, touching only the fields `mask` marks.
    pub fn apply(&mut self, incoming: ControlFlags, mask: ControlMask) {
        if mask.selected {
            self.selected = incoming.selected;
        }
        if mask.clock_ctrl {
            self.clock_ctrl = incoming.clock_ctrl;
        }
        if mask.timestamp_processing {
            self.timestamp_processing = incoming.timestamp_processing;
        }
        if mask.clustering_determinant {
            self.clustering_determinant = incoming.clustering_determinant;
        }
        if mask.leap_second_guard {
            self.leap_second_guard = incoming.leap_second_guard;
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Constraints {
    pub must_be_selected: bool,
    pub cannot_be_selected: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints { must_be_selected: false, cannot_be_selected: false }
    }
}

/// Master/grandmaster quality fields, named per the 1588 BMC criteria
/// (§4.4's `CLOCK_CLASS, TOTAL_ACCURACY, ALLAN_VARIANCE, STEPS_REMOVED`).
#[derive(Clone, Copy, Debug)]
pub struct MasterInfo {
    pub clock_id: [u8; 8],
    pub clock_class: u8,
    pub time_source: u8,
    pub accuracy_ns: f64,
    pub allan_variance: f64,
    pub steps_removed: u16,
    pub remote_clock: bool,
    pub time_traceable: bool,
    pub freq_traceable: bool,
}

#[derive(Clone, Debug)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub alarms: Alarms,
    pub constraints: Constraints,
    pub clock: ClockId,
    pub user_priority: i32,
    pub offset_from_master: Option<f64>,
    pub local_accuracy: f64,
    pub master: Option<MasterInfo>,
    pub clustering_score: u8,
}

#[derive(Clone, Copy, Debug)]
pub enum LeapType {
    Insert61,
    Delete59,
}

#[derive(Clone, Debug)]
pub enum EngineToInstance {
    Run,
    GetStatus,
    Control { flags: ControlFlags, mask: ControlMask },
    UpdateGmInfo { master: Option<MasterInfo> },
    UpdateLeapSecond { leap_type: Option<LeapType> },
    StepClock { offset: Timespec },
    LogStats { time: Timespec },
    SaveState,
    WriteTopology,
    StatsEndPeriod { time: Timespec },
    TestMode { id: u32, p0: i64, p1: i64, p2: i64 },
}

#[derive(Clone, Debug)]
pub enum InstanceToEngine {
    StatusReply { instance: InstanceId, status: InstanceStatus },
    StateChanged { instance: InstanceId, status: InstanceStatus },
    RtStatsEntry { instance: InstanceId, text: String },
    ClusteringInput { instance: InstanceId, offset_ns: Option<f64>, clock: ClockId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_priority_orders_slave_above_master() {
        assert!(InstanceState::Slave.priority() < InstanceState::Master.priority());
        assert!(InstanceState::Disabled.priority() > InstanceState::Faulty.priority());
    }

    #[test]
    fn control_apply_only_touches_masked_fields() {
        let mut flags = ControlFlags { selected: true, clock_ctrl: false, timestamp_processing: true, clustering_determinant: false, leap_second_guard: false };
        let incoming = ControlFlags { selected: false, clock_ctrl: true, timestamp_processing: false, clustering_determinant: true, leap_second_guard: true };
        let mask = ControlMask { selected: true, clock_ctrl: false, timestamp_processing: false, clustering_determinant: false, leap_second_guard: false };
        flags.apply(incoming, mask);
        assert!(!flags.selected);
        assert!(!flags.clock_ctrl); // untouched, kept original false
        assert!(flags.timestamp_processing); // untouched, kept original true
    }
}
