//! NTP/chrony sync module (C10, §4.7): polls the running daemon (`ntpd` or
//! `chronyd`), translates its state into an [`InstanceStatus`], and can
//! disable the daemon's own clock discipline when selected.

pub mod envfile;

use std::net::SocketAddr;
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::clock::ClockId;
use crate::helper::HelperClient;
use crate::instance::{Alarms, Constraints, ControlFlags, EngineToInstance, InstanceId, InstanceState, InstanceStatus, InstanceToEngine, MasterInfo};
use crate::rt::{mailbox, Tx};

#[derive(thiserror::Error, Debug)]
pub enum NtpModuleError {
    #[error("ntp daemon connection refused")]
    Disabled,
    #[error("ntp daemon communication error: {0}")]
    Faulty(String),
    #[error("clock control conflict: ntp daemon disciplines the system clock while this module is passive")]
    ClockControlConflict,
    #[error("privileged helper rpc failed: {0}")]
    Helper(#[from] crate::helper::HelperRpcError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Active,
    Passive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Daemon {
    Ntpd,
    Chronyd,
}

/// Identifies a particular peer's offset sample: per §4.7, a fresh offset
/// is only recognised once either field changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OffsetId {
    pub peer_remote_address: SocketAddr,
    pub pkts_received_from_peer: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PollPhase {
    SysInfo,
    PeerInfo,
    Sleep,
}

pub struct ConvergenceEstimator {
    threshold_ns: f64,
    min_period: Duration,
    below_threshold_since: Option<Instant>,
    paused: bool,
}

impl ConvergenceEstimator {
    pub fn new(threshold_ns: f64, min_period: Duration) -> ConvergenceEstimator {
        ConvergenceEstimator { threshold_ns, min_period, below_threshold_since: None, paused: false }
    }

    /// `reset` per §4.7 means "paused, not cleared": a subsequent `sample`
    /// resumes counting from wherever `below_threshold_since` already was,
    /// rather than restarting the clock.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn sample(&mut self, offset_ns: f64, now: Instant) -> bool {
        self.paused = false;
        if offset_ns.abs() < self.threshold_ns {
            let since = *self.below_threshold_since.get_or_insert(now);
            now.duration_since(since) >= self.min_period
        } else {
            self.below_threshold_since = None;
            false
        }
    }

    pub fn is_converged(&self, now: Instant) -> bool {
        !self.paused
            && self.below_threshold_since.map(|since| now.duration_since(since) >= self.min_period).unwrap_or(false)
    }
}

pub struct NtpInstance {
    pub clock: ClockId,
    pub daemon: Daemon,
    pub mode: Mode,
    pub ignore_clock_ctrl_conflict: bool,
    phase: PollPhase,
    last_offset_id: Option<OffsetId>,
    latest_offset_ns: Option<f64>,
    state: InstanceState,
    alarms: Alarms,
    constraints: Constraints,
    convergence: ConvergenceEstimator,
    helper: std::sync::Arc<HelperClient>,
}

impl NtpInstance {
    pub fn new(clock: ClockId, daemon: Daemon, mode: Mode, helper: std::sync::Arc<HelperClient>) -> NtpInstance {
        NtpInstance {
            clock,
            daemon,
            mode,
            ignore_clock_ctrl_conflict: false,
            phase: PollPhase::SysInfo,
            last_offset_id: None,
            latest_offset_ns: None,
            state: InstanceState::Listening,
            alarms: Alarms::empty(),
            constraints: Constraints::default(),
            convergence: ConvergenceEstimator::new(500.0, Duration::from_secs(60)),
            helper,
        }
    }

    /// Advances the `SYS_INFO -> PEER_INFO -> SLEEP` cycle by one poll tick
    /// (§4.7). `probe` supplies daemon-specific query results so the state
    /// machine itself has no protocol knowledge (the ntpd control-mode
    /// query and the chronyd binary control protocol are both modeled as
    /// this one trait at the call site).
    pub fn poll(&mut self, probe: &dyn DaemonProbe) -> Result<(), NtpModuleError> {
        match self.phase {
            PollPhase::SysInfo => {
                match probe.sys_info() {
                    Ok(info) => {
                        self.alarms.remove(Alarms::NO_SYNC);
                        if info.daemon_disciplines_clock && self.mode == Mode::Passive {
                            if !self.ignore_clock_ctrl_conflict {
                                self.alarms.insert(Alarms::CLOCK_CTRL_CONFLICT);
                                error!("ntp daemon disciplines system clock while module is passive");
                                return Err(NtpModuleError::ClockControlConflict);
                            }
                        } else if info.daemon_disciplines_clock && self.mode == Mode::Active {
                            if let Err(e) = probe.disable_clock_control() {
                                warn!(error = %e, "failed to disable daemon clock control; asserting must_be_selected");
                                self.constraints.must_be_selected = true;
                            }
                        }
                    }
                    Err(NtpModuleError::Disabled) => {
                        self.state = InstanceState::Disabled;
                        self.phase = PollPhase::Sleep;
                        return Ok(());
                    }
                    Err(e) => {
                        self.state = InstanceState::Faulty;
                        self.phase = PollPhase::Sleep;
                        return Err(e);
                    }
                }
                self.phase = PollPhase::PeerInfo;
            }
            PollPhase::PeerInfo => {
                match probe.peer_info() {
                    Ok(Some(peer)) => {
                        let fresh = Some(peer.offset_id) != self.last_offset_id;
                        self.last_offset_id = Some(peer.offset_id);
                        if fresh {
                            self.latest_offset_ns = Some(peer.offset_ns);
                            let converged = self.convergence.sample(peer.offset_ns, Instant::now());
                            self.state =
                                if peer.selected && !peer.stepped_since_last_poll { InstanceState::Slave } else { InstanceState::Selection };
                            if !converged {
                                self.alarms.insert(Alarms::NO_SYNC);
                            } else {
                                self.alarms.remove(Alarms::NO_SYNC);
                            }
                        }
                    }
                    Ok(None) => {
                        self.state = InstanceState::Listening;
                        self.convergence.pause();
                    }
                    Err(e) => {
                        self.state = InstanceState::Faulty;
                        self.phase = PollPhase::Sleep;
                        return Err(e);
                    }
                }
                self.phase = PollPhase::Sleep;
            }
            PollPhase::Sleep => {
                self.phase = PollPhase::SysInfo;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            state: self.state,
            alarms: self.alarms,
            constraints: self.constraints,
            clock: self.clock,
            user_priority: 0,
            offset_from_master: self.latest_offset_ns,
            local_accuracy: 0.0,
            master: self.master_info(),
            clustering_score: 0,
        }
    }

    fn master_info(&self) -> Option<MasterInfo> {
        self.latest_offset_ns.map(|_| MasterInfo {
            clock_id: [0; 8],
            clock_class: 6,
            time_source: 0x20, // NTP, per the 1588 time-source enumeration
            accuracy_ns: 1_000_000.0,
            allan_variance: 0.0,
            steps_removed: 1,
            remote_clock: true,
            time_traceable: true,
            freq_traceable: true,
        })
    }
}

/// Spawns the actor thread for one configured NTP/chrony instance (§4.9's
/// one-thread-per-actor model, applied to C10): it drives [`NtpInstance`]'s
/// poll cycle on `poll_period`, answers `CONTROL`/`GET_STATUS` from its own
/// inbox between poll ticks, and reports every status change and clustering
/// offset back to the engine. `probe` is supplied by the caller (§1's
/// non-goal: this crate coordinates offsets, it does not speak ntpd's
/// mode-6 protocol or chrony's binary protocol itself).
pub fn spawn(
    id: InstanceId,
    mut instance: NtpInstance,
    probe: Box<dyn DaemonProbe + Send>,
    poll_period: Duration,
    to_engine: Tx<InstanceToEngine>,
) -> (Tx<EngineToInstance>, JoinHandle<()>) {
    let (tx, rx) = mailbox("ntp-instance");
    let join = std::thread::Builder::new()
        .name(format!("ntp-instance-{}", id.0))
        .spawn(move || {
            let mut flags = ControlFlags::default();
            loop {
                match rx.recv_timeout(poll_period) {
                    Ok(EngineToInstance::Control { flags: incoming, mask }) => flags.apply(incoming, mask),
                    Ok(EngineToInstance::GetStatus) => {
                        to_engine.send_or_log(InstanceToEngine::StatusReply { instance: id, status: instance.status() });
                        continue;
                    }
                    Ok(EngineToInstance::Run) | Ok(EngineToInstance::SaveState) | Ok(EngineToInstance::WriteTopology) => {}
                    Ok(EngineToInstance::UpdateGmInfo { .. })
                    | Ok(EngineToInstance::UpdateLeapSecond { .. })
                    | Ok(EngineToInstance::StepClock { .. })
                    | Ok(EngineToInstance::LogStats { .. })
                    | Ok(EngineToInstance::StatsEndPeriod { .. })
                    | Ok(EngineToInstance::TestMode { .. }) => {}
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        info!(instance = id.0, "ntp instance: engine gone, stopping");
                        return;
                    }
                }

                if !flags.timestamp_processing && flags.leap_second_guard {
                    continue; // leap second guard window: hold the last-reported status
                }

                if let Err(e) = instance.poll(&*probe) {
                    warn!(instance = id.0, error = %e, "ntp instance poll failed");
                }
                let status = instance.status();
                if to_engine.send(InstanceToEngine::StateChanged { instance: id, status: status.clone() }).is_err() {
                    return;
                }
                to_engine.send_or_log(InstanceToEngine::ClusteringInput {
                    instance: id,
                    offset_ns: status.offset_from_master,
                    clock: status.clock,
                });
            }
        })
        .expect("spawn ntp instance thread");
    (tx, join)
}

#[derive(Clone, Copy, Debug)]
pub struct SysInfo {
    pub daemon_disciplines_clock: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PeerInfo {
    pub offset_id: OffsetId,
    pub offset_ns: f64,
    pub selected: bool,
    pub stepped_since_last_poll: bool,
}

/// Abstracts the daemon-specific wire query (ntpd's mode-6 control
/// protocol vs. chronyd's binary control protocol over the helper-opened
/// socket) behind one interface the state machine above drives.
pub trait DaemonProbe {
    fn sys_info(&self) -> Result<SysInfo, NtpModuleError>;
    fn peer_info(&self) -> Result<Option<PeerInfo>, NtpModuleError>;
    /// Active-mode only: issues the authenticated control-mode command (or,
    /// for chrony, the env-file-edit + restart dance) that stops the
    /// daemon from disciplining the system clock.
    fn disable_clock_control(&self) -> Result<(), NtpModuleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct FixedProbe {
        sys: SysInfo,
        peer: Option<PeerInfo>,
    }
    impl DaemonProbe for FixedProbe {
        fn sys_info(&self) -> Result<SysInfo, NtpModuleError> {
            Ok(self.sys)
        }
        fn peer_info(&self) -> Result<Option<PeerInfo>, NtpModuleError> {
            Ok(self.peer)
        }
        fn disable_clock_control(&self) -> Result<(), NtpModuleError> {
            Ok(())
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 123)
    }

    #[test]
    fn passive_mode_conflict_without_ignore_is_an_error() {
        let helper = std::sync::Arc::new(HelperClient::direct());
        let mut inst = NtpInstance::new(ClockId(0), Daemon::Ntpd, Mode::Passive, helper);
        let probe = FixedProbe { sys: SysInfo { daemon_disciplines_clock: true }, peer: None };
        let result = inst.poll(&probe);
        assert!(matches!(result, Err(NtpModuleError::ClockControlConflict)));
    }

    #[test]
    fn passive_mode_conflict_ignored_when_configured() {
        let helper = std::sync::Arc::new(HelperClient::direct());
        let mut inst = NtpInstance::new(ClockId(0), Daemon::Ntpd, Mode::Passive, helper);
        inst.ignore_clock_ctrl_conflict = true;
        let probe = FixedProbe { sys: SysInfo { daemon_disciplines_clock: true }, peer: None };
        assert!(inst.poll(&probe).is_ok());
    }

    #[test]
    fn fresh_offset_updates_state_to_slave_when_selected() {
        let helper = std::sync::Arc::new(HelperClient::direct());
        let mut inst = NtpInstance::new(ClockId(0), Daemon::Ntpd, Mode::Active, helper);
        let peer = PeerInfo {
            offset_id: OffsetId { peer_remote_address: addr(), pkts_received_from_peer: 1 },
            offset_ns: 10.0,
            selected: true,
            stepped_since_last_poll: false,
        };
        let probe = FixedProbe { sys: SysInfo { daemon_disciplines_clock: false }, peer: Some(peer) };
        inst.poll(&probe).unwrap(); // SYS_INFO
        inst.poll(&probe).unwrap(); // PEER_INFO
        assert_eq!(inst.status().state, InstanceState::Slave);
    }

    #[test]
    fn stale_offset_id_does_not_update_state() {
        let helper = std::sync::Arc::new(HelperClient::direct());
        let mut inst = NtpInstance::new(ClockId(0), Daemon::Ntpd, Mode::Active, helper);
        let offset_id = OffsetId { peer_remote_address: addr(), pkts_received_from_peer: 1 };
        let peer = PeerInfo { offset_id, offset_ns: 10.0, selected: true, stepped_since_last_poll: false };
        let probe = FixedProbe { sys: SysInfo { daemon_disciplines_clock: false }, peer: Some(peer) };
        inst.poll(&probe).unwrap();
        inst.poll(&probe).unwrap();
        inst.poll(&probe).unwrap(); // SLEEP -> SYS_INFO
        inst.poll(&probe).unwrap(); // SYS_INFO -> PEER_INFO, same offset_id: not fresh
        assert_eq!(inst.last_offset_id, Some(offset_id));
    }

    #[test]
    fn convergence_pauses_rather_than_clears_on_no_candidate_peers() {
        let mut est = ConvergenceEstimator::new(100.0, Duration::from_millis(1));
        let t0 = Instant::now();
        assert!(!est.sample(10.0, t0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(est.sample(10.0, Instant::now()));
        est.pause();
        assert!(!est.is_converged(Instant::now()));
        // Resuming without crossing the threshold again should immediately
        // be converged again, since history wasn't cleared.
        assert!(est.sample(10.0, Instant::now()));
    }

    #[test]
    fn spawned_instance_reports_state_changes_to_the_engine() {
        let helper = std::sync::Arc::new(HelperClient::direct());
        let inst = NtpInstance::new(ClockId(0), Daemon::Ntpd, Mode::Active, helper);
        let peer = PeerInfo {
            offset_id: OffsetId { peer_remote_address: addr(), pkts_received_from_peer: 1 },
            offset_ns: 10.0,
            selected: true,
            stepped_since_last_poll: false,
        };
        let probe = FixedProbe { sys: SysInfo { daemon_disciplines_clock: false }, peer: Some(peer) };

        let (to_engine, from_instance) = mailbox("test-engine-inbox");
        let (_ctrl_tx, join) = spawn(InstanceId(7), inst, Box::new(probe), Duration::from_millis(5), to_engine);

        let mut saw_clustering_input = false;
        for _ in 0..20 {
            match from_instance.recv_timeout(Duration::from_millis(200)) {
                Ok(InstanceToEngine::ClusteringInput { instance, .. }) => {
                    assert_eq!(instance, InstanceId(7));
                    saw_clustering_input = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert!(saw_clustering_input, "expected at least one clustering input report");
        drop(from_instance);
        join.join().unwrap();
    }
}
