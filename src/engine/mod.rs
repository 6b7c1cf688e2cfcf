//! Engine (C11): the main loop. Owns the servo pool, the selection
//! holdoff, and the leap-second scheduler, and drives every sync instance
//! through the alphabet defined in [`crate::instance`] (§4.9, §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use crate::clock::{ClockId, ClockRegistry};
use crate::feed::{ClockFeed, FeedEvent};
use crate::iface::InterfaceRegistry;
use crate::instance::{ControlFlags, ControlMask, EngineToInstance, InstanceId, InstanceStatus, InstanceToEngine, LeapType};
use crate::leap::{LeapScheduler, SteppingPolicy};
use crate::rt::{mailbox, Rx, Tx, TimerSet};
use crate::select::{clustering_scores, select_bic, Candidate, ClusteringInput, SelectionPolicy};
use crate::servo::{Servo, ServoAlarms, ServoStats};
use crate::stats::{StatsEntry, StatsSink};
use crate::time::Timespec;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
enum TimerKey {
    LogStats,
    SaveState,
    StatsEndPeriod,
    NetlinkRescan,
    SelectionHoldoff,
}

/// Messages accepted on the engine's own inbox (§4.9's engine message
/// alphabet), distinct from [`EngineToInstance`]/[`InstanceToEngine`] which
/// travel on each instance's own inbox.
#[derive(Debug)]
pub enum EngineMessage {
    StepClocks,
    ScheduleLeapSecond { leap_type: LeapType, dry_run: bool },
    CancelLeapSecond,
    SelectInstance { instance: Option<InstanceId> },
    ConfigureTestMode { instance: InstanceId, id: u32, p0: i64, p1: i64, p2: i64 },
    RtStatsEntry { instance: InstanceId, text: String },
    LogRotate,
    ClusteringInput { instance: InstanceId, offset_ns: Option<f64>, clock: ClockId },
    LinkTableRelease,
    ServoPidAdjust { instance: InstanceId, kp: f64, ki: f64, kd: f64 },
    Shutdown,
}

struct InstanceHandle {
    name: String,
    manual_selected: bool,
    clock: ClockId,
    tx: Tx<EngineToInstance>,
    last_status: Option<InstanceStatus>,
}

/// Sizes the pre-allocated servo pool: `active_clocks` registered at
/// startup plus a fixed number of spares for clocks hotplugged later
/// (§5's "servo pool sized active_clocks + spare").
pub const SERVO_POOL_SPARE: usize = 4;

pub struct Engine {
    clocks: Arc<ClockRegistry>,
    interfaces: Arc<InterfaceRegistry>,
    instances: HashMap<InstanceId, InstanceHandle>,
    instance_rx: Rx<InstanceToEngine>,
    self_rx: Rx<EngineMessage>,
    servos: Vec<Servo>,
    servo_assignment: HashMap<InstanceId, usize>,
    servo_by_slave: HashMap<ClockId, usize>,
    servo_last_alarms: HashMap<ClockId, ServoAlarms>,
    servo_last_stats: HashMap<ClockId, ServoStats>,
    selection_policy: SelectionPolicy,
    selected: Option<InstanceId>,
    pending_selection: Option<Option<InstanceId>>,
    selection_holdoff: Duration,
    discriminator: Option<InstanceId>,
    clustering_inputs: HashMap<InstanceId, ClusteringInput>,
    clustering_threshold_ns: f64,
    clustering_score_without_discriminator: u8,
    clustering_guard_threshold: Option<u8>,
    leap: LeapScheduler,
    /// `(timestamp_processing suspended, leap_second_guard)` last broadcast,
    /// so `tick_timers` only sends `Control` when either actually changes.
    leap_guard_broadcast: (bool, bool),
    timers: TimerSet<TimerKey>,
    sinks: Vec<Box<dyn StatsSink>>,
}

impl Engine {
    pub fn new(
        clocks: Arc<ClockRegistry>,
        interfaces: Arc<InterfaceRegistry>,
        selection_policy: SelectionPolicy,
        selection_holdoff: Duration,
        servo_capacity: usize,
        servo_config: crate::servo::ServoConfig,
        sinks: Vec<Box<dyn StatsSink>>,
    ) -> (Engine, Tx<EngineMessage>, Tx<InstanceToEngine>) {
        let (tx_self, self_rx) = mailbox("engine");
        let (instance_tx, instance_rx) = mailbox("engine-from-instances");
        let servos = (0..servo_capacity + SERVO_POOL_SPARE).map(|_| Servo::new(servo_config)).collect();

        let engine = Engine {
            clocks,
            interfaces,
            instances: HashMap::new(),
            instance_rx,
            self_rx,
            servos,
            servo_assignment: HashMap::new(),
            servo_by_slave: HashMap::new(),
            servo_last_alarms: HashMap::new(),
            servo_last_stats: HashMap::new(),
            selection_policy,
            selected: None,
            pending_selection: None,
            selection_holdoff,
            discriminator: None,
            clustering_inputs: HashMap::new(),
            clustering_threshold_ns: 1_000.0,
            clustering_score_without_discriminator: 1,
            clustering_guard_threshold: None,
            leap: LeapScheduler::new(Duration::from_secs(60), SteppingPolicy::NeverStep),
            leap_guard_broadcast: (false, false),
            timers: TimerSet::new(),
            sinks,
        };
        (engine, tx_self, instance_tx)
    }

    /// Startup sequence per §5: register the timers every build needs,
    /// then let the caller register clocks/instances before calling
    /// [`Engine::run`].
    pub fn start(&mut self, log_stats_period: Duration, save_state_period: Duration, stats_end_period: Duration) {
        self.timers.arm_periodic(TimerKey::LogStats, log_stats_period);
        self.timers.arm_periodic(TimerKey::SaveState, save_state_period);
        self.timers.arm_periodic(TimerKey::StatsEndPeriod, stats_end_period);
        self.timers.arm_periodic(TimerKey::NetlinkRescan, Duration::from_secs(30));
        info!("engine started");
    }

    /// Configures the clustering discriminator (§4.5). `guard_threshold`, if
    /// set, makes instances scoring below it `cannot_be_selected` for the
    /// `CLUSTERING` rule (the optional "clustering guard threshold").
    pub fn configure_clustering(&mut self, discriminator: Option<InstanceId>, threshold_ns: f64, score_without_discriminator: u8, guard_threshold: Option<u8>) {
        self.discriminator = discriminator;
        self.clustering_threshold_ns = threshold_ns;
        self.clustering_score_without_discriminator = score_without_discriminator;
        self.clustering_guard_threshold = guard_threshold;
    }

    pub fn register_instance(&mut self, id: InstanceId, name: String, clock: ClockId, tx: Tx<EngineToInstance>) {
        let servo_index = self.servos.iter().position(|s| !s.is_active());
        if let Some(idx) = servo_index {
            self.servo_assignment.insert(id, idx);
        } else {
            warn!(instance = id.0, "no spare servo available for new instance");
        }
        self.instances.insert(id, InstanceHandle { name, manual_selected: false, clock, last_status: None, tx });
    }

    pub fn unregister_instance(&mut self, id: InstanceId) {
        if let Some(idx) = self.servo_assignment.remove(&id) {
            self.servos[idx].deactivate();
        }
        self.instances.remove(&id);
        if self.selected == Some(id) {
            self.selected = None;
            self.reassign_servos();
        }
    }

    /// Handles one message from the engine's own inbox (`rx_self`, owned by
    /// the caller's run loop so it can be select()ed alongside the
    /// instance-status inbox and the clockfeed subscription).
    pub fn handle_engine_message(&mut self, msg: EngineMessage) {
        match msg {
            EngineMessage::StepClocks => self.synchronize(),
            EngineMessage::ScheduleLeapSecond { leap_type, dry_run } => {
                if let Err(e) = self.leap.schedule(leap_type, SystemTime::now(), dry_run) {
                    warn!(error = %e, "schedule leap second failed");
                }
            }
            EngineMessage::CancelLeapSecond => {
                if let Err(e) = self.leap.cancel() {
                    warn!(error = %e, "cancel leap second failed");
                }
            }
            EngineMessage::SelectInstance { instance } => self.request_selection(instance),
            EngineMessage::ConfigureTestMode { instance, id, p0, p1, p2 } => {
                if let Some(handle) = self.instances.get(&instance) {
                    handle.tx.send_or_log(EngineToInstance::TestMode { id, p0, p1, p2 });
                }
            }
            EngineMessage::RtStatsEntry { instance, text } => {
                info!(instance = instance.0, %text, "real-time stats");
            }
            EngineMessage::LogRotate => {
                for sink in &mut self.sinks {
                    if let Err(e) = sink.flush() {
                        warn!(error = %e, "stats sink flush on rotate failed");
                    }
                }
            }
            EngineMessage::ClusteringInput { instance, offset_ns, clock } => {
                self.clustering_inputs.insert(instance, ClusteringInput { offset_ns, clock });
            }
            EngineMessage::LinkTableRelease => {
                info!("link table release acknowledged");
            }
            EngineMessage::ServoPidAdjust { .. } => {
                // Live gain adjustment is intentionally not wired to a
                // concrete servo field here: ServoConfig is Copy and owned
                // per-servo, so an adjust request would replace the whole
                // config; left for the administrative-control surface to
                // construct explicitly.
            }
            EngineMessage::Shutdown => {
                info!("engine shutdown requested");
            }
        }
    }

    pub fn handle_instance_message(&mut self, msg: InstanceToEngine) {
        match msg {
            InstanceToEngine::StatusReply { instance, status } | InstanceToEngine::StateChanged { instance, status } => {
                if let Some(handle) = self.instances.get_mut(&instance) {
                    handle.last_status = Some(status);
                }
            }
            InstanceToEngine::RtStatsEntry { instance, text } => {
                info!(instance = instance.0, %text, "instance stats");
            }
            InstanceToEngine::ClusteringInput { instance, offset_ns, clock } => {
                self.clustering_inputs.insert(instance, ClusteringInput { offset_ns, clock });
            }
        }
    }

    /// Re-derives which clocks need a servo given the current selection:
    /// the selected instance's clock (the LRC) becomes master for every
    /// other registered clock (§4.9 "committing reconfigures servos").
    /// Called after every selection commit and after hotplug changes the
    /// clock registry's membership.
    pub fn reassign_servos(&mut self) {
        let master = self.selected.and_then(|id| self.instances.get(&id)).map(|h| h.clock);
        let desired: std::collections::HashSet<ClockId> = match master {
            Some(m) => self.clocks.ids().into_iter().filter(|&c| c != m).collect(),
            None => std::collections::HashSet::new(),
        };

        let stale: Vec<ClockId> = self
            .servo_by_slave
            .iter()
            .filter(|(slave, &idx)| !desired.contains(slave) || self.servos[idx].master() != master)
            .map(|(&slave, _)| slave)
            .collect();
        for slave in stale {
            if let Some(idx) = self.servo_by_slave.remove(&slave) {
                self.servos[idx].deactivate();
            }
            self.servo_last_alarms.remove(&slave);
            self.servo_last_stats.remove(&slave);
        }

        let Some(master) = master else { return };
        for slave in desired {
            if self.servo_by_slave.contains_key(&slave) {
                continue;
            }
            let Some(idx) = self.servos.iter().position(|s| !s.is_active()) else {
                warn!(slave = slave.0, "no spare servo to drive newly required clock");
                continue;
            };
            self.servos[idx].activate(master, slave);
            self.servo_by_slave.insert(slave, idx);
        }
    }

    /// One synchronise-pass servo fan-out (§4.9's "clockfeed SYNC_EVENT
    /// drives the synchronise pass"): every active servo reads the tick's
    /// samples, runs its control step against its slave clock, and any
    /// alarm transition is logged.
    pub fn on_clockfeed_event(&mut self, event: FeedEvent) {
        let FeedEvent::SyncEvent { samples } = event;
        let slaves: Vec<ClockId> = self.servo_by_slave.keys().copied().collect();
        for slave in slaves {
            let Some(clock) = self.clocks.get(slave) else { continue };
            let idx = self.servo_by_slave[&slave];
            let Some(master) = self.servos[idx].master().and_then(|m| self.clocks.get(m)) else { continue };
            let stats = self.servos[idx].step(&samples, &*master, &*clock);
            let previous = self.servo_last_alarms.get(&slave).copied().unwrap_or(ServoAlarms::empty());
            if stats.alarms != previous {
                info!(slave = slave.0, ?previous, current = ?stats.alarms, "servo alarm state changed");
                self.servo_last_alarms.insert(slave, stats.alarms);
            }
            self.servo_last_stats.insert(slave, stats);
        }
    }

    pub fn servo_stats(&self, slave: ClockId) -> Option<ServoStats> {
        self.servo_last_stats.get(&slave).copied()
    }

    /// One synchronize pass: run a selection vote, commit after the
    /// holdoff, apply CONTROL to the winner, then run every active servo's
    /// control step.
    pub fn synchronize(&mut self) {
        self.maybe_commit_selection();
        self.run_selection_vote();
    }

    fn run_selection_vote(&mut self) {
        if self.instances.is_empty() {
            return;
        }
        let clocks = Arc::clone(&self.clocks);
        let scores = clustering_scores(
            &self.clustering_inputs,
            self.discriminator,
            |a, b| match (clocks.get(a), clocks.get(b)) {
                (Some(ca), Some(cb)) => match (ca.now(), cb.now()) {
                    (Ok(ta), Ok(tb)) => Some(ta.subtract(tb)),
                    _ => None,
                },
                _ => None,
            },
            self.clustering_threshold_ns,
            self.clustering_score_without_discriminator,
        );

        let guard = self.clustering_guard_threshold;
        let candidates: Vec<Candidate> = self
            .instances
            .iter()
            .filter_map(|(&id, handle)| {
                handle.last_status.clone().map(|mut status| {
                    if let Some(&score) = scores.get(&id) {
                        status.clustering_score = score;
                    }
                    if let Some(threshold) = guard {
                        if status.clustering_score < threshold {
                            status.constraints.cannot_be_selected = true;
                        }
                    }
                    Candidate { id, name: handle.name.clone(), manual_selected: handle.manual_selected, status }
                })
            })
            .collect();
        if candidates.is_empty() {
            return;
        }
        let winner = select_bic(&candidates, &self.selection_policy, self.selected);
        if winner == self.selected {
            // §4.4's holdoff: if the vote reverts to the currently selected
            // instance before the holdoff expires, the timer is cancelled
            // and the pending candidate is dropped rather than committed
            // stale at expiry (S2).
            if self.pending_selection.is_some() {
                self.pending_selection = None;
                self.timers.cancel(&TimerKey::SelectionHoldoff);
                info!("selection vote reverted to current selection, holdoff cancelled");
            }
        } else if self.pending_selection != Some(winner) {
            self.pending_selection = Some(winner);
            self.timers.arm_once(TimerKey::SelectionHoldoff, self.selection_holdoff);
            info!(?winner, "selection vote changed, arming holdoff before commit");
        }
    }

    fn maybe_commit_selection(&mut self) {
        if self.pending_selection.is_none() {
            return;
        }
        if self.timers.is_armed(&TimerKey::SelectionHoldoff) {
            return;
        }
        // Re-run the vote rather than trusting the now-expired
        // `pending_selection` blindly: anything that changed the candidate
        // set without going through `run_selection_vote` in between
        // (there is none today, but this keeps the commit point
        // authoritative rather than the snapshot taken when the holdoff
        // was armed) must not commit a candidate that is no longer
        // preferred.
        self.run_selection_vote();
        if self.timers.is_armed(&TimerKey::SelectionHoldoff) {
            return;
        }
        if let Some(winner) = self.pending_selection.take() {
            self.commit_selection(winner);
        }
    }

    fn request_selection(&mut self, instance: Option<InstanceId>) {
        for handle in self.instances.values_mut() {
            handle.manual_selected = false;
        }
        if let Some(id) = instance {
            if let Some(handle) = self.instances.get_mut(&id) {
                handle.manual_selected = true;
            }
        }
        self.pending_selection = Some(instance);
        self.timers.cancel(&TimerKey::SelectionHoldoff);
        self.commit_selection(instance);
    }

    fn commit_selection(&mut self, winner: Option<InstanceId>) {
        if winner == self.selected {
            return;
        }
        for (&id, handle) in &self.instances {
            let selected = Some(id) == winner;
            handle.tx.send_or_log(EngineToInstance::Control {
                flags: ControlFlags { selected, clock_ctrl: selected, timestamp_processing: true, clustering_determinant: false, leap_second_guard: false },
                mask: ControlMask { selected: true, clock_ctrl: true, timestamp_processing: false, clustering_determinant: false, leap_second_guard: false },
            });
        }
        info!(?winner, previous = ?self.selected, "selection committed");
        self.selected = winner;
        self.reassign_servos();
    }

    /// Advances timers and the leap-second scheduler; called once per
    /// iteration of the caller's event loop after `recv_timeout` returns,
    /// whether due to a message or a timeout.
    pub fn tick_timers(&mut self) {
        let now = SystemTime::now();
        let should_step = self.leap.tick(now);
        // `timestamp_processing` follows the active_pre/active_post states,
        // which now span exactly [T-guard, T+guard]; `leap_second_guard` is
        // driven straight from `guard_active()` rather than reused from
        // that same bool, since the two are conceptually distinct fields
        // in §4.8's control broadcast even though they happen to cover the
        // same window once the state machine transitions are correct.
        let suspend_now = self.leap.timestamp_processing_suspended();
        let guard_now = self.leap.guard_active(now);
        if suspend_now != self.leap_guard_broadcast.0 || guard_now != self.leap_guard_broadcast.1 {
            self.leap_guard_broadcast = (suspend_now, guard_now);
            for handle in self.instances.values() {
                handle.tx.send_or_log(EngineToInstance::Control {
                    flags: ControlFlags {
                        selected: false,
                        clock_ctrl: false,
                        timestamp_processing: !suspend_now,
                        clustering_determinant: false,
                        leap_second_guard: guard_now,
                    },
                    mask: ControlMask { selected: false, clock_ctrl: false, timestamp_processing: true, clustering_determinant: false, leap_second_guard: true },
                });
            }
            info!(suspend = suspend_now, guard = guard_now, "leap second guard window toggled");
        }
        if should_step {
            let sign = match self.leap.leap_type() {
                Some(LeapType::Delete59) => -1i64,
                _ => 1,
            };
            let offset = Timespec::from_nanos(sign, 0);
            for id in self.clocks.ids() {
                if let Some(clock) = self.clocks.get(id) {
                    if let Err(e) = clock.step(offset) {
                        warn!(clock = id.0, error = %e, "leap second step failed");
                    }
                }
            }
        }

        for fired in self.timers.pop_expired() {
            match fired {
                TimerKey::LogStats => self.log_stats(),
                TimerKey::SaveState => {
                    for (_, handle) in &self.instances {
                        handle.tx.send_or_log(EngineToInstance::SaveState);
                    }
                }
                TimerKey::StatsEndPeriod => {
                    for (_, handle) in &self.instances {
                        handle.tx.send_or_log(EngineToInstance::StatsEndPeriod { time: Timespec::ZERO });
                    }
                }
                TimerKey::NetlinkRescan => {
                    let _ = self.interfaces.snapshot();
                    self.reassign_servos();
                }
                TimerKey::SelectionHoldoff => self.maybe_commit_selection(),
            }
        }
    }

    fn log_stats(&mut self) {
        for (&id, handle) in &self.instances {
            if let Some(status) = &handle.last_status {
                let mut fields = std::collections::BTreeMap::new();
                fields.insert("offset_ns", crate::stats::StatValue::Float(status.offset_from_master.unwrap_or(0.0)));
                let entry = StatsEntry { instance: id, name: "sync", time: Timespec::ZERO, fields };
                crate::stats::write_to_all(&mut self.sinks, &entry);
            }
        }
    }

    pub fn selected_instance(&self) -> Option<InstanceId> {
        self.selected
    }

    pub fn clocks(&self) -> &Arc<ClockRegistry> {
        &self.clocks
    }

    /// Drives one `recv_timeout`-scheduled iteration of the main loop,
    /// returning when either inbox yields a message or the shortest timer
    /// expires — matching the single-thread, no-busy-poll scheduling model
    /// every actor in this daemon uses (§4.9).
    pub fn step(&mut self, clockfeed_rx: &Rx<FeedEvent>, timeout_floor: Duration) {
        let deadline = self.timers.time_until_next().map(|d| d.min(timeout_floor)).unwrap_or(timeout_floor);
        match clockfeed_rx.recv_timeout(deadline) {
            Ok(event) => self.on_clockfeed_event(event),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => warn!("clockfeed channel disconnected"),
        }
        for msg in self.instance_rx.try_iter().collect::<Vec<_>>() {
            self.handle_instance_message(msg);
        }
        for msg in self.self_rx.try_iter().collect::<Vec<_>>() {
            self.handle_engine_message(msg);
        }
        self.tick_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockCapabilities, ClockError, HoldFrequency};
    use crate::instance::{Alarms, Constraints, InstanceState};
    use crate::servo::{ClockControlPolicy, ServoGains};

    struct FakeClock(ClockId);
    impl crate::clock::Clock for FakeClock {
        fn id(&self) -> ClockId {
            self.0
        }
        fn short_name(&self) -> &str {
            "fake"
        }
        fn long_name(&self) -> String {
            "fake".into()
        }
        fn now(&self) -> Result<Timespec, ClockError> {
            Ok(Timespec::ZERO)
        }
        fn capabilities(&self) -> ClockCapabilities {
            ClockCapabilities { max_frequency_adjustment_ppb: 1000, max_offset_adjustment_ns: 1000 }
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

    fn servo_config() -> crate::servo::ServoConfig {
        crate::servo::ServoConfig {
            gains: ServoGains { kp: 0.5, ki: 0.1, kd: 0.0 },
            step_threshold_ns: 1_000_000.0,
            policy: ClockControlPolicy::SlewOnly,
            feed_stale_after: Duration::from_secs(1),
        }
    }

    fn status(state: InstanceState) -> InstanceStatus {
        InstanceStatus {
            state,
            alarms: Alarms::empty(),
            constraints: Constraints::default(),
            clock: ClockId(1),
            user_priority: 0,
            offset_from_master: Some(0.0),
            local_accuracy: 0.0,
            master: None,
            clustering_score: 1,
        }
    }

    #[test]
    fn selection_vote_arms_holdoff_before_committing() {
        let clocks = Arc::new(ClockRegistry::new());
        clocks.register(Arc::new(FakeClock(ClockId(1))));
        let interfaces = Arc::new(InterfaceRegistry::new());
        let (mut engine, _tx, _instance_tx) = Engine::new(clocks, interfaces, SelectionPolicy::default(), Duration::from_millis(50), 2, servo_config(), vec![]);

        let (tx, _rx) = mailbox("instance-a");
        engine.register_instance(InstanceId(1), "a".to_string(), ClockId(1), tx);
        engine.instances.get_mut(&InstanceId(1)).unwrap().last_status = Some(status(InstanceState::Slave));

        engine.run_selection_vote();
        assert!(engine.timers.is_armed(&TimerKey::SelectionHoldoff));
        assert_eq!(engine.selected_instance(), None);
    }

    #[test]
    fn holdoff_expiry_commits_pending_selection() {
        let clocks = Arc::new(ClockRegistry::new());
        clocks.register(Arc::new(FakeClock(ClockId(1))));
        let interfaces = Arc::new(InterfaceRegistry::new());
        let (mut engine, _tx, _instance_tx) =
            Engine::new(clocks, interfaces, SelectionPolicy::default(), Duration::from_millis(1), 2, servo_config(), vec![]);

        let (tx, _rx) = mailbox("instance-a");
        engine.register_instance(InstanceId(1), "a".to_string(), ClockId(1), tx);
        engine.instances.get_mut(&InstanceId(1)).unwrap().last_status = Some(status(InstanceState::Slave));

        engine.run_selection_vote();
        std::thread::sleep(Duration::from_millis(5));
        engine.maybe_commit_selection();
        assert_eq!(engine.selected_instance(), Some(InstanceId(1)));
    }

    #[test]
    fn holdoff_is_cancelled_when_vote_reverts_before_expiry() {
        // S2: selected = a. b becomes preferred (lower user_priority) and
        // arms the holdoff; before it expires, a's alarms clear so the
        // vote reverts to a. The holdoff must be cancelled and a must stay
        // selected, not b committed stale at expiry.
        let clocks = Arc::new(ClockRegistry::new());
        clocks.register(Arc::new(FakeClock(ClockId(1))));
        clocks.register(Arc::new(FakeClock(ClockId(2))));
        let interfaces = Arc::new(InterfaceRegistry::new());
        let (mut engine, _tx, _instance_tx) =
            Engine::new(clocks, interfaces, SelectionPolicy::default(), Duration::from_millis(50), 2, servo_config(), vec![]);

        let (tx_a, _rx_a) = mailbox("instance-a");
        let (tx_b, _rx_b) = mailbox("instance-b");
        engine.register_instance(InstanceId(1), "a".to_string(), ClockId(1), tx_a);
        engine.register_instance(InstanceId(2), "b".to_string(), ClockId(2), tx_b);

        let mut a_status = status(InstanceState::Slave);
        a_status.alarms = Alarms::NO_SYNC;
        engine.instances.get_mut(&InstanceId(1)).unwrap().last_status = Some(a_status);
        engine.instances.get_mut(&InstanceId(2)).unwrap().last_status = Some(status(InstanceState::Slave));

        // First vote: a is alarming, b is clean -> b preferred, holdoff armed.
        engine.run_selection_vote();
        assert!(engine.timers.is_armed(&TimerKey::SelectionHoldoff));
        assert_eq!(engine.selected_instance(), None);

        // a's alarm clears before the holdoff expires -> vote reverts to a
        // (the tie-break prefers the lexicographically smaller name when
        // nothing else distinguishes them, and "a" < "b").
        let mut a_clean = status(InstanceState::Slave);
        a_clean.alarms = Alarms::empty();
        engine.instances.get_mut(&InstanceId(1)).unwrap().last_status = Some(a_clean);
        engine.run_selection_vote();
        assert!(!engine.timers.is_armed(&TimerKey::SelectionHoldoff));

        std::thread::sleep(Duration::from_millis(55));
        engine.maybe_commit_selection();
        assert_ne!(engine.selected_instance(), Some(InstanceId(2)));
    }

    #[test]
    fn manual_selection_bypasses_holdoff() {
        let clocks = Arc::new(ClockRegistry::new());
        clocks.register(Arc::new(FakeClock(ClockId(1))));
        let interfaces = Arc::new(InterfaceRegistry::new());
        let (mut engine, _tx, _instance_tx) =
            Engine::new(clocks, interfaces, SelectionPolicy::default(), Duration::from_secs(60), 2, servo_config(), vec![]);

        let (tx, _rx) = mailbox("instance-a");
        engine.register_instance(InstanceId(1), "a".to_string(), ClockId(1), tx);

        engine.request_selection(Some(InstanceId(1)));
        assert_eq!(engine.selected_instance(), Some(InstanceId(1)));
    }

    #[test]
    fn unregister_frees_its_servo_slot() {
        let clocks = Arc::new(ClockRegistry::new());
        let interfaces = Arc::new(InterfaceRegistry::new());
        let (mut engine, _tx, _instance_tx) = Engine::new(clocks, interfaces, SelectionPolicy::default(), Duration::from_millis(50), 1, servo_config(), vec![]);
        let (tx, _rx) = mailbox("instance-a");
        engine.register_instance(InstanceId(1), "a".to_string(), ClockId(1), tx);
        assert!(engine.servo_assignment.contains_key(&InstanceId(1)));
        engine.unregister_instance(InstanceId(1));
        assert!(!engine.servo_assignment.contains_key(&InstanceId(1)));
    }
}
