//! Configuration surface **[AMBIENT]**: plain, owned, `Default`-implementing
//! structs the caller builds (by hand, or by parsing a file in a separate
//! crate outside this one's scope) and hands to [`build_engine`] or the
//! individual component constructors directly. Nothing here touches a file
//! system or config-file format — that parsing step is explicitly out of
//! scope, matching the same "external collaborator reached only through its
//! interface" treatment the netlink reader and ACL matcher get.

use std::path::PathBuf;
use std::time::Duration;

use crate::ntp::{Daemon, Mode};
use crate::select::{SelectionPolicy, SelectionStrategy};
use crate::servo::ServoConfig;

/// Selection engine configuration: the BIC policy plus the holdoff applied
/// before a new winner is committed (§4.4, §4.9).
#[derive(Clone, Debug)]
pub struct SelectionConfig {
    pub policy: SelectionPolicy,
    pub holdoff: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig { policy: SelectionPolicy::default(), holdoff: Duration::from_secs(10) }
    }
}

/// Clustering discriminator configuration (§4.5). `discriminator` names the
/// instance whose offset every other instance's grandmaster gap is measured
/// against; `None` disables clustering scoring (every instance then scores
/// `score_without_discriminator`).
#[derive(Clone, Copy, Debug, Default)]
pub struct ClusteringConfig {
    pub discriminator: Option<crate::instance::InstanceId>,
    pub threshold_ns: f64,
    pub score_without_discriminator: u8,
    pub guard_threshold: Option<u8>,
}

/// Leap-second scheduler configuration (§4.8).
#[derive(Clone, Copy, Debug)]
pub struct LeapSecondConfig {
    pub guard_interval: Duration,
    pub stepping_policy: crate::leap::SteppingPolicy,
}

impl Default for LeapSecondConfig {
    fn default() -> Self {
        LeapSecondConfig { guard_interval: Duration::from_secs(60), stepping_policy: crate::leap::SteppingPolicy::NeverStep }
    }
}

/// Privileged helper configuration (§4.1). `helper_path` set spawns the
/// `sfptpd-helper` child over a fresh socketpair; left `None`, every
/// privileged operation is serviced directly in-process (the daemon must
/// then already be running with sufficient privilege).
#[derive(Clone, Debug, Default)]
pub struct HelperConfig {
    pub helper_path: Option<PathBuf>,
}

/// One configured NTP/chrony sync instance (§4.7).
#[derive(Clone, Debug)]
pub struct NtpModuleConfig {
    pub name: String,
    pub daemon: Daemon,
    pub mode: Mode,
    pub ignore_clock_ctrl_conflict: bool,
    pub poll_period: Duration,
}

impl Default for NtpModuleConfig {
    fn default() -> Self {
        NtpModuleConfig {
            name: "ntp0".to_string(),
            daemon: Daemon::Ntpd,
            mode: Mode::Active,
            ignore_clock_ctrl_conflict: false,
            poll_period: Duration::from_secs(1),
        }
    }
}

/// Periods for the engine's housekeeping timers (§4.9).
#[derive(Clone, Copy, Debug)]
pub struct TimerConfig {
    pub log_stats_period: Duration,
    pub save_state_period: Duration,
    pub stats_end_period: Duration,
    pub clockfeed_period: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            log_stats_period: Duration::from_secs(1),
            save_state_period: Duration::from_secs(60),
            stats_end_period: Duration::from_secs(60),
            clockfeed_period: Duration::from_millis(125),
        }
    }
}

/// Top-level configuration the `sfptpd` binary assembles before starting
/// the engine. Every field is a plain owned type so a caller (this crate's
/// `main.rs`, or a test) can build one by hand without touching a parser.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub selection: SelectionConfig,
    pub clustering: ClusteringConfig,
    pub leap: LeapSecondConfig,
    pub helper: HelperConfig,
    pub ntp_instances: Vec<NtpModuleConfig>,
    pub servo: ServoConfig,
    pub timers: TimerConfig,
    /// Number of actively-disciplined clocks to size the servo pool for,
    /// before [`crate::engine::SERVO_POOL_SPARE`] spares are added (§5).
    pub servo_capacity: usize,
}
