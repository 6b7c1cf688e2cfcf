//! PHC-backed [`Clock`]: wraps a [`PhcHandle`], exposing the same interface
//! the system clock does so servos and the selection engine never need to
//! know which kind of clock they're driving.

use std::sync::Mutex;

use nix::time::{clock_gettime, ClockId as NixClockId};

use super::{Clock, ClockCapabilities, ClockError, ClockId, HoldFrequency};
use crate::phc::PhcHandle;
use crate::time::Timespec;

const PPM_SCALE: f64 = 65536.0;

pub struct PhcClock {
    id: ClockId,
    name: String,
    handle: Mutex<PhcHandle>,
}

impl PhcClock {
    pub fn new(id: ClockId, handle: PhcHandle) -> PhcClock {
        let name = format!("phc{}", handle.phc_index());
        PhcClock { id, name, handle: Mutex::new(handle) }
    }

    /// Tell the underlying [`PhcHandle`] a step just happened, so its next
    /// sample is not reported against pre-step state (§4.2).
    pub fn record_step(&self) {
        self.handle.lock().unwrap().record_step();
    }

    fn adjtime(&self, timex: &mut libc::timex) -> Result<(), ClockError> {
        let posix_clockid = self.handle.lock().unwrap().posix_clockid;
        let rc = unsafe { libc::clock_adjtime(posix_clockid, timex) };
        if rc == -1 {
            Err(ClockError::Errno(nix::errno::Errno::last()))
        } else {
            Ok(())
        }
    }
}

impl Clock for PhcClock {
    fn id(&self) -> ClockId {
        self.id
    }

    fn short_name(&self) -> &str {
        &self.name
    }

    fn long_name(&self) -> String {
        format!("PTP hardware clock /dev/ptp{}", self.handle.lock().unwrap().phc_index())
    }

    fn now(&self) -> Result<Timespec, ClockError> {
        let clockid = self.handle.lock().unwrap().posix_clockid;
        let ts = clock_gettime(NixClockId::from_raw(clockid)).map_err(ClockError::Errno)?;
        Ok(Timespec::from_nanos(ts.tv_sec(), ts.tv_nsec() as i64))
    }

    fn capabilities(&self) -> ClockCapabilities {
        let caps = self.handle.lock().unwrap().caps;
        ClockCapabilities { max_frequency_adjustment_ppb: caps.max_adj_ppb, max_offset_adjustment_ns: i64::MAX }
    }

    fn step(&self, offset: Timespec) -> Result<Timespec, ClockError> {
        let mut timex: libc::timex = unsafe { std::mem::zeroed() };
        timex.modes = libc::ADJ_SETOFFSET | libc::MOD_NANO;
        timex.time.tv_sec = offset.sec as _;
        timex.time.tv_usec = offset.nsec as _;
        self.adjtime(&mut timex)?;
        self.record_step();
        self.now()
    }

    fn set_frequency(&self, freq_ppb: f64, hold: HoldFrequency) -> Result<(), ClockError> {
        let mut timex: libc::timex = unsafe { std::mem::zeroed() };
        timex.modes = match hold {
            HoldFrequency::Enable => libc::MOD_FREQUENCY | libc::MOD_STATUS,
            HoldFrequency::Disable => libc::MOD_FREQUENCY,
        };
        timex.freq = (freq_ppb / 1000.0 * PPM_SCALE) as libc::c_long;
        timex.status |= libc::STA_FREQHOLD;
        self.adjtime(&mut timex)
    }

    fn get_frequency(&self) -> Result<f64, ClockError> {
        let mut timex: libc::timex = unsafe { std::mem::zeroed() };
        self.adjtime(&mut timex)?;
        Ok(timex.freq as f64 / PPM_SCALE * 1000.0)
    }

    fn disable_kernel_ntp_algorithm(&self) -> Result<(), ClockError> {
        let mut timex: libc::timex = unsafe { std::mem::zeroed() };
        timex.modes = libc::MOD_STATUS;
        timex.status &= !(libc::STA_PLL | libc::STA_FLL | libc::STA_PPSTIME | libc::STA_PPSFREQ);
        match self.adjtime(&mut timex) {
            Ok(()) => Ok(()),
            // Many PHC drivers never implement a PLL/PPS discipline loop at
            // all; reporting that as success (rather than propagating
            // EOPNOTSUPP) matches the system clock's behaviour on hosts
            // without PPS hardware.
            Err(ClockError::Errno(nix::errno::Errno::EOPNOTSUPP)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn set_leap_second_pending(&self, _insert: bool) -> Result<(), ClockError> {
        // PHCs run free of UTC leap-second bookkeeping; only the system
        // clock's kernel timekeeping needs the STA_INS/STA_DEL dance.
        Ok(())
    }

    fn clear_leap_second_pending(&self) -> Result<(), ClockError> {
        Ok(())
    }
}
