//! Per-method sampling and the smallest-window rule shared by the three
//! windowed methods (`SYS_OFFSET_EXTENDED`, `SYS_OFFSET`, `READ_TIME`), per
//! §4.2.

use std::os::fd::RawFd;

use nix::time::{clock_gettime, ClockId};

use crate::phc::ffi::{self, PtpSysOffset, PtpSysOffsetExtended, PtpSysOffsetPrecise};
use crate::phc::PhcSampleError;
use crate::time::Timespec;

/// One `(sys_before, device, sys_after)` triple as read from the kernel or
/// sampled in user space.
#[derive(Clone, Copy, Debug)]
pub struct Triple {
    pub sys_before: Timespec,
    pub device: Timespec,
    pub sys_after: Timespec,
}

/// The smallest-window rule from §4.2: among all candidate triples, pick the
/// one with the smallest positive `sys_after - sys_before` window and report
/// `(device - sys_before) - window/2` as the offset. Returns `NotReady`
/// (mapped to `EAGAIN`) if no triple has a strictly positive window.
pub fn smallest_window(triples: impl IntoIterator<Item = Triple>) -> Result<(Timespec, Timespec), PhcSampleError> {
    let mut best: Option<(Timespec, Timespec)> = None; // (offset, window)

    for t in triples {
        let window = t.sys_after.subtract(t.sys_before);
        if window.sec < 0 || (window.sec == 0 && window.nsec == 0 && window.nsec_frac == 0) {
            continue; // not positive
        }
        if best.is_none() || window < best.unwrap().1 {
            let half = Timespec::from_nanos_f64(window.as_nanos_f64() / 2.0);
            let offset = t.device.subtract(t.sys_before).subtract(half);
            best = Some((offset, window));
        }
    }

    best.ok_or(PhcSampleError::NotReady)
}

pub fn sample_sys_offset_precise(fd: RawFd) -> Result<Timespec, PhcSampleError> {
    let mut arg = PtpSysOffsetPrecise::default();
    unsafe { ffi::ptp_sys_offset_precise(fd, &mut arg) }.map_err(PhcSampleError::from_errno)?;
    Ok(arg.device.to_timespec().subtract(arg.sys_realtime.to_timespec()))
}

pub fn sample_sys_offset_extended(fd: RawFd) -> Result<Timespec, PhcSampleError> {
    let mut arg = PtpSysOffsetExtended { n_samples: ffi::PTP_MAX_SAMPLES as u32, ..Default::default() };
    unsafe { ffi::ptp_sys_offset_extended(fd, &mut arg) }.map_err(PhcSampleError::from_errno)?;

    let n = (arg.n_samples as usize).min(ffi::PTP_MAX_SAMPLES);
    let triples = arg.ts[..n].iter().map(|row| Triple {
        sys_before: row[0].to_timespec(),
        device: row[1].to_timespec(),
        sys_after: row[2].to_timespec(),
    });
    let (offset, _window) = smallest_window(triples)?;
    Ok(offset)
}

pub fn sample_sys_offset(fd: RawFd) -> Result<Timespec, PhcSampleError> {
    let mut arg = PtpSysOffset { n_samples: ffi::PTP_MAX_SAMPLES as u32, ..Default::default() };
    // `PTP_SYS_OFFSET` is declared `_IOW` in the kernel header for historical
    // reasons, but the driver still writes the filled samples back through
    // the same pointer; we read `arg` again below once the ioctl returns.
    unsafe { ffi::ptp_sys_offset(fd, &arg) }.map_err(PhcSampleError::from_errno)?;

    let n = (arg.n_samples as usize).min(ffi::PTP_MAX_SAMPLES);
    let triples = (0..n).map(|i| Triple {
        sys_before: arg.ts[2 * i].to_timespec(),
        device: arg.ts[2 * i + 1].to_timespec(),
        sys_after: arg.ts[2 * i + 2].to_timespec(),
    });
    let (offset, _window) = smallest_window(triples)?;
    Ok(offset)
}

/// Four user-space `(sys_before, phc, sys_after)` samples, per §4.2's
/// `READ_TIME` method — the fallback of last resort when the kernel offers
/// none of the ioctl-based methods.
pub fn sample_read_time(clockid: libc::clockid_t) -> Result<Timespec, PhcSampleError> {
    const ROUNDS: usize = 4;
    let clock = ClockId::from_raw(clockid);
    let realtime = ClockId::CLOCK_REALTIME;

    let mut triples = Vec::with_capacity(ROUNDS);
    for _ in 0..ROUNDS {
        let sys_before = clock_gettime(realtime).map_err(PhcSampleError::from_errno)?;
        let device = clock_gettime(clock).map_err(PhcSampleError::from_errno)?;
        let sys_after = clock_gettime(realtime).map_err(PhcSampleError::from_errno)?;
        triples.push(Triple {
            sys_before: Timespec::from_nanos(sys_before.tv_sec(), sys_before.tv_nsec() as i64),
            device: Timespec::from_nanos(device.tv_sec(), device.tv_nsec() as i64),
            sys_after: Timespec::from_nanos(sys_after.tv_sec(), sys_after.tv_nsec() as i64),
        });
    }
    let (offset, _window) = smallest_window(triples)?;
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(sec: i64, nsec: u32) -> Timespec {
        Timespec::new(sec, nsec, 0)
    }

    #[test]
    fn picks_smallest_positive_window() {
        let triples = vec![
            Triple { sys_before: ts(100, 0), device: ts(100, 100), sys_after: ts(100, 500) },
            Triple { sys_before: ts(100, 0), device: ts(100, 120), sys_after: ts(100, 200) },
        ];
        let (offset, window) = smallest_window(triples).unwrap();
        assert_eq!(window, ts(0, 200));
        // midpoint of the winning triple is 100.000_000_100; device is
        // 100.000_000_120, so offset should be +20ns.
        assert_eq!(offset, ts(0, 20));
    }

    #[test]
    fn no_positive_window_is_not_ready() {
        let triples = vec![Triple { sys_before: ts(5, 0), device: ts(5, 0), sys_after: ts(4, 0) }];
        assert!(matches!(smallest_window(triples), Err(PhcSampleError::NotReady)));
    }

    #[test]
    fn offset_within_half_window_of_midpoint() {
        let t = Triple { sys_before: ts(0, 0), device: ts(0, 300), sys_after: ts(0, 1000) };
        let (offset, window) = smallest_window(vec![t]).unwrap();
        let half_window_ns = window.as_nanos_f64() / 2.0;
        assert!(offset.as_nanos_f64().abs() <= half_window_ns + 1e-6);
    }
}
