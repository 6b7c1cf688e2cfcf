//! Raw `/dev/ptpN` structures and ioctls.
//!
//! `libc` does not carry the PTP clock ioctl surface (it lives in
//! `linux/ptp_clock.h`, not any POSIX or glibc header), so this module
//! defines the handful of structures and ioctl numbers this crate needs by
//! hand, following the same fixed-size-struct-plus-raw-ioctl style the
//! teacher crate uses for its own kernel ABI (`ffi::bindings` /
//! `ffi::syscall`). Ioctl numbers themselves are generated with
//! `nix::ioctl_*!`, which is the idiomatic alternative to hand-computing the
//! `_IOC` bit layout.

#![allow(dead_code)]

use nix::{ioctl_read, ioctl_readwrite, ioctl_write_int, ioctl_write_ptr};

pub const PTP_MAX_SAMPLES: usize = 25;

const PTP_CLK_MAGIC: u8 = b'=';

/// `struct ptp_clock_time` — a PHC-domain timestamp as reported by the
/// kernel's PTP ioctls. Distinct from [`crate::time::Timespec`]: this is the
/// wire shape, converted to `Timespec` immediately after each ioctl.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PtpClockTime {
    pub sec: i64,
    pub nsec: u32,
    pub reserved: u32,
}

impl PtpClockTime {
    pub fn to_timespec(self) -> crate::time::Timespec {
        crate::time::Timespec::new(self.sec, self.nsec, 0)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PtpClockCaps {
    pub max_adj: i32,
    pub n_alarm: i32,
    pub n_ext_ts: i32,
    pub n_per_out: i32,
    pub pps: i32,
    pub n_pins: i32,
    pub cross_timestamping: i32,
    pub adjust_phase: i32,
    pub max_phase_adj: i32,
    pub rsv: [i32; 11],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PtpExttsRequest {
    pub index: u32,
    pub flags: u32,
    pub rsv: [u32; 2],
}

pub const PTP_ENABLE_FEATURE: u32 = 1 << 0;
pub const PTP_RISING_EDGE: u32 = 1 << 1;
pub const PTP_FALLING_EDGE: u32 = 1 << 2;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PtpExttsEvent {
    pub t: PtpClockTime,
    pub index: u32,
    pub flags: u32,
    pub rsv: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpSysOffset {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    pub ts: [PtpClockTime; 2 * PTP_MAX_SAMPLES + 1],
}

impl Default for PtpSysOffset {
    fn default() -> Self {
        PtpSysOffset { n_samples: 0, rsv: [0; 3], ts: [PtpClockTime::default(); 2 * PTP_MAX_SAMPLES + 1] }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PtpSysOffsetPrecise {
    pub device: PtpClockTime,
    pub sys_realtime: PtpClockTime,
    pub sys_monoraw: PtpClockTime,
    pub rsv: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpSysOffsetExtended {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    /// `[sample][0]` = sys_before, `[sample][1]` = device, `[sample][2]` = sys_after.
    pub ts: [[PtpClockTime; 3]; PTP_MAX_SAMPLES],
}

impl Default for PtpSysOffsetExtended {
    fn default() -> Self {
        PtpSysOffsetExtended { n_samples: 0, rsv: [0; 3], ts: [[PtpClockTime::default(); 3]; PTP_MAX_SAMPLES] }
    }
}

pub const PTP_PF_NONE: u32 = 0;
pub const PTP_PF_EXTTS: u32 = 1;
pub const PTP_PF_PEROUT: u32 = 2;
pub const PTP_PF_PHYSYNC: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtpPinDesc {
    pub name: [u8; 64],
    pub index: u32,
    pub func: u32,
    pub chan: u32,
    pub rsv: [u32; 5],
}

impl Default for PtpPinDesc {
    fn default() -> Self {
        PtpPinDesc { name: [0; 64], index: 0, func: 0, chan: 0, rsv: [0; 5] }
    }
}

ioctl_read!(ptp_clock_getcaps, PTP_CLK_MAGIC, 1, PtpClockCaps);
ioctl_write_ptr!(ptp_extts_request, PTP_CLK_MAGIC, 2, PtpExttsRequest);
ioctl_write_int!(ptp_enable_pps, PTP_CLK_MAGIC, 4);
ioctl_write_ptr!(ptp_sys_offset, PTP_CLK_MAGIC, 5, PtpSysOffset);
ioctl_readwrite!(ptp_pin_getfunc, PTP_CLK_MAGIC, 6, PtpPinDesc);
ioctl_write_ptr!(ptp_pin_setfunc, PTP_CLK_MAGIC, 7, PtpPinDesc);
ioctl_readwrite!(ptp_sys_offset_precise, PTP_CLK_MAGIC, 8, PtpSysOffsetPrecise);
ioctl_readwrite!(ptp_sys_offset_extended, PTP_CLK_MAGIC, 9, PtpSysOffsetExtended);

/// `FD_TO_CLOCKID(fd)`, the kernel's convention for deriving a `clockid_t`
/// from an open PHC file descriptor (`#define CLOCKFD 3` in
/// `linux/posix-timers.h`; see `clock_gettime(2)`'s "dynamic clocks"
/// section).
pub fn fd_to_clockid(fd: std::os::fd::RawFd) -> libc::clockid_t {
    const CLOCKFD: libc::clockid_t = 3;
    ((!(fd as libc::clockid_t)) << 3) | CLOCKFD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_to_clockid_matches_known_values() {
        // Values cross-checked against linuxptp's phc_open(): fd 3 -> -29.
        assert_eq!(fd_to_clockid(3), -29);
    }
}
