//! Raw `/dev/ppsN` structures and ioctls (`linux/pps.h`), used by the `DEV_PPS`
//! PPS source described in §4.2.

#![allow(dead_code)]

use nix::ioctl_readwrite;

const PPS_IOC_MAGIC: u8 = b'1';

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PpsKtime {
    pub sec: i64,
    pub nsec: i32,
    pub flags: u32,
}

impl PpsKtime {
    pub fn to_timespec(self) -> crate::time::Timespec {
        crate::time::Timespec::new(self.sec, self.nsec.max(0) as u32, 0)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PpsKinfo {
    pub assert_sequence: u32,
    pub clear_sequence: u32,
    pub assert_tu: PpsKtime,
    pub clear_tu: PpsKtime,
    pub current_mode: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PpsFdata {
    pub info: PpsKinfo,
    pub timeout: PpsKtime,
}

/// `PPS_CAPTUREASSERT`, the only edge mode this daemon requests.
pub const PPS_CAPTUREASSERT: i32 = 0x01;

// `_IOWR('1', 0xa4, struct pps_fdata)` in the kernel header; nix's macro
// takes the ioctl sequence number as a plain integer.
ioctl_readwrite!(pps_fetch, PPS_IOC_MAGIC, 0xa4, PpsFdata);
