//! PPS source abstraction (§4.2 "PPS sourcing"): either the PTP device's own
//! external-timestamp channel (`DEV_PTP`) or a paired `/sys/class/pps/*`
//! character device (`DEV_PPS`), polled with `PPS_FETCH`.

use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use super::ffi::{self, PtpExttsEvent, PtpExttsRequest};
use super::pps_ffi::{self, PpsFdata, PPS_CAPTUREASSERT};
use super::{PhcSampleError, PpsSourceKind};
use crate::helper::HelperClient;
use crate::time::Timespec;

const NANOS_PER_SEC: u32 = 1_000_000_000;

pub enum PpsSource {
    DevPtp { ptp_fd: RawFd, channel: u32 },
    DevPps { fd: OwnedFd },
}

impl PpsSource {
    /// Enables external-timestamp capture on `channel` of the already-open
    /// PHC fd; edges are then read back out of the same fd as
    /// `ptp_extts_event` records.
    pub fn open_dev_ptp(ptp_fd: RawFd, channel: u32) -> Result<PpsSource, PhcSampleError> {
        let req = PtpExttsRequest {
            index: channel,
            flags: ffi::PTP_ENABLE_FEATURE | ffi::PTP_RISING_EDGE,
            rsv: [0; 2],
        };
        unsafe { ffi::ptp_extts_request(ptp_fd, &req) }.map_err(PhcSampleError::from_errno)?;
        Ok(PpsSource::DevPtp { ptp_fd, channel })
    }

    /// Finds the `/sys/class/pps/*` device named `ptp{phc_index}.ext` (or,
    /// for the vendor extension, the internal device's sibling named
    /// `sfc`/`xlnx`) and opens its `/dev/ppsN` node via the helper.
    pub fn open_dev_pps(phc_index: u32, helper: &HelperClient) -> Result<PpsSource, PhcSampleError> {
        let want_name = format!("ptp{phc_index}.ext");
        let dev_number = find_pps_device(&want_name)
            .or_else(|| find_pps_device_by_vendor_suffix())
            .ok_or(PhcSampleError::Unsupported)?;

        let path = format!("/dev/pps{dev_number}");
        let fd = helper.open_dev(&path).map_err(PhcSampleError::Helper)?;
        Ok(PpsSource::DevPps { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Returns `Some(edge_offset)` if a new PPS edge is available within
    /// `timeout`, `None` if the window elapsed with no edge.
    ///
    /// The offset reported is `(phc - system)` at the instant of the edge:
    /// the edge's whole seconds come from a `READ_TIME`-style sample
    /// (seconds are never ambiguous across an edge), its nanoseconds are
    /// `10^9 - edge_nsec` (the edge timestamp records *time since the
    /// second started counting down to it*, wrapping the second when
    /// `edge_nsec` is itself ~0), per §4.2.
    pub fn poll_edge(&mut self, timeout: Duration) -> Result<Option<Timespec>, PhcSampleError> {
        match self {
            PpsSource::DevPtp { ptp_fd, .. } => self.poll_dev_ptp_edge(*ptp_fd, timeout),
            PpsSource::DevPps { fd } => poll_dev_pps_edge(fd.as_raw_fd(), timeout),
        }
    }

    fn poll_dev_ptp_edge(&self, ptp_fd: RawFd, timeout: Duration) -> Result<Option<Timespec>, PhcSampleError> {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(ptp_fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        match poll(&mut fds, timeout_ms).map_err(PhcSampleError::from_errno)? {
            0 => Ok(None),
            _ => {
                let mut event = PtpExttsEvent::default();
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(
                        &mut event as *mut PtpExttsEvent as *mut u8,
                        std::mem::size_of::<PtpExttsEvent>(),
                    )
                };
                let n = nix::unistd::read(ptp_fd, buf).map_err(PhcSampleError::from_errno)?;
                if n != buf.len() {
                    return Ok(None);
                }
                Ok(Some(edge_to_offset(event.t.sec, event.t.nsec)))
            }
        }
    }
}

fn poll_dev_pps_edge(fd: RawFd, timeout: Duration) -> Result<Option<Timespec>, PhcSampleError> {
    let mut data = PpsFdata::default();
    data.timeout.sec = timeout.as_secs() as i64;
    data.timeout.nsec = timeout.subsec_nanos() as i32;
    // A zero `timeout` with both fields zero means "block indefinitely" in
    // the kernel ABI; a prior, still-unconsumed edge is reported
    // immediately either way, so a zero-duration caller still gets a
    // nonblocking poll in practice because `PPS_FETCH` never blocks past an
    // already-pending sequence number.
    match unsafe { pps_ffi::pps_fetch(fd, &mut data) } {
        Ok(_) => {
            let assert = data.info.assert_tu;
            Ok(Some(edge_to_offset(assert.sec, assert.nsec.max(0) as u32)))
        }
        Err(nix::errno::Errno::ETIMEDOUT) | Err(nix::errno::Errno::EAGAIN) => Ok(None),
        Err(e) => Err(PhcSampleError::from_errno(e)),
    }
}

fn edge_to_offset(edge_sec: i64, edge_nsec: u32) -> Timespec {
    let _ = PPS_CAPTUREASSERT;
    let (sec, nsec) = if edge_nsec == 0 {
        (edge_sec, 0)
    } else {
        (edge_sec, NANOS_PER_SEC - edge_nsec)
    };
    Timespec::new(sec, nsec, 0)
}

fn find_pps_device(want_name: &str) -> Option<u32> {
    let entries = fs::read_dir("/sys/class/pps").ok()?;
    for entry in entries.flatten() {
        let name_path = entry.path().join("name");
        if let Ok(name) = fs::read_to_string(&name_path) {
            if name.trim() == want_name {
                return parse_pps_number(&entry.file_name().to_string_lossy());
            }
        }
    }
    None
}

/// Vendor extension: an internal PHC device followed by a second
/// `/sys/class/pps/*` entry named `sfc` or `xlnx`.
fn find_pps_device_by_vendor_suffix() -> Option<u32> {
    let entries = fs::read_dir("/sys/class/pps").ok()?;
    for entry in entries.flatten() {
        let name_path = entry.path().join("name");
        if let Ok(name) = fs::read_to_string(&name_path) {
            let name = name.trim();
            if name == "sfc" || name == "xlnx" {
                return parse_pps_number(&entry.file_name().to_string_lossy());
            }
        }
    }
    None
}

fn parse_pps_number(device_name: &str) -> Option<u32> {
    device_name.strip_prefix("pps")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_with_zero_sub_second_does_not_wrap() {
        let ts = edge_to_offset(100, 0);
        assert_eq!(ts.sec, 100);
        assert_eq!(ts.nsec, 0);
    }

    #[test]
    fn edge_offset_is_complement_of_sub_second_part() {
        let ts = edge_to_offset(100, 400_000_000);
        assert_eq!(ts.sec, 100);
        assert_eq!(ts.nsec, 600_000_000);
    }

    #[test]
    fn parses_pps_device_number() {
        assert_eq!(parse_pps_number("pps0"), Some(0));
        assert_eq!(parse_pps_number("pps12"), Some(12));
        assert_eq!(parse_pps_number("ppsx"), None);
    }
}
