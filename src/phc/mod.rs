//! Physical Hardware Clock abstraction (C3).
//!
//! Opens `/dev/ptpN`, probes which of the comparison methods in §4.2 the
//! device and kernel actually support, and produces `(phc - system)` offset
//! samples from whichever method is currently active — falling back through
//! the configured order when the active one starts failing. Also drives
//! hardware PPS, either through the PHC's own external-timestamp channel or
//! through a paired `/dev/ppsN` device.

pub mod ffi;
mod methods;
pub mod pps;
pub mod pps_ffi;

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use tracing::{debug, info, warn};

use crate::helper::{HelperClient, HelperRpcError};
use crate::time::Timespec;

pub const MAX_DIFF_METHODS: usize = 6;

/// The comparison methods from §4.2, in the order they are tried by
/// default. A deployment may reorder or omit entries via
/// [`PhcOpenOptions::method_order`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DiffMethod {
    SysOffsetPrecise,
    Efx,
    Pps,
    SysOffsetExtended,
    SysOffset,
    ReadTime,
}

impl DiffMethod {
    pub const DEFAULT_ORDER: [DiffMethod; 6] = [
        DiffMethod::SysOffsetPrecise,
        DiffMethod::Efx,
        DiffMethod::Pps,
        DiffMethod::SysOffsetExtended,
        DiffMethod::SysOffset,
        DiffMethod::ReadTime,
    ];
}

#[derive(thiserror::Error, Debug)]
pub enum PhcSampleError {
    /// Transient: `EAGAIN`. The caller should skip this tick, not advance
    /// the method cursor.
    #[error("phc sample not ready")]
    NotReady,
    /// The active method is not supported by this device/kernel; the caller
    /// should advance to the next configured method.
    #[error("phc comparison method unsupported")]
    Unsupported,
    /// Every configured method has been exhausted.
    #[error("no phc comparison method available")]
    NoMethodAvailable,
    #[error("phc ioctl failed: {0}")]
    Io(#[from] nix::errno::Errno),
    #[error("privileged helper rpc failed: {0}")]
    Helper(#[from] HelperRpcError),
}

impl PhcSampleError {
    pub fn from_errno(e: nix::errno::Errno) -> Self {
        match e {
            nix::errno::Errno::EAGAIN => PhcSampleError::NotReady,
            nix::errno::Errno::EOPNOTSUPP | nix::errno::Errno::ENOTTY | nix::errno::Errno::EINVAL => {
                PhcSampleError::Unsupported
            }
            other => PhcSampleError::Io(other),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PhcOpenError {
    #[error("privileged helper rpc failed: {0}")]
    Helper(#[from] HelperRpcError),
    #[error("failed to read phc capabilities: {0}")]
    GetCaps(#[source] nix::errno::Errno),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PhcCaps {
    pub max_adj_ppb: i64,
    pub n_ext_ts: i32,
    pub pps: bool,
    pub cross_timestamping: bool,
}

/// PPS source selection, per §4.2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PpsSourceKind {
    DevPtp,
    DevPps,
}

/// Internal "is the PPS edge still arriving" tracker. `Pps` is demoted out of
/// the active-method rotation once a full second passes with no edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SynthPpsState {
    Ready,
    NotReady,
    Bad,
}

/// A vendor-specific diff method (`EFX`), registered once at startup via
/// [`PhcHandle::define_diff_method`]. Not set by default: no vendor adapter
/// is linked in, so `Efx` behaves as `Unsupported` until a caller registers
/// one.
pub type EfxSampler = Arc<dyn Fn(RawFd) -> Result<Timespec, PhcSampleError> + Send + Sync>;

/// An open PHC device and the state needed to run the method-fallback state
/// machine across calls (§9's "coroutine-like control flow ... expressed as
/// a state carried across calls").
pub struct PhcHandle {
    phc_index: u32,
    fd: RawFd,
    // Keeps the underlying fd (and the helper-opened resource it
    // represents) alive for as long as the handle exists.
    _owned_fd: Arc<OwnedRawFd>,
    pub posix_clockid: libc::clockid_t,
    pub caps: PhcCaps,

    ordered_methods: ArrayVec<DiffMethod, MAX_DIFF_METHODS>,
    cursor: usize,
    active_method: Option<DiffMethod>,
    efx_sampler: Option<EfxSampler>,

    stepped_since_sample: bool,

    pps_source: Option<pps::PpsSource>,
    synth_pps_state: SynthPpsState,
    pps_last_edge_seen: Option<Instant>,
}

/// Closes the raw fd on drop; kept out of `PhcHandle` itself so it can be
/// shared into the PPS source without double-closing.
struct OwnedRawFd(RawFd);
impl Drop for OwnedRawFd {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.0);
    }
}

#[derive(Clone, Debug)]
pub struct PhcOpenOptions {
    pub method_order: ArrayVec<DiffMethod, MAX_DIFF_METHODS>,
    pub pps_source_order: ArrayVec<PpsSourceKind, 2>,
    pub extts_channel: u32,
}

impl Default for PhcOpenOptions {
    fn default() -> Self {
        let mut pps_source_order = ArrayVec::new();
        pps_source_order.push(PpsSourceKind::DevPps);
        pps_source_order.push(PpsSourceKind::DevPtp);
        PhcOpenOptions {
            method_order: DiffMethod::DEFAULT_ORDER.into_iter().collect(),
            pps_source_order,
            extts_channel: 0,
        }
    }
}

impl PhcHandle {
    /// Open `/dev/ptp{phc_index}` through the privileged helper (or
    /// in-process when unconfigured, per §4.1's fallback), read its
    /// capabilities, and pre-filter the configured method order down to
    /// methods the device/kernel claim to support.
    pub fn open(phc_index: u32, helper: &HelperClient, opts: &PhcOpenOptions) -> Result<PhcHandle, PhcOpenError> {
        let path = format!("/dev/ptp{phc_index}");
        let fd = helper.open_dev(&path)?;
        let owned = Arc::new(OwnedRawFd(fd));

        let mut raw_caps = ffi::PtpClockCaps::default();
        unsafe { ffi::ptp_clock_getcaps(fd, &mut raw_caps) }.map_err(PhcOpenError::GetCaps)?;

        #[cfg(target_pointer_width = "32")]
        let max_adj_ppb = crate::time::clamp_max_adj_ppb_32bit(raw_caps.max_adj as i64 * 1000);
        #[cfg(not(target_pointer_width = "32"))]
        let max_adj_ppb = raw_caps.max_adj as i64 * 1000;

        let caps = PhcCaps {
            max_adj_ppb,
            n_ext_ts: raw_caps.n_ext_ts,
            pps: raw_caps.pps != 0,
            cross_timestamping: raw_caps.cross_timestamping != 0,
        };

        let ordered_methods: ArrayVec<DiffMethod, MAX_DIFF_METHODS> = opts
            .method_order
            .iter()
            .copied()
            .filter(|m| method_plausible_at_open(*m, &caps))
            .collect();

        info!(phc_index, ?ordered_methods, "phc opened");

        Ok(PhcHandle {
            phc_index,
            fd,
            _owned_fd: owned,
            posix_clockid: ffi::fd_to_clockid(fd),
            caps,
            ordered_methods,
            cursor: 0,
            active_method: None,
            efx_sampler: None,
            stepped_since_sample: false,
            pps_source: None,
            synth_pps_state: SynthPpsState::NotReady,
            pps_last_edge_seen: None,
        })
    }

    pub fn phc_index(&self) -> u32 {
        self.phc_index
    }

    pub fn active_method(&self) -> Option<DiffMethod> {
        self.active_method
    }

    /// Register the vendor `EFX` comparison method. Without this call,
    /// `Efx` is always `Unsupported` and falls through immediately.
    pub fn define_diff_method(&mut self, sampler: EfxSampler) {
        self.efx_sampler = Some(sampler);
    }

    /// Inform the handle that its clock (or the system clock) was just
    /// stepped. Per §4.2, the next sample from any cache-dependent method is
    /// forced to `EAGAIN` so stale pre-step state is never reported as a
    /// fresh sample.
    pub fn record_step(&mut self) {
        self.stepped_since_sample = true;
    }

    /// Produce one `(phc - system)` sample, running the method-fallback
    /// state machine described in §9: try the method at `cursor`; on
    /// `Unsupported` advance the cursor and retry; on success latch it as
    /// the active method; on `NotReady` return without moving the cursor.
    pub fn sample(&mut self) -> Result<Timespec, PhcSampleError> {
        if self.stepped_since_sample {
            self.stepped_since_sample = false;
            return Err(PhcSampleError::NotReady);
        }

        while self.cursor < self.ordered_methods.len() {
            let method = self.ordered_methods[self.cursor];
            match self.sample_with(method) {
                Ok(sample) => {
                    if self.active_method != Some(method) {
                        info!(phc_index = self.phc_index, ?method, "phc comparison method now active");
                    }
                    self.active_method = Some(method);
                    return Ok(sample);
                }
                Err(PhcSampleError::Unsupported) => {
                    info!(phc_index = self.phc_index, ?method, "phc method unsupported, advancing");
                    self.cursor += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(PhcSampleError::NoMethodAvailable)
    }

    fn sample_with(&mut self, method: DiffMethod) -> Result<Timespec, PhcSampleError> {
        match method {
            DiffMethod::SysOffsetPrecise => methods::sample_sys_offset_precise(self.fd),
            DiffMethod::Efx => match &self.efx_sampler {
                Some(sampler) => sampler(self.fd),
                None => Err(PhcSampleError::Unsupported),
            },
            DiffMethod::Pps => self.sample_pps(),
            DiffMethod::SysOffsetExtended => methods::sample_sys_offset_extended(self.fd),
            DiffMethod::SysOffset => methods::sample_sys_offset(self.fd),
            DiffMethod::ReadTime => methods::sample_read_time(self.posix_clockid),
        }
    }

    fn sample_pps(&mut self) -> Result<Timespec, PhcSampleError> {
        let source = self.pps_source.as_mut().ok_or(PhcSampleError::Unsupported)?;
        match source.poll_edge(Duration::from_millis(0))? {
            Some(edge) => {
                self.pps_last_edge_seen = Some(Instant::now());
                self.synth_pps_state = SynthPpsState::Ready;
                Ok(edge)
            }
            None => {
                let stale = self
                    .pps_last_edge_seen
                    .map(|t| t.elapsed() >= Duration::from_secs(1))
                    .unwrap_or(true);
                if stale {
                    if self.synth_pps_state == SynthPpsState::Ready {
                        self.synth_pps_state = SynthPpsState::NotReady;
                    } else {
                        self.synth_pps_state = SynthPpsState::Bad;
                        warn!(phc_index = self.phc_index, "pps edge missing for >=1s, demoting method");
                        return Err(PhcSampleError::Unsupported);
                    }
                }
                Err(PhcSampleError::NotReady)
            }
        }
    }

    /// Wire up a PPS source for the `Pps` comparison method, trying
    /// `opts.pps_source_order` in turn (§4.2: "`DEV_PPS` is default first").
    pub fn configure_pps(&mut self, helper: &HelperClient, opts: &PhcOpenOptions) -> Result<(), PhcSampleError> {
        for kind in &opts.pps_source_order {
            let result = match kind {
                PpsSourceKind::DevPtp => pps::PpsSource::open_dev_ptp(self.fd, opts.extts_channel),
                PpsSourceKind::DevPps => pps::PpsSource::open_dev_pps(self.phc_index, helper),
            };
            match result {
                Ok(source) => {
                    debug!(phc_index = self.phc_index, ?kind, "pps source configured");
                    self.pps_source = Some(source);
                    return Ok(());
                }
                Err(e) => debug!(phc_index = self.phc_index, ?kind, error = ?e, "pps source unavailable"),
            }
        }
        Err(PhcSampleError::Unsupported)
    }
}

impl AsRawFd for PhcHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Pre-filters at open time, per §8's boundary-behaviour scenario S4: a
/// method whose prerequisite capability is known absent is never tried
/// (rather than failing once per fallback pass at runtime).
fn method_plausible_at_open(method: DiffMethod, caps: &PhcCaps) -> bool {
    match method {
        DiffMethod::SysOffsetPrecise => caps.cross_timestamping,
        DiffMethod::Pps => caps.pps || caps.n_ext_ts > 0,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(cross: bool, pps: bool, ext: i32) -> PhcCaps {
        PhcCaps { max_adj_ppb: 0, n_ext_ts: ext, pps, cross_timestamping: cross }
    }

    #[test]
    fn s4_fallback_skips_unsupported_methods_at_open() {
        // caps.cross_timestamping=0 and no PPS device/channel: SYS_OFFSET_PRECISE
        // and PPS are pre-filtered, leaving EFX first (EFX has no capability
        // prerequisite at open time; whether it is actually usable depends on
        // a sampler being registered later via `define_diff_method`).
        let caps = caps(false, false, 0);
        let order: ArrayVec<DiffMethod, MAX_DIFF_METHODS> =
            DiffMethod::DEFAULT_ORDER.into_iter().filter(|m| method_plausible_at_open(*m, &caps)).collect();
        assert_eq!(order[0], DiffMethod::Efx);
        assert!(!order.contains(&DiffMethod::SysOffsetPrecise));
        assert!(!order.contains(&DiffMethod::Pps));
    }

    #[test]
    fn s4_pps_kept_when_ext_ts_channels_present() {
        let caps = caps(false, false, 2);
        let order: ArrayVec<DiffMethod, MAX_DIFF_METHODS> =
            DiffMethod::DEFAULT_ORDER.into_iter().filter(|m| method_plausible_at_open(*m, &caps)).collect();
        assert!(order.contains(&DiffMethod::Pps));
    }
}
