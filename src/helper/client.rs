//! Client side of the privileged-helper RPC (§4.1).
//!
//! Every privileged operation funnels through [`HelperClient`], which either
//! round-trips a request to the spawned helper child over a `SOCK_SEQPACKET`
//! socket (passing back any opened fd via `SCM_RIGHTS`), or — when no helper
//! binary is configured — performs the operation directly in-process. RPC is
//! serialised through a single mutex: the protocol has no request ids, so
//! only one call may be in flight at a time.

use std::ffi::CString;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::{Child, Command};

use nix::sys::socket::{self, socketpair, AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::warn;

use super::wire::{Request, Response, RESPONSE_WIRE_SIZE};

const OPEN_DEV_PATH_RE_DESCRIPTION: &str = "^/dev/(pps|ptp)[0-9]+$";

#[derive(thiserror::Error, Debug)]
pub enum HelperRpcError {
    #[error("helper socket io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("helper socket errno: {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("helper returned malformed response")]
    Malformed,
    #[error("helper reported failure: {0}")]
    Remote(i32),
    #[error("path '{0}' is not permitted by helper OPEN_DEV policy ({OPEN_DEV_PATH_RE_DESCRIPTION})")]
    PathNotAllowed(String),
}

/// The result of dispatching one request, independent of whether it went
/// over the wire or was serviced in-process: a return code (negative errno
/// on failure), an optional fd, and — for `OPEN_CHRONY` only — a short
/// marker of which connect step failed.
struct Outcome {
    rc: i32,
    fd: Option<OwnedFd>,
    failing_step: String,
}

impl Outcome {
    fn ok(fd: Option<OwnedFd>) -> Outcome {
        Outcome { rc: 0, fd, failing_step: String::new() }
    }
    fn err(rc: i32) -> Outcome {
        Outcome { rc, fd: None, failing_step: String::new() }
    }
}

enum Backend {
    /// No helper binary configured: every RPC is satisfied directly,
    /// in-process, by a caller running with sufficient privilege already
    /// (§4.1's "Fallback").
    Direct,
    Spawned { child: Child, socket: OwnedFd, pid: Pid },
}

pub struct HelperClient {
    backend: Mutex<Backend>,
}

impl HelperClient {
    /// No helper configured: RPCs are serviced directly in-process.
    pub fn direct() -> HelperClient {
        HelperClient { backend: Mutex::new(Backend::Direct) }
    }

    /// Spawn `helper_path` with one end of a freshly created
    /// `SOCK_SEQPACKET` pair passed as `argv[1]` (its fd number), keep the
    /// other end, and issue the post-spawn `SYNC` probe described in §4.1.
    pub fn spawn(helper_path: &Path) -> Result<HelperClient, HelperRpcError> {
        let (ours, theirs) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::SOCK_CLOEXEC)
            .map_err(HelperRpcError::Errno)?;
        let theirs_fd = theirs.as_raw_fd();
        clear_cloexec(theirs_fd)?;

        let child = Command::new(helper_path).arg(theirs_fd.to_string()).spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(theirs);

        let client = HelperClient { backend: Mutex::new(Backend::Spawned { child, socket: ours, pid }) };
        client.dispatch(&Request::Sync)?;
        Ok(client)
    }

    /// The helper child's pid, for `pidfd`-based death watching by the
    /// caller (direct backend has no process to watch).
    pub fn pid(&self) -> Option<Pid> {
        match &*self.backend.lock() {
            Backend::Direct => None,
            Backend::Spawned { pid, .. } => Some(*pid),
        }
    }

    fn dispatch(&self, req: &Request) -> Result<Outcome, HelperRpcError> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Direct => Ok(direct_dispatch(req)),
            Backend::Spawned { socket, .. } => rpc_over_socket(socket, req),
        }
    }

    /// Open `path` (checked against the `^/dev/(pps|ptp)[0-9]+$` policy
    /// here too, so a misconfigured direct backend fails the same way the
    /// server would) and return the opened fd.
    pub fn open_dev(&self, path: &str) -> Result<RawFd, HelperRpcError> {
        if !open_dev_path_allowed(path) {
            return Err(HelperRpcError::PathNotAllowed(path.to_string()));
        }
        let outcome = self.dispatch(&Request::OpenDev { path: path.to_string() })?;
        if outcome.rc < 0 {
            return Err(HelperRpcError::Remote(outcome.rc));
        }
        outcome.fd.map(IntoRawFd::into_raw_fd).ok_or(HelperRpcError::Malformed)
    }

    /// Open the chronyd control socket client fd via the helper.
    pub fn open_chrony(&self) -> Result<RawFd, HelperRpcError> {
        let outcome = self.dispatch(&Request::OpenChrony)?;
        if outcome.rc < 0 {
            warn!(failing_step = %outcome.failing_step, rc = outcome.rc, "chrony control connect failed");
            return Err(HelperRpcError::Remote(outcome.rc));
        }
        outcome.fd.map(IntoRawFd::into_raw_fd).ok_or(HelperRpcError::Malformed)
    }

    pub fn chrony_control(&self, op: u32) -> Result<(), HelperRpcError> {
        let outcome = self.dispatch(&Request::ChronyControl { op })?;
        if outcome.rc == 0 {
            Ok(())
        } else {
            Err(HelperRpcError::Remote(outcome.rc))
        }
    }

    /// Orderly shutdown: send `CLOSE` (the one RPC outcome that is *not*
    /// treated as fatal, per §4.1) and wait for the child.
    pub fn close(&self) {
        if let Err(e) = self.dispatch(&Request::Close) {
            warn!(error = %e, "helper close rpc failed (ignored)");
        }
        let mut backend = self.backend.lock();
        if let Backend::Spawned { child, .. } = &mut *backend {
            let _ = child.wait();
        }
    }
}

fn clear_cloexec(fd: RawFd) -> Result<(), HelperRpcError> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(HelperRpcError::Errno)?;
    let mut flags = FdFlag::from_bits_truncate(flags);
    flags.remove(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(HelperRpcError::Errno)?;
    Ok(())
}

fn rpc_over_socket(sock: &OwnedFd, req: &Request) -> Result<Outcome, HelperRpcError> {
    let encoded = req.encode();
    socket::send(sock.as_raw_fd(), &encoded, MsgFlags::empty()).map_err(HelperRpcError::Errno)?;

    let mut buf = [0u8; RESPONSE_WIRE_SIZE];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

    let received = socket::recvmsg::<()>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(HelperRpcError::Errno)?;

    let mut fd = None;
    for cmsg in received.cmsgs().map_err(|_| HelperRpcError::Malformed)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    let n = received.bytes;
    drop(received);

    match Response::decode(&buf[..n]).map_err(|_| HelperRpcError::Malformed)? {
        Response::Ok => Ok(Outcome::ok(fd)),
        Response::OpenDev { rc } if rc >= 0 => Ok(Outcome::ok(fd)),
        Response::OpenDev { rc } => Ok(Outcome::err(rc)),
        Response::OpenChrony { rc, .. } if rc >= 0 => Ok(Outcome::ok(fd)),
        Response::OpenChrony { rc, failing_step } => Ok(Outcome { rc, fd: None, failing_step }),
        Response::ChronyControl { rc } => if rc == 0 { Ok(Outcome::ok(None)) } else { Ok(Outcome::err(rc)) },
    }
}

/// In-process fallback used when no helper binary is configured. Requires
/// the calling process to already hold whatever privilege the operation
/// needs.
fn direct_dispatch(req: &Request) -> Outcome {
    match req {
        Request::Sync | Request::Close => Outcome::ok(None),
        Request::OpenDev { path } => match open_raw(path) {
            Ok(fd) => Outcome::ok(Some(fd)),
            Err(e) => Outcome::err(-(e as i32)),
        },
        Request::OpenChrony => {
            let mut o = Outcome::err(-(nix::errno::Errno::ENOSYS as i32));
            o.failing_step = "unsupported".to_string();
            o
        }
        Request::ChronyControl { .. } => Outcome::ok(None),
    }
}

fn open_raw(path: &str) -> Result<OwnedFd, nix::errno::Errno> {
    let c_path = CString::new(path).map_err(|_| nix::errno::Errno::EINVAL)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        Err(nix::errno::Errno::last())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

/// `^/dev/(pps|ptp)[0-9]+$`, matched without pulling in a regex engine for
/// one fixed pattern.
pub fn open_dev_path_allowed(path: &str) -> bool {
    let rest = path.strip_prefix("/dev/pps").or_else(|| path.strip_prefix("/dev/ptp"));
    match rest {
        Some(digits) if !digits.is_empty() => digits.bytes().all(|b| b.is_ascii_digit()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_device_paths() {
        assert!(open_dev_path_allowed("/dev/ptp0"));
        assert!(open_dev_path_allowed("/dev/pps12"));
    }

    #[test]
    fn rejects_paths_outside_policy() {
        assert!(!open_dev_path_allowed("/dev/ptp"));
        assert!(!open_dev_path_allowed("/dev/mem"));
        assert!(!open_dev_path_allowed("/dev/ptp0/../../etc/passwd"));
        assert!(!open_dev_path_allowed("/dev/ppsx"));
    }

    #[test]
    fn direct_backend_services_open_dev_failure_without_panicking() {
        let client = HelperClient::direct();
        let result = client.open_dev("/dev/ptp999999999");
        assert!(result.is_err());
    }
}
