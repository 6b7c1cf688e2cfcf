//! Bridges fd readability into an actor's message inbox.
//!
//! The engine's netlink socket (§4.9 "User fds") and a sync module's
//! protocol socket both need to react to fd readability without the actor
//! thread blocking in `poll(2)` instead of on its own queue. [`FdWatcher`]
//! spawns a small dedicated thread that blocks in `poll` and forwards a
//! caller-supplied message every time a watched fd becomes readable; the
//! owning actor keeps blocking on its own `Rx` exactly as before.

use std::os::fd::{IntoRawFd, RawFd};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, warn};

use crate::rt::Tx;

/// Handle to a running fd-watch thread. Dropping it does not stop the
/// thread (there is no cheap way to interrupt a blocked `poll` without an
/// extra self-pipe fd); call [`FdWatcher::stop`] for orderly shutdown.
pub struct FdWatcher {
    join: Option<JoinHandle<()>>,
    stop_write: RawFd,
}

impl FdWatcher {
    /// Watch `fds` for readability, posting `make_msg(fd)` via `tx` each time
    /// one becomes readable. `poll_interval` bounds how promptly the thread
    /// notices a requested stop.
    pub fn spawn<M, F>(fds: Vec<RawFd>, tx: Tx<M>, make_msg: F, poll_interval: Duration) -> FdWatcher
    where
        M: Send + 'static,
        F: Fn(RawFd) -> M + Send + 'static,
    {
        let (stop_read, stop_write) = nix::unistd::pipe().expect("fdwatch: failed to create stop pipe");
        let stop_read_fd: RawFd = stop_read.into_raw_fd();
        let stop_write_fd: RawFd = stop_write.into_raw_fd();

        let join = std::thread::Builder::new()
            .name("fdwatch".into())
            .spawn(move || {
                let timeout_ms: i32 = poll_interval.as_millis().clamp(1, i32::MAX as u128) as i32;
                loop {
                    let mut poll_fds: Vec<PollFd> = fds
                        .iter()
                        .map(|&fd| {
                            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                            PollFd::new(borrowed, PollFlags::POLLIN)
                        })
                        .collect();
                    let stop_borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(stop_read_fd) };
                    poll_fds.push(PollFd::new(stop_borrowed, PollFlags::POLLIN));

                    match poll(&mut poll_fds, timeout_ms) {
                        Ok(0) => continue,
                        Ok(_) => {
                            if let Some(last) = poll_fds.last() {
                                if last.revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
                                    debug!("fdwatch: stop requested");
                                    break;
                                }
                            }
                            for (i, &fd) in fds.iter().enumerate() {
                                let revents = poll_fds[i].revents().unwrap_or(PollFlags::empty());
                                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                                    tx.send_or_log(make_msg(fd));
                                }
                            }
                        }
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            warn!(error = %e, "fdwatch: poll failed");
                            break;
                        }
                    }
                }
            })
            .expect("fdwatch: failed to spawn thread");

        FdWatcher { join: Some(join), stop_write: stop_write_fd }
    }

    /// Request the watcher thread to exit and wait for it to do so.
    pub fn stop(mut self) {
        let _ = nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(self.stop_write) }, &[0u8]);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for FdWatcher {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(self.stop_write) }, &[0u8]);
        }
    }
}
