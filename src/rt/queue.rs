//! Typed per-thread inbox.
//!
//! A thin wrapper around `std::sync::mpsc` that gives every actor a cloneable
//! [`Tx`] handle (other threads post to it) and a single [`Rx`] the actor
//! owns and blocks on. Keeping this as its own module (rather than using
//! `mpsc` directly everywhere) is what let us swap `recv` for `recv_timeout`
//! in one place when timers were added.

use std::sync::mpsc;
use std::time::Duration;

use tracing::trace;

/// Sending half of an actor's inbox. Cheap to clone; every producer thread
/// keeps its own.
#[derive(Clone)]
pub struct Tx<M> {
    inner: mpsc::Sender<M>,
    name: &'static str,
}

impl<M> Tx<M> {
    /// Post a message. Returns `Err` only once the receiving actor has shut
    /// down and dropped its `Rx` — callers generally log and drop on that
    /// path rather than treating it as fatal, since it only ever happens
    /// during shutdown races.
    pub fn send(&self, msg: M) -> Result<(), mpsc::SendError<M>> {
        self.inner.send(msg)
    }

    /// Post a message, logging (rather than propagating) a failure. Used at
    /// call sites where the actor has no sensible recovery for a dead peer.
    pub fn send_or_log(&self, msg: M) {
        if self.inner.send(msg).is_err() {
            trace!(actor = self.name, "dropped message: receiver gone");
        }
    }
}

/// Receiving half of an actor's inbox.
pub struct Rx<M> {
    inner: mpsc::Receiver<M>,
}

impl<M> Rx<M> {
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.inner.recv()
    }

    /// Block until a message arrives or `timeout` elapses, whichever is
    /// first. The engine's main loop uses this with the next timer deadline
    /// as `timeout` so it never busy-polls.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.inner.recv_timeout(timeout)
    }

    pub fn try_iter(&self) -> mpsc::TryIter<'_, M> {
        self.inner.try_iter()
    }
}

/// Create a fresh inbox. `name` is used only for diagnostics (it shows up in
/// trace logs when a send fails because the receiver has gone away).
pub fn mailbox<M>(name: &'static str) -> (Tx<M>, Rx<M>) {
    let (tx, rx) = mpsc::channel();
    (Tx { inner: tx, name }, Rx { inner: rx })
}
