//! Message/thread runtime (C13).
//!
//! Every actor in the daemon (the engine, the clock feed, and one thread per
//! configured sync-module type) is a plain OS thread that owns a single
//! inbox and blocks only on that inbox, a timer deadline, or — via
//! [`fdwatch::FdWatcher`] — a small dedicated thread that turns fd
//! readability into inbox messages. There is no async runtime: the teacher
//! crate this is grounded on doesn't pull one in either, and a reactor this
//! small does not need one.

pub mod fdwatch;
pub mod queue;
pub mod timer;

pub use fdwatch::FdWatcher;
pub use queue::{mailbox, Rx, Tx};
pub use timer::{TimerHandle, TimerSet};
