//! Privileged helper IPC (C2): the client half lives here for use by the
//! daemon; the server half ([`server`]) is driven by the separate
//! `sfptpd-helper` binary, sharing [`wire`] so the two cannot disagree on
//! layout.

mod client;
pub mod server;
pub mod wire;

pub use client::{open_dev_path_allowed, HelperClient, HelperRpcError};
