//! `sfptpd-helper`: the privileged half of the daemon. Kept to the bare
//! minimum of root-requiring operations (opening `/dev/ptp*`/`/dev/pps*`
//! and the chronyd control socket, restarting chronyd) so the much larger
//! `sfptpd` binary can drop privileges after spawning this one (§4.1).

use std::os::fd::RawFd;

use sfptpd_core::helper::server;

fn main() {
    tracing_subscriber::fmt::init();

    let socket_fd: RawFd = match std::env::args().nth(1).and_then(|s| s.parse().ok()) {
        Some(fd) => fd,
        None => {
            eprintln!("usage: sfptpd-helper <inherited-socket-fd>");
            std::process::exit(2);
        }
    };

    if let Err(e) = server::run(socket_fd) {
        eprintln!("sfptpd-helper: {e}");
        std::process::exit(1);
    }
}
