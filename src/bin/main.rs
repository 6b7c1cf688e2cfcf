//! `sfptpd`: the unprivileged half of the daemon (§4.1). Builds the clock
//! registry, the engine, and the clockfeed, wires signal delivery onto the
//! engine's own inbox, and drives the main loop until told to stop.
//!
//! Sync-instance threads (NTP/chrony/PTP/PPS) are started by whatever
//! assembles a concrete deployment's [`EngineConfig::ntp_instances`]; this
//! binary only demonstrates the clock-and-engine skeleton every deployment
//! shares, since speaking ntpd's mode-6 protocol or chronyd's binary
//! protocol is out of this crate's scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use sfptpd_core::clock::unix::UnixClock;
use sfptpd_core::clock::{ClockId, ClockRegistry};
use sfptpd_core::config::EngineConfig;
use sfptpd_core::engine::{Engine, EngineMessage};
use sfptpd_core::feed::ClockFeed;
use sfptpd_core::helper::HelperClient;
use sfptpd_core::iface::InterfaceRegistry;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::default();

    let helper = match &config.helper.helper_path {
        Some(path) => match HelperClient::spawn(path) {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "failed to spawn privileged helper, falling back to direct mode");
                HelperClient::direct()
            }
        },
        None => HelperClient::direct(),
    };

    let clocks = Arc::new(ClockRegistry::new());
    clocks.register(Arc::new(UnixClock::system(ClockId(0))));
    let interfaces = Arc::new(InterfaceRegistry::new());

    let (mut feed, feed_rx) = ClockFeed::new(config.timers.clockfeed_period);
    for id in clocks.ids() {
        if let Some(clock) = clocks.get(id) {
            feed.add_clock(clock);
        }
    }

    let (mut engine, engine_tx, _instance_tx) = Engine::new(
        Arc::clone(&clocks),
        Arc::clone(&interfaces),
        config.selection.policy.clone(),
        config.selection.holdoff,
        config.servo_capacity,
        config.servo,
        vec![],
    );
    engine.configure_clustering(
        config.clustering.discriminator,
        config.clustering.threshold_ns,
        config.clustering.score_without_discriminator,
        config.clustering.guard_threshold,
    );
    engine.start(config.timers.log_stats_period, config.timers.save_state_period, config.timers.stats_end_period);

    let running = Arc::new(AtomicBool::new(true));

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM, SIGUSR1]).expect("register signal handlers");
    let signal_engine_tx = engine_tx.clone();
    let signal_running = Arc::clone(&running);
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGUSR1 => signal_engine_tx.send_or_log(EngineMessage::StepClocks),
                    SIGHUP => signal_engine_tx.send_or_log(EngineMessage::LogRotate),
                    SIGTERM | SIGINT => {
                        info!(signal, "shutdown signal received");
                        signal_engine_tx.send_or_log(EngineMessage::Shutdown);
                        signal_running.store(false, Ordering::SeqCst);
                        return;
                    }
                    other => warn!(signal = other, "unhandled signal"),
                }
            }
        })
        .expect("spawn signal thread");

    let clockfeed_period = config.timers.clockfeed_period;
    std::thread::Builder::new()
        .name("clockfeed".to_string())
        .spawn(move || {
            let (_stop_tx, stop_rx) = sfptpd_core::rt::mailbox::<()>("clockfeed-stop");
            feed.run(&stop_rx);
            let _ = clockfeed_period;
        })
        .expect("spawn clockfeed thread");

    info!("sfptpd started");
    while running.load(Ordering::SeqCst) {
        engine.step(&feed_rx, Duration::from_millis(200));
    }
    info!("sfptpd stopped");

    helper.close();
}
