//! Warden: IKEv2 VPN connection coordinator
//!
//! Loads profiles from a config file, connects one of them through a
//! simulated engine and logs every state transition until interrupted.

mod args;
mod config;
mod sim;

use anyhow::{Context, Result};
use args::Args;
use clap::Parser;
use config::AppConfig;
use sim::{SimTiming, SimulatedEngine};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use warden_iface::MemoryBackend;
use warden_net::{NetworkKind, NetworkSnapshot, SharedProbe};
use warden_vpn::{
    ConnectionCoordinator, DisconnectReason, FnListener, NetworkMonitor, VpnEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&args.log))
        .with_target(false)
        .compact()
        .init();

    info!("Warden starting...");

    let config = AppConfig::load(&args.config)?;
    let profile = config.select(args.profile.as_deref())?;

    let probe = SharedProbe::new(NetworkSnapshot::on(config.network));
    let coordinator = Arc::new(
        ConnectionCoordinator::new(
            config.coordinator.clone(),
            Box::new(SimulatedEngine::new(SimTiming::default())),
            Arc::new(MemoryBackend::new()),
            Arc::new(probe.clone()),
        )
        .context("starting coordinator")?,
    );
    let monitor = NetworkMonitor::spawn(coordinator.clone(), probe)
        .context("starting network monitor")?;

    coordinator.subscribe(FnListener(|event: VpnEvent| match event {
        VpnEvent::State(state) => info!("VPN state: {}", state.external_name()),
        VpnEvent::Error(error) => warn!("VPN error: {}", error.external_name()),
    }));

    info!("Connecting profile '{}' on {}", profile.name, config.network);
    coordinator.request_connect(profile)?;

    let wifi_after = args.wifi_after.map(Duration::from_secs);
    let run = async {
        if let Some(delay) = wifi_after {
            tokio::time::sleep(delay).await;
            info!("Simulating move to Wi-Fi");
            monitor.notify(NetworkSnapshot::on(NetworkKind::Wifi));
        }
        std::future::pending::<()>().await;
    };

    match args.run_for {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("Run time elapsed"),
                _ = run => {}
            }
        }
        None => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("waiting for Ctrl-C")?;
                    info!("Interrupted");
                }
                _ = run => {}
            }
        }
    }

    let status = coordinator.status();
    if status.error.is_error() {
        warn!("Last attempt ended with {}", status.error);
    }
    info!("Final status: {}", status.to_json());
    coordinator.request_disconnect(DisconnectReason::User);

    // Both joins block; keep them off the async runtime
    tokio::task::spawn_blocking(move || {
        monitor.stop();
        coordinator.shutdown();
    })
    .await?;

    info!("Warden shutting down");
    Ok(())
}
