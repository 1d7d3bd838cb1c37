//! Command-line argument definitions.

use clap::Parser;
use std::path::PathBuf;

/// Warden - IKEv2 VPN connection coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file with coordinator settings and profiles
    #[arg(short, long, env = "WARDEN_CONFIG", default_value = "warden.toml")]
    pub config: PathBuf,

    /// Profile to connect (default: the first one in the config)
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Disconnect and exit after this many seconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "SECS")]
    pub run_for: Option<u64>,

    /// Simulate moving to Wi-Fi after this many seconds
    #[arg(long, value_name = "SECS")]
    pub wifi_after: Option<u64>,

    /// Log filter, e.g. `info` or `warden_vpn=debug`
    #[arg(long, env = "WARDEN_LOG", default_value = "info")]
    pub log: String,
}
