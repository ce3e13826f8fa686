use clap::{Args, Parser, Subcommand};

use crate::client::OBSERVER_SOCKET;

#[derive(Debug, Parser)]
#[command(version, about = "A cli for interacting with the nodeflow observer", long_about = None)]
pub struct Cli {
    /// Observer address, host:port or a unix:// socket path
    #[arg(long, default_value = OBSERVER_SOCKET, global = true)]
    pub server: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Check observer health and ring fill
    Status,

    /// Fetch recent flows, or tail them live with --follow
    Observe(ObserveArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ObserveArgs {
    /// Keep the stream open and print flows as they arrive
    #[arg(long, short)]
    pub follow: bool,

    /// Number of recent flows to fetch when not following
    #[arg(long, default_value_t = 20)]
    pub number: u64,

    /// Match flows with this pod name on either side
    #[arg(long)]
    pub pod: Vec<String>,

    /// Match flows with this namespace on either side
    #[arg(long)]
    pub namespace: Vec<String>,

    /// Match flows carrying this label on either side
    #[arg(long)]
    pub label: Vec<String>,

    /// Match flows with this verdict (forwarded, dropped, error)
    #[arg(long)]
    pub verdict: Vec<String>,

    /// Match flows with this port on either side
    #[arg(long)]
    pub port: Vec<String>,

    /// Match flows with this L4 protocol (tcp, udp, icmpv4, icmpv6)
    #[arg(long)]
    pub protocol: Vec<String>,
}
