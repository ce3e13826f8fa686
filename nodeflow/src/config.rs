use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the node-local flow observer daemon
    Serve(ServeArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Address to serve the observer API on, either host:port or a
    /// unix:// socket path. May be given more than once.
    #[arg(long = "listen-client-urls", default_value = "unix:///var/run/nodeflow/observer.sock")]
    pub listen_client_urls: Vec<String>,

    /// Capacity of the in-memory flow ring, rounded up to a power of two
    #[arg(long, default_value_t = 4096)]
    pub max_flows: u64,

    /// Container runtime endpoint, reserved for CRI-backed pod resolution
    #[arg(long, env = "CRI_ENDPOINT")]
    pub cri_endpoint: Option<String>,

    /// Address to serve prometheus metrics on
    #[arg(long)]
    pub metrics_server: Option<SocketAddr>,

    /// Flow metric handler to enable (flow, drop, tcp, icmp)
    #[arg(long = "metric")]
    pub metric: Vec<String>,

    /// Path to the datapath agent socket
    #[arg(
        long,
        env = "AGENT_SOCKET_PATH",
        default_value = "/var/run/nodeflow/agent.sock"
    )]
    pub agent_socket_path: PathBuf,

    /// Name of the node the observer is running on, stamped on every flow
    #[arg(long, env = "HUBBLE_NODE_NAME", default_value = "")]
    pub node_name: String,
}

impl ServeArgs {
    /// The node name stamped on flows. Falls back to
    /// "$HUBBLE_NAMESPACE/<hostname>" when no name was configured.
    pub fn node_name(&self) -> String {
        if !self.node_name.is_empty() {
            return self.node_name.clone();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        match std::env::var("HUBBLE_NAMESPACE") {
            Ok(ns) if !ns.is_empty() => format!("{ns}/{host}"),
            _ => host,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_name_prefers_configured() {
        let args = ServeArgs::parse_from(["serve", "--node-name", "k8s1"]);
        assert_eq!(args.node_name(), "k8s1");
    }

    #[test]
    fn test_default_listen_url() {
        let args = ServeArgs::parse_from(["serve"]);
        assert_eq!(
            args.listen_client_urls,
            vec!["unix:///var/run/nodeflow/observer.sock".to_string()]
        );
        assert_eq!(args.max_flows, 4096);
    }
}
