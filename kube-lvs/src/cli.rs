use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "Operator CLI for the IPVS service proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Show the IPVS services and destinations this node currently carries
    State(HostArgs),

    /// Tear down everything the proxy owns on this node: the IPVS table and
    /// the dummy VIP interface
    Cleanup(HostArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct HostArgs {
    /// Device the external IP route table points at
    #[arg(long, env = "POD_INTERFACE", default_value = "kube-bridge")]
    pub pod_interface: String,
}
