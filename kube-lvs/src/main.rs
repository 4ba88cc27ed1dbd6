mod cleanup;
mod cli;
mod state;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    setup_subscriber();
    let cli = Cli::parse();
    match cli.command {
        cli::Commands::State(args) => state::run(args)?,
        cli::Commands::Cleanup(args) => cleanup::run(args)?,
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kube_lvs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
