mod cli;
mod client;
mod observe;
mod status;

use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        crate::cli::Commands::Status => status::run(&cli.server).await?,
        crate::cli::Commands::Observe(observe_args) => {
            observe::run(&cli.server, observe_args).await?
        }
    };
    Ok(())
}
