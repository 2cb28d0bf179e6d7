//! Trickle CLI - Command-line interface
//!
//! Starts the streaming server.

mod commands;

use clap::Parser;

#[derive(Parser)]
#[command(name = "trickle")]
#[command(about = "Streams torrent files over HTTP within a fixed memory budget")]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::handle_command(cli.command).await
}
