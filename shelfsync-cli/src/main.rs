//! shelfsync — keep local back-ends in step with remote libraries.
//!
//! # Usage
//!
//! ```text
//! shelfsync subscribe <url> [--key <key>] [--id <id>] [--plugin name[:k=v,...]]...
//! shelfsync unsubscribe <id>
//! shelfsync sync [<id>] [--all] [--skip]
//! shelfsync list [--json]
//! shelfsync plugins [--json]
//! shelfsync daemon start|stop|status
//! ```
//!
//! Commands talk to a running daemon when there is one and otherwise act on
//! the subscription store directly.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    list::ListArgs,
    plugins::PluginsArgs,
    subscribe::{SubscribeArgs, UnsubscribeArgs},
    sync::SyncArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "shelfsync",
    version,
    about = "Replay remote library changes through local output plugins",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a library URL and its plugin chain.
    Subscribe(SubscribeArgs),

    /// Remove a subscription and its known items.
    Unsubscribe(UnsubscribeArgs),

    /// Sync one subscription or all of them.
    Sync(SyncArgs),

    /// Show subscriptions and their versions.
    List(ListArgs),

    /// Show available output plugins and their parameters.
    Plugins(PluginsArgs),

    /// Manage the shelfsync background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Subscribe(args) => args.run(),
        Commands::Unsubscribe(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::List(args) => args.run(),
        Commands::Plugins(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
