//! handoff - hand each local client a private pipe over a Unix socket
//!
//! `handoff server` listens on the rendezvous socket; `handoff client <msg>`
//! connects, receives a pipe write end and sends one message through it.

use std::path::PathBuf;

use clap::Parser;
use handoff::{cli, commands::Commands};

#[derive(Parser)]
#[command(name = "handoff", about = "Pipe handoff over a local socket")]
#[command(version, long_about = None)]
struct Cli {
    /// Rendezvous socket path (default: /tmp/os-net/socket-0)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::dispatch(cli.command, cli.socket) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
