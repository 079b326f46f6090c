use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use studio_server::RunOptions;

/// Local WordPress site server daemon.
#[derive(Debug, Parser)]
#[command(name = "studio-server", version, about)]
struct Cli {
    /// Path to config.toml
    #[arg(long, env = "STUDIO_CONFIG")]
    config: Option<PathBuf>,

    /// IPC socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory holding appdata-v1.json and archives
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    studio_server::run(RunOptions {
        config: cli.config,
        socket: cli.socket,
        data_dir: cli.data_dir,
    })
}
