//! blockdv: inspect and maintain persisted key maps.

mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// blockdv: key map tooling for data validation runs
#[derive(Parser)]
#[command(name = "blockdv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration supplying map_dir and segment_shift defaults
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count bad, busy and known blocks without changing anything
    Census(commands::MapArgs),

    /// Show the key and busy flag of one block
    Get(commands::GetArgs),

    /// Clear every busy flag, keeping persisted keys
    ClearBusy(commands::MapArgs),

    /// Compress sector numbers into range text
    Compress(commands::CompressArgs),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Census(args) => commands::census(&config, args),
        Commands::Get(args) => commands::get(&config, args),
        Commands::ClearBusy(args) => commands::clear_busy(&config, args),
        Commands::Compress(args) => commands::compress(args),
    };

    match result {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
