use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

use commands::Commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Incremental build execution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to kiln.json in the build directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run as if started in this directory
    #[arg(short = 'C', long, global = true)]
    directory: Option<PathBuf>,

    /// Log filter used when KILN_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    kiln_utils::logging::init(&cli.log_level).map_err(|e| eyre::eyre!("cannot initialize logging: {e}"))?;

    let directory = match cli.directory {
        Some(directory) => directory,
        None => std::env::current_dir()?,
    };
    cli.command.execute(&directory, cli.config.as_deref()).await
}
