//! duck-cache - content-addressed build cache for Duck programs
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use duck_cache::cli::{Cli, Commands};
use duck_cache::config::ConfigManager;
use duck_cache::error::DuckResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, log_format: &str) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("duck_cache=warn"),
        1 => EnvFilter::new("duck_cache=info"),
        _ => EnvFilter::new("duck_cache=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> DuckResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Using configuration {}", config_manager.path().display());

    match cli.command {
        Commands::Key(args) => duck_cache::cli::commands::key(args, &config).await,
        Commands::Check(args) => duck_cache::cli::commands::check(args, &config).await,
        Commands::Render(args) => duck_cache::cli::commands::render(args, &config).await,
        Commands::Show(args) => duck_cache::cli::commands::show(args, &config).await,
        Commands::Config(args) => {
            duck_cache::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
