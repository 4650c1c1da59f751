//! Check command - type-check a source file

use super::{open_cache, read_input};
use crate::cache::Diagnostics;
use crate::cli::args::{CheckArgs, OutputFormat};
use crate::config::Config;
use crate::error::{DuckError, DuckResult};
use crate::ui;

/// Execute the check command
pub async fn execute(args: CheckArgs, config: &Config) -> DuckResult<()> {
    let source = read_input(&args.file).await?;
    let cache = open_cache(config).await?;

    let diagnostics = cache.check_source(&source).await?;

    match args.format {
        OutputFormat::Text => print_text(&diagnostics),
        OutputFormat::Json => print_json(&diagnostics)?,
    }
    Ok(())
}

fn print_text(diagnostics: &Diagnostics) {
    match &diagnostics.errors {
        None => ui::step_ok_detail("No errors", &diagnostics.hash),
        Some(errors) => {
            ui::step_error_detail("Errors found", &diagnostics.hash);
            for line in errors.lines() {
                println!("    {}", line);
            }
        }
    }
}

fn print_json(diagnostics: &Diagnostics) -> DuckResult<()> {
    let json = serde_json::to_string_pretty(diagnostics)
        .map_err(|e| DuckError::Internal(format!("serializing diagnostics: {}", e)))?;
    println!("{}", json);
    Ok(())
}
