//! Key command - store a source file and print its key

use super::{open_cache, read_input};
use crate::cli::args::KeyArgs;
use crate::config::Config;
use crate::error::DuckResult;

/// Execute the key command
pub async fn execute(args: KeyArgs, config: &Config) -> DuckResult<()> {
    let source = read_input(&args.file).await?;
    let cache = open_cache(config).await?;

    let key = cache.submit(&source).await?;
    println!("{}", key);
    Ok(())
}
