//! Show command - print stored source for a key

use super::open_cache;
use crate::cli::args::ShowArgs;
use crate::config::Config;
use crate::error::DuckResult;

/// Execute the show command
pub async fn execute(args: ShowArgs, config: &Config) -> DuckResult<()> {
    let cache = open_cache(config).await?;
    let key = cache.lookup(&args.key)?;

    let source = cache.read_source(&key).await?;
    print!("{}", source);
    if !source.ends_with('\n') {
        println!();
    }
    Ok(())
}
