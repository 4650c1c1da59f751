//! Render command - produce audio or a waveform image

use super::{open_cache, read_input};
use crate::cli::args::RenderArgs;
use crate::config::Config;
use crate::error::{DuckError, DuckResult};
use tracing::debug;

/// Execute the render command
pub async fn execute(args: RenderArgs, config: &Config) -> DuckResult<()> {
    let cache = open_cache(config).await?;

    let key = match (&args.file, &args.key) {
        (Some(file), _) => cache.submit(&read_input(file).await?).await?,
        (None, Some(key)) => cache.lookup(key)?,
        (None, None) => {
            return Err(DuckError::Internal(
                "render needs a file or --key".to_string(),
            ))
        }
    };
    debug!("Rendering {}", key);

    let path = if args.image {
        cache.image(&key).await?
    } else {
        cache.audio(&key).await?
    };

    println!("{}", path.display());
    Ok(())
}
