//! CLI command implementations

pub mod check;
pub mod config;
pub mod key;
pub mod render;
pub mod show;

pub use check::execute as check;
pub use config::execute as config;
pub use key::execute as key;
pub use render::execute as render;
pub use show::execute as show;

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{DuckError, DuckResult};
use crate::eviction::TokioScheduler;
use crate::toolchain::ExternalToolchain;
use std::path::Path;
use std::sync::Arc;

/// Open the cache with the real toolchain and runtime timers
async fn open_cache(config: &Config) -> DuckResult<Cache> {
    Cache::open(
        config,
        Arc::new(ExternalToolchain::new(config.tools.clone())),
        Arc::new(TokioScheduler::new()?),
    )
    .await
}

/// Read a source file given on the command line
async fn read_input(path: &Path) -> DuckResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| DuckError::disk(format!("reading {}", path.display()), e))
}
