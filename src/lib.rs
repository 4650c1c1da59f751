//! duck-cache - content-addressed build cache for Duck programs
//!
//! Source text is stored under the hash of its bytes. Diagnostics, rendered
//! audio and waveform images are derived from it on demand by external
//! tools, computed once per key no matter how many callers ask, and evicted
//! from memory and then from disk when a key goes unused.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod eviction;
pub mod identity;
pub mod process;
pub mod slot;
pub mod store;
pub mod toolchain;
pub mod ui;

pub use cache::{Cache, CacheOptions, Diagnostics, EntrySnapshot};
pub use error::{DuckError, DuckResult, ErrorKind, Stage, Tool};
pub use identity::{compute_key, CacheKey};
