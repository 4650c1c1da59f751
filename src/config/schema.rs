//! Configuration schema for duck-cache
//!
//! Configuration is stored at `~/.config/duck-cache/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Eviction and concurrency settings
    pub cache: CacheConfig,

    /// On-disk layout
    pub storage: StorageConfig,

    /// External compiler, encoder and renderer
    pub tools: ToolsConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Cache eviction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Drop in-memory results after N seconds without access (default: 10 min)
    pub memory_timeout_secs: u64,

    /// Delete rendered files N seconds after memory eviction (default: 3 days)
    pub disk_timeout_secs: u64,

    /// Keep entries without renders until the disk timer too
    pub retain_without_artifacts: bool,

    /// Maximum simultaneous compile/render jobs
    pub max_concurrent_jobs: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_timeout_secs: 10 * 60,
            disk_timeout_secs: 3 * 24 * 60 * 60,
            retain_without_artifacts: false,
            max_concurrent_jobs: 4,
        }
    }
}

impl CacheConfig {
    pub fn memory_timeout(&self) -> Duration {
        Duration::from_secs(self.memory_timeout_secs)
    }

    pub fn disk_timeout(&self) -> Duration {
        Duration::from_secs(self.disk_timeout_secs)
    }
}

/// Storage locations; unset paths fall back to platform defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding persisted `<key>.duck` sources
    pub root: Option<PathBuf>,

    /// Directory holding rendered audio and images (default: `<root>/renders`)
    pub render_dir: Option<PathBuf>,

    /// Directory for scratch executables (default: system temp dir)
    pub scratch_dir: Option<PathBuf>,
}

/// External tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Duck compiler executable
    pub compiler: String,

    /// Audio encoder reading AU on stdin
    pub encoder: String,

    /// Encoded audio format, also the file extension
    pub audio_format: String,

    /// Waveform image renderer
    pub waveform: String,

    pub waveform_width: u32,
    pub waveform_height: u32,
    pub waveform_color: String,
    pub background_color: String,

    /// Wall-clock deadline for audio and image rendering
    pub process_timeout_ms: u64,

    /// Wall-clock deadline for a single check or compile
    pub compile_timeout_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            compiler: "duck".to_string(),
            encoder: "sox".to_string(),
            audio_format: "flac".to_string(),
            waveform: "audiowaveform".to_string(),
            waveform_width: 1600,
            waveform_height: 256,
            waveform_color: "cccccc".to_string(),
            background_color: "272822".to_string(),
            process_timeout_ms: 4000,
            compile_timeout_ms: 60_000,
        }
    }
}

impl ToolsConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }
}
