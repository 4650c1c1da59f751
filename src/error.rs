//! Error types for duck-cache
//!
//! All modules use `DuckResult<T>` as their return type. Errors are `Clone`
//! because a failed derivation is delivered to every waiter of the shared
//! computation, so I/O causes are held behind an `Arc`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for duck-cache operations
pub type DuckResult<T> = Result<T, DuckError>;

/// Derivation stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Persisting or locating the source file
    Source,
    /// Compiler check mode
    Check,
    /// Compile to executable and encode audio
    Audio,
    /// Waveform image rendering
    Image,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::Check => "check",
            Self::Audio => "audio",
            Self::Image => "image",
        };
        write!(f, "{}", name)
    }
}

/// External tool involved in a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Compiler,
    Encoder,
    Renderer,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compiler => "compiler",
            Self::Encoder => "encoder",
            Self::Renderer => "waveform renderer",
        };
        write!(f, "{}", name)
    }
}

/// Closed classification of every error the cache can surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidKey,
    NotFound,
    DiagnosticFailure,
    InternalCompilerError,
    EncodingTimeout,
    EncodingFailure,
    DiskError,
    Config,
    Internal,
}

/// All errors that can occur in duck-cache
#[derive(Error, Debug, Clone)]
pub enum DuckError {
    // Identity errors
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("Source not found for {key}")]
    NotFound { key: String },

    // Compiler errors
    #[error("Compilation failed for {key} ({stage}): {message}")]
    Diagnostic {
        key: String,
        stage: Stage,
        message: String,
    },

    #[error("Internal compiler error for {key} ({stage}), exit code: {exit_code:?}")]
    InternalCompiler {
        key: String,
        stage: Stage,
        exit_code: Option<i32>,
        stderr: String,
    },

    // Render errors
    #[error("Timeout after {deadline:?} while rendering {stage} for {key}")]
    EncodingTimeout {
        key: String,
        stage: Stage,
        deadline: Duration,
    },

    #[error("{stage} rendering failed for {key}, exit code: {exit_code:?}, signal: {signal:?}")]
    EncodingFailure {
        key: String,
        stage: Stage,
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    // Storage errors
    #[error("Disk error: {context}")]
    Disk {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    // Process errors
    #[error("Failed to spawn {program} ({tool}, {stage})")]
    Spawn {
        tool: Tool,
        program: String,
        stage: Stage,
        #[source]
        source: Arc<std::io::Error>,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid environment override {var}: {reason}")]
    EnvInvalid { var: String, reason: String },

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DuckError {
    /// Create a disk error with context
    pub fn disk(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Disk {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Create a spawn error for a program
    pub fn spawn(
        tool: Tool,
        program: impl Into<String>,
        stage: Stage,
        source: std::io::Error,
    ) -> Self {
        Self::Spawn {
            tool,
            program: program.into(),
            stage,
            source: Arc::new(source),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Diagnostic { .. } => ErrorKind::DiagnosticFailure,
            Self::InternalCompiler { .. } => ErrorKind::InternalCompilerError,
            Self::EncodingTimeout { .. } => ErrorKind::EncodingTimeout,
            Self::Spawn {
                tool: Tool::Compiler,
                ..
            } => ErrorKind::InternalCompilerError,
            Self::EncodingFailure { .. } | Self::Spawn { .. } => ErrorKind::EncodingFailure,
            Self::Disk { .. } => ErrorKind::DiskError,
            Self::ConfigInvalid { .. } | Self::EnvInvalid { .. } | Self::TomlSerialize(_) => {
                ErrorKind::Config
            }
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error points at the service rather than the submitted code
    pub fn is_system_fault(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::InvalidKey | ErrorKind::NotFound | ErrorKind::DiagnosticFailure
        )
    }

    /// Cache key the error was raised for, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::NotFound { key }
            | Self::Diagnostic { key, .. }
            | Self::InternalCompiler { key, .. }
            | Self::EncodingTimeout { key, .. }
            | Self::EncodingFailure { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidKey(_) => Some("Keys are 40 lowercase hex characters"),
            Self::NotFound { .. } => Some("Submit the source first: duck-cache key <file>"),
            Self::Spawn { .. } => Some("Check the [tools] section: duck-cache config show"),
            Self::EncodingTimeout { .. } => Some("Raise tools.process_timeout_ms or shorten the piece"),
            _ => None,
        }
    }
}
