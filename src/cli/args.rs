//! CLI argument definitions using clap derive

use clap::{ArgAction, ArgGroup, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// duck-cache - content-addressed build cache for Duck programs
///
/// Stores Duck source under the hash of its text and renders it to audio and
/// waveform images with the external Duck compiler, sox and audiowaveform.
#[derive(Parser, Debug)]
#[command(name = "duck-cache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "DUCK_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a source file and print its key
    Key(KeyArgs),

    /// Type-check a source file
    Check(CheckArgs),

    /// Render a source file to audio, or to a waveform image
    Render(RenderArgs),

    /// Print the stored source for a key
    Show(ShowArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the key command
#[derive(Parser, Debug)]
pub struct KeyArgs {
    /// Duck source file
    pub file: PathBuf,
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Duck source file
    pub file: PathBuf,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the render command
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("input").required(true).args(["file", "key"])))]
pub struct RenderArgs {
    /// Duck source file
    pub file: Option<PathBuf>,

    /// Render previously stored source by key instead of a file
    #[arg(short, long)]
    pub key: Option<String>,

    /// Produce the waveform image instead of the audio file
    #[arg(long)]
    pub image: bool,
}

/// Arguments for the show command
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Cache key (40 lowercase hex characters)
    pub key: String,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for check results
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}
