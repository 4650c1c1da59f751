//! External toolchain abstraction
//!
//! The cache never compiles or encodes anything itself. It drives three
//! external collaborators through the [`Toolchain`] trait:
//! - the Duck compiler, in check mode and in executable-emit mode
//! - an audio encoder fed by the compiled executable's raw output
//! - a waveform renderer reading the encoded audio

use crate::config::schema::ToolsConfig;
use crate::process::{run_pipeline, run_tool, PipelineOutput, ToolCommand, ToolOutput, ToolResult};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Abstract interface to the compiler, encoder and waveform renderer
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Type-check a source file (`-t check`); bounded by the compile deadline
    async fn check(&self, source: &Path) -> ToolResult<ToolOutput>;

    /// Compile a source file into a standalone executable; bounded by the
    /// compile deadline
    async fn compile(&self, source: &Path, executable: &Path) -> ToolResult<ToolOutput>;

    /// Run the executable and pipe its raw audio into the encoder
    async fn encode_audio(
        &self,
        executable: &Path,
        audio: &Path,
        deadline: Duration,
    ) -> ToolResult<PipelineOutput>;

    /// Render a waveform image from an encoded audio file
    async fn render_waveform(
        &self,
        audio: &Path,
        image: &Path,
        deadline: Duration,
    ) -> ToolResult<ToolOutput>;

    /// Human-readable toolchain name for logs
    fn name(&self) -> &'static str;
}

/// Toolchain backed by real executables on this machine
pub struct ExternalToolchain {
    tools: ToolsConfig,
}

impl ExternalToolchain {
    /// Create a toolchain from the `[tools]` config section
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }

    /// `duck -t check <source>`
    pub fn check_command(&self, source: &Path) -> ToolCommand {
        ToolCommand::new(&self.tools.compiler)
            .args(["-t", "check"])
            .arg(source.display().to_string())
    }

    /// `duck -t exe -o <executable> -e null <source>`
    pub fn compile_command(&self, source: &Path, executable: &Path) -> ToolCommand {
        ToolCommand::new(&self.tools.compiler)
            .args(["-t", "exe", "-o"])
            .arg(executable.display().to_string())
            .args(["-e", "null"])
            .arg(source.display().to_string())
    }

    /// `<executable> --output au` piped into `sox -t au - <audio> remix 1,2`
    pub fn encode_commands(&self, executable: &Path, audio: &Path) -> (ToolCommand, ToolCommand) {
        let producer = ToolCommand::new(executable.display().to_string()).args(["--output", "au"]);
        let consumer = ToolCommand::new(&self.tools.encoder)
            .args(["-t", "au", "-"])
            .arg(audio.display().to_string())
            .args(["remix", "1,2"]);
        (producer, consumer)
    }

    /// `audiowaveform -i <audio> -o <image> ...`
    pub fn waveform_command(&self, audio: &Path, image: &Path) -> ToolCommand {
        ToolCommand::new(&self.tools.waveform)
            .arg("-i")
            .arg(audio.display().to_string())
            .arg("-o")
            .arg(image.display().to_string())
            .args(["--no-axis-labels", "-z", "auto"])
            .arg("-w")
            .arg(self.tools.waveform_width.to_string())
            .arg("-h")
            .arg(self.tools.waveform_height.to_string())
            .arg("--waveform-color")
            .arg(&self.tools.waveform_color)
            .arg("--background-color")
            .arg(&self.tools.background_color)
    }
}

#[async_trait]
impl Toolchain for ExternalToolchain {
    async fn check(&self, source: &Path) -> ToolResult<ToolOutput> {
        run_tool(&self.check_command(source), Some(self.tools.compile_timeout())).await
    }

    async fn compile(&self, source: &Path, executable: &Path) -> ToolResult<ToolOutput> {
        run_tool(
            &self.compile_command(source, executable),
            Some(self.tools.compile_timeout()),
        )
        .await
    }

    async fn encode_audio(
        &self,
        executable: &Path,
        audio: &Path,
        deadline: Duration,
    ) -> ToolResult<PipelineOutput> {
        let (producer, consumer) = self.encode_commands(executable, audio);
        run_pipeline(&producer, &consumer, Some(deadline)).await
    }

    async fn render_waveform(
        &self,
        audio: &Path,
        image: &Path,
        deadline: Duration,
    ) -> ToolResult<ToolOutput> {
        run_tool(&self.waveform_command(audio, image), Some(deadline)).await
    }

    fn name(&self) -> &'static str {
        "External"
    }
}

/// Extract user-facing diagnostics from compiler stderr
///
/// Compiler messages look like `path/to/file.duck(3,7): error: ...`. The path
/// prefix before the first `(` is dropped from every line, and lines with no
/// location are discarded. Returns `None` if nothing is left.
pub fn parse_diagnostics(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr
        .lines()
        .filter_map(|line| line.find('(').map(|at| line[at..].trim_end()))
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
