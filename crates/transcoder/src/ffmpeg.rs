//! FFmpeg command construction and execution
//!
//! Both external collaborators (the encoder and the VMAF meter) are ffmpeg
//! invocations. This module builds their argument lists and runs them.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// Output target that tells ffmpeg to discard the muxed result
pub const NULL_OUTPUT: &str = "-";

/// Argument set for one ffmpeg run
#[derive(Debug, Clone, Default)]
pub struct FfmpegInvocation {
    /// Input files, passed as `-i <path>` in order
    pub inputs: Vec<PathBuf>,
    /// Output path, or [`NULL_OUTPUT`]
    pub output: PathBuf,
    /// `(flag, value)` pairs emitted as `-flag value` between inputs and output
    pub args: Vec<(String, String)>,
    /// Pass `-y` so an existing output gets overwritten
    pub overwrite: bool,
}

impl FfmpegInvocation {
    pub fn new<I, P>(inputs: I, output: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            output: output.into(),
            args: Vec::new(),
            overwrite: false,
        }
    }

    /// Append a `-flag value` pair
    pub fn arg(mut self, flag: &str, value: impl ToString) -> Self {
        self.args.push((flag.to_string(), value.to_string()));
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Build the ffmpeg command for an invocation
///
/// Always passes `-nostdin -nostats` so the child neither reads the terminal
/// nor floods the captured output with progress lines. Paths are made absolute.
pub fn build_ffmpeg_command(invocation: &FfmpegInvocation) -> Command {
    let mut cmd = Command::new("ffmpeg");

    if invocation.overwrite {
        cmd.arg("-y");
    }
    cmd.arg("-nostdin");
    cmd.arg("-nostats");

    for input in &invocation.inputs {
        cmd.arg("-i").arg(absolute(input));
    }

    for (flag, value) in &invocation.args {
        cmd.arg(format!("-{}", flag)).arg(value);
    }

    if invocation.output.as_os_str() == NULL_OUTPUT {
        cmd.arg(NULL_OUTPUT);
    } else {
        cmd.arg(absolute(&invocation.output));
    }

    cmd
}

/// Render a command as a single shell-like line for logging
pub fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command to completion, capturing stdout and stderr
///
/// The child is killed if the returned future is dropped, so cancelling a
/// worker never leaves an orphaned ffmpeg behind. With `verbose` the command
/// line is logged before it starts.
pub async fn run_captured(cmd: Command, verbose: bool) -> std::io::Result<Output> {
    if verbose {
        tracing::info!(command = %command_line(&cmd), "running");
    } else {
        tracing::debug!(command = %command_line(&cmd), "running");
    }

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.output().await
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
