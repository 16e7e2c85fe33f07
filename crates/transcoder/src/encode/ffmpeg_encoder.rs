//! FFmpeg encoder for the transcoder
//!
//! Builds and runs the ffmpeg transcode with the configured codec settings and a
//! per-attempt constant-quality (cq) value.

use super::{EncodeError, Encoder};
use crate::config::EncodeConfig;
use crate::ffmpeg::{build_ffmpeg_command, run_captured, FfmpegInvocation};
use async_trait::async_trait;
use std::path::Path;
use std::process::Command;

/// How many trailing lines of ffmpeg output are kept in an error
const ERROR_TAIL_LINES: usize = 5;

/// Codec settings shared by every encode attempt
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    pub video_codec: String,
    pub preset: String,
    pub rate_control: String,
    /// Output audio channel count
    pub audio_channels: u32,
    /// Copy global metadata from the source
    pub map_metadata: bool,
}

impl From<&EncodeConfig> for EncodeSettings {
    fn from(cfg: &EncodeConfig) -> Self {
        Self {
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            rate_control: cfg.rate_control.clone(),
            audio_channels: cfg.audio_channels,
            map_metadata: cfg.map_metadata,
        }
    }
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self::from(&EncodeConfig::default())
    }
}

/// Build the ffmpeg transcode command for one attempt
///
/// Creates a Command configured with:
/// - `-y` so retries overwrite the previous candidate
/// - The configured video codec, preset and rate control
/// - `-cq` set to the attempt's value
/// - Audio channel count and optional metadata copy
pub fn build_encode_command(
    settings: &EncodeSettings,
    source: &Path,
    output: &Path,
    cq: u32,
) -> Command {
    let mut invocation = FfmpegInvocation::new([source], output)
        .overwrite(true)
        .arg("vcodec", &settings.video_codec)
        .arg("preset", &settings.preset)
        .arg("rc", &settings.rate_control)
        .arg("cq", cq)
        .arg("ac", settings.audio_channels);

    if settings.map_metadata {
        invocation = invocation.arg("map_metadata", 0);
    }

    build_ffmpeg_command(&invocation)
}

/// Encoder backed by an ffmpeg child process
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    settings: EncodeSettings,
    verbose: bool,
}

impl FfmpegEncoder {
    pub fn new(settings: EncodeSettings, verbose: bool) -> Self {
        Self { settings, verbose }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, source: &Path, output: &Path, cq: u32) -> Result<(), EncodeError> {
        let cmd = build_encode_command(&self.settings, source, output, cq);
        let result = run_captured(cmd, self.verbose).await?;

        if result.status.success() {
            return Ok(());
        }

        match result.status.code() {
            Some(code) => Err(EncodeError::Failed {
                code,
                detail: output_tail(&result.stderr),
            }),
            None => Err(EncodeError::Terminated),
        }
    }
}

/// Last few non-empty lines of captured output, joined with " | "
fn output_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join(" | ")
}
