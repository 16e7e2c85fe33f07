//! Startup checks module for the transcoder
//!
//! Provides preflight checks to verify system requirements before a run:
//! - FFmpeg is installed and reports a version
//! - The configured video encoder is compiled in
//! - The libvmaf filter is compiled in

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Filter used for quality measurement
pub const VMAF_FILTER: &str = "libvmaf";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Encoder '{0}' is not supported by this FFmpeg build")]
    EncoderMissing(String),

    #[error("Filter '{0}' is not supported by this FFmpeg build")]
    FilterMissing(String),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Whether a listing from `ffmpeg -encoders` or `ffmpeg -filters` contains `name`
///
/// Both listings put the flags first and the name second on every entry line.
pub fn listing_contains(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|entry| entry == name)
}

fn run_ffmpeg(arg: &str) -> Result<String, StartupError> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", arg])
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "ffmpeg {} failed; is FFmpeg installed and in PATH? Error: {}",
                arg, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "ffmpeg {} exited with {}",
            arg, output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that `ffmpeg -version` runs and log the version it reports
pub fn check_ffmpeg_available() -> Result<(), StartupError> {
    let version_output = run_ffmpeg("-version")?;

    match parse_ffmpeg_version(&version_output) {
        Some(major) => info!(major, "found ffmpeg"),
        None => warn!(
            first_line = version_output.lines().next().unwrap_or("(empty)"),
            "could not parse ffmpeg version"
        ),
    }

    Ok(())
}

/// Check that ffmpeg can encode with `codec`
pub fn check_encoder_available(codec: &str) -> Result<(), StartupError> {
    if !listing_contains(&run_ffmpeg("-encoders")?, codec) {
        return Err(StartupError::EncoderMissing(codec.to_string()));
    }
    Ok(())
}

/// Check that ffmpeg was built with libvmaf
pub fn check_libvmaf_available() -> Result<(), StartupError> {
    if !listing_contains(&run_ffmpeg("-filters")?, VMAF_FILTER) {
        return Err(StartupError::FilterMissing(VMAF_FILTER.to_string()));
    }
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg availability
/// 2. Configured encoder
/// 3. libvmaf filter
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg_available()?;
    check_encoder_available(&cfg.encode.video_codec)?;
    check_libvmaf_available()?;
    Ok(())
}
