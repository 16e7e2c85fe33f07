//! VMAF measurement through ffmpeg's libvmaf filter

use super::{MeasureError, QualityMeter};
use crate::ffmpeg::{build_ffmpeg_command, run_captured, FfmpegInvocation, NULL_OUTPUT};
use async_trait::async_trait;
use std::path::Path;
use std::process::Command;

/// Marker libvmaf prints in front of the pooled score
const SCORE_MARKER: &str = "VMAF score:";

/// Build the ffmpeg command comparing `candidate` (distorted) to `reference`
///
/// The muxed output is discarded; only the filter's log line matters.
pub fn build_vmaf_command(candidate: &Path, reference: &Path, threads: u32) -> Command {
    let invocation = FfmpegInvocation::new([candidate, reference], NULL_OUTPUT)
        .arg("filter_complex", format!("libvmaf=n_threads={}", threads))
        .arg("f", "null");
    build_ffmpeg_command(&invocation)
}

/// Extract the pooled score from libvmaf's log output
///
/// Looks for `VMAF score: <float>` anywhere in the text. Returns None when the
/// marker is missing or the number after it does not parse.
pub fn parse_vmaf_score(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(SCORE_MARKER)?;
        let number: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        number.parse::<f64>().ok().filter(|score| score.is_finite())
    })
}

/// Quality meter running `ffmpeg -filter_complex libvmaf`
#[derive(Debug, Clone)]
pub struct VmafMeter {
    threads: u32,
    verbose: bool,
}

impl VmafMeter {
    pub fn new(threads: u32, verbose: bool) -> Self {
        Self { threads, verbose }
    }
}

#[async_trait]
impl QualityMeter for VmafMeter {
    async fn measure(&self, candidate: &Path, reference: &Path) -> Result<f64, MeasureError> {
        let cmd = build_vmaf_command(candidate, reference, self.threads);
        let output = run_captured(cmd, self.verbose).await?;

        // libvmaf logs to stderr; stdout is checked too in case it was redirected
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_vmaf_score(&stderr)
            .or_else(|| parse_vmaf_score(&stdout))
            .ok_or(MeasureError::NoScore)
    }
}
