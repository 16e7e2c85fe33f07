//! Quality measurement collaborator
//!
//! The pipeline only knows the [`QualityMeter`] trait; [`VmafMeter`] is the
//! production implementation using ffmpeg's libvmaf filter.

pub mod vmaf;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub use vmaf::{build_vmaf_command, parse_vmaf_score, VmafMeter};

/// Reasons a candidate could not be scored
///
/// Every variant is treated as transient by the pipeline: the same candidate is
/// measured again.
#[derive(Debug, Error)]
pub enum MeasureError {
    /// The tool ran but its output carried no score
    #[error("no VMAF score in ffmpeg output")]
    NoScore,

    /// The tool could not be started
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scores an encoded candidate against its reference
///
/// Implementations must not modify either file.
#[async_trait]
pub trait QualityMeter: Send + Sync {
    async fn measure(&self, candidate: &Path, reference: &Path) -> Result<f64, MeasureError>;
}
