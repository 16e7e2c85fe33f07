//! Encoding collaborator
//!
//! The pipeline only knows the [`Encoder`] trait; [`FfmpegEncoder`] is the
//! production implementation driving ffmpeg.

pub mod ffmpeg_encoder;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub use ffmpeg_encoder::{build_encode_command, EncodeSettings, FfmpegEncoder};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder process exited with non-zero status
    #[error("encoder failed with exit code {code}: {detail}")]
    Failed { code: i32, detail: String },

    /// Encoder process was terminated by signal
    #[error("encoder process was terminated by signal")]
    Terminated,

    /// IO error starting or talking to the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces one encoded candidate from a source file
///
/// Implementations must overwrite `output` if it already exists: retries of the
/// same file reuse the same output path.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, source: &Path, output: &Path, cq: u32) -> Result<(), EncodeError>;
}
