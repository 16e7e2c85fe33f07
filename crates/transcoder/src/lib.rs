//! VMAF Transcoder
//!
//! Batch re-encoder that searches, per file, for the highest cq whose output still
//! meets a VMAF threshold. Encoding and quality measurement run in separate worker
//! pools connected by two counting queues.

pub mod concurrency;
pub mod encode;
pub mod ffmpeg;
pub mod ledger;
pub mod pipeline;
pub mod policy;
pub mod quality;
pub mod queue;
pub mod scan;
pub mod startup;
pub mod workers;

pub use concurrency::{derive_plan, WorkerPlan};
pub use encode::{build_encode_command, EncodeError, EncodeSettings, Encoder, FfmpegEncoder};
pub use ledger::{AbandonReason, RunSummary, TaskOutcome, TaskRecord, TaskState};
pub use pipeline::{Pipeline, PipelineError, RunOptions};
pub use policy::{decide, Decision};
pub use quality::{build_vmaf_command, parse_vmaf_score, MeasureError, QualityMeter, VmafMeter};
pub use queue::{CountingQueue, QueueCounts, QueueError};
pub use scan::{resolve_inputs, ScanError};
pub use startup::{run_startup_checks, StartupError};
pub use vmaf_transcoder_config as config;
pub use vmaf_transcoder_config::Config;
