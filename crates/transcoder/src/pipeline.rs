//! Run orchestration for the transcoder
//!
//! Seeds the encode queue, starts both worker pools, waits until no work is left
//! in either queue and then cancels the workers.

use crate::concurrency::WorkerPlan;
use crate::config::Config;
use crate::encode::{EncodeSettings, Encoder, FfmpegEncoder};
use crate::ledger::{
    current_timestamp_ms, new_shared_ledger, AbandonReason, RunSummary, TaskKey, TaskOutcome,
};
use crate::quality::{QualityMeter, VmafMeter};
use crate::queue::{CountingQueue, QueueCounts, QueueError};
use crate::workers::{
    run_encode_worker, run_quality_worker, EncodeItem, FeedbackSettings, PipelineQueues,
    QualityItem, WorkerContext,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for a whole run
///
/// Per-file failures never show up here; they end as abandoned tasks in the
/// summary. Only setup problems and internal faults fail the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid run options: {0}")]
    InvalidOptions(String),

    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A worker ended before the run was drained, e.g. by panicking
    #[error("Worker stopped unexpectedly: {0}")]
    WorkerStopped(String),
}

/// Parameters of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub output_dir: PathBuf,
    /// Extension with leading dot
    pub output_extension: String,
    pub initial_cq: u32,
    pub cq_step: u32,
    /// Minimum VMAF score for acceptance
    pub threshold: f64,
    pub encode_workers: u32,
    pub quality_workers: u32,
    /// Thread hint passed to the quality meter
    pub vmaf_threads: u32,
    /// Echo every external command line
    pub verbose: bool,
    pub max_measure_attempts: Option<u32>,
}

impl RunOptions {
    /// Combine validated configuration with a derived worker plan
    pub fn from_config(cfg: &Config, plan: &WorkerPlan, verbose: bool) -> Self {
        Self {
            output_dir: cfg.encode.output_dir.clone(),
            output_extension: cfg.encode.output_extension.clone(),
            initial_cq: cfg.encode.initial_cq,
            cq_step: cfg.encode.cq_step,
            threshold: cfg.quality.threshold,
            encode_workers: plan.encode_workers,
            quality_workers: plan.quality_workers,
            vmaf_threads: plan.vmaf_threads,
            verbose,
            max_measure_attempts: cfg.quality.max_measure_attempts,
        }
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.encode_workers == 0 || self.quality_workers == 0 {
            return Err(PipelineError::InvalidOptions(
                "both worker pools need at least one worker".to_string(),
            ));
        }
        if self.cq_step == 0 {
            return Err(PipelineError::InvalidOptions(
                "cq step must be at least 1".to_string(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(PipelineError::InvalidOptions(
                "quality threshold must be a number".to_string(),
            ));
        }
        Ok(())
    }

    fn feedback(&self) -> FeedbackSettings {
        FeedbackSettings {
            threshold: self.threshold,
            cq_step: self.cq_step,
            max_measure_attempts: self.max_measure_attempts,
        }
    }
}

/// Drop repeated inputs, keeping the first occurrence of each path in order
pub fn dedup_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    inputs
        .iter()
        .filter(|path| seen.insert(path.as_path()))
        .cloned()
        .collect()
}

/// Output location for an input: its file stem plus `extension`, inside `output_dir`
pub fn output_path_for(input: &Path, output_dir: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_dir.join(format!("{}{}", stem, extension))
}

/// Tasks of a run after dedup and output-path assignment
#[derive(Debug, Default, PartialEq)]
pub struct TaskPlan {
    /// Tasks that will be encoded, in input order
    pub tasks: Vec<TaskKey>,
    /// Inputs whose output path was already taken, with the input that took it
    pub collisions: Vec<(TaskKey, PathBuf)>,
}

/// Deduplicate inputs and assign output paths
///
/// When two different inputs map to the same output file, the first one keeps
/// it and later ones end up in `collisions`.
pub fn plan_tasks(inputs: &[PathBuf], output_dir: &Path, extension: &str) -> TaskPlan {
    let mut plan = TaskPlan::default();
    let mut claimed: HashMap<PathBuf, PathBuf> = HashMap::new();

    for source in dedup_inputs(inputs) {
        let output = output_path_for(&source, output_dir, extension);
        let key = TaskKey::new(source.clone(), output.clone());

        match claimed.get(&output) {
            Some(owner) => plan.collisions.push((key, owner.clone())),
            None => {
                claimed.insert(output, source);
                plan.tasks.push(key);
            }
        }
    }

    plan
}

/// Whether both queues are empty, judged from three snapshots taken in order:
/// `first`, then `other`, then `first` again.
///
/// `other` can only gain work from items of `first`. If `first` was drained at
/// its first read and saw no enqueue until its second read, nothing could have
/// refilled `other` in between, so two zero readings mean both queues were
/// drained at the moment `other` was read. A drained pair stays drained because
/// new work only comes from processing existing work.
pub fn is_drained(first: QueueCounts, other: QueueCounts, first_again: QueueCounts) -> bool {
    first.outstanding == 0
        && other.outstanding == 0
        && first_again.enqueued_total == first.enqueued_total
}

/// Block until neither queue has outstanding work
pub async fn wait_for_drain(
    encode: &CountingQueue<EncodeItem>,
    quality: &CountingQueue<QualityItem>,
) {
    loop {
        encode.join().await;
        quality.join().await;

        let quality_first = quality.counts();
        let encode_now = encode.counts();
        let quality_again = quality.counts();

        if is_drained(quality_first, encode_now, quality_again) {
            return;
        }

        debug!(
            encode_outstanding = encode_now.outstanding,
            quality_outstanding = quality_again.outstanding,
            "work moved between queues while checking, waiting again"
        );
    }
}

/// Quality-gated batch transcoder
pub struct Pipeline {
    options: RunOptions,
    encoder: Arc<dyn Encoder>,
    meter: Arc<dyn QualityMeter>,
}

impl Pipeline {
    /// Create a pipeline over arbitrary collaborators
    pub fn new(options: RunOptions, encoder: Arc<dyn Encoder>, meter: Arc<dyn QualityMeter>) -> Self {
        Self {
            options,
            encoder,
            meter,
        }
    }

    /// Create a pipeline driving ffmpeg for both encoding and VMAF scoring
    pub fn with_ffmpeg(options: RunOptions, settings: EncodeSettings) -> Self {
        let encoder = Arc::new(FfmpegEncoder::new(settings, options.verbose));
        let meter = Arc::new(VmafMeter::new(options.vmaf_threads, options.verbose));
        Self::new(options, encoder, meter)
    }

    /// Process every input to a terminal outcome
    ///
    /// Returns once every file has been accepted or abandoned. Individual file
    /// failures are reported in the summary, not as an error.
    pub async fn run(&self, inputs: &[PathBuf]) -> Result<RunSummary, PipelineError> {
        self.options.validate()?;
        let started_at = current_timestamp_ms();

        tokio::fs::create_dir_all(&self.options.output_dir)
            .await
            .map_err(|source| PipelineError::OutputDir {
                path: self.options.output_dir.clone(),
                source,
            })?;

        let plan = plan_tasks(
            inputs,
            &self.options.output_dir,
            &self.options.output_extension,
        );
        let ledger = new_shared_ledger();
        let queues = Arc::new(PipelineQueues::new());

        {
            let mut ledger = ledger.write().await;
            for key in &plan.tasks {
                ledger.register(key);
                queues.encode.enqueue(EncodeItem {
                    source: key.source.clone(),
                    output: key.output.clone(),
                    cq: self.options.initial_cq,
                })?;
            }

            for (key, owner) in &plan.collisions {
                warn!(
                    source = %key.source.display(),
                    output = %key.output.display(),
                    claimed_by = %owner.display(),
                    "output path already used by another input, skipping"
                );
                ledger.register(key);
                ledger.finish(
                    key,
                    TaskOutcome::Abandoned(AbandonReason::OutputCollision {
                        claimed_by: owner.clone(),
                    }),
                );
            }
        }

        info!(
            files = plan.tasks.len(),
            skipped = plan.collisions.len(),
            initial_cq = self.options.initial_cq,
            threshold = self.options.threshold,
            encode_workers = self.options.encode_workers,
            quality_workers = self.options.quality_workers,
            "starting run"
        );

        let ctx = Arc::new(WorkerContext {
            queues: queues.clone(),
            encoder: self.encoder.clone(),
            meter: self.meter.clone(),
            ledger: ledger.clone(),
            feedback: self.options.feedback(),
        });

        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        for id in 0..self.options.encode_workers as usize {
            workers.spawn(run_encode_worker(id, ctx.clone(), cancel.child_token()));
        }
        for id in 0..self.options.quality_workers as usize {
            workers.spawn(run_quality_worker(id, ctx.clone(), cancel.child_token()));
        }

        tokio::select! {
            _ = wait_for_drain(&queues.encode, &queues.quality) => {}
            Some(stopped) = workers.join_next() => {
                cancel.cancel();
                workers.abort_all();
                let detail = match stopped {
                    Ok(()) => "worker loop returned".to_string(),
                    Err(e) => e.to_string(),
                };
                error!(detail = %detail, "worker stopped before the run finished");
                return Err(PipelineError::WorkerStopped(detail));
            }
        }

        // Drained: every worker is parked at its dequeue point.
        cancel.cancel();
        queues.close();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker failed during shutdown");
            }
        }

        let summary = RunSummary::from_ledger(&*ledger.read().await, started_at);
        info!(
            accepted = summary.accepted(),
            abandoned = summary.abandoned(),
            "run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodeError;
    use crate::ledger::TaskState;
    use crate::quality::MeasureError;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Encoder that records every call and fails for chosen sources
    #[derive(Default)]
    struct FakeEncoder {
        calls: Mutex<Vec<(PathBuf, u32)>>,
        fail_sources: HashSet<PathBuf>,
        /// Every source fails from this attempt on (1-based)
        fail_from_attempt: Option<usize>,
        /// Write the output file before reporting the result, like ffmpeg does
        writes_output: bool,
        delay: Option<Duration>,
    }

    impl FakeEncoder {
        fn calls(&self) -> Vec<(PathBuf, u32)> {
            self.calls.lock().unwrap().clone()
        }

        fn cqs_for(&self, source: &str) -> Vec<u32> {
            self.calls()
                .into_iter()
                .filter(|(s, _)| s == Path::new(source))
                .map(|(_, cq)| cq)
                .collect()
        }
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn encode(&self, source: &Path, output: &Path, cq: u32) -> Result<(), EncodeError> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((source.to_path_buf(), cq));
                calls.iter().filter(|(s, _)| s == source).count()
            };
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.writes_output {
                tokio::fs::write(output, format!("cq {}", cq)).await?;
            }
            let past_limit = self.fail_from_attempt.is_some_and(|n| attempt >= n);
            if self.fail_sources.contains(source) || past_limit {
                return Err(EncodeError::Failed {
                    code: 1,
                    detail: "simulated".to_string(),
                });
            }
            Ok(())
        }
    }

    /// How a scripted meter answers for one reference file
    #[derive(Clone)]
    enum Script {
        /// Same answer every time; None means unmeasurable
        Always(Option<f64>),
        /// Answers in order, repeating the last one
        Sequence(VecDeque<Option<f64>>),
        /// Score as a function of the cq baked into the call order
        ByCall(fn(usize) -> Option<f64>),
    }

    #[derive(Default)]
    struct FakeMeter {
        scripts: Mutex<HashMap<PathBuf, Script>>,
        default: Option<f64>,
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl FakeMeter {
        fn always(score: Option<f64>) -> Self {
            Self {
                default: score,
                ..Self::default()
            }
        }

        fn script(self, reference: &str, script: Script) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(PathBuf::from(reference), script);
            self
        }

        fn calls(&self) -> Vec<(PathBuf, PathBuf)> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, reference: &str) -> usize {
            self.calls()
                .iter()
                .filter(|(_, r)| r == Path::new(reference))
                .count()
        }
    }

    #[async_trait]
    impl QualityMeter for FakeMeter {
        async fn measure(&self, candidate: &Path, reference: &Path) -> Result<f64, MeasureError> {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((candidate.to_path_buf(), reference.to_path_buf()));
                calls.iter().filter(|(_, r)| r == reference).count() - 1
            };

            let answer = {
                let mut scripts = self.scripts.lock().unwrap();
                match scripts.get_mut(reference) {
                    Some(Script::Always(answer)) => *answer,
                    Some(Script::Sequence(answers)) => {
                        if answers.len() > 1 {
                            answers.pop_front().flatten()
                        } else {
                            answers.front().copied().flatten()
                        }
                    }
                    Some(Script::ByCall(f)) => f(call_index),
                    None => self.default,
                }
            };

            tokio::task::yield_now().await;
            answer.ok_or(MeasureError::NoScore)
        }
    }

    fn options(output_dir: &Path) -> RunOptions {
        RunOptions {
            output_dir: output_dir.to_path_buf(),
            output_extension: ".mkv".to_string(),
            initial_cq: 40,
            cq_step: 2,
            threshold: 95.0,
            encode_workers: 1,
            quality_workers: 1,
            vmaf_threads: 4,
            verbose: false,
            max_measure_attempts: None,
        }
    }

    async fn run_with(
        options: RunOptions,
        encoder: Arc<FakeEncoder>,
        meter: Arc<FakeMeter>,
        inputs: &[&str],
    ) -> RunSummary {
        let inputs: Vec<PathBuf> = inputs.iter().map(PathBuf::from).collect();
        let pipeline = Pipeline::new(options, encoder, meter);
        tokio::time::timeout(Duration::from_secs(10), pipeline.run(&inputs))
            .await
            .expect("run should finish")
            .expect("run should succeed")
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let inputs: Vec<PathBuf> = ["b.mp4", "a.mp4", "b.mp4", "c.mp4", "a.mp4"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let expected: Vec<PathBuf> = ["b.mp4", "a.mp4", "c.mp4"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(dedup_inputs(&inputs), expected);
    }

    #[test]
    fn test_output_path_for() {
        assert_eq!(
            output_path_for(Path::new("/media/in/movie.final.mp4"), Path::new("/out"), ".mkv"),
            PathBuf::from("/out/movie.final.mkv")
        );
        assert_eq!(
            output_path_for(Path::new("clip"), Path::new("out"), ".mkv"),
            PathBuf::from("out/clip.mkv")
        );
    }

    #[test]
    fn test_plan_tasks_reports_collisions() {
        let inputs = vec![
            PathBuf::from("/a/show.mp4"),
            PathBuf::from("/b/show.mov"),
            PathBuf::from("/a/show.mp4"),
            PathBuf::from("/a/other.mp4"),
        ];
        let plan = plan_tasks(&inputs, Path::new("/out"), ".mkv");

        assert_eq!(
            plan.tasks,
            vec![
                TaskKey::new("/a/show.mp4", "/out/show.mkv"),
                TaskKey::new("/a/other.mp4", "/out/other.mkv"),
            ]
        );
        assert_eq!(
            plan.collisions,
            vec![(
                TaskKey::new("/b/show.mov", "/out/show.mkv"),
                PathBuf::from("/a/show.mp4")
            )]
        );
    }

    #[test]
    fn test_is_drained_requires_both_zero() {
        let zero = QueueCounts {
            outstanding: 0,
            enqueued_total: 3,
        };
        let busy = QueueCounts {
            outstanding: 1,
            enqueued_total: 3,
        };
        assert!(is_drained(zero, zero, zero));
        assert!(!is_drained(busy, zero, zero));
        assert!(!is_drained(zero, busy, zero));
    }

    // An encode worker hands its candidate to the quality queue and marks its own
    // item done between the orchestrator's two reads. Both outstanding counters
    // read zero, but the moved enqueue total exposes the hand-off.
    #[tokio::test]
    async fn test_drain_check_catches_handoff_between_reads() {
        let queues = PipelineQueues::new();
        queues
            .encode
            .enqueue(EncodeItem {
                source: PathBuf::from("/in/a.mp4"),
                output: PathBuf::from("/out/a.mkv"),
                cq: 40,
            })
            .unwrap();
        let item = queues.encode.dequeue().await.unwrap();

        // Orchestrator: first read of the quality queue
        let quality_first = queues.quality.counts();
        assert_eq!(quality_first.outstanding, 0);

        // Encode worker finishes right now
        queues
            .quality
            .enqueue(QualityItem {
                candidate: item.output.clone(),
                reference: item.source.clone(),
                cq: item.cq,
                failed_measurements: 0,
            })
            .unwrap();
        queues.encode.mark_done().unwrap();

        // Orchestrator: encode read and quality re-read
        let encode_now = queues.encode.counts();
        let quality_again = queues.quality.counts();

        assert_eq!(encode_now.outstanding, 0);
        assert!(!is_drained(quality_first, encode_now, quality_again));
    }

    // A quality worker re-enqueues an encode attempt and marks its item done
    // while the orchestrator checks; the quality queue is still outstanding at
    // the first read, so the check cannot pass.
    #[tokio::test]
    async fn test_drain_check_catches_retry_between_reads() {
        let queues = PipelineQueues::new();
        queues
            .quality
            .enqueue(QualityItem {
                candidate: PathBuf::from("/out/a.mkv"),
                reference: PathBuf::from("/in/a.mp4"),
                cq: 40,
                failed_measurements: 0,
            })
            .unwrap();
        let _ = queues.quality.dequeue().await.unwrap();

        let quality_first = queues.quality.counts();
        queues
            .encode
            .enqueue(EncodeItem {
                source: PathBuf::from("/in/a.mp4"),
                output: PathBuf::from("/out/a.mkv"),
                cq: 38,
            })
            .unwrap();
        queues.quality.mark_done().unwrap();
        let encode_now = queues.encode.counts();
        let quality_again = queues.quality.counts();

        assert!(!is_drained(quality_first, encode_now, quality_again));
        assert_eq!(encode_now.outstanding, 1);
    }

    #[tokio::test]
    async fn test_wait_for_drain_waits_for_retry_chain() {
        let queues = Arc::new(PipelineQueues::new());
        queues
            .quality
            .enqueue(QualityItem {
                candidate: PathBuf::from("/out/a.mkv"),
                reference: PathBuf::from("/in/a.mp4"),
                cq: 40,
                failed_measurements: 0,
            })
            .unwrap();

        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move { wait_for_drain(&queues.encode, &queues.quality).await })
        };

        // Quality item produces an encode retry before being marked done
        let _ = queues.quality.dequeue().await.unwrap();
        queues
            .encode
            .enqueue(EncodeItem {
                source: PathBuf::from("/in/a.mp4"),
                output: PathBuf::from("/out/a.mkv"),
                cq: 38,
            })
            .unwrap();
        queues.quality.mark_done().unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished(), "encode retry is still outstanding");

        let _ = queues.encode.dequeue().await.unwrap();
        queues.encode.mark_done().unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should be detected")
            .unwrap();
    }

    // Score above threshold on the first try
    #[tokio::test]
    async fn test_accept_on_first_attempt() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let meter = Arc::new(FakeMeter::always(Some(96.0)));

        let summary = run_with(
            options(dir.path()),
            encoder.clone(),
            meter.clone(),
            &["/in/a.mp4"],
        )
        .await;

        assert_eq!(encoder.cqs_for("/in/a.mp4"), vec![40]);
        assert_eq!(meter.calls_for("/in/a.mp4"), 1);

        let task = summary.task_for(Path::new("/in/a.mp4")).unwrap();
        assert_eq!(task.state, TaskState::Accepted);
        assert_eq!(task.outcome, Some(TaskOutcome::Accepted { cq: 40, score: 96.0 }));
        assert_eq!(task.output, dir.path().join("a.mkv"));
    }

    // Never good enough: cq walks 4, 2, 0 and stops
    #[tokio::test]
    async fn test_abandon_after_cq_exhausted() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let meter = Arc::new(FakeMeter::always(Some(50.0)));
        let opts = RunOptions {
            initial_cq: 4,
            ..options(dir.path())
        };

        let summary = run_with(opts, encoder.clone(), meter.clone(), &["/in/a.mp4"]).await;

        assert_eq!(encoder.cqs_for("/in/a.mp4"), vec![4, 2, 0]);
        assert_eq!(meter.calls_for("/in/a.mp4"), 3);

        let task = summary.task_for(Path::new("/in/a.mp4")).unwrap();
        assert_eq!(task.state, TaskState::Abandoned);
        assert_eq!(task.cq_attempts, vec![4, 2, 0]);
        assert_eq!(
            task.outcome,
            Some(TaskOutcome::Abandoned(AbandonReason::CqExhausted {
                last_cq: 0,
                last_score: 50.0
            }))
        );
    }

    // Two unmeasurable results, then a passing score
    #[tokio::test]
    async fn test_unmeasurable_is_retried_on_same_candidate() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let meter = Arc::new(FakeMeter::default().script(
            "/in/a.mp4",
            Script::Sequence(VecDeque::from(vec![None, None, Some(96.0)])),
        ));

        let summary = run_with(
            options(dir.path()),
            encoder.clone(),
            meter.clone(),
            &["/in/a.mp4"],
        )
        .await;

        assert_eq!(encoder.calls().len(), 1);
        let calls = meter.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(candidate, _)| *candidate == dir.path().join("a.mkv")));

        let task = summary.task_for(Path::new("/in/a.mp4")).unwrap();
        assert_eq!(task.state, TaskState::Accepted);
        assert_eq!(task.measure_runs, 3);
    }

    // Two files with one worker per pool do not disturb each other
    #[tokio::test]
    async fn test_two_files_progress_independently() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        // a.mp4 passes only from its third measurement on; b.mp4 passes at once
        let meter = Arc::new(
            FakeMeter::default()
                .script(
                    "/in/a.mp4",
                    Script::ByCall(|call| Some(if call >= 2 { 97.0 } else { 80.0 })),
                )
                .script("/in/b.mp4", Script::Always(Some(99.0))),
        );

        let summary = run_with(
            options(dir.path()),
            encoder.clone(),
            meter.clone(),
            &["/in/a.mp4", "/in/b.mp4"],
        )
        .await;

        assert_eq!(encoder.cqs_for("/in/a.mp4"), vec![40, 38, 36]);
        assert_eq!(encoder.cqs_for("/in/b.mp4"), vec![40]);
        assert_eq!(summary.accepted(), 2);
        assert!(summary.is_complete());
    }

    #[tokio::test]
    async fn test_encode_failure_abandons_without_measuring() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder {
            fail_sources: HashSet::from([PathBuf::from("/in/broken.mp4")]),
            ..FakeEncoder::default()
        });
        let meter = Arc::new(FakeMeter::always(Some(99.0)));

        let summary = run_with(
            options(dir.path()),
            encoder.clone(),
            meter.clone(),
            &["/in/broken.mp4", "/in/fine.mp4"],
        )
        .await;

        assert_eq!(encoder.cqs_for("/in/broken.mp4"), vec![40]);
        assert_eq!(meter.calls_for("/in/broken.mp4"), 0);

        let broken = summary.task_for(Path::new("/in/broken.mp4")).unwrap();
        assert!(matches!(
            broken.outcome,
            Some(TaskOutcome::Abandoned(AbandonReason::EncodeFailed { .. }))
        ));
        let fine = summary.task_for(Path::new("/in/fine.mp4")).unwrap();
        assert_eq!(fine.state, TaskState::Accepted);
    }

    #[tokio::test]
    async fn test_failed_encode_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder {
            fail_sources: HashSet::from([PathBuf::from("/in/broken.mp4")]),
            writes_output: true,
            ..FakeEncoder::default()
        });
        let meter = Arc::new(FakeMeter::always(Some(99.0)));

        let summary = run_with(
            options(dir.path()),
            encoder,
            meter,
            &["/in/broken.mp4", "/in/fine.mp4"],
        )
        .await;

        let broken = summary.task_for(Path::new("/in/broken.mp4")).unwrap();
        assert!(matches!(
            broken.outcome,
            Some(TaskOutcome::Abandoned(AbandonReason::EncodeFailed { .. }))
        ));
        assert!(!dir.path().join("broken.mkv").exists());
        assert!(dir.path().join("fine.mkv").exists());
    }

    // The retry overwrote the earlier candidate before failing, so nothing
    // usable is left at the output path.
    #[tokio::test]
    async fn test_failed_retry_removes_overwritten_candidate() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder {
            fail_from_attempt: Some(2),
            writes_output: true,
            ..FakeEncoder::default()
        });
        let meter = Arc::new(FakeMeter::always(Some(50.0)));

        let summary = run_with(options(dir.path()), encoder.clone(), meter, &["/in/a.mp4"]).await;

        assert_eq!(encoder.cqs_for("/in/a.mp4"), vec![40, 38]);
        let task = summary.task_for(Path::new("/in/a.mp4")).unwrap();
        assert!(matches!(
            task.outcome,
            Some(TaskOutcome::Abandoned(AbandonReason::EncodeFailed { .. }))
        ));
        assert!(!dir.path().join("a.mkv").exists());
    }

    #[tokio::test]
    async fn test_measure_cap_abandons_file() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let meter = Arc::new(FakeMeter::always(None));
        let opts = RunOptions {
            max_measure_attempts: Some(3),
            ..options(dir.path())
        };

        let summary = run_with(opts, encoder.clone(), meter.clone(), &["/in/a.mp4"]).await;

        assert_eq!(meter.calls_for("/in/a.mp4"), 3);
        let task = summary.task_for(Path::new("/in/a.mp4")).unwrap();
        assert_eq!(
            task.outcome,
            Some(TaskOutcome::Abandoned(
                AbandonReason::MeasurementUnavailable { attempts: 3 }
            ))
        );
    }

    #[tokio::test]
    async fn test_duplicate_inputs_match_deduplicated_run() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let score = |call: usize| Some(if call == 0 { 90.0 } else { 96.0 });

        let encoder_dup = Arc::new(FakeEncoder::default());
        let meter_dup =
            Arc::new(FakeMeter::always(Some(99.0)).script("/in/a.mp4", Script::ByCall(score)));
        let with_dups = run_with(
            options(dir_a.path()),
            encoder_dup.clone(),
            meter_dup,
            &["/in/a.mp4", "/in/a.mp4", "/in/b.mp4", "/in/a.mp4"],
        )
        .await;

        let encoder_unique = Arc::new(FakeEncoder::default());
        let meter_unique =
            Arc::new(FakeMeter::always(Some(99.0)).script("/in/a.mp4", Script::ByCall(score)));
        let unique = run_with(
            options(dir_b.path()),
            encoder_unique.clone(),
            meter_unique,
            &["/in/a.mp4", "/in/b.mp4"],
        )
        .await;

        assert_eq!(with_dups.tasks.len(), 2);
        assert_eq!(encoder_dup.cqs_for("/in/a.mp4"), vec![40, 38]);
        assert_eq!(encoder_dup.cqs_for("/in/a.mp4"), encoder_unique.cqs_for("/in/a.mp4"));
        let outcomes = |s: &RunSummary| -> Vec<_> {
            s.tasks.iter().map(|t| (t.source.clone(), t.outcome.clone())).collect()
        };
        assert_eq!(outcomes(&with_dups), outcomes(&unique));
    }

    #[tokio::test]
    async fn test_output_collision_is_skipped() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let meter = Arc::new(FakeMeter::always(Some(99.0)));

        let summary = run_with(
            options(dir.path()),
            encoder.clone(),
            meter,
            &["/a/show.mp4", "/b/show.mov"],
        )
        .await;

        assert_eq!(encoder.calls().len(), 1);
        let skipped = summary.task_for(Path::new("/b/show.mov")).unwrap();
        assert_eq!(
            skipped.outcome,
            Some(TaskOutcome::Abandoned(AbandonReason::OutputCollision {
                claimed_by: PathBuf::from("/a/show.mp4")
            }))
        );
        assert!(summary.is_complete());
    }

    #[tokio::test]
    async fn test_empty_input_finishes_immediately() {
        let dir = TempDir::new().unwrap();
        let summary = run_with(
            options(dir.path()),
            Arc::new(FakeEncoder::default()),
            Arc::new(FakeMeter::default()),
            &[],
        )
        .await;
        assert!(summary.tasks.is_empty());
        assert!(summary.is_complete());
    }

    #[tokio::test]
    async fn test_creates_output_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested/out");
        run_with(
            options(&nested),
            Arc::new(FakeEncoder::default()),
            Arc::new(FakeMeter::always(Some(99.0))),
            &["/in/a.mp4"],
        )
        .await;
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_zero_workers_is_rejected() {
        let dir = TempDir::new().unwrap();
        let opts = RunOptions {
            quality_workers: 0,
            ..options(dir.path())
        };
        let pipeline = Pipeline::new(
            opts,
            Arc::new(FakeEncoder::default()),
            Arc::new(FakeMeter::default()),
        );
        let result = pipeline.run(&[PathBuf::from("/in/a.mp4")]).await;
        assert!(matches!(result, Err(PipelineError::InvalidOptions(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_files_many_workers_all_terminal() {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder {
            delay: Some(Duration::from_millis(1)),
            fail_sources: HashSet::from([PathBuf::from("/in/f7.mp4")]),
            ..FakeEncoder::default()
        });
        let mut meter = FakeMeter::always(Some(60.0));
        for i in 0..20 {
            let script = match i % 4 {
                0 => Script::Always(Some(99.0)),
                1 => Script::ByCall(|call| Some(if call >= 3 { 96.0 } else { 70.0 })),
                2 => Script::Sequence(VecDeque::from(vec![None, Some(99.0)])),
                _ => Script::Always(Some(10.0)),
            };
            meter = meter.script(&format!("/in/f{}.mp4", i), script);
        }
        let meter = Arc::new(meter);
        let opts = RunOptions {
            initial_cq: 10,
            encode_workers: 3,
            quality_workers: 2,
            ..options(dir.path())
        };

        let inputs: Vec<String> = (0..20).map(|i| format!("/in/f{}.mp4", i)).collect();
        let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        let summary = run_with(opts, encoder.clone(), meter, &inputs).await;

        assert_eq!(summary.tasks.len(), 20);
        assert!(summary.is_complete());
        assert_eq!(summary.accepted() + summary.abandoned(), 20);
        for task in &summary.tasks {
            let mut sorted = task.cq_attempts.clone();
            sorted.sort_unstable_by(|a, b| b.cmp(a));
            sorted.dedup();
            assert_eq!(sorted, task.cq_attempts, "cq must strictly decrease");
        }
        // "always 10" files walk 10, 8, 6, 4, 2, 0
        assert_eq!(encoder.cqs_for("/in/f3.mp4"), vec![10, 8, 6, 4, 2, 0]);
    }

    // For any multiset of inputs, each unique path ends with exactly one record
    // and every record is terminal.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_every_unique_input_has_one_outcome(
            picks in prop::collection::vec(0usize..6, 0..12),
            threshold in 0.0f64..=100.0,
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let dir = TempDir::new().unwrap();
            let inputs: Vec<String> = picks.iter().map(|i| format!("/in/clip{}.mp4", i)).collect();
            let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();

            let summary = runtime.block_on(run_with(
                RunOptions { threshold, initial_cq: 6, ..options(dir.path()) },
                Arc::new(FakeEncoder::default()),
                Arc::new(FakeMeter::always(Some(50.0))),
                &inputs,
            ));

            let unique: HashSet<&str> = inputs.iter().copied().collect();
            prop_assert_eq!(summary.tasks.len(), unique.len());
            prop_assert!(summary.is_complete());
            for source in unique {
                prop_assert_eq!(
                    summary.tasks.iter().filter(|t| t.source == Path::new(source)).count(),
                    1
                );
            }
        }
    }
}
