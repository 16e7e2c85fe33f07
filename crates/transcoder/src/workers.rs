//! Encode and quality-check worker loops
//!
//! Workers never talk to each other; every hand-off goes through the two
//! counting queues. Each loop runs until its cancellation token fires, which is
//! only observed while waiting for the next item.

use crate::encode::Encoder;
use crate::ledger::{AbandonReason, SharedLedger, TaskKey, TaskOutcome};
use crate::policy::{decide, Decision};
use crate::quality::QualityMeter;
use crate::queue::{CountingQueue, QueueError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One pending encode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeItem {
    pub source: PathBuf,
    pub output: PathBuf,
    pub cq: u32,
}

impl EncodeItem {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.source, &self.output)
    }
}

/// One encoded candidate waiting for its quality score
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityItem {
    /// Newly encoded file
    pub candidate: PathBuf,
    /// Original source, used as ground truth
    pub reference: PathBuf,
    /// cq the candidate was encoded with
    pub cq: u32,
    /// Unmeasurable results so far for this candidate
    pub failed_measurements: u32,
}

impl QualityItem {
    fn from_encode(item: &EncodeItem) -> Self {
        Self {
            candidate: item.output.clone(),
            reference: item.source.clone(),
            cq: item.cq,
            failed_measurements: 0,
        }
    }

    /// Encode attempt for the same task at a new cq; the candidate path is reused
    fn retry_at(&self, cq: u32) -> EncodeItem {
        EncodeItem {
            source: self.reference.clone(),
            output: self.candidate.clone(),
            cq,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.reference, &self.candidate)
    }
}

/// The two queues of a run
pub struct PipelineQueues {
    pub encode: CountingQueue<EncodeItem>,
    pub quality: CountingQueue<QualityItem>,
}

impl PipelineQueues {
    pub fn new() -> Self {
        Self {
            encode: CountingQueue::new("encode"),
            quality: CountingQueue::new("quality"),
        }
    }

    /// Refuse further enqueues on both queues
    pub fn close(&self) {
        self.encode.close();
        self.quality.close();
    }
}

impl Default for PipelineQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings the quality workers feed into the policy
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackSettings {
    pub threshold: f64,
    pub cq_step: u32,
    /// None retries unmeasurable candidates forever
    pub max_measure_attempts: Option<u32>,
}

/// Everything a worker needs, shared by both pools
pub struct WorkerContext {
    pub queues: Arc<PipelineQueues>,
    pub encoder: Arc<dyn Encoder>,
    pub meter: Arc<dyn QualityMeter>,
    pub ledger: SharedLedger,
    pub feedback: FeedbackSettings,
}

/// Encode worker loop
pub async fn run_encode_worker(id: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = ctx.queues.encode.dequeue() => next,
        };

        let item = match next {
            Ok(item) => item,
            Err(e) => {
                error!(worker = id, error = %e, "encode queue unavailable, stopping worker");
                break;
            }
        };

        ctx.process_encode(id, item).await;
        mark_done(&ctx.queues.encode, id);
    }

    debug!(worker = id, "encode worker stopped");
}

/// Quality-check worker loop
pub async fn run_quality_worker(id: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = ctx.queues.quality.dequeue() => next,
        };

        let item = match next {
            Ok(item) => item,
            Err(e) => {
                error!(worker = id, error = %e, "quality queue unavailable, stopping worker");
                break;
            }
        };

        ctx.process_quality(id, item).await;
        // Only after any follow-up item is already enqueued
        mark_done(&ctx.queues.quality, id);
    }

    debug!(worker = id, "quality worker stopped");
}

/// Remove whatever a failed encode left at `output`
async fn discard_output(worker: usize, output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(worker, output = %output.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            worker,
            output = %output.display(),
            error = %e,
            "could not remove partial output"
        ),
    }
}

fn mark_done<T: Send>(queue: &CountingQueue<T>, worker: usize) {
    if let Err(e) = queue.mark_done() {
        error!(worker, queue = queue.name(), error = %e, "mark_done failed");
    }
}

impl WorkerContext {
    async fn process_encode(&self, worker: usize, item: EncodeItem) {
        let key = item.key();
        self.ledger.write().await.start_encode(&key, item.cq);

        info!(
            worker,
            cq = item.cq,
            source = %item.source.display(),
            "encode started"
        );

        match self.encoder.encode(&item.source, &item.output, item.cq).await {
            Ok(()) => {
                self.ledger.write().await.await_measure(&key);
                self.forward(&key, self.queues.quality.enqueue(QualityItem::from_encode(&item)));
                info!(
                    worker,
                    cq = item.cq,
                    source = %item.source.display(),
                    "encode finished"
                );
            }
            Err(e) => {
                error!(
                    worker,
                    cq = item.cq,
                    source = %item.source.display(),
                    error = %e,
                    "encode failed, abandoning file"
                );
                discard_output(worker, &item.output).await;
                let reason = AbandonReason::EncodeFailed {
                    error: e.to_string(),
                };
                self.ledger
                    .write()
                    .await
                    .finish(&key, TaskOutcome::Abandoned(reason));
            }
        }
    }

    async fn process_quality(&self, worker: usize, item: QualityItem) {
        let key = item.key();

        info!(
            worker,
            cq = item.cq,
            source = %item.reference.display(),
            "vmaf started"
        );

        match self.meter.measure(&item.candidate, &item.reference).await {
            Ok(score) => {
                self.ledger.write().await.record_measure(&key, Some(score));
                self.apply_decision(worker, &key, &item, score).await;
            }
            Err(e) => {
                self.ledger.write().await.record_measure(&key, None);
                self.handle_unmeasurable(worker, &key, item, e).await;
            }
        }
    }

    async fn apply_decision(&self, worker: usize, key: &TaskKey, item: &QualityItem, score: f64) {
        let decision = decide(
            score,
            self.feedback.threshold,
            item.cq,
            self.feedback.cq_step,
        );

        match decision {
            Decision::Accept => {
                info!(
                    worker,
                    cq = item.cq,
                    score,
                    source = %item.reference.display(),
                    "vmaf passed, keeping candidate"
                );
                self.ledger
                    .write()
                    .await
                    .finish(key, TaskOutcome::Accepted { cq: item.cq, score });
            }
            Decision::Retry(next_cq) => {
                info!(
                    worker,
                    cq = item.cq,
                    next_cq,
                    score,
                    source = %item.reference.display(),
                    "vmaf below threshold, encoding again"
                );
                self.ledger.write().await.requeue(key);
                self.forward(key, self.queues.encode.enqueue(item.retry_at(next_cq)));
            }
            Decision::Abandon => {
                warn!(
                    worker,
                    cq = item.cq,
                    score,
                    source = %item.reference.display(),
                    "vmaf below threshold and cq exhausted, keeping last candidate"
                );
                let reason = AbandonReason::CqExhausted {
                    last_cq: item.cq,
                    last_score: score,
                };
                self.ledger
                    .write()
                    .await
                    .finish(key, TaskOutcome::Abandoned(reason));
            }
        }
    }

    async fn handle_unmeasurable(
        &self,
        worker: usize,
        key: &TaskKey,
        item: QualityItem,
        error: crate::quality::MeasureError,
    ) {
        let failures = item.failed_measurements.saturating_add(1);

        let capped = match self.feedback.max_measure_attempts {
            Some(cap) => failures >= cap,
            None => false,
        };

        if capped {
            warn!(
                worker,
                cq = item.cq,
                attempts = failures,
                source = %item.reference.display(),
                error = %error,
                "vmaf failed too often, giving up on file"
            );
            let reason = AbandonReason::MeasurementUnavailable { attempts: failures };
            self.ledger
                .write()
                .await
                .finish(key, TaskOutcome::Abandoned(reason));
            return;
        }

        warn!(
            worker,
            cq = item.cq,
            attempts = failures,
            source = %item.reference.display(),
            error = %error,
            "vmaf failed, retrying"
        );
        let retry = QualityItem {
            failed_measurements: failures,
            ..item
        };
        self.forward(key, self.queues.quality.enqueue(retry));
    }

    /// Log a failed hand-off; the task then stays non-terminal in the ledger
    fn forward(&self, key: &TaskKey, enqueued: Result<(), QueueError>) {
        if let Err(e) = enqueued {
            error!(
                source = %key.source.display(),
                error = %e,
                "could not hand off work item, file left unfinished"
            );
        }
    }
}
