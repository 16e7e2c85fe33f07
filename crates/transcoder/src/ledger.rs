//! Task ledger for the transcoder
//!
//! Explicit per-file record of what the queues are doing. Scheduling never reads
//! it; it exists so a run can report one terminal outcome per input file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Identity of a logical task: one source file and the output it produces
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub source: PathBuf,
    pub output: PathBuf,
}

impl TaskKey {
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
        }
    }
}

/// Where a task currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the encode queue
    Queued,
    Encoding,
    /// Waiting for or running a quality measurement
    Measuring,
    Accepted,
    Abandoned,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Encoding => write!(f, "encoding"),
            TaskState::Measuring => write!(f, "measuring"),
            TaskState::Accepted => write!(f, "accepted"),
            TaskState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Why a task stopped without meeting the quality threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AbandonReason {
    /// The encoder process failed; no candidate from this attempt
    EncodeFailed { error: String },
    /// Every cq down to the floor scored below threshold; last candidate kept
    CqExhausted { last_cq: u32, last_score: f64 },
    /// The candidate could not be scored within the configured attempt cap
    MeasurementUnavailable { attempts: u32 },
    /// Another input already produces the same output file
    OutputCollision { claimed_by: PathBuf },
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::EncodeFailed { error } => write!(f, "encode failed: {}", error),
            AbandonReason::CqExhausted {
                last_cq,
                last_score,
            } => write!(f, "cq exhausted at {} (score {:.2})", last_cq, last_score),
            AbandonReason::MeasurementUnavailable { attempts } => {
                write!(f, "no VMAF score after {} attempts", attempts)
            }
            AbandonReason::OutputCollision { claimed_by } => {
                write!(f, "output already claimed by {}", claimed_by.display())
            }
        }
    }
}

/// Terminal outcome of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Accepted { cq: u32, score: f64 },
    Abandoned(AbandonReason),
}

/// Everything known about one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub source: PathBuf,
    pub output: PathBuf,
    pub state: TaskState,
    /// cq of every encode attempt, in order
    pub cq_attempts: Vec<u32>,
    /// Encoder invocations
    pub encode_runs: u32,
    /// Quality meter invocations, including unmeasurable ones
    pub measure_runs: u32,
    pub last_score: Option<f64>,
    pub outcome: Option<TaskOutcome>,
    /// Unix timestamp (milliseconds) of the last change
    pub updated_at: i64,
}

impl TaskRecord {
    fn new(key: &TaskKey) -> Self {
        Self {
            source: key.source.clone(),
            output: key.output.clone(),
            state: TaskState::Queued,
            cq_attempts: Vec::new(),
            encode_runs: 0,
            measure_runs: 0,
            last_score: None,
            outcome: None,
            updated_at: current_timestamp_ms(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }
}

/// Ledger of all tasks in one run, in seeding order
#[derive(Debug, Default)]
pub struct RunLedger {
    tasks: Vec<TaskRecord>,
    index: HashMap<TaskKey, usize>,
}

/// Shared ledger state for the workers and the orchestrator
pub type SharedLedger = Arc<RwLock<RunLedger>>;

/// Create a new empty shared ledger
pub fn new_shared_ledger() -> SharedLedger {
    Arc::new(RwLock::new(RunLedger::default()))
}

impl RunLedger {
    /// Add a task; returns false if the key is already present
    pub fn register(&mut self, key: &TaskKey) -> bool {
        if self.index.contains_key(key) {
            return false;
        }
        self.index.insert(key.clone(), self.tasks.len());
        self.tasks.push(TaskRecord::new(key));
        true
    }

    pub fn get(&self, key: &TaskKey) -> Option<&TaskRecord> {
        self.index.get(key).map(|&i| &self.tasks[i])
    }

    fn get_mut(&mut self, key: &TaskKey) -> Option<&mut TaskRecord> {
        match self.index.get(key) {
            Some(&i) => self.tasks.get_mut(i),
            None => {
                tracing::error!(source = %key.source.display(), "update for unknown task");
                None
            }
        }
    }

    pub fn start_encode(&mut self, key: &TaskKey, cq: u32) {
        if let Some(task) = self.get_mut(key) {
            task.state = TaskState::Encoding;
            task.cq_attempts.push(cq);
            task.encode_runs += 1;
            task.touch();
        }
    }

    /// Candidate produced; now waiting for its score
    pub fn await_measure(&mut self, key: &TaskKey) {
        if let Some(task) = self.get_mut(key) {
            task.state = TaskState::Measuring;
            task.touch();
        }
    }

    pub fn record_measure(&mut self, key: &TaskKey, score: Option<f64>) {
        if let Some(task) = self.get_mut(key) {
            task.measure_runs += 1;
            if score.is_some() {
                task.last_score = score;
            }
            task.touch();
        }
    }

    /// Back into the encode queue with a stricter cq
    pub fn requeue(&mut self, key: &TaskKey) {
        if let Some(task) = self.get_mut(key) {
            task.state = TaskState::Queued;
            task.touch();
        }
    }

    /// Record the terminal outcome; a second outcome for the same task is
    /// refused and logged. Returns whether the outcome was applied.
    pub fn finish(&mut self, key: &TaskKey, outcome: TaskOutcome) -> bool {
        let Some(task) = self.get_mut(key) else {
            return false;
        };

        if let Some(existing) = &task.outcome {
            tracing::error!(
                source = %key.source.display(),
                ?existing,
                rejected = ?outcome,
                "task already has a terminal outcome"
            );
            return false;
        }

        task.state = match outcome {
            TaskOutcome::Accepted { .. } => TaskState::Accepted,
            TaskOutcome::Abandoned(_) => TaskState::Abandoned,
        };
        task.outcome = Some(outcome);
        task.touch();
        true
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: i64,
    pub finished_at: i64,
    pub tasks: Vec<TaskRecord>,
}

impl RunSummary {
    pub fn from_ledger(ledger: &RunLedger, started_at: i64) -> Self {
        Self {
            started_at,
            finished_at: current_timestamp_ms(),
            tasks: ledger.tasks().to_vec(),
        }
    }

    pub fn accepted(&self) -> usize {
        self.count_state(TaskState::Accepted)
    }

    pub fn abandoned(&self) -> usize {
        self.count_state(TaskState::Abandoned)
    }

    /// Whether every task reached a terminal outcome
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(TaskRecord::is_terminal)
    }

    pub fn task_for(&self, source: &Path) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.source == source)
    }

    fn count_state(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
