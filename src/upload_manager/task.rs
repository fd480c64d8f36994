use crate::transfer::{BatchId, CancelToken, FileInfo, FileSource, TaskIndex};
use serde::Serialize;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Queued tasks may fail without ever starting when they are cancelled.
    pub fn can_advance_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Queued, TaskState::Active)
                | (TaskState::Queued, TaskState::Failed)
                | (TaskState::Active, TaskState::Completed)
                | (TaskState::Active, TaskState::Failed)
        )
    }
}

/// Scheduler-internal handle of a batch. Batch ids come from the caller and
/// may repeat, so batches are keyed by submission instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BatchKey(pub(crate) u64);

/// One file and its transfer bookkeeping.
#[derive(Debug)]
pub struct UploadTask {
    pub(crate) index: TaskIndex,
    pub(crate) file: FileInfo,
    /// Present while queued; moves into the transfer channel at admission.
    pub(crate) source: Option<FileSource>,
    pub(crate) state: TaskState,
    pub(crate) progress_percent: u8,
    pub(crate) started_at: Option<Instant>,
    pub(crate) last_sample_at: Option<Instant>,
    pub(crate) bytes_at_last_sample: u64,
    pub(crate) batch: BatchKey,
    pub(crate) batch_id: BatchId,
    pub(crate) cancel: CancelToken,
    pub(crate) error: Option<String>,
}

impl UploadTask {
    pub(crate) fn queued(
        index: TaskIndex,
        file: FileInfo,
        source: FileSource,
        batch: BatchKey,
        batch_id: BatchId,
    ) -> Self {
        Self {
            index,
            file,
            source: Some(source),
            state: TaskState::Queued,
            progress_percent: 0,
            started_at: None,
            last_sample_at: None,
            bytes_at_last_sample: 0,
            batch,
            batch_id,
            cancel: CancelToken::new(),
            error: None,
        }
    }

    pub fn index(&self) -> TaskIndex {
        self.index
    }

    pub fn file(&self) -> &FileInfo {
        &self.file
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn progress_percent(&self) -> u8 {
        self.progress_percent
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn advance(&mut self, next: TaskState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub(crate) fn activate(&mut self, now: Instant) -> bool {
        if !self.advance(TaskState::Active) {
            return false;
        }
        self.started_at = Some(now);
        self.last_sample_at = Some(now);
        self.bytes_at_last_sample = 0;
        true
    }

    pub(crate) fn summary(&self) -> TaskSummary {
        TaskSummary {
            index: self.index,
            batch_id: self.batch_id.clone(),
            file: self.file.clone(),
            state: self.state,
            progress_percent: self.progress_percent,
            error: self.error.clone(),
        }
    }
}

/// Tasks submitted by one `enqueue` call.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) id: BatchId,
    pub(crate) size: usize,
    pub(crate) remaining: usize,
    pub(crate) failed: usize,
}

impl Batch {
    pub(crate) fn new(id: BatchId, size: usize) -> Self {
        Self {
            id,
            size,
            remaining: size,
            failed: 0,
        }
    }

    /// Counts one task as done. Returns true when it was the last one.
    pub(crate) fn record_terminal(&mut self, failed: bool) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if failed {
            self.failed += 1;
        }
        self.remaining == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskSummary {
    pub index: TaskIndex,
    pub batch_id: BatchId,
    pub file: FileInfo,
    pub state: TaskState,
    pub progress_percent: u8,
    pub error: Option<String>,
}

/// Point-in-time view of the scheduler, grouped by state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueSnapshot {
    pub queued: Vec<TaskSummary>,
    pub active: Vec<TaskSummary>,
    pub completed: Vec<TaskSummary>,
    pub failed: Vec<TaskSummary>,
}
