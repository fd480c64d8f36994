//! One outbound file transfer and the events it reports back.
//!
//! A transport only sees a [`TransferRequest`] and an [`EventSink`]. It knows
//! nothing about queues or batches: it reports `(loaded, total)` progress while
//! the bytes move and then exactly one terminal event.

pub mod file;
pub mod http;

pub use file::{FileInfo, FileSource, UploadFile};
pub use http::HttpTransport;

use crate::error::TransferError;
use reqwest::Method;
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    time::Instant,
};
use url::Url;

/// Position of a task in submission order. Assigned once, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskIndex(pub u64);

impl fmt::Display for TaskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-chosen label of a batch, returned by the batch-started hook.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        BatchId(value.to_string())
    }
}

/// Abort signal handed to a transfer when it starts.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a transport needs to send one file.
#[derive(Debug)]
pub struct TransferRequest {
    pub index: TaskIndex,
    pub batch_id: BatchId,
    pub file: FileInfo,
    pub source: FileSource,
    pub endpoint: Url,
    pub method: Method,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct TransferEvent {
    pub index: TaskIndex,
    pub at: Instant,
    pub kind: TransferEventKind,
}

#[derive(Debug)]
pub enum TransferEventKind {
    /// `total` is `None` when the length is not computable.
    Progress { loaded: u64, total: Option<u64> },
    Completed,
    Failed(TransferError),
}

impl TransferEventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEventKind::Progress { .. })
    }
}

/// Write end of a transfer's event stream.
///
/// `complete` and `fail` consume the sink, so a channel reports at most one
/// terminal event. A sink dropped without either reports [`TransferError::Abandoned`].
#[derive(Debug)]
pub struct EventSink {
    index: TaskIndex,
    tx: Sender<TransferEvent>,
    finished: bool,
}

impl EventSink {
    pub(crate) fn new(index: TaskIndex, tx: Sender<TransferEvent>) -> Self {
        Self {
            index,
            tx,
            finished: false,
        }
    }

    pub fn index(&self) -> TaskIndex {
        self.index
    }

    pub fn progress(&self, loaded: u64, total: Option<u64>) {
        self.progress_at(Instant::now(), loaded, total);
    }

    pub fn progress_at(&self, at: Instant, loaded: u64, total: Option<u64>) {
        send(&self.tx, self.index, at, TransferEventKind::Progress { loaded, total });
    }

    /// A cloneable handle that can only report progress, for readers that
    /// must be `'static` while the sink itself waits for the outcome.
    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle {
            index: self.index,
            tx: self.tx.clone(),
        }
    }

    pub fn complete(self) {
        self.complete_at(Instant::now());
    }

    pub fn complete_at(mut self, at: Instant) {
        self.finish(at, TransferEventKind::Completed);
    }

    pub fn fail(self, err: TransferError) {
        self.fail_at(Instant::now(), err);
    }

    pub fn fail_at(mut self, at: Instant, err: TransferError) {
        self.finish(at, TransferEventKind::Failed(err));
    }

    fn finish(&mut self, at: Instant, kind: TransferEventKind) {
        if !self.finished {
            self.finished = true;
            send(&self.tx, self.index, at, kind);
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.finish(
            Instant::now(),
            TransferEventKind::Failed(TransferError::Abandoned),
        );
    }
}

#[derive(Clone, Debug)]
pub struct ProgressHandle {
    index: TaskIndex,
    tx: Sender<TransferEvent>,
}

impl ProgressHandle {
    pub fn report(&self, loaded: u64, total: Option<u64>) {
        send(
            &self.tx,
            self.index,
            Instant::now(),
            TransferEventKind::Progress { loaded, total },
        );
    }
}

fn send(tx: &Sender<TransferEvent>, index: TaskIndex, at: Instant, kind: TransferEventKind) {
    // The scheduler owns the receiver for its whole life; a send error only
    // means it is gone and nobody is listening anymore.
    let _ = tx.send(TransferEvent { index, at, kind });
}

/// Performs transfers. `start` must return promptly; the bytes move elsewhere
/// (a worker thread for [`HttpTransport`]) and report through the sink.
pub trait Transport {
    fn start(&self, request: TransferRequest, sink: EventSink);
}
