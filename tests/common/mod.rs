#![allow(dead_code)]

use dropq::{
    BatchId, EventSink, FileInfo, TaskIndex, TransferError, TransferRequest, Transport,
    UploadFile, UploadHandler, UploadScheduler, UploadSettings,
};
use std::{cell::RefCell, collections::VecDeque, time::Duration};

/// Holds every started transfer so tests decide how and when it ends.
#[derive(Default)]
pub struct RecordingTransport {
    started: RefCell<Vec<(TransferRequest, EventSink)>>,
    order: RefCell<Vec<u64>>,
}

impl Transport for RecordingTransport {
    fn start(&self, request: TransferRequest, sink: EventSink) {
        self.order.borrow_mut().push(request.index.0);
        self.started.borrow_mut().push((request, sink));
    }
}

impl RecordingTransport {
    /// Indices in the order their transfers were opened.
    pub fn start_order(&self) -> Vec<u64> {
        self.order.borrow().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.started.borrow().len()
    }

    pub fn take(&self, index: u64) -> (TransferRequest, EventSink) {
        let mut started = self.started.borrow_mut();
        let pos = started
            .iter()
            .position(|(request, _)| request.index == TaskIndex(index))
            .unwrap_or_else(|| panic!("task {index} was never started"));
        started.remove(pos)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Seen {
    BatchStarted(String),
    Started(u64),
    Finished(u64),
    Failed(u64),
    Progress(u64, u8),
    BatchFinished(String),
}

/// Records callbacks in order. Batch ids are handed out from `names`,
/// falling back to `batch-N`.
#[derive(Default)]
pub struct Recorder {
    pub seen: Vec<Seen>,
    pub names: VecDeque<String>,
    batches: usize,
}

impl Recorder {
    pub fn named(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn count(&self, wanted: &Seen) -> usize {
        self.seen.iter().filter(|seen| *seen == wanted).count()
    }

    pub fn since(&self, marker: &Seen) -> &[Seen] {
        let pos = self
            .seen
            .iter()
            .position(|seen| seen == marker)
            .unwrap_or_else(|| panic!("{marker:?} never happened"));
        &self.seen[pos + 1..]
    }
}

impl UploadHandler for Recorder {
    fn batch_started(&mut self) -> BatchId {
        self.batches += 1;
        let name = self
            .names
            .pop_front()
            .unwrap_or_else(|| format!("batch-{}", self.batches));
        self.seen.push(Seen::BatchStarted(name.clone()));
        BatchId(name)
    }

    fn upload_started(&mut self, index: TaskIndex, _file: &FileInfo) {
        self.seen.push(Seen::Started(index.0));
    }

    fn upload_finished(&mut self, index: TaskIndex, _file: &FileInfo, _elapsed: Duration) {
        self.seen.push(Seen::Finished(index.0));
    }

    fn upload_failed(&mut self, index: TaskIndex, _file: &FileInfo, _error: &TransferError) {
        self.seen.push(Seen::Failed(index.0));
    }

    fn file_upload_progress_updated(&mut self, index: TaskIndex, _file: &FileInfo, percent: u8) {
        self.seen.push(Seen::Progress(index.0, percent));
    }

    fn batch_finished(&mut self, batch_id: &BatchId) {
        self.seen.push(Seen::BatchFinished(batch_id.to_string()));
    }
}

pub type TestScheduler = UploadScheduler<RecordingTransport, Recorder>;

pub fn scheduler(max_concurrency: usize, handler: Recorder) -> TestScheduler {
    let settings = UploadSettings {
        max_concurrency,
        ..UploadSettings::with_destination("http://localhost:8080/nuxeo/")
    };
    UploadScheduler::from_settings(&settings, RecordingTransport::default(), handler)
        .expect("valid settings")
}

pub fn file(name: &str, size: usize) -> UploadFile {
    UploadFile::from_bytes(name, None, vec![0u8; size])
}

pub fn files(count: usize) -> Vec<UploadFile> {
    (0..count).map(|i| file(&format!("file-{i}.bin"), 16)).collect()
}

/// Completes a started transfer and applies the resulting events.
pub fn complete(scheduler: &mut TestScheduler, index: u64) {
    let (_request, sink) = scheduler.transport().take(index);
    sink.complete();
    scheduler.pump();
}

pub fn fail(scheduler: &mut TestScheduler, index: u64) {
    let (_request, sink) = scheduler.transport().take(index);
    sink.fail(TransferError::TransferFailed("connection reset".into()));
    scheduler.pump();
}
