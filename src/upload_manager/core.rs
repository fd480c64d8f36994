use super::{
    handler::UploadHandler,
    task::{Batch, BatchKey, QueueSnapshot, TaskState, UploadTask},
};
use crate::error::{ConfigError, TransferError};
use crate::settings::{SchedulerConfig, UploadSettings};
use crate::transfer::{
    BatchId, EventSink, TaskIndex, TransferEvent, TransferEventKind, TransferRequest, Transport,
    UploadFile,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::mpsc::{self, Receiver, Sender},
    time::Instant,
};
use tracing::{debug, info, warn};

const CANCELLED_BEFORE_START: &str = "cancelled before the upload started";

/// Bounded-concurrency upload queue for one drop target.
///
/// All state is owned here and mutated from a single thread. Transports only
/// talk back through [`TransferEvent`]s, which the owner feeds in with
/// [`pump`](Self::pump), [`run_until_idle`](Self::run_until_idle) or
/// [`dispatch`](Self::dispatch).
///
/// Finished tasks stay visible to [`task`](Self::task) and
/// [`snapshot`](Self::snapshot). Once their batch has settled, only the most
/// recent `history_limit` of them are kept; [`clear_history`](Self::clear_history)
/// drops the rest on demand.
pub struct UploadScheduler<T: Transport, H: UploadHandler> {
    config: SchedulerConfig,
    transport: T,
    handler: H,
    tasks: BTreeMap<TaskIndex, UploadTask>,
    pending: VecDeque<TaskIndex>,
    /// Terminal tasks, oldest first.
    history: VecDeque<TaskIndex>,
    batches: HashMap<BatchKey, Batch>,
    active_count: usize,
    admitting: bool,
    next_index: u64,
    next_batch: u64,
    events_tx: Sender<TransferEvent>,
    events: Receiver<TransferEvent>,
}

impl<T: Transport, H: UploadHandler> UploadScheduler<T, H> {
    pub fn new(config: SchedulerConfig, transport: T, handler: H) -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            config,
            transport,
            handler,
            tasks: BTreeMap::new(),
            pending: VecDeque::new(),
            history: VecDeque::new(),
            batches: HashMap::new(),
            active_count: 0,
            admitting: false,
            next_index: 0,
            next_batch: 0,
            events_tx,
            events,
        }
    }

    pub fn from_settings(
        settings: &UploadSettings,
        transport: T,
        handler: H,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(settings.validate()?, transport, handler))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Batches that still have tasks queued or in flight.
    pub fn open_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active_count == 0 && self.pending.is_empty()
    }

    pub fn task(&self, index: TaskIndex) -> Option<&UploadTask> {
        self.tasks.get(&index)
    }

    pub fn task_state(&self, index: TaskIndex) -> Option<TaskState> {
        self.tasks.get(&index).map(|task| task.state)
    }

    /// Queues `files` as one batch and starts as many as the cap allows.
    pub fn enqueue<I>(&mut self, files: I) -> BatchId
    where
        I: IntoIterator<Item = UploadFile>,
    {
        let batch_id = self.handler.batch_started();
        let key = BatchKey(self.next_batch);
        self.next_batch += 1;

        let mut count = 0;
        for UploadFile { info, source } in files {
            let index = TaskIndex(self.next_index);
            self.next_index += 1;
            self.tasks.insert(
                index,
                UploadTask::queued(index, info, source, key, batch_id.clone()),
            );
            self.pending.push_back(index);
            count += 1;
        }
        info!(batch = %batch_id, files = count, "batch started");

        if count == 0 {
            // Nothing will ever decrement this batch, so it is already done.
            self.handler.batch_finished(&batch_id);
            return batch_id;
        }
        self.batches.insert(key, Batch::new(batch_id.clone(), count));

        if !self.admitting {
            self.admit();
        }
        batch_id
    }

    /// Starts queued tasks in FIFO order until the queue is empty or the cap
    /// is reached. Does nothing when an admission pass is already running.
    pub fn admit(&mut self) {
        if self.admitting {
            return;
        }
        self.admitting = true;

        while !self.pending.is_empty() && self.active_count < self.config.max_concurrency {
            let Some(index) = self.pending.pop_front() else {
                break;
            };
            self.start_task(index);

            if self.active_count == self.config.max_concurrency {
                debug!(
                    active = self.active_count,
                    queued = self.pending.len(),
                    "concurrency cap reached, pausing admission"
                );
                break;
            }
        }

        self.admitting = false;
    }

    fn start_task(&mut self, index: TaskIndex) {
        let Some(task) = self.tasks.get_mut(&index) else {
            warn!(%index, "queued index has no task");
            return;
        };
        if !task.activate(Instant::now()) {
            warn!(%index, state = ?task.state, "refusing to start task");
            return;
        }
        self.active_count += 1;

        let sink = EventSink::new(index, self.events_tx.clone());
        match task.source.take() {
            Some(source) => {
                let request = TransferRequest {
                    index,
                    batch_id: task.batch_id.clone(),
                    file: task.file.clone(),
                    source,
                    endpoint: self.config.endpoint.clone(),
                    method: self.config.method.clone(),
                    cancel: task.cancel.clone(),
                };
                self.transport.start(request, sink);
            }
            None => {
                warn!(%index, "task has no file source");
                drop(sink);
            }
        }

        debug!(%index, file = %task.file.name, active = self.active_count, "upload started");
        self.handler.upload_started(index, &task.file);
    }

    /// Applies one event reported by a transfer channel.
    pub fn dispatch(&mut self, event: TransferEvent) {
        let TransferEvent { index, at, kind } = event;
        match kind {
            TransferEventKind::Progress { loaded, total } => {
                self.on_task_progress(index, at, loaded, total)
            }
            TransferEventKind::Completed => self.on_task_terminal(index, at, Ok(())),
            TransferEventKind::Failed(err) => self.on_task_terminal(index, at, Err(err)),
        }
    }

    fn on_task_progress(&mut self, index: TaskIndex, at: Instant, loaded: u64, total: Option<u64>) {
        let Some(task) = self.tasks.get_mut(&index) else {
            return;
        };
        if task.state != TaskState::Active {
            debug!(%index, state = ?task.state, "ignoring progress for inactive task");
            return;
        }
        // Transfers without a computable length report no progress at all.
        let Some(total) = total.filter(|total| *total > 0) else {
            return;
        };

        let percent = ((loaded as f64 * 100.0) / total as f64).round().min(100.0) as u8;
        if percent > task.progress_percent {
            task.progress_percent = percent;
            self.handler
                .file_upload_progress_updated(index, &task.file, percent);
        }

        let last_sample_at = task.last_sample_at.unwrap_or(at);
        let elapsed = at.saturating_duration_since(last_sample_at);
        if elapsed >= self.config.upload_rate_refresh_interval && !elapsed.is_zero() {
            let delta_bytes = loaded.saturating_sub(task.bytes_at_last_sample);
            let bytes_per_ms = delta_bytes as f64 / (elapsed.as_secs_f64() * 1000.0);
            self.handler
                .file_upload_speed_updated(index, &task.file, bytes_per_ms);
            task.bytes_at_last_sample = loaded;
            task.last_sample_at = Some(at);
        }
    }

    fn on_task_terminal(&mut self, index: TaskIndex, at: Instant, outcome: Result<(), TransferError>) {
        let Some(task) = self.tasks.get_mut(&index) else {
            warn!(%index, "terminal event for unknown task");
            return;
        };
        let next = if outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        if task.state != TaskState::Active || !task.advance(next) {
            warn!(%index, state = ?task.state, "ignoring terminal event for inactive task");
            return;
        }
        self.active_count = self.active_count.saturating_sub(1);

        let elapsed = task
            .started_at
            .map(|started| at.saturating_duration_since(started))
            .unwrap_or_default();
        match &outcome {
            Ok(()) => {
                info!(%index, file = %task.file.name, elapsed_ms = elapsed.as_millis() as u64, "upload finished");
                self.handler.upload_finished(index, &task.file, elapsed);
            }
            Err(err) => {
                warn!(%index, file = %task.file.name, error = %err, "upload failed");
                task.error = Some(err.to_string());
                self.handler.upload_failed(index, &task.file, err);
            }
        }

        let batch = task.batch;
        self.history.push_back(index);
        self.settle_batch(batch, outcome.is_err());
        self.trim_history();
        self.admit();
    }

    fn settle_batch(&mut self, key: BatchKey, failed: bool) {
        let finished = match self.batches.get_mut(&key) {
            Some(batch) => batch.record_terminal(failed),
            None => {
                warn!(batch = key.0, "task belongs to no open batch");
                false
            }
        };
        if finished {
            if let Some(batch) = self.batches.remove(&key) {
                info!(batch = %batch.id, files = batch.size, failed = batch.failed, "batch finished");
                self.handler.batch_finished(&batch.id);
            }
        }
    }

    /// Forgets the oldest terminal tasks beyond `history_limit`, skipping
    /// those whose batch is still open.
    fn trim_history(&mut self) {
        while self.history.len() > self.config.history_limit {
            let settled = self.history.iter().position(|index| {
                self.tasks
                    .get(index)
                    .map_or(true, |task| !self.batches.contains_key(&task.batch))
            });
            let Some(position) = settled else {
                break;
            };
            if let Some(index) = self.history.remove(position) {
                self.tasks.remove(&index);
            }
        }
    }

    /// Aborts a task. A queued task fails immediately; an active one is
    /// signalled and fails once its channel notices. Returns false for
    /// terminal or unknown tasks.
    pub fn cancel(&mut self, index: TaskIndex) -> bool {
        let Some(task) = self.tasks.get_mut(&index) else {
            return false;
        };
        let state = task.state;
        match state {
            TaskState::Active => {
                task.cancel.cancel();
                debug!(%index, "cancellation signalled");
                true
            }
            TaskState::Queued => {
                self.pending.retain(|queued| *queued != index);
                task.advance(TaskState::Failed);
                task.source = None;
                task.error = Some(CANCELLED_BEFORE_START.to_string());
                info!(%index, file = %task.file.name, "queued upload cancelled");
                self.handler
                    .upload_failed(index, &task.file, &TransferError::Cancelled);
                let batch = task.batch;
                self.history.push_back(index);
                self.settle_batch(batch, true);
                self.trim_history();
                true
            }
            TaskState::Completed | TaskState::Failed => false,
        }
    }

    /// Applies every event already delivered, without blocking.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Blocks on the event stream until nothing is queued or in flight.
    pub fn run_until_idle(&mut self) {
        self.admit();
        while self.active_count > 0 {
            match self.events.recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => break,
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut snapshot = QueueSnapshot::default();
        for task in self.tasks.values() {
            let bucket = match task.state {
                TaskState::Queued => &mut snapshot.queued,
                TaskState::Active => &mut snapshot.active,
                TaskState::Completed => &mut snapshot.completed,
                TaskState::Failed => &mut snapshot.failed,
            };
            bucket.push(task.summary());
        }
        snapshot
    }

    /// Forgets completed and failed tasks. Returns how many were dropped.
    pub fn clear_history(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !task.state.is_terminal());
        self.history.clear();
        before - self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{FileInfo, TaskIndex};
    use std::{cell::RefCell, time::Duration};

    /// Keeps sinks so a test decides when and how transfers end.
    #[derive(Default)]
    struct ManualTransport {
        started: RefCell<Vec<(TransferRequest, EventSink)>>,
    }

    impl Transport for ManualTransport {
        fn start(&self, request: TransferRequest, sink: EventSink) {
            self.started.borrow_mut().push((request, sink));
        }
    }

    impl ManualTransport {
        fn take(&self, index: u64) -> (TransferRequest, EventSink) {
            let mut started = self.started.borrow_mut();
            let pos = started
                .iter()
                .position(|(request, _)| request.index == TaskIndex(index))
                .unwrap();
            started.remove(pos)
        }
    }

    #[derive(Default)]
    struct Recorder {
        progress: Vec<(u64, u8)>,
        speeds: Vec<(u64, f64)>,
        finished: Vec<u64>,
        elapsed: Vec<Duration>,
        failed: Vec<u64>,
        batches: Vec<String>,
    }

    impl UploadHandler for Recorder {
        fn batch_started(&mut self) -> BatchId {
            BatchId::from("batch")
        }
        fn upload_finished(&mut self, index: TaskIndex, _file: &FileInfo, elapsed: Duration) {
            self.finished.push(index.0);
            self.elapsed.push(elapsed);
        }
        fn upload_failed(&mut self, index: TaskIndex, _file: &FileInfo, _error: &TransferError) {
            self.failed.push(index.0);
        }
        fn file_upload_progress_updated(&mut self, index: TaskIndex, _file: &FileInfo, percent: u8) {
            self.progress.push((index.0, percent));
        }
        fn file_upload_speed_updated(&mut self, index: TaskIndex, _file: &FileInfo, speed: f64) {
            self.speeds.push((index.0, speed));
        }
        fn batch_finished(&mut self, batch_id: &BatchId) {
            self.batches.push(batch_id.to_string());
        }
    }

    fn scheduler(max_concurrency: usize) -> UploadScheduler<ManualTransport, Recorder> {
        scheduler_with(UploadSettings {
            max_concurrency,
            ..UploadSettings::with_destination("http://localhost/")
        })
    }

    fn scheduler_with(settings: UploadSettings) -> UploadScheduler<ManualTransport, Recorder> {
        UploadScheduler::from_settings(&settings, ManualTransport::default(), Recorder::default())
            .unwrap()
    }

    fn file(name: &str, size: usize) -> UploadFile {
        UploadFile::from_bytes(name, None, vec![0u8; size])
    }

    #[test]
    fn invalid_settings_build_nothing() {
        let settings = UploadSettings {
            max_concurrency: 0,
            ..UploadSettings::with_destination("http://localhost/")
        };
        let result =
            UploadScheduler::from_settings(&settings, ManualTransport::default(), Recorder::default());
        assert!(matches!(result, Err(ConfigError::InvalidConcurrency(0))));
    }

    #[test]
    fn requests_carry_task_metadata() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a.txt", 3)]);
        let (request, sink) = s.transport().take(0);
        assert_eq!(request.batch_id, BatchId::from("batch"));
        assert_eq!(request.file.name, "a.txt");
        assert_eq!(request.file.size, 3);
        assert_eq!(request.endpoint.as_str(), "http://localhost/upload");
        sink.complete();
    }

    #[test]
    fn progress_is_deduplicated_and_monotonic() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 200)]);
        let (_request, sink) = s.transport().take(0);
        let now = Instant::now();

        sink.progress_at(now, 101, Some(200)); // 51%
        sink.progress_at(now, 102, Some(200)); // still 51%
        sink.progress_at(now, 50, Some(200)); // would go backwards
        sink.progress_at(now, 200, Some(200));
        s.pump();

        assert_eq!(s.handler().progress, vec![(0, 51), (0, 100)]);
        assert_eq!(s.task(TaskIndex(0)).unwrap().progress_percent(), 100);
        sink.complete();
    }

    #[test]
    fn unknown_length_skips_progress_and_speed() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 10)]);
        let (_request, sink) = s.transport().take(0);
        sink.progress_at(Instant::now() + Duration::from_secs(5), 10, None);
        s.pump();
        assert!(s.handler().progress.is_empty());
        assert!(s.handler().speeds.is_empty());
        sink.complete();
    }

    #[test]
    fn speed_is_raw_delta_bytes_per_millisecond() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 10_000)]);
        let (_request, sink) = s.transport().take(0);
        let started = s.task(TaskIndex(0)).unwrap().last_sample_at.unwrap();

        // Before the refresh interval: progress only.
        sink.progress_at(started + Duration::from_millis(500), 1_000, Some(10_000));
        s.pump();
        assert!(s.handler().speeds.is_empty());

        sink.progress_at(started + Duration::from_millis(1_500), 3_000, Some(10_000));
        s.pump();
        assert_eq!(s.handler().speeds, vec![(0, 2.0)]);

        // Next sample is measured from the previous one.
        sink.progress_at(started + Duration::from_millis(2_500), 4_000, Some(10_000));
        s.pump();
        assert_eq!(s.handler().speeds, vec![(0, 2.0), (0, 1.0)]);
        sink.complete();
    }

    #[test]
    fn speed_sampling_does_not_depend_on_percent_change() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 1_000_000)]);
        let (_request, sink) = s.transport().take(0);
        let started = s.task(TaskIndex(0)).unwrap().last_sample_at.unwrap();

        sink.progress_at(started + Duration::from_millis(1_000), 1_000, Some(1_000_000));
        s.pump();
        assert!(s.handler().progress.is_empty());
        assert_eq!(s.handler().speeds, vec![(0, 1.0)]);
        sink.complete();
    }

    #[test]
    fn finished_elapsed_is_measured_from_activation() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 4)]);
        let (request, sink) = s.transport().take(0);
        assert_eq!(sink.index(), request.index);
        let started = s.task(TaskIndex(0)).unwrap().started_at.unwrap();

        sink.complete_at(started + Duration::from_millis(750));
        s.pump();
        assert_eq!(s.handler().elapsed, vec![Duration::from_millis(750)]);
    }

    #[test]
    fn failed_transfers_report_no_elapsed_time() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 4)]);
        let (_request, sink) = s.transport().take(0);
        let started = s.task(TaskIndex(0)).unwrap().started_at.unwrap();

        sink.fail_at(started + Duration::from_millis(300), TransferError::Status(503));
        s.pump();
        assert!(s.handler().elapsed.is_empty());
        assert_eq!(s.handler().failed, vec![0]);
    }

    #[test]
    fn failure_frees_the_slot_and_counts_towards_the_batch() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 1), file("b", 1)]);
        let (_request, sink) = s.transport().take(0);
        sink.fail(TransferError::TransferFailed("boom".into()));
        s.pump();

        assert_eq!(s.task_state(TaskIndex(0)), Some(TaskState::Failed));
        assert_eq!(s.task(TaskIndex(0)).unwrap().error(), Some("transfer failed: boom"));
        assert_eq!(s.task_state(TaskIndex(1)), Some(TaskState::Active));
        assert_eq!(s.handler().failed, vec![0]);

        let (_request, sink) = s.transport().take(1);
        sink.complete();
        s.pump();
        assert_eq!(s.handler().batches, vec!["batch"]);
        assert!(s.is_idle());
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 4)]);
        let (_request, sink) = s.transport().take(0);
        let progress = sink.progress_handle();
        sink.complete();
        progress.report(4, Some(4));
        s.pump();

        assert_eq!(s.handler().finished, vec![0]);
        assert!(s.handler().progress.is_empty());
        assert_eq!(s.active_count(), 0);
    }

    #[test]
    fn empty_batch_finishes_immediately() {
        let mut s = scheduler(2);
        let id = s.enqueue(Vec::new());
        assert_eq!(id, BatchId::from("batch"));
        assert_eq!(s.handler().batches, vec!["batch"]);
        assert_eq!(s.open_batches(), 0);
    }

    #[test]
    fn cancelling_a_queued_task_settles_its_batch() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 1), file("b", 1)]);
        assert!(s.cancel(TaskIndex(1)));
        assert_eq!(s.task_state(TaskIndex(1)), Some(TaskState::Failed));
        assert_eq!(s.pending_count(), 0);
        assert!(s.handler().batches.is_empty());

        let (_request, sink) = s.transport().take(0);
        sink.complete();
        s.pump();
        assert_eq!(s.handler().batches, vec!["batch"]);
        assert!(!s.cancel(TaskIndex(0)));
        assert!(!s.cancel(TaskIndex(42)));
    }

    #[test]
    fn cancelling_an_active_task_signals_its_channel() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 1)]);
        assert!(s.cancel(TaskIndex(0)));
        let (request, sink) = s.transport().take(0);
        assert!(request.cancel.is_cancelled());
        assert_eq!(s.task_state(TaskIndex(0)), Some(TaskState::Active));

        sink.fail(TransferError::Cancelled);
        s.pump();
        assert_eq!(s.task_state(TaskIndex(0)), Some(TaskState::Failed));
    }

    #[test]
    fn abandoned_channel_fails_its_task() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 1)]);
        let (_request, sink) = s.transport().take(0);
        drop(sink);
        s.pump();
        assert_eq!(s.task_state(TaskIndex(0)), Some(TaskState::Failed));
        assert_eq!(s.handler().batches, vec!["batch"]);
    }

    #[test]
    fn snapshot_groups_and_clear_history_drops_terminal_tasks() {
        let mut s = scheduler(1);
        s.enqueue(vec![file("a", 1), file("b", 1), file("c", 1)]);
        let (_request, sink) = s.transport().take(0);
        sink.complete();
        s.pump();

        let snapshot = s.snapshot();
        assert_eq!(snapshot.completed.len(), 1);
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.queued.len(), 1);
        assert!(snapshot.failed.is_empty());
        assert_eq!(snapshot.active[0].file.name, "b");

        assert_eq!(s.clear_history(), 1);
        assert!(s.task(TaskIndex(0)).is_none());
        assert!(s.task(TaskIndex(1)).is_some());
    }

    #[test]
    fn settled_history_is_bounded() {
        let mut s = scheduler_with(UploadSettings {
            max_concurrency: 1,
            history_limit: 1,
            ..UploadSettings::with_destination("http://localhost/")
        });
        s.enqueue(vec![file("a", 1), file("b", 1), file("c", 1)]);

        // The batch is still open, so finished tasks are kept past the limit.
        s.transport().take(0).1.complete();
        s.pump();
        s.transport().take(1).1.complete();
        s.pump();
        assert!(s.task(TaskIndex(0)).is_some());
        assert!(s.task(TaskIndex(1)).is_some());

        s.transport().take(2).1.complete();
        s.pump();
        assert_eq!(s.handler().batches, vec!["batch"]);
        assert!(s.task(TaskIndex(0)).is_none());
        assert!(s.task(TaskIndex(1)).is_none());
        assert_eq!(s.task_state(TaskIndex(2)), Some(TaskState::Completed));
        assert_eq!(s.snapshot().completed.len(), 1);
    }
}
