//! Turns drop and file-picker gestures into scheduler submissions.

use crate::transfer::{BatchId, Transport, UploadFile};
use crate::upload_manager::{UploadHandler, UploadScheduler};
use std::{path::Path, time::Instant};
use tracing::debug;

/// What the platform should do with a gesture after the zone saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum Disposition {
    /// Suppress the default handling (navigating to or opening the file).
    PreventDefault,
}

/// Raw gestures delivered by the UI layer.
#[derive(Debug)]
pub enum Gesture {
    DragEnter,
    DragOver,
    DragLeave,
    Drop(Vec<UploadFile>),
    PickerChanged(Vec<UploadFile>),
}

#[derive(Debug)]
struct Hover {
    entered_at: Instant,
    extended: bool,
}

/// A registered drop target and the scheduler that serves it.
pub struct DropZone<T: Transport, H: UploadHandler> {
    id: String,
    scheduler: UploadScheduler<T, H>,
    staged: Vec<UploadFile>,
    hover: Option<Hover>,
    last_batch: Option<BatchId>,
}

impl<T: Transport, H: UploadHandler> DropZone<T, H> {
    pub fn new(id: impl Into<String>, scheduler: UploadScheduler<T, H>) -> Self {
        Self {
            id: id.into(),
            scheduler,
            staged: Vec::new(),
            hover: None,
            last_batch: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scheduler(&self) -> &UploadScheduler<T, H> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut UploadScheduler<T, H> {
        &mut self.scheduler
    }

    pub fn into_scheduler(self) -> UploadScheduler<T, H> {
        self.scheduler
    }

    /// Files dropped but not yet submitted (direct upload disabled).
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn is_hovered(&self) -> bool {
        self.hover.is_some()
    }

    /// Id of the most recent batch this zone submitted, including those
    /// submitted directly by a drop or a picker selection.
    pub fn last_batch(&self) -> Option<&BatchId> {
        self.last_batch.as_ref()
    }

    pub fn handle(&mut self, gesture: Gesture, now: Instant) -> Disposition {
        match gesture {
            Gesture::DragEnter => self.drag_enter(now),
            Gesture::DragOver => self.drag_over(now),
            Gesture::DragLeave => self.drag_leave(),
            Gesture::Drop(files) => self.drop_files(files),
            Gesture::PickerChanged(files) => self.picker_changed(files),
        }
    }

    /// A drag gesture entered the zone; arms the extended-mode timer.
    pub fn drag_enter(&mut self, now: Instant) -> Disposition {
        if self.hover.is_none() {
            debug!(zone = %self.id, "drag entered");
            self.hover = Some(Hover {
                entered_at: now,
                extended: false,
            });
        }
        Disposition::PreventDefault
    }

    pub fn drag_over(&mut self, now: Instant) -> Disposition {
        self.poll(now);
        Disposition::PreventDefault
    }

    pub fn drag_leave(&mut self) -> Disposition {
        if self.hover.take().is_some() {
            debug!(zone = %self.id, "drag left");
        }
        Disposition::PreventDefault
    }

    /// Fires `enable_extended_mode` once per hover that outlasts the timeout.
    /// Returns true when it fired on this call.
    pub fn poll(&mut self, now: Instant) -> bool {
        let timeout = self.scheduler.config().extended_mode_timeout;
        let Some(hover) = self.hover.as_mut() else {
            return false;
        };
        if hover.extended || now.saturating_duration_since(hover.entered_at) < timeout {
            return false;
        }
        hover.extended = true;
        debug!(zone = %self.id, "enabling extended mode");
        self.scheduler.handler_mut().enable_extended_mode(&self.id);
        true
    }

    pub fn drop_files(&mut self, files: Vec<UploadFile>) -> Disposition {
        self.hover = None;
        self.staged.extend(files);
        if self.scheduler.config().direct_upload {
            let _ = self.flush();
        }
        Disposition::PreventDefault
    }

    /// A picker selection is always submitted right away.
    pub fn picker_changed(&mut self, files: Vec<UploadFile>) -> Disposition {
        self.staged.extend(files);
        let _ = self.flush();
        Disposition::PreventDefault
    }

    /// Submits everything staged so far as one batch.
    pub fn flush(&mut self) -> Option<BatchId> {
        if self.staged.is_empty() {
            return None;
        }
        let files = std::mem::take(&mut self.staged);
        let batch_id = self.scheduler.enqueue(files);
        self.last_batch = Some(batch_id.clone());
        Some(batch_id)
    }
}

/// Describes local files for submission.
pub fn files_from_paths<I, P>(paths: I) -> Vec<UploadFile>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    paths.into_iter().map(|path| UploadFile::from_path(path)).collect()
}
