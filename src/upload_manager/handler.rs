use crate::error::TransferError;
use crate::transfer::{BatchId, FileInfo, TaskIndex};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle hooks of a drop target. Every method but `batch_started` is an
/// observation point; none of them can steer the scheduler.
pub trait UploadHandler {
    /// Names a batch about to be submitted.
    fn batch_started(&mut self) -> BatchId {
        BatchId(Uuid::new_v4().to_string())
    }

    fn upload_started(&mut self, _index: TaskIndex, _file: &FileInfo) {}

    fn upload_finished(&mut self, _index: TaskIndex, _file: &FileInfo, _elapsed: Duration) {}

    fn upload_failed(&mut self, _index: TaskIndex, _file: &FileInfo, _error: &TransferError) {}

    fn file_upload_progress_updated(&mut self, _index: TaskIndex, _file: &FileInfo, _percent: u8) {
    }

    /// `bytes_per_ms` is the raw delta since the previous sample.
    fn file_upload_speed_updated(&mut self, _index: TaskIndex, _file: &FileInfo, _bytes_per_ms: f64) {
    }

    fn batch_finished(&mut self, _batch_id: &BatchId) {}

    /// A drag gesture lingered over the zone for the extended-mode timeout.
    fn enable_extended_mode(&mut self, _zone_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Defaults;
    impl UploadHandler for Defaults {}

    #[test]
    fn default_batch_ids_are_unique() {
        let mut handler = Defaults;
        let first = handler.batch_started();
        let second = handler.batch_started();
        assert_ne!(first, second);
        assert!(Uuid::parse_str(first.as_str()).is_ok());
    }
}
