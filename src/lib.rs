pub mod error;
pub mod ingest;
pub mod settings;
pub mod transfer;
pub mod upload_manager;

pub use error::{ConfigError, TransferError};
pub use ingest::{files_from_paths, Disposition, DropZone, Gesture};
pub use settings::{SchedulerConfig, UploadSettings};
pub use transfer::{
    BatchId, CancelToken, EventSink, FileInfo, FileSource, HttpTransport, TaskIndex,
    TransferEvent, TransferEventKind, TransferRequest, Transport, UploadFile,
};
pub use upload_manager::{
    QueueSnapshot, TaskState, TaskSummary, UploadHandler, UploadScheduler, UploadTask,
};
