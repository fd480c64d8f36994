pub mod core;
pub mod handler;
pub mod task;

pub use self::core::UploadScheduler;
pub use handler::UploadHandler;
pub use task::{QueueSnapshot, TaskState, TaskSummary, UploadTask};
