pub mod upload_settings;

pub use upload_settings::{
    SchedulerConfig, UploadSettings, DEFAULT_EXTENDED_MODE_TIMEOUT_MS, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_UPLOAD_RATE_REFRESH_MS,
};
