use anyhow::{bail, Context, Result};
use clap::Parser;
use dropq::{
    files_from_paths, BatchId, DropZone, FileInfo, HttpTransport, SchedulerConfig, TaskIndex,
    TransferError, UploadHandler, UploadScheduler, UploadSettings,
};
use std::{path::PathBuf, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dropq", about = "Upload files with a bounded number of parallel transfers")]
struct Cli {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base endpoint; files are sent to `<url>upload`
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    method: Option<String>,

    /// Print the final queue snapshot as JSON
    #[arg(long)]
    json: bool,

    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Default)]
struct ConsoleHandler {
    failures: usize,
}

impl UploadHandler for ConsoleHandler {
    fn upload_started(&mut self, index: TaskIndex, file: &FileInfo) {
        info!(%index, file = %file.name, size = file.size, "uploading");
    }

    fn upload_finished(&mut self, index: TaskIndex, file: &FileInfo, elapsed: Duration) {
        info!(%index, file = %file.name, elapsed_ms = elapsed.as_millis() as u64, "uploaded");
    }

    fn upload_failed(&mut self, index: TaskIndex, file: &FileInfo, error: &TransferError) {
        self.failures += 1;
        warn!(%index, file = %file.name, %error, "upload failed");
    }

    fn file_upload_progress_updated(&mut self, index: TaskIndex, file: &FileInfo, percent: u8) {
        info!(%index, file = %file.name, percent, "progress");
    }

    fn file_upload_speed_updated(&mut self, index: TaskIndex, file: &FileInfo, bytes_per_ms: f64) {
        info!(%index, file = %file.name, kb_per_sec = bytes_per_ms * 1000.0 / 1024.0, "speed");
    }

    fn batch_finished(&mut self, batch_id: &BatchId) {
        info!(batch = %batch_id, "batch finished");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => UploadSettings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => UploadSettings::default(),
    };
    if let Some(url) = cli.url {
        settings.destination_url = url;
    }
    if let Some(concurrency) = cli.concurrency {
        settings.max_concurrency = concurrency;
    }
    if let Some(method) = cli.method {
        settings.method = method;
    }
    let config = SchedulerConfig::try_from(&settings).context("invalid upload settings")?;

    let transport = HttpTransport::new(config.request_timeout)?;
    let scheduler = UploadScheduler::new(config, transport, ConsoleHandler::default());
    let mut zone = DropZone::new("cli", scheduler);
    let _ = zone.picker_changed(files_from_paths(&cli.files));
    if let Some(batch_id) = zone.last_batch() {
        info!(batch = %batch_id, zone = zone.id(), files = cli.files.len(), "submitted");
    }

    let mut scheduler = zone.into_scheduler();
    scheduler.run_until_idle();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&scheduler.snapshot())?);
    }

    let failures = scheduler.handler().failures;
    if failures > 0 {
        bail!("{failures} upload(s) failed");
    }
    Ok(())
}
