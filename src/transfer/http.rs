use super::{
    BatchId, CancelToken, EventSink, FileInfo, ProgressHandle, TaskIndex, TransferRequest,
    Transport,
};
use crate::error::TransferError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{
    blocking::{Body, Client, Request},
    header::{CACHE_CONTROL, CONTENT_TYPE},
    redirect::Policy,
    Method,
};
use std::{io::Read, thread, time::Duration};
use tracing::{debug, warn};
use url::Url;

/// Characters left alone by `encodeURIComponent`, which receiving endpoints
/// use to decode `X-File-Name`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const MULTIPART_FORM_DATA: &str = "multipart/form-data";

/// Sends each file as the raw body of one blocking HTTP request on its own
/// worker thread.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        Ok(Self {
            client: build_blocking_client(timeout)?,
        })
    }
}

impl Transport for HttpTransport {
    fn start(&self, request: TransferRequest, sink: EventSink) {
        let client = self.client.clone();
        debug!(
            index = %request.index,
            batch = %request.batch_id,
            file = %request.file.name,
            "starting http transfer"
        );
        thread::spawn(move || send_file(&client, request, sink));
    }
}

/// Builds a blocking HTTP client with the redirect policy shared by every
/// transfer.
pub(crate) fn build_blocking_client(timeout: Duration) -> Result<Client, TransferError> {
    Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(10))
        .build()
        .map_err(|e| TransferError::TransferFailed(format!("failed to build HTTP client: {e}")))
}

fn send_file(client: &Client, request: TransferRequest, sink: EventSink) {
    let TransferRequest {
        index,
        batch_id,
        file,
        source,
        endpoint,
        method,
        cancel,
    } = request;

    let reader = match source.open() {
        Ok(reader) => reader,
        Err(source) => {
            sink.fail(TransferError::MalformedFile {
                name: file.name.clone(),
                source,
            });
            return;
        }
    };

    let total = file.size;
    let reader = ProgressReader::new(reader, total, cancel.clone(), sink.progress_handle());
    let result = upload_request(
        client,
        method,
        endpoint,
        index,
        &batch_id,
        &file,
        Body::sized(reader, total),
    )
    .and_then(|req| client.execute(req));

    match result {
        Ok(response) if response.status().is_success() => sink.complete(),
        Ok(response) => {
            warn!(%index, status = %response.status(), "endpoint rejected upload");
            sink.fail(TransferError::Status(response.status().as_u16()));
        }
        Err(_) if cancel.is_cancelled() => sink.fail(TransferError::Cancelled),
        Err(err) => sink.fail(err.into()),
    }
}

/// The upload request for one file, with the correlation headers a
/// receiving endpoint uses to tie requests back to tasks and batches.
pub(crate) fn upload_request(
    client: &Client,
    method: Method,
    endpoint: Url,
    index: TaskIndex,
    batch_id: &BatchId,
    file: &FileInfo,
    body: Body,
) -> reqwest::Result<Request> {
    let encoded_name = utf8_percent_encode(&file.name, URI_COMPONENT).to_string();
    client
        .request(method, endpoint)
        .header(CACHE_CONTROL, "no-cache")
        .header("X-Requested-With", "XMLHttpRequest")
        .header("X-File-Name", encoded_name)
        .header("X-File-Size", file.size.to_string())
        .header("X-File-Type", file.content_type.as_str())
        .header("X-Batch-Id", batch_id.as_str())
        .header("X-File-Idx", index.to_string())
        .header(CONTENT_TYPE, MULTIPART_FORM_DATA)
        .body(body)
        .build()
}

/// Request body reader that reports progress and honours the abort signal.
struct ProgressReader<R: Read> {
    inner: R,
    sent: u64,
    total: u64,
    cancel: CancelToken,
    progress: ProgressHandle,
}

impl<R: Read> ProgressReader<R> {
    fn new(inner: R, total: u64, cancel: CancelToken, progress: ProgressHandle) -> Self {
        Self {
            inner,
            sent: 0,
            total,
            cancel,
            progress,
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "upload cancelled",
            ));
        }
        let read_bytes = self.inner.read(buf)?;
        if read_bytes > 0 {
            self.sent = self.sent.saturating_add(read_bytes as u64);
            self.progress.report(self.sent, Some(self.total));
        }
        Ok(read_bytes)
    }
}
