use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::progress::TransferEvent;
use crate::state::TransferState;

/// No byte for this long means the connection is abandoned and reissued.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the very first request may wait for response headers.
pub const FIRST_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between abandoning a connection and reissuing it.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Largest slice written (and reported) at once.
pub const CHUNK_SIZE: usize = 32 * 1024;

const EVENT_BUFFER: usize = 64;

/// One resource to fetch into one local file.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    url: Url,
    headers: HeaderMap,
    destination: PathBuf,
}

impl TransferRequest {
    pub fn new(
        url: &str,
        headers: HeaderMap,
        destination: impl Into<PathBuf>,
    ) -> Result<Self, TransferError> {
        let url = Url::parse(url)
            .map_err(|e| TransferError::InvalidRequest(format!("{}: {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransferError::InvalidRequest(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            headers,
            destination: destination.into(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Caller headers for an attempt starting at `offset`.
    ///
    /// Any caller-supplied `Range` is dropped; range control belongs to the
    /// downloader alone.
    pub fn headers_for(&self, offset: u64) -> Result<HeaderMap, TransferError> {
        let mut headers = self.headers.clone();
        headers.remove(header::RANGE);
        if offset > 0 {
            let range = HeaderValue::from_str(&format!("bytes={}-", offset))
                .map_err(|e| TransferError::InvalidRequest(e.to_string()))?;
            headers.insert(header::RANGE, range);
        }
        Ok(headers)
    }
}

/// How often, and how patiently, an interrupted transfer is reissued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff: RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn bounded(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries: Some(max_retries),
            backoff,
        }
    }

    fn allows(&self, retries: u32) -> bool {
        self.max_retries.map_or(true, |max| retries <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub bytes: u64,
}

/// A spawned transfer: its event channel and its terminal result.
///
/// The channel closes once the task has finished, successfully or not.
pub struct TransferHandle {
    pub events: mpsc::Receiver<TransferEvent>,
    pub task: JoinHandle<Result<TransferOutcome, TransferError>>,
}

impl TransferHandle {
    /// Drain every event, then wait for the outcome.
    pub async fn collect(mut self) -> (Vec<TransferEvent>, Result<TransferOutcome, TransferError>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, join(self.task).await)
    }
}

/// Await a transfer task, folding a panic into a `TransferError`.
pub async fn join(
    task: JoinHandle<Result<TransferOutcome, TransferError>>,
) -> Result<TransferOutcome, TransferError> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(TransferError::Aborted(e.to_string())),
    }
}

enum Attempt {
    Complete,
    Interrupted(String),
}

#[derive(Debug, Clone)]
pub struct ResumableDownloader {
    client: Client,
    retry: RetryPolicy,
    stall_timeout: Duration,
    first_response_timeout: Duration,
}

impl Default for ResumableDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumableDownloader {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("avdl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            retry: RetryPolicy::default(),
            stall_timeout: STALL_TIMEOUT,
            first_response_timeout: FIRST_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Header wait allowed before the first response; later reconnects use
    /// the stall timeout.
    pub fn with_first_response_timeout(mut self, timeout: Duration) -> Self {
        self.first_response_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Run `request` on its own task.
    pub fn spawn(&self, request: TransferRequest, cancel: CancellationToken) -> TransferHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let downloader = self.clone();
        let task = tokio::spawn(async move { downloader.run(request, tx, cancel).await });
        TransferHandle { events: rx, task }
    }

    /// Fetch `request` to its destination, reporting on `events`.
    ///
    /// Appends to whatever the destination already holds, reconnecting with
    /// an updated `Range` after every stall or read error until the body ends
    /// cleanly or a fatal error occurs.
    pub async fn run(
        &self,
        request: TransferRequest,
        events: mpsc::Sender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let path = request.destination().to_path_buf();
        let mut file = open_destination(&path).await?;
        let on_disk = file
            .metadata()
            .await
            .map_err(|source| TransferError::CreateFile {
                path: path.clone(),
                source,
            })?
            .len();

        let mut state = TransferState::resume_from(on_disk);
        let mut connected = false;
        let mut retries = 0u32;
        debug!(url = %request.url(), path = ?path, offset = on_disk, "starting transfer");

        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                attempt = self.attempt(&request, &mut file, &mut state, &events, &mut connected) => attempt?,
            };

            match attempt {
                Attempt::Complete => {
                    state.finish();
                    let _ = events.send(TransferEvent::Progress(state.snapshot())).await;
                    info!(path = ?path, bytes = state.bytes_written(), "transfer complete");
                    return Ok(TransferOutcome {
                        path,
                        bytes: state.bytes_written(),
                    });
                }
                Attempt::Interrupted(reason) => {
                    if let Err(e) = file.flush().await {
                        warn!(error = %e, "failed to flush partial download");
                    }
                    retries += 1;
                    if !self.retry.allows(retries) {
                        return Err(TransferError::RetriesExhausted {
                            attempts: retries,
                            last: reason,
                        });
                    }
                    info!(
                        url = %request.url(),
                        resume_from = state.bytes_written(),
                        retry = retries,
                        "{}", reason
                    );
                    let _ = events
                        .send(TransferEvent::Retrying {
                            resume_from: state.bytes_written(),
                            reason,
                        })
                        .await;
                    state.reconnecting();

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(self.retry.backoff) => {}
                    }
                }
            }
        }
    }

    /// One request/response cycle. `Ok(Interrupted)` asks for a retry.
    async fn attempt(
        &self,
        request: &TransferRequest,
        file: &mut File,
        state: &mut TransferState,
        events: &mpsc::Sender<TransferEvent>,
        connected: &mut bool,
    ) -> Result<Attempt, TransferError> {
        let offset = state.bytes_written();
        let headers = request.headers_for(offset)?;
        let send = self.client.get(request.url().clone()).headers(headers).send();

        let wait = if *connected {
            self.stall_timeout
        } else {
            self.first_response_timeout
        };
        let failure = match tokio::time::timeout(wait, send).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no response within {:?}", wait)),
        };
        let response = match failure {
            Ok(response) => response,
            Err(reason) if !*connected => {
                return Err(TransferError::Connect {
                    url: request.url().to_string(),
                    reason,
                });
            }
            Err(reason) => return Ok(Attempt::Interrupted(format!("request failed: {}", reason))),
        };
        *connected = true;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::Status {
                status,
                url: request.url().to_string(),
            });
        }

        // A 200 to a ranged request restarts the body at byte 0.
        let mut skip = if status == StatusCode::OK && offset > 0 {
            warn!(url = %request.url(), offset, "server ignored Range, skipping persisted prefix");
            offset
        } else {
            0
        };
        state.set_total(total_size(&response, offset));
        debug!(%status, offset, total = ?state.total_bytes(), "response received");

        let mut stream = response.bytes_stream();
        let watchdog = tokio::time::sleep(self.stall_timeout);
        tokio::pin!(watchdog);

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = &mut watchdog => {
                    return Ok(Attempt::Interrupted(format!(
                        "stalled, no data for {:?}",
                        self.stall_timeout
                    )));
                }
            };

            let chunk = match next {
                None => {
                    if let Err(e) = file.flush().await {
                        rollback(file, state.bytes_written()).await;
                        return Ok(Attempt::Interrupted(format!("flush failed: {}", e)));
                    }
                    return Ok(Attempt::Complete);
                }
                Some(Err(e)) => return Ok(Attempt::Interrupted(format!("read error: {}", e))),
                Some(Ok(chunk)) => chunk,
            };
            watchdog.as_mut().reset(Instant::now() + self.stall_timeout);

            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
            }

            for piece in data.chunks(CHUNK_SIZE) {
                if let Err(e) = commit_piece(file, state, piece).await {
                    rollback(file, state.bytes_written()).await;
                    return Ok(Attempt::Interrupted(format!("write error: {}", e)));
                }
                let _ = events.send(TransferEvent::Progress(state.snapshot())).await;
            }
        }
    }
}

/// Write `piece` through to the file and only then count it.
///
/// Flushing per piece means a failure always belongs to the piece being
/// written, and `bytes_written` never runs ahead of what reached the file.
async fn commit_piece<W>(out: &mut W, state: &mut TransferState, piece: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(piece).await?;
    out.flush().await?;
    state.record(piece.len() as u64);
    Ok(())
}

/// Cut off anything past `committed`, the last offset known to be on disk.
async fn rollback(file: &mut File, committed: u64) {
    if let Err(e) = file.set_len(committed).await {
        warn!(error = %e, committed, "failed to truncate after write error");
    }
}

async fn open_destination(path: &Path) -> Result<File, TransferError> {
    let create_err = |source| TransferError::CreateFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(create_err)?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(create_err)
}

/// Full resource size: the `Content-Range` total when present, otherwise
/// `Content-Length` (offset by what a 206 resumed from).
fn total_size(response: &Response, offset: u64) -> Option<u64> {
    if let Some(range) = response.headers().get(header::CONTENT_RANGE) {
        return range.to_str().ok().and_then(parse_content_range_total);
    }
    let length = response.content_length()?;
    if response.status() == StatusCode::PARTIAL_CONTENT {
        Some(offset + length)
    } else {
        Some(length)
    }
}

/// `bytes 100-199/1000` -> `1000`. An unknown (`*`) total yields `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts writes at once like `tokio::fs::File`; a failed background
    /// write only surfaces on the following flush.
    #[derive(Default)]
    struct DeferredWriter {
        landed: Vec<u8>,
        pending: Vec<u8>,
        flushes: usize,
        fail_flush: usize,
    }

    impl AsyncWrite for DeferredWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.get_mut().pending.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            this.flushes += 1;
            if this.flushes == this.fail_flush {
                this.pending.clear();
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")));
            }
            let pending = std::mem::take(&mut this.pending);
            this.landed.extend(pending);
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_piece_is_not_counted() {
        let mut out = DeferredWriter {
            fail_flush: 2,
            ..Default::default()
        };
        let mut state = TransferState::resume_from(0);

        commit_piece(&mut out, &mut state, &[1u8; 100]).await.unwrap();
        assert!(commit_piece(&mut out, &mut state, &[2u8; 50]).await.is_err());

        // The counted offset matches what actually landed.
        assert_eq!(state.bytes_written(), 100);
        assert_eq!(out.landed, vec![1u8; 100]);

        commit_piece(&mut out, &mut state, &[3u8; 10]).await.unwrap();
        assert_eq!(state.bytes_written(), 110);
        assert_eq!(out.landed.len(), 110);
    }

    #[tokio::test]
    async fn rollback_truncates_to_committed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.m4s");
        let mut file = open_destination(&path).await.unwrap();
        file.write_all(&[7u8; 100]).await.unwrap();
        file.flush().await.unwrap();

        rollback(&mut file, 40).await;
        file.write_all(&[9u8; 5]).await.unwrap();
        file.flush().await.unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 45);
        assert_eq!(&content[..40], &[7u8; 40][..]);
        assert_eq!(&content[40..], &[9u8; 5][..]);
    }

    fn request(headers: HeaderMap) -> TransferRequest {
        TransferRequest::new("http://localhost/stream.m4s", headers, "out.m4s").unwrap()
    }

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-99/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 500-999/1000 "), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-99/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn caller_range_is_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("range", HeaderValue::from_static("bytes=0-10"));
        headers.insert("referer", HeaderValue::from_static("https://example.com/"));
        let request = request(headers);

        let fresh = request.headers_for(0).unwrap();
        assert!(fresh.get(header::RANGE).is_none());
        assert_eq!(fresh.get("Referer").unwrap(), "https://example.com/");

        let resumed = request.headers_for(500).unwrap();
        assert_eq!(resumed.get_all(header::RANGE).iter().count(), 1);
        assert_eq!(resumed.get(header::RANGE).unwrap(), "bytes=500-");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(
            TransferRequest::new("not a url", HeaderMap::new(), "x"),
            Err(TransferError::InvalidRequest(_))
        ));
        assert!(matches!(
            TransferRequest::new("ftp://host/file", HeaderMap::new(), "x"),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn retry_policy_bounds() {
        let unbounded = RetryPolicy::default();
        assert!(unbounded.allows(u32::MAX));
        assert_eq!(unbounded.backoff, RETRY_BACKOFF);

        let bounded = RetryPolicy::bounded(2, Duration::from_millis(10));
        assert!(bounded.allows(1));
        assert!(bounded.allows(2));
        assert!(!bounded.allows(3));
    }
}
