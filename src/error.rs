use std::path::PathBuf;
use std::process::ExitStatus;

use reqwest::StatusCode;
use thiserror::Error;

use crate::coordinator::StreamRole;
use crate::downloader::TransferOutcome;

/// Terminal failure of a single transfer.
///
/// Only non-retryable conditions end up here. Stalls, read timeouts and
/// mid-body I/O errors are absorbed by the downloader's retry loop.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to open {path:?} for writing: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("HTTP error! status: {status} ({url})")]
    Status { status: StatusCode, url: String },

    #[error("gave up after {attempts} attempts, last failure: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer task aborted: {0}")]
    Aborted(String),
}

/// The first fatal error observed while running the audio/video pair.
#[derive(Debug, Error)]
#[error("{role} download failed: {source}")]
pub struct PairError {
    pub role: StreamRole,
    #[source]
    pub source: TransferError,
    /// The other stream, when it had already finished.
    pub other: Option<TransferOutcome>,
}

#[derive(Debug, Error)]
pub enum CurlError {
    #[error("could not find a URL in the cURL command")]
    MissingUrl,

    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid header {0:?}")]
    InvalidHeader(String),
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("output file {0:?} already exists")]
    OutputExists(PathBuf),

    #[error("I/O error while combining: {0}")]
    Io(#[from] std::io::Error),

    #[error("ffmpeg exited with {0}")]
    Exited(ExitStatus),
}
