pub mod cli;
pub mod coordinator;
pub mod curl;
pub mod downloader;
pub mod error;
pub mod muxer;
pub mod progress;
pub mod sampler;
pub mod state;
pub mod utils;

pub use coordinator::{DownloadCoordinator, PairOutcome, StreamRole};
pub use downloader::{ResumableDownloader, RetryPolicy, TransferOutcome, TransferRequest};
pub use error::{PairError, TransferError};
