use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use crate::curl::join_command_lines;
use crate::downloader::RetryPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download an audio and a video stream from pasted cURL commands and combine them", long_about = None)]
pub struct Args {
    /// Output file name (prompted for when omitted, ".mp4" is appended if missing)
    #[arg(index = 1)]
    pub name: Option<String>,

    /// Directory for the combined output file
    #[arg(short = 'o', long = "output-dir", default_value = "download")]
    pub output_dir: PathBuf,

    /// Directory for the partially downloaded streams
    #[arg(long = "cache-dir", default_value = ".cache")]
    pub cache_dir: PathBuf,

    /// Give up after this many reconnects per stream (default: retry forever)
    #[arg(short = 'r', long = "max-retries")]
    pub max_retries: Option<u32>,

    /// Pause before reconnecting, in milliseconds
    #[arg(long = "retry-backoff-ms", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// Seconds without data before a connection is considered stalled
    #[arg(short = 's', long = "stall-timeout-secs", default_value_t = 5)]
    pub stall_timeout_secs: u64,

    /// Seconds to wait for the first response of each stream
    #[arg(long = "first-response-timeout-secs", default_value_t = 30)]
    pub first_response_timeout_secs: u64,

    /// ffmpeg executable used to combine the streams
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Keep the cache directory after a successful combine
    #[arg(long = "keep-cache")]
    pub keep_cache: bool,
}

impl Args {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.max(1))
    }

    pub fn first_response_timeout(&self) -> Duration {
        Duration::from_secs(self.first_response_timeout_secs.max(1))
    }
}

/// Print `prompt` and read one trimmed line.
pub fn prompt_line(input: &mut impl BufRead, prompt: &str) -> std::io::Result<String> {
    println!("{}", prompt);
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Print `prompt` and read a pasted multi-line command up to a blank line or EOF.
pub fn prompt_command(input: &mut impl BufRead, prompt: &str) -> std::io::Result<String> {
    println!("{}", prompt);
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }
        lines.push(line);
    }
    Ok(join_command_lines(lines.iter().map(String::as_str)))
}
