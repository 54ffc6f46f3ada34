//! Combines the downloaded streams with an external ffmpeg process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::MuxError;
use crate::progress::{format_percentage, render_bar};

const MUX_BAR_WIDTH: usize = 50;

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duration: (\d{2}):(\d{2}):(\d{2})").unwrap());

static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=(\d{2}):(\d{2}):(\d{2})").unwrap());

fn hms(caps: &regex::Captures<'_>) -> Option<Duration> {
    let field = |i: usize| caps.get(i)?.as_str().parse::<u64>().ok();
    Some(Duration::from_secs(field(1)? * 3600 + field(2)? * 60 + field(3)?))
}

/// Position tracking from ffmpeg's diagnostic output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxProgress {
    duration: Option<Duration>,
    position: Option<Duration>,
}

impl MuxProgress {
    /// Feed one diagnostic line; returns true when the position moved.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.duration.is_none() {
            if let Some(caps) = DURATION_RE.captures(line) {
                self.duration = hms(&caps);
            }
        }
        match (self.duration, TIME_RE.captures(line)) {
            (Some(_), Some(caps)) => {
                self.position = hms(&caps);
                self.position.is_some()
            }
            _ => false,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn position(&self) -> Option<Duration> {
        self.position
    }

    pub fn percentage(&self) -> Option<f64> {
        let total = self.duration?.as_secs_f64();
        if total <= 0.0 {
            return None;
        }
        let current = self.position?.as_secs_f64();
        Some((current / total * 100.0).min(100.0))
    }
}

/// Formats a position as `HH:MM:SS`.
fn clock(d: Duration) -> String {
    let s = d.as_secs();
    format!("{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
}

#[derive(Debug, Clone)]
pub struct Muxer {
    program: PathBuf,
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Muxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// ffmpeg arguments: copy the video, re-encode audio to AAC.
    pub fn args(video: &Path, audio: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "-nostdin".into(),
            "-n".into(),
            "-i".into(),
            video.into(),
            "-i".into(),
            audio.into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            output.into(),
        ]
    }

    /// Write `video` + `audio` into `output`, showing combine progress.
    pub async fn combine(&self, video: &Path, audio: &Path, output: &Path) -> Result<PathBuf, MuxError> {
        if fs::try_exists(output).await? {
            return Err(MuxError::OutputExists(output.to_path_buf()));
        }
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        info!(program = ?self.program, output = ?output, "combining streams");
        let mut child = Command::new(&self.program)
            .args(Self::args(video, audio, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| MuxError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(10));
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}") {
            bar.set_style(style);
        }
        bar.set_message("combining...");

        let mut progress = MuxProgress::default();
        if let Some(stderr) = child.stderr.take() {
            // ffmpeg rewrites its status line with '\r'.
            let mut segments = BufReader::new(stderr).split(b'\r');
            while let Some(segment) = segments.next_segment().await? {
                let text = String::from_utf8_lossy(&segment);
                for line in text.lines() {
                    debug!(target: "ffmpeg", "{}", line);
                    if progress.observe(line) {
                        let percentage = progress.percentage();
                        bar.set_message(format!(
                            "combining: [{}] {} | at {}",
                            render_bar(percentage, MUX_BAR_WIDTH),
                            format_percentage(percentage),
                            progress.position().map(clock).unwrap_or_default()
                        ));
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            bar.abandon_with_message("combine failed");
            return Err(MuxError::Exited(status));
        }
        bar.finish_with_message("combine complete");
        Ok(output.to_path_buf())
    }
}
