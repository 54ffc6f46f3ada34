//! Runs the audio and video transfers side by side behind one status line.

use std::fmt;

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::downloader::{self, ResumableDownloader, TransferOutcome, TransferRequest};
use crate::error::{PairError, TransferError};
use crate::progress::{ProgressEvent, TransferEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Audio,
    Video,
}

impl StreamRole {
    pub fn other(self) -> Self {
        match self {
            StreamRole::Audio => StreamRole::Video,
            StreamRole::Video => StreamRole::Audio,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Audio => write!(f, "audio"),
            StreamRole::Video => write!(f, "video"),
        }
    }
}

/// Last known state of one side of the status line.
#[derive(Debug, Clone, PartialEq)]
pub enum SideStatus {
    Waiting,
    Active(ProgressEvent),
    Reconnecting { resume_from: u64 },
    Done(ProgressEvent),
    Failed,
}

impl fmt::Display for SideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideStatus::Waiting => write!(f, "waiting..."),
            SideStatus::Active(event) => write!(f, "{}", event),
            SideStatus::Reconnecting { resume_from } => {
                write!(f, "reconnecting at {}...", HumanBytes(*resume_from))
            }
            SideStatus::Done(event) => write!(f, "{} | done", event),
            SideStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The merged `audio | video` line.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    audio: SideStatus,
    video: SideStatus,
}

impl Default for StatusLine {
    fn default() -> Self {
        Self {
            audio: SideStatus::Waiting,
            video: SideStatus::Waiting,
        }
    }
}

impl StatusLine {
    pub fn side(&self, role: StreamRole) -> &SideStatus {
        match role {
            StreamRole::Audio => &self.audio,
            StreamRole::Video => &self.video,
        }
    }

    fn side_mut(&mut self, role: StreamRole) -> &mut SideStatus {
        match role {
            StreamRole::Audio => &mut self.audio,
            StreamRole::Video => &mut self.video,
        }
    }

    pub fn apply(&mut self, role: StreamRole, event: TransferEvent) {
        *self.side_mut(role) = match event {
            TransferEvent::Progress(progress) => SideStatus::Active(progress),
            TransferEvent::Retrying { resume_from, .. } => SideStatus::Reconnecting { resume_from },
        };
    }

    /// Pin `role` to 100%, keeping its last byte counts.
    pub fn complete(&mut self, role: StreamRole, bytes: u64) {
        let side = self.side_mut(role);
        let last = match side {
            SideStatus::Active(event) | SideStatus::Done(event) => event.clone(),
            _ => ProgressEvent::new(bytes, Some(bytes), 0.0),
        };
        *side = SideStatus::Done(last.completed());
    }

    pub fn fail(&mut self, role: StreamRole) {
        *self.side_mut(role) = SideStatus::Failed;
    }

    pub fn render(&self) -> String {
        format!("audio: {} | video: {}", self.audio, self.video)
    }
}

/// Both finished streams plus the final status line.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub audio: TransferOutcome,
    pub video: TransferOutcome,
    pub status_line: String,
}

pub struct DownloadCoordinator {
    downloader: ResumableDownloader,
    bar: ProgressBar,
}

impl DownloadCoordinator {
    pub fn new(downloader: ResumableDownloader) -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(10));
        Self::with_progress_bar(downloader, bar)
    }

    /// Render into `bar` instead of stderr.
    pub fn with_progress_bar(downloader: ResumableDownloader, bar: ProgressBar) -> Self {
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}") {
            bar.set_style(style);
        }
        Self { downloader, bar }
    }

    /// Download both streams concurrently.
    ///
    /// Resolves once both sides finished, or with the first fatal error, in
    /// which case the other transfer is cancelled.
    pub async fn run_both(
        &self,
        audio: TransferRequest,
        video: TransferRequest,
    ) -> Result<PairOutcome, PairError> {
        let cancel = CancellationToken::new();
        let audio_handle = self.downloader.spawn(audio, cancel.child_token());
        let video_handle = self.downloader.spawn(video, cancel.child_token());

        let mut audio_events = Some(audio_handle.events);
        let mut video_events = Some(video_handle.events);
        let mut audio_task = Some(audio_handle.task);
        let mut video_task = Some(video_handle.task);
        let mut audio_outcome: Option<TransferOutcome> = None;
        let mut video_outcome: Option<TransferOutcome> = None;

        let mut line = StatusLine::default();
        self.redraw(&line);

        while audio_events.is_some() || video_events.is_some() {
            let (role, event) = tokio::select! {
                event = recv(&mut audio_events), if audio_events.is_some() => (StreamRole::Audio, event),
                event = recv(&mut video_events), if video_events.is_some() => (StreamRole::Video, event),
            };

            if let Some(event) = event {
                if let TransferEvent::Retrying { resume_from, reason } = &event {
                    self.bar.println(format!(
                        "{}: {}, resuming from {}",
                        role,
                        reason,
                        HumanBytes(*resume_from)
                    ));
                }
                line.apply(role, event);
                self.redraw(&line);
                continue;
            }

            // Channel closed: the task has produced its outcome.
            let (events, task) = match role {
                StreamRole::Audio => (&mut audio_events, &mut audio_task),
                StreamRole::Video => (&mut video_events, &mut video_task),
            };
            *events = None;
            let result = match task.take() {
                Some(task) => downloader::join(task).await,
                None => Err(TransferError::Aborted("transfer joined twice".to_string())),
            };

            match result {
                Ok(outcome) => {
                    debug!(%role, path = ?outcome.path, "stream finished");
                    line.complete(role, outcome.bytes);
                    self.redraw(&line);
                    match role {
                        StreamRole::Audio => audio_outcome = Some(outcome),
                        StreamRole::Video => video_outcome = Some(outcome),
                    }
                }
                Err(source) => {
                    line.fail(role);
                    self.redraw(&line);
                    self.bar.abandon();

                    let other = match role {
                        StreamRole::Audio => video_outcome.take(),
                        StreamRole::Video => audio_outcome.take(),
                    };
                    if let Some(done) = &other {
                        info!(role = %role.other(), path = ?done.path, "other stream had already finished");
                    }

                    cancel.cancel();
                    // Close the channels first so a sender can never block the join.
                    drop(audio_events.take());
                    drop(video_events.take());
                    for task in [audio_task.take(), video_task.take()].into_iter().flatten() {
                        let _ = downloader::join(task).await;
                    }
                    return Err(PairError { role, source, other });
                }
            }
        }

        self.bar.finish();
        let status_line = line.render();
        match (audio_outcome, video_outcome) {
            (Some(audio), Some(video)) => Ok(PairOutcome {
                audio,
                video,
                status_line,
            }),
            (None, video) => Err(PairError {
                role: StreamRole::Audio,
                source: TransferError::Aborted("no outcome".to_string()),
                other: video,
            }),
            (audio, None) => Err(PairError {
                role: StreamRole::Video,
                source: TransferError::Aborted("no outcome".to_string()),
                other: audio,
            }),
        }
    }

    fn redraw(&self, line: &StatusLine) {
        self.bar.set_message(line.render());
    }
}

async fn recv(events: &mut Option<mpsc::Receiver<TransferEvent>>) -> Option<TransferEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
