//! Progress values produced by transfers and their textual rendering.

use std::fmt;

use indicatif::HumanBytes;

/// Width of the per-stream bar in cells.
pub const BAR_WIDTH: usize = 30;

const FILLED: char = '█';
const EMPTY: char = '░';
const UNKNOWN: &str = "▒░";

/// Snapshot of one transfer after a chunk was persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// `None` while the total size is unknown.
    pub percentage: Option<f64>,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    /// Bytes per second over the trailing window.
    pub throughput: f64,
    pub rendered_bar: String,
}

impl ProgressEvent {
    pub fn new(bytes_downloaded: u64, bytes_total: Option<u64>, throughput: f64) -> Self {
        let percentage = match bytes_total {
            Some(total) if total > 0 => {
                Some((bytes_downloaded as f64 / total as f64 * 100.0).min(100.0))
            }
            Some(_) => Some(100.0),
            None => None,
        };
        Self {
            percentage,
            bytes_downloaded,
            bytes_total,
            throughput,
            rendered_bar: render_bar(percentage, BAR_WIDTH),
        }
    }

    /// Same figures with the bar full and the percentage at 100.
    pub fn completed(&self) -> Self {
        Self {
            percentage: Some(100.0),
            bytes_total: Some(self.bytes_total.unwrap_or(self.bytes_downloaded)),
            rendered_bar: render_bar(Some(100.0), BAR_WIDTH),
            ..self.clone()
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} | ", self.rendered_bar, format_percentage(self.percentage))?;
        match self.bytes_total {
            Some(total) => write!(f, "{}/{}", HumanBytes(self.bytes_downloaded), HumanBytes(total))?,
            None => write!(f, "{}/?", HumanBytes(self.bytes_downloaded))?,
        }
        write!(f, " | {}/s", HumanBytes(self.throughput as u64))
    }
}

/// What a transfer reports to whoever consumes its event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(ProgressEvent),
    /// The connection was abandoned and will be reissued from `resume_from`.
    Retrying { resume_from: u64, reason: String },
}

/// Percentage with two decimals, or `--.--%` when indeterminate.
pub fn format_percentage(percentage: Option<f64>) -> String {
    match percentage {
        Some(p) => format!("{:.2}%", p),
        None => "--.--%".to_string(),
    }
}

/// Fixed-width bar; an unknown percentage renders a hatched pattern.
pub fn render_bar(percentage: Option<f64>, width: usize) -> String {
    match percentage {
        Some(p) => {
            let p = p.clamp(0.0, 100.0);
            let filled = ((p / 100.0) * width as f64).round() as usize;
            let mut bar = String::with_capacity(width * 3);
            bar.extend(std::iter::repeat(FILLED).take(filled));
            bar.extend(std::iter::repeat(EMPTY).take(width - filled));
            bar
        }
        None => UNKNOWN.chars().cycle().take(width).collect(),
    }
}
