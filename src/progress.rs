//! Classification of yt-dlp console output.
//!
//! The console format is not a stable contract, so every rule here is
//! tolerant: a line that matches nothing produces no events.

use regex::Regex;
use std::sync::LazyLock;

const DESTINATION_MARKER: &str = "Destination:";
const DOWNLOAD_MARKER: &str = "[download]";
const MERGER_MARKER: &str = "[Merger]";

static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)\.(mp4|webm|mkv|m4a|f\d+\.)").unwrap());
static RE_PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+\.?\d*)%").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Output file announced; carries the title part of its name
    Destination(String),
    Percent(f64),
    /// Download finished, formats are being merged
    Merging,
}

pub fn parse_line(line: &str, download_dir: &str) -> Vec<ProgressEvent> {
    let line = line.trim();
    let mut events = Vec::new();

    if line.contains(DESTINATION_MARKER) {
        if let Some(title) = destination_title(line, download_dir) {
            events.push(ProgressEvent::Destination(title));
        }
    }

    if line.contains(DOWNLOAD_MARKER) && line.contains('%') {
        if let Some(percent) = percent(line) {
            events.push(ProgressEvent::Percent(percent));
        }
    }

    if line.contains(MERGER_MARKER) {
        events.push(ProgressEvent::Merging);
    }

    events
}

fn destination_title(line: &str, download_dir: &str) -> Option<String> {
    let download_dir = download_dir.trim_end_matches(['/', '\\']);
    let file_part = match line.rsplit_once(download_dir) {
        Some((_, rest)) if !download_dir.is_empty() => rest,
        _ => {
            // Tool printed a path outside the configured directory; keep the bare file name.
            let (_, rest) = line.split_once(DESTINATION_MARKER)?;
            rest.rsplit(['/', '\\']).next().unwrap_or(rest)
        }
    };
    let file_part = file_part.trim().trim_start_matches(['/', '\\']);

    RE_TITLE
        .captures(file_part)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn percent(line: &str) -> Option<f64> {
    let caps = RE_PERCENT.captures(line)?;
    caps.get(1)?.as_str().parse::<f64>().ok()
}
