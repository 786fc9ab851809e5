use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::resolver::CANONICAL_EXTENSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOutcome {
    AlreadyCanonical(PathBuf),
    Remuxed(PathBuf),
    Reencoded(PathBuf),
    /// Both attempts failed; the original file is left in place
    Unchanged(PathBuf),
}

impl TranscodeOutcome {
    pub fn path(&self) -> &Path {
        match self {
            TranscodeOutcome::AlreadyCanonical(p)
            | TranscodeOutcome::Remuxed(p)
            | TranscodeOutcome::Reencoded(p)
            | TranscodeOutcome::Unchanged(p) => p,
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            TranscodeOutcome::AlreadyCanonical(p)
            | TranscodeOutcome::Remuxed(p)
            | TranscodeOutcome::Reencoded(p)
            | TranscodeOutcome::Unchanged(p) => p,
        }
    }
}

/// Normalizes downloads into the canonical container with ffmpeg
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_bin: PathBuf,
    remux_timeout: Duration,
    reencode_timeout: Duration,
}

impl Transcoder {
    pub fn new(ffmpeg_bin: PathBuf, remux_timeout: Duration, reencode_timeout: Duration) -> Self {
        Self {
            ffmpeg_bin,
            remux_timeout,
            reencode_timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.ffmpeg_bin.clone(),
            cfg.remux_timeout,
            cfg.reencode_timeout,
        )
    }

    /// Convert `input` to mp4: stream copy first, full re-encode second.
    /// Never fails; on total failure the input path comes back untouched.
    pub async fn normalize(&self, input: &Path) -> TranscodeOutcome {
        if is_canonical(input) {
            return TranscodeOutcome::AlreadyCanonical(input.to_path_buf());
        }

        let output = free_target_path(input);
        info!("Converting {} -> {}", input.display(), output.display());

        let copy_args = ["-c", "copy"];
        if self.attempt(input, &output, &copy_args, self.remux_timeout).await {
            discard_source(input).await;
            return TranscodeOutcome::Remuxed(output);
        }

        warn!("Stream copy failed for {}, re-encoding", input.display());
        let encode_args = ["-c:v", "libx264", "-c:a", "aac"];
        if self.attempt(input, &output, &encode_args, self.reencode_timeout).await {
            discard_source(input).await;
            return TranscodeOutcome::Reencoded(output);
        }

        warn!("Could not convert {}, serving the original", input.display());
        if output.exists() {
            if let Err(e) = tokio::fs::remove_file(&output).await {
                warn!("Failed to remove partial output {}: {}", output.display(), e);
            }
        }
        TranscodeOutcome::Unchanged(input.to_path_buf())
    }

    async fn attempt(
        &self,
        input: &Path,
        output: &Path,
        codec_args: &[&str],
        limit: Duration,
    ) -> bool {
        match self.run_ffmpeg(input, output, codec_args, limit).await {
            Ok(true) => output.exists(),
            Ok(false) => false,
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        }
    }

    async fn run_ffmpeg(
        &self,
        input: &Path,
        output: &Path,
        codec_args: &[&str],
        limit: Duration,
    ) -> Result<bool> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-i")
            .arg(input)
            .args(codec_args)
            .arg("-y")
            .arg(output)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let result = timeout(limit, cmd.output())
            .await
            .with_context(|| format!("ffmpeg timed out after {}s", limit.as_secs()))?
            .with_context(|| format!("Failed to execute {}", self.ffmpeg_bin.display()))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            warn!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.lines().last().unwrap_or_default()
            );
        }
        Ok(result.status.success())
    }
}

pub fn is_canonical(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(CANONICAL_EXTENSION))
}

/// `<stem>.mp4`, or `<stem> (n).mp4` with the first free n
pub fn free_target_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let dir = input.parent().unwrap_or_else(|| Path::new(""));

    let mut candidate = dir.join(format!("{stem}.{CANONICAL_EXTENSION}"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem} ({counter}).{CANONICAL_EXTENSION}"));
        counter += 1;
    }
    candidate
}

async fn discard_source(input: &Path) {
    if let Err(e) = tokio::fs::remove_file(input).await {
        warn!("Failed to remove source {}: {}", input.display(), e);
    }
}
