use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wait after yt-dlp exits before scanning, so renames and merges settle
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_REMUX_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REENCODE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Runtime settings shared by the API and job workers
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute directory yt-dlp writes into and files are served from
    pub download_dir: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub settle_delay: Duration,
    pub remux_timeout: Duration,
    pub reencode_timeout: Duration,
}

impl Config {
    /// Build a config, creating the download directory and making it absolute.
    pub fn new(download_dir: &Path, ytdlp_bin: PathBuf, ffmpeg_bin: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(download_dir).with_context(|| {
            format!(
                "Failed to create download directory: {}",
                download_dir.display()
            )
        })?;
        let download_dir = std::fs::canonicalize(download_dir).with_context(|| {
            format!(
                "Failed to resolve download directory: {}",
                download_dir.display()
            )
        })?;

        Ok(Self {
            download_dir,
            ytdlp_bin,
            ffmpeg_bin,
            settle_delay: DEFAULT_SETTLE_DELAY,
            remux_timeout: DEFAULT_REMUX_TIMEOUT,
            reencode_timeout: DEFAULT_REENCODE_TIMEOUT,
        })
    }

    /// Directory to hand yt-dlp as `--ffmpeg-location`, when ffmpeg was given as a path
    pub fn ffmpeg_location(&self) -> Option<&Path> {
        self.ffmpeg_bin
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// yt-dlp output template: title-based name inside the download directory
    pub fn output_template(&self) -> String {
        self.download_dir
            .join("%(title)s.%(ext)s")
            .to_string_lossy()
            .into_owned()
    }
}
