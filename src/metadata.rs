use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

const DESCRIPTION_LIMIT: usize = 200;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);
const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";

static RE_YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/|youtube\.com/v/|youtube\.com/shorts/)([^&\n?#]+)",
    )
    .unwrap()
});

/// Summary shown to the user before they start a download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail: String,
    pub duration: u64,
    pub channel: String,
    pub views: u64,
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    view_count: Option<u64>,
    description: Option<String>,
}

impl From<YtDlpInfo> for VideoInfo {
    fn from(raw: YtDlpInfo) -> Self {
        Self {
            title: raw.title.unwrap_or_else(|| "Unknown".to_string()),
            thumbnail: raw.thumbnail.unwrap_or_default(),
            duration: raw.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
            channel: raw.uploader.unwrap_or_else(|| "Unknown".to_string()),
            views: raw.view_count.unwrap_or(0),
            description: raw
                .description
                .filter(|d| !d.is_empty())
                .map(|d| truncate_description(&d))
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OEmbed {
    title: Option<String>,
    author_name: Option<String>,
}

/// Looks up video metadata with yt-dlp, falling back to YouTube oEmbed
#[derive(Debug, Clone)]
pub struct MetadataClient {
    ytdlp_bin: PathBuf,
    http: reqwest::Client,
}

impl MetadataClient {
    pub fn new(ytdlp_bin: PathBuf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { ytdlp_bin, http })
    }

    pub async fn lookup(&self, url: &str) -> Result<VideoInfo> {
        let primary = match self.lookup_ytdlp(url).await {
            Ok(info) => return Ok(info),
            Err(e) => e,
        };

        let Some(video_id) = youtube_video_id(url) else {
            return Err(primary);
        };
        warn!("yt-dlp lookup failed ({:#}), trying oEmbed", primary);
        self.lookup_oembed(url, &video_id)
            .await
            .with_context(|| format!("{:#}", primary))
    }

    async fn lookup_ytdlp(&self, url: &str) -> Result<VideoInfo> {
        info!("Fetching metadata for {}", url);
        let mut cmd = Command::new(&self.ytdlp_bin);
        cmd.args([
            "--dump-single-json",
            "--no-playlist",
            "--no-warnings",
            "--skip-download",
            "--no-check-certificate",
            "--",
        ])
        .arg(url)
        .stdin(Stdio::null())
        .kill_on_drop(true);

        let output = tokio::time::timeout(LOOKUP_TIMEOUT, cmd.output())
            .await
            .context("Metadata lookup timed out")?
            .context("Failed to execute yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to fetch video info: {}", stderr.trim());
        }

        let raw: YtDlpInfo =
            serde_json::from_slice(&output.stdout).context("Unreadable yt-dlp metadata")?;
        Ok(raw.into())
    }

    async fn lookup_oembed(&self, url: &str, video_id: &str) -> Result<VideoInfo> {
        let response = self
            .http
            .get(OEMBED_ENDPOINT)
            .query(&[("url", url), ("format", "json")])
            .send()
            .await
            .context("oEmbed request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Failed to fetch video info: {}", status.as_u16());
        }
        let data: OEmbed = response.json().await.context("Unreadable oEmbed response")?;

        Ok(VideoInfo {
            title: data.title.unwrap_or_else(|| "Unknown".to_string()),
            thumbnail: format!("https://img.youtube.com/vi/{video_id}/maxresdefault.jpg"),
            duration: 0,
            channel: data.author_name.unwrap_or_else(|| "Unknown".to_string()),
            views: 0,
            description: String::new(),
        })
    }
}

pub fn youtube_video_id(url: &str) -> Option<String> {
    RE_YOUTUBE_ID
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn truncate_description(text: &str) -> String {
    let mut short: String = text.chars().take(DESCRIPTION_LIMIT).collect();
    short.push_str("...");
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_youtube_ids() {
        assert_eq!(
            youtube_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("https://youtu.be/dQw4w9WgXcQ?si=x").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("https://youtube.com/shorts/abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(youtube_video_id("https://vimeo.com/123"), None);
    }

    #[test]
    fn ytdlp_json_maps_with_defaults() {
        let raw: YtDlpInfo = serde_json::from_str(
            r#"{"title":"Talk","duration":61.7,"view_count":12,"uploader":null,"description":""}"#,
        )
        .unwrap();
        let info = VideoInfo::from(raw);
        assert_eq!(info.title, "Talk");
        assert_eq!(info.duration, 61);
        assert_eq!(info.channel, "Unknown");
        assert_eq!(info.views, 12);
        assert_eq!(info.thumbnail, "");
        assert_eq!(info.description, "");
    }

    #[test]
    fn long_descriptions_are_cut() {
        let text = "é".repeat(300);
        let short = truncate_description(&text);
        assert_eq!(short.chars().count(), DESCRIPTION_LIMIT + 3);
        assert!(short.ends_with("..."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lookup_reads_ytdlp_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let ytdlp = crate::transcode::tests::stub_tool(
            dir.path(),
            "yt-dlp",
            r#"echo '{"title":"Clip","thumbnail":"t.jpg","duration":10,"uploader":"Chan","view_count":5,"description":"hi"}'"#,
        );
        let client = MetadataClient::new(ytdlp).unwrap();
        let info = client.lookup("https://vimeo.com/1").await.unwrap();
        assert_eq!(info.title, "Clip");
        assert_eq!(info.channel, "Chan");
        assert_eq!(info.description, "hi...");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_youtube_failure_surfaces_ytdlp_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let ytdlp = crate::transcode::tests::stub_tool(
            dir.path(),
            "yt-dlp",
            "echo 'ERROR: Unsupported URL' >&2\nexit 1",
        );
        let client = MetadataClient::new(ytdlp).unwrap();
        let err = client.lookup("https://example.com/x").await.unwrap_err();
        assert!(err.to_string().contains("Unsupported URL"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn url_is_never_read_as_an_option() {
        let dir = tempfile::TempDir::new().unwrap();
        let argv = dir.path().join("argv");
        let ytdlp = crate::transcode::tests::stub_tool(
            dir.path(),
            "yt-dlp",
            &format!(
                "for a in \"$@\"; do printf '%s\\n' \"$a\" >> '{}'; done\necho '{{\"title\":\"x\"}}'",
                argv.display()
            ),
        );
        let client = MetadataClient::new(ytdlp).unwrap();
        client.lookup("--exec=touch nope").await.unwrap();

        let recorded = std::fs::read_to_string(&argv).unwrap();
        let args: Vec<&str> = recorded.lines().collect();
        assert_eq!(&args[args.len() - 2..], ["--", "--exec=touch nope"]);
    }
}
