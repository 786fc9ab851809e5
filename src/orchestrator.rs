use anyhow::{Context, Result};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ServiceError;
use crate::job::{Job, JobStatus};
use crate::progress::{parse_line, ProgressEvent};
use crate::resolver::{resolve_output, Resolution};
use crate::store::{JobHandle, JobStore, StoreError};
use crate::transcode::{is_canonical, Transcoder};

/// Starts download jobs and drives each one to a terminal state
pub struct Orchestrator {
    store: Arc<JobStore>,
    config: Arc<Config>,
    transcoder: Transcoder,
}

impl Orchestrator {
    pub fn new(store: Arc<JobStore>, config: Arc<Config>) -> Self {
        let transcoder = Transcoder::from_config(&config);
        Self {
            store,
            config,
            transcoder,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    #[cfg(test)]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a job and run it in the background. Returns as soon as the
    /// job exists; the worker task is detached and cannot be cancelled.
    pub fn start(&self, url: &str) -> String {
        let id = self.store.create(url);
        match self.store.handle(&id) {
            Ok(handle) => {
                let worker = JobWorker {
                    handle,
                    config: Arc::clone(&self.config),
                    transcoder: self.transcoder.clone(),
                };
                tokio::spawn(worker.run(url.to_string()));
                info!("Job {}: queued {}", id, url);
            }
            Err(e) => error!("Job {}: vanished before its worker started: {}", id, e),
        }
        id
    }

    /// Poll until the job reaches `completed` or `error`
    pub async fn wait_for(&self, id: &str, every: Duration) -> Result<Job, StoreError> {
        loop {
            let job = self.store.get(id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(every).await;
        }
    }
}

struct JobWorker {
    handle: JobHandle,
    config: Arc<Config>,
    transcoder: Transcoder,
}

impl JobWorker {
    async fn run(self, url: String) {
        let handle = self.handle.clone();
        let id = handle.id().to_string();

        // Run on its own task so a panic still ends the job in `error`.
        let outcome = tokio::spawn(async move { self.execute(&url).await }).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(join) if join.is_panic() => Some("job worker panicked".to_string()),
            Err(_) => Some("job worker was cancelled".to_string()),
        };

        if let Some(message) = failure {
            error!("Job {}: {}", id, message);
            handle.update(|job| job.fail(message));
        }
        handle.update(|job| {
            if !job.status.is_terminal() {
                job.fail("job ended without a result");
            }
        });
    }

    async fn execute(&self, url: &str) -> Result<()> {
        let id = self.handle.id().to_string();
        self.handle.update(|job| job.advance(JobStatus::Downloading));

        let status = self.download(url).await?;
        if !status.success() {
            warn!(
                "Job {}: yt-dlp exited with {}, checking for usable output",
                id, status
            );
        }

        tokio::time::sleep(self.config.settle_delay).await;

        let dir = self.config.download_dir.clone();
        let scan_id = id.clone();
        let resolution =
            tokio::task::spawn_blocking(move || resolve_output(&dir, &scan_id, SystemTime::now()))
                .await
                .context("Output scan failed")?;

        let resolved = match resolution {
            Resolution::Found { path, size } => {
                info!("Job {}: found {} ({} bytes)", id, path.display(), size);
                path
            }
            Resolution::Missing { inspected } => {
                return Err(ServiceError::Processing(format!(
                    "Merge may have failed. Files found: {:?}",
                    inspected
                ))
                .into());
            }
        };

        let final_path = if is_canonical(&resolved) {
            resolved
        } else {
            self.handle.update(|job| job.advance(JobStatus::Converting));
            let outcome = self.transcoder.normalize(&resolved).await;
            info!("Job {}: converted to {}", id, outcome.path().display());
            debug!("Job {}: transcode outcome {:?}", id, outcome);
            outcome.into_path()
        };

        let title = self
            .handle
            .snapshot()
            .title
            .or_else(|| file_stem(&final_path));
        self.handle.update(|job| job.complete(final_path.clone(), title));
        info!("Job {}: completed -> {}", id, final_path.display());
        Ok(())
    }

    /// Run yt-dlp, applying progress from its output until both streams close.
    async fn download(&self, url: &str) -> Result<ExitStatus> {
        let id = self.handle.id();
        let mut cmd = Command::new(&self.config.ytdlp_bin);
        cmd.arg("--no-check-certificate");
        if let Some(dir) = self.config.ffmpeg_location() {
            cmd.arg("--ffmpeg-location").arg(dir);
        }
        cmd.arg("-o")
            .arg(self.config.output_template())
            .args(["--newline", "--no-overwrites", "--restrict-filenames", "--"])
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Job {}: downloading {}", id, url);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute {}", self.config.ytdlp_bin.display()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let dir = self.config.download_dir.to_string_lossy().into_owned();
        while let Some(line) = rx.recv().await {
            debug!("Job {}: {}", id, line);
            for event in parse_line(&line, &dir) {
                self.apply(event);
            }
        }

        child.wait().await.context("Failed to wait for yt-dlp")
    }

    fn apply(&self, event: ProgressEvent) {
        self.handle.update(|job| match event {
            ProgressEvent::Destination(title) => job.set_title(title),
            ProgressEvent::Percent(percent) => job.record_progress(percent),
            ProgressEvent::Merging => {
                if job.status.can_transition_to(JobStatus::Processing) {
                    job.advance(JobStatus::Processing);
                }
            }
        });
    }
}

/// Send each line of `reader` to `tx`; invalid UTF-8 is replaced rather than fatal
async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading process output: {}", e);
                break;
            }
        }
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}
