use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Lifecycle state of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Downloading,
    Processing,
    Converting,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Position in the forward-only pipeline; terminal states sit past every working state.
    fn rank(self) -> u8 {
        match self {
            JobStatus::Starting => 0,
            JobStatus::Downloading => 1,
            JobStatus::Processing => 2,
            JobStatus::Converting => 3,
            JobStatus::Completed | JobStatus::Error => 4,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Starting => "starting",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Converting => "converting",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One user-requested download, as reported to pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub url: String,
    pub title: Option<String>,
    pub filename: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String, url: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Starting,
            progress: 0.0,
            url,
            title: None,
            filename: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a later working state. Backward moves and moves out of a
    /// terminal state are ignored.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if next.is_terminal() {
            warn!(
                "Job {}: use complete()/fail() to finish, not advance({})",
                self.id, next
            );
            return false;
        }
        if !self.status.can_transition_to(next) {
            warn!("Job {}: rejected transition {} -> {}", self.id, self.status, next);
            return false;
        }
        self.status = next;
        if next == JobStatus::Processing {
            self.progress = 100.0;
        }
        self.touch();
        true
    }

    /// Record a download percentage. Only applies while downloading and never lowers the value.
    pub fn record_progress(&mut self, percent: f64) {
        if self.status != JobStatus::Downloading || !percent.is_finite() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.progress {
            self.progress = percent;
            self.touch();
        }
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.title = Some(title.into());
        self.touch();
    }

    pub fn complete(&mut self, filename: PathBuf, title: Option<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Completed) {
            warn!("Job {}: cannot complete from {}", self.id, self.status);
            return false;
        }
        self.status = JobStatus::Completed;
        self.filename = Some(filename);
        if title.is_some() {
            self.title = title;
        }
        self.error = None;
        self.touch();
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Error) {
            warn!("Job {}: cannot fail from {}", self.id, self.status);
            return false;
        }
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        self.filename = None;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
