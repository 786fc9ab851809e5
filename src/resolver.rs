use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::debug;
use walkdir::WalkDir;

/// Anything this small is a thumbnail, a sidecar, or a failed write
pub const MIN_OUTPUT_BYTES: u64 = 1_000_000;

/// Canonical files older than this belong to an earlier job
pub const STALE_CANONICAL_WINDOW: Duration = Duration::from_secs(10);

pub const CANONICAL_EXTENSION: &str = "mp4";

const MEDIA_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "m4a"];
const PARTIAL_MARKER: &str = ".part";

static RE_FORMAT_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.f\d+\.").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found { path: PathBuf, size: u64 },
    /// Nothing qualified; names of the media files that were looked at
    Missing { inspected: Vec<String> },
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    name: String,
    size: u64,
    modified: SystemTime,
}

/// Pick the file in `dir` most likely to be the finished output of `job_id`.
pub fn resolve_output(dir: &Path, job_id: &str, now: SystemTime) -> Resolution {
    let stale_before = now.checked_sub(STALE_CANONICAL_WINDOW).unwrap_or(now);
    let mut inspected = Vec::new();
    let mut best: Option<Candidate> = None;

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        if name.contains(PARTIAL_MARKER) || RE_FORMAT_SEGMENT.is_match(&name) {
            continue;
        }
        if name.starts_with(job_id) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("Cannot stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let Some(ext) = extension(&name) else {
            continue;
        };
        if ext == CANONICAL_EXTENSION && modified < stale_before {
            continue;
        }
        if !MEDIA_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        inspected.push(name.clone());
        let size = metadata.len();
        if size <= MIN_OUTPUT_BYTES {
            continue;
        }

        let candidate = Candidate {
            path: entry.path().to_path_buf(),
            name,
            size,
            modified,
        };
        if best.as_ref().map_or(true, |b| outranks(&candidate, b)) {
            best = Some(candidate);
        }
    }

    match best {
        Some(c) => {
            debug!("Resolved output {} ({} bytes)", c.path.display(), c.size);
            Resolution::Found {
                path: c.path,
                size: c.size,
            }
        }
        None => Resolution::Missing { inspected },
    }
}

fn outranks(a: &Candidate, b: &Candidate) -> bool {
    (a.modified, a.size, &a.name) > (b.modified, b.size, &b.name)
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    const JOB: &str = "a1b2c3d4";

    fn write(dir: &Path, name: &str, size: u64, age: Duration) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    #[test]
    fn picks_newest_qualifying_media_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.part", 2_000_000, Duration::from_secs(1));
        write(dir.path(), "b.mp4", 500_000, Duration::from_secs(2));
        let c = write(dir.path(), "c.webm", 5_000_000, Duration::ZERO);

        match resolve_output(dir.path(), JOB, SystemTime::now()) {
            Resolution::Found { path, size } => {
                assert_eq!(path, c);
                assert_eq!(size, 5_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nothing_over_threshold_is_no_match() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "tiny.webm", 1_000_000, Duration::ZERO);
        write(dir.path(), "thumb.mkv", 20_000, Duration::ZERO);

        let resolution = resolve_output(dir.path(), JOB, SystemTime::now());
        assert_eq!(
            resolution,
            Resolution::Missing {
                inspected: vec!["thumb.mkv".into(), "tiny.webm".into()]
            }
        );
    }

    #[test]
    fn skips_segments_job_prefixed_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Clip.f137.mp4", 9_000_000, Duration::ZERO);
        write(dir.path(), "Clip.webm.part", 9_000_000, Duration::ZERO);
        write(dir.path(), &format!("{JOB}_video.mkv"), 9_000_000, Duration::ZERO);
        write(dir.path(), "notes.txt", 9_000_000, Duration::ZERO);
        let keep = write(dir.path(), "Clip.mkv", 3_000_000, Duration::from_secs(5));

        assert_eq!(
            resolve_output(dir.path(), JOB, SystemTime::now()),
            Resolution::Found {
                path: keep,
                size: 3_000_000
            }
        );
    }

    #[test]
    fn stale_canonical_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "old.mp4", 8_000_000, Duration::from_secs(3600));
        let fresh = write(dir.path(), "new.webm", 2_000_000, Duration::from_secs(3000));

        assert_eq!(
            resolve_output(dir.path(), JOB, SystemTime::now()),
            Resolution::Found {
                path: fresh,
                size: 2_000_000
            }
        );
    }

    #[test]
    fn recent_canonical_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let fresh = write(dir.path(), "merged.mp4", 4_000_000, Duration::from_secs(1));
        assert!(matches!(
            resolve_output(dir.path(), JOB, SystemTime::now()),
            Resolution::Found { path, .. } if path == fresh
        ));
    }

    #[test]
    fn equal_timestamps_break_ties_deterministically() {
        let dir = TempDir::new().unwrap();
        let stamp = SystemTime::now() - Duration::from_secs(1);
        for (name, size) in [("x.mkv", 2_000_000), ("y.mkv", 3_000_000), ("z.webm", 3_000_000)] {
            let file = File::create(dir.path().join(name)).unwrap();
            file.set_len(size).unwrap();
            file.set_modified(stamp).unwrap();
        }

        for _ in 0..3 {
            assert_eq!(
                resolve_output(dir.path(), JOB, SystemTime::now()),
                Resolution::Found {
                    path: dir.path().join("z.webm"),
                    size: 3_000_000
                }
            );
        }
    }

    #[test]
    fn missing_directory_is_no_match() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("nope");
        assert_eq!(
            resolve_output(&gone, JOB, SystemTime::now()),
            Resolution::Missing { inspected: vec![] }
        );
    }
}
