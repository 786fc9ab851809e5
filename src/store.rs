use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use uuid::Uuid;

use crate::job::Job;

/// Length of the public job id
pub const JOB_ID_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
}

type Slot = Arc<RwLock<Job>>;

#[derive(Default)]
struct Table {
    slots: HashMap<String, Slot>,
    /// Every id ever handed out, so a deleted id is never issued again.
    /// Grows for the life of the process; entries are never evicted.
    issued: HashSet<String>,
}

/// In-memory job table.
///
/// The map lock is held only long enough to find a slot. Each job has its
/// own lock, so writers on different jobs never wait on each other.
#[derive(Default)]
pub struct JobStore {
    table: RwLock<Table>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, url: &str) -> String {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let id = loop {
            let candidate = short_id();
            if !table.issued.contains(&candidate) {
                break candidate;
            }
        };
        table.issued.insert(id.clone());
        table.slots.insert(
            id.clone(),
            Arc::new(RwLock::new(Job::new(id.clone(), url.to_string()))),
        );
        id
    }

    /// Snapshot of the job's current state
    pub fn get(&self, id: &str) -> Result<Job, StoreError> {
        let slot = self.slot(id)?;
        let job = slot.read().unwrap_or_else(PoisonError::into_inner);
        Ok(job.clone())
    }

    pub fn update<F>(&self, id: &str, mutation: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let slot = self.slot(id)?;
        let mut job = slot.write().unwrap_or_else(PoisonError::into_inner);
        mutation(&mut job);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Option<Job> {
        let slot = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            table.slots.remove(id)?
        };
        let job = slot.read().unwrap_or_else(PoisonError::into_inner);
        Some(job.clone())
    }

    /// Writer bound to a single job's slot
    pub fn handle(&self, id: &str) -> Result<JobHandle, StoreError> {
        Ok(JobHandle {
            id: id.to_string(),
            slot: self.slot(id)?,
        })
    }

    fn slot(&self, id: &str) -> Result<Slot, StoreError> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .slots
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Write access to exactly one job. Held by that job's worker.
///
/// If the job is deleted while the worker still runs, writes land in the
/// detached slot and are no longer visible to readers.
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    slot: Slot,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn update<F, R>(&self, mutation: F) -> R
    where
        F: FnOnce(&mut Job) -> R,
    {
        let mut job = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        mutation(&mut job)
    }

    pub fn snapshot(&self) -> Job {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..JOB_ID_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn create_issues_short_unique_ids() {
        let store = JobStore::new();
        let a = store.create("https://a");
        let b = store.create("https://b");
        assert_eq!(a.len(), JOB_ID_LEN);
        assert_ne!(a, b);

        let job = store.get(&a).unwrap();
        assert_eq!(job.status, JobStatus::Starting);
        assert_eq!(job.url, "https://a");
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let store = JobStore::new();
        assert_eq!(
            store.get("missing").unwrap_err(),
            StoreError::NotFound("missing".into())
        );
        assert!(store.update("missing", |_| {}).is_err());
    }

    #[test]
    fn delete_removes_record() {
        let store = JobStore::new();
        let id = store.create("https://a");
        assert!(store.delete(&id).is_some());
        assert!(store.get(&id).is_err());
        assert!(store.delete(&id).is_none());
    }

    #[test]
    fn deleted_ids_stay_reserved() {
        let store = JobStore::new();
        let id = store.create("https://a");
        store.delete(&id);

        let table = store.table.read().unwrap();
        assert!(table.issued.contains(&id));
        assert!(!table.slots.contains_key(&id));
    }

    #[test]
    fn writers_on_distinct_ids_do_not_block_each_other() {
        let store = Arc::new(JobStore::new());
        let slow = store.create("https://slow");
        let fast = store.create("https://fast");

        let entered = Arc::new(Barrier::new(2));
        let writer = {
            let store = Arc::clone(&store);
            let entered = Arc::clone(&entered);
            let slow = slow.clone();
            thread::spawn(move || {
                store
                    .update(&slow, |job| {
                        entered.wait();
                        thread::sleep(Duration::from_millis(300));
                        job.advance(JobStatus::Downloading);
                    })
                    .unwrap();
            })
        };

        entered.wait();
        // The slow writer still holds its job lock here.
        let started = std::time::Instant::now();
        store
            .update(&fast, |job| {
                job.advance(JobStatus::Downloading);
            })
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(store.get(&fast).unwrap().status, JobStatus::Downloading);

        writer.join().unwrap();
        assert_eq!(store.get(&slow).unwrap().status, JobStatus::Downloading);
    }

    #[test]
    fn readers_see_whole_values_during_writes() {
        let store = Arc::new(JobStore::new());
        let id = store.create("https://a");
        store
            .update(&id, |job| {
                job.advance(JobStatus::Downloading);
            })
            .unwrap();

        let writer = {
            let store = Arc::clone(&store);
            let id = id.clone();
            thread::spawn(move || {
                for step in 1..=100 {
                    store
                        .update(&id, |job| {
                            job.record_progress(step as f64);
                            job.set_title(format!("title-{step}"));
                        })
                        .unwrap();
                }
            })
        };

        let mut last = 0.0;
        for _ in 0..200 {
            let job = store.get(&id).unwrap();
            assert!(job.progress >= last, "progress went backwards");
            if let Some(title) = &job.title {
                assert_eq!(title, &format!("title-{}", job.progress as u32));
            }
            last = job.progress;
        }
        writer.join().unwrap();
        assert_eq!(store.get(&id).unwrap().progress, 100.0);
    }

    #[test]
    fn handle_writes_its_own_slot() {
        let store = JobStore::new();
        let id = store.create("https://a");
        let other = store.create("https://b");
        let handle = store.handle(&id).unwrap();

        handle.update(|job| job.fail("nope"));
        assert_eq!(handle.id(), id);
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Error);
        assert_eq!(store.get(&other).unwrap().status, JobStatus::Starting);
    }
}
