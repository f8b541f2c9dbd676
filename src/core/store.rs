use crate::core::job::Job;
use compact_str::CompactString;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory job map keyed by job id. The mutex is held only for the map
/// operation itself, never across filesystem I/O or process waits; the
/// directory layout remains the durable truth this cache must agree with.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<CompactString, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, job: Job) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    pub async fn list(&self) -> Vec<Job> {
        self.jobs.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    /// Replace the stored record wholesale (records carry their own id).
    pub async fn update(&self, job: Job) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    /// Mutate a record in place; returns false for unknown ids.
    pub async fn update_with<F>(&self, job_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(job) => {
                mutate(job);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}
