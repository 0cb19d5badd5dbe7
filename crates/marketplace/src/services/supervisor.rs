//! Per-job task supervision
//!
//! The provider pump spawns one task per accepted job and routes every
//! later record for that job id into the task's mailbox. A job that
//! stalls waiting for payment or release only ever blocks itself.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::relay::Record;

/// Mailbox depth per job. Deep enough that a bursty stream of chunks or
/// retried payment messages never stalls the pump.
const JOB_MAILBOX: usize = 64;

struct JobHandle {
    tx: mpsc::Sender<Record>,
    task: JoinHandle<()>,
}

/// Registry of in-flight jobs keyed by job id.
pub struct JobSupervisor {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a task for `job_id` with a fresh mailbox. Returns false
    /// without spawning when the job is already tracked, which makes a
    /// replayed request a no-op.
    pub async fn spawn<F, Fut>(&self, job_id: &str, f: F) -> bool
    where
        F: FnOnce(mpsc::Receiver<Record>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(job_id) {
            return false;
        }
        let (tx, rx) = mpsc::channel(JOB_MAILBOX);
        let task = tokio::spawn(f(rx));
        jobs.insert(job_id.to_string(), JobHandle { tx, task });
        true
    }

    /// Route a record to the task handling its job. Returns false when no
    /// task is tracked for the id or the task has already exited; the
    /// finished entry is dropped on the way out. Records for a job whose
    /// mailbox is full are dropped, counted as routed; the registry lock
    /// is never held across a blocking send.
    pub async fn dispatch(&self, record: Record) -> bool {
        let Some(job_id) = record.job_id.clone() else {
            return false;
        };
        let mut jobs = self.jobs.lock().await;
        let Some(handle) = jobs.get(&job_id) else {
            return false;
        };
        match handle.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "job {}: mailbox full, dropping record",
                    job_id.get(..8).unwrap_or(&job_id)
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                jobs.remove(&job_id);
                false
            }
        }
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.jobs.lock().await.contains_key(job_id)
    }

    /// Number of tracked jobs, finished tasks included until reaped.
    pub async fn active(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Drop entries whose task has run to completion. Returns how many
    /// were removed.
    pub async fn reap(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, handle| !handle.task.is_finished());
        before - jobs.len()
    }

    /// Abort every tracked task and clear the registry.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for (_, handle) in jobs.drain() {
            handle.task.abort();
        }
    }
}

impl Default for JobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
