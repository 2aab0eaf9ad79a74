//! Job execution pipeline: validation, lifecycle tracking, subprocess
//! streaming.
//!
//! An `attack` envelope resolves to a [`JobSpec`](crate::protocol::JobSpec);
//! the runner validates it, spawns hashcat, and streams the combined
//! output back as `status_update` envelopes through the target
//! connection's outbound queue. Every failure class — bad selector,
//! unsafe path, spawn error, non-zero exit — is contained to that one job
//! and reported as a `failed` update; nothing propagates to the
//! connection or the relay.
//!
//! # Modules
//!
//! - [`runner`] - per-job task: spawn, stream, terminal report

pub mod runner;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::protocol::JobStatus;

/// One tracked job: lifecycle state plus accumulated output.
///
/// Mutated only by the runner task that owns the job; terminal states are
/// final.
#[derive(Debug, Clone)]
pub struct Job {
    /// Caller-supplied identifier.
    pub id: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Accumulated combined stdout/stderr text.
    pub output: String,
    /// Failure reason, set with the `failed` state.
    pub error: Option<String>,
}

/// Per-connection job table.
///
/// Enforces the uniqueness rule: a job id may not be reused while a job
/// with that id is still running on the same connection. Terminal entries
/// stay queryable (and reusable) afterwards.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    inner: Arc<Mutex<HashMap<String, Job>>>,
}

impl JobTable {
    /// Claim a job id, creating a `queued` entry.
    ///
    /// Returns `false` if a job with this id is already in a non-terminal
    /// state — the caller must reject the duplicate without spawning.
    pub fn claim(&self, job_id: &str) -> bool {
        let mut jobs = self.lock();
        if let Some(existing) = jobs.get(job_id) {
            if !existing.status.is_terminal() {
                return false;
            }
        }
        jobs.insert(
            job_id.to_string(),
            Job {
                id: job_id.to_string(),
                status: JobStatus::Queued,
                output: String::new(),
                error: None,
            },
        );
        true
    }

    /// Transition a job to `running`.
    pub fn mark_running(&self, job_id: &str) {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.status = JobStatus::Running;
        }
    }

    /// Append one output line to a job's accumulated text.
    pub fn append_output(&self, job_id: &str, line: &str) {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.output.push_str(line);
            job.output.push('\n');
        }
    }

    /// Terminal transition: success.
    pub fn mark_completed(&self, job_id: &str) {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.status = JobStatus::Completed;
        }
    }

    /// Terminal transition: failure with a reason.
    pub fn mark_failed(&self, job_id: &str, error: &str) {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
        }
    }

    /// Snapshot of one job, if tracked.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        // Held only for map access, never across an await.
        self.inner.lock().expect("job table lock poisoned")
    }
}
