use crate::errors::{Result, SpoolerError};
use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Identifier handed back to the submitter. Counts up from 1 per spooler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: JobId,
    /// Raw image bytes exactly as submitted.
    pub payload: Arc<[u8]>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

/// What `inspect` reports per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    /// 0 = next to run
    pub position: usize,
}

/// Aggregate counters; the only history kept once jobs leave the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Polls that found no output target.
    pub retries: u64,
}

/// In-memory FIFO of print jobs plus the busy flag.
///
/// Pure bookkeeping with no I/O; the spooler wraps it in a mutex and is the
/// only caller that mutates job status.
#[derive(Debug)]
pub struct JobQueue {
    jobs: VecDeque<PrintJob>,
    next_id: u64,
    busy: bool,
    stats: QueueStats,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            next_id: 1,
            busy: false,
            stats: QueueStats::default(),
        }
    }

    /// Append a new `Queued` job and return its id.
    pub fn enqueue(&mut self, payload: impl Into<Arc<[u8]>>) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;

        self.jobs.push_back(PrintJob {
            id,
            payload: payload.into(),
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
        });
        self.stats.submitted += 1;

        id
    }

    /// Take the head job for execution without removing it.
    ///
    /// Returns `None` when already busy or empty.
    pub fn claim_front(&mut self) -> Option<PrintJob> {
        if self.busy {
            return None;
        }

        let job = self.jobs.front()?.clone();
        self.busy = true;
        Some(job)
    }

    /// Move the claimed head job to `next`.
    pub fn transition(&mut self, id: JobId, next: JobStatus) -> Result<()> {
        let busy = self.busy;
        let job = self
            .jobs
            .front_mut()
            .filter(|job| busy && job.id == id)
            .ok_or_else(|| SpoolerError::Other(anyhow::anyhow!("Job {} is not the claimed head job", id)))?;

        if !job.status.can_transition_to(next) {
            return Err(SpoolerError::InvalidTransition {
                job_id: id.0,
                from: job.status,
                to: next,
            });
        }

        job.status = next;
        match next {
            JobStatus::Retrying => self.stats.retries += 1,
            JobStatus::Done => self.stats.completed += 1,
            JobStatus::Error => self.stats.failed += 1,
            JobStatus::Queued | JobStatus::Printing => {}
        }

        Ok(())
    }

    /// Dequeue the finished head job and release the busy flag.
    pub fn remove_finished(&mut self, id: JobId) -> Option<PrintJob> {
        let is_finished_head = self
            .jobs
            .front()
            .map(|job| job.id == id && job.status.is_terminal())
            .unwrap_or(false);

        if !is_finished_head {
            return None;
        }

        self.busy = false;
        self.jobs.pop_front()
    }

    /// Force the claimed head job into `Error` from any live status.
    ///
    /// Only for a job whose execution blew up part way, so it bypasses the
    /// transition table (a job can die while still `Queued`). Returns `false`
    /// if `id` is not the claimed head or is already terminal.
    pub fn fail_claimed(&mut self, id: JobId) -> bool {
        let busy = self.busy;
        let job = match self.jobs.front_mut() {
            Some(job) if busy && job.id == id && !job.status.is_terminal() => job,
            _ => return false,
        };

        job.status = JobStatus::Error;
        self.stats.failed += 1;
        true
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs
            .iter()
            .enumerate()
            .map(|(position, job)| JobSnapshot {
                id: job.id,
                status: job.status,
                position,
            })
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop every job (shutdown only; there is no persistence).
    pub fn clear(&mut self) -> usize {
        let dropped = self.jobs.len();
        self.jobs.clear();
        self.busy = false;
        dropped
    }
}
