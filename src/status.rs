use serde::{Deserialize, Serialize};
use std::fmt;

/// Print job status, shared by the queue, the HTTP API and the WebSocket
/// feed. Serialized names are what the UI matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Printing,
    Retrying,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Printing => "Printing",
            JobStatus::Retrying => "Retrying",
            JobStatus::Done => "Done",
            JobStatus::Error => "Error",
        }
    }

    /// Terminal jobs are dequeued as soon as observers have been told.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// The job currently held by the execution loop.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Printing | JobStatus::Retrying)
    }

    /// Allowed edges of the job state machine.
    ///
    /// `Retrying -> Retrying` is a real transition (another failed poll),
    /// and `Retrying -> Error` only happens if the retry policy gives up.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, next),
            (Queued, Printing)
                | (Queued, Retrying)
                | (Retrying, Printing)
                | (Retrying, Retrying)
                | (Retrying, Error)
                | (Printing, Done)
                | (Printing, Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Printer Status (reported to the UI on connect and on USB hot-plug)
// =============================================================================

/// Snapshot of printer reachability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrinterStatus {
    /// True when at least one output target is reachable.
    pub connected: bool,
    /// Names of every reachable output target, in provider order.
    pub targets: Vec<String>,
    /// The target the spooler would print to right now.
    pub selected: Option<String>,
}

impl PrinterStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            targets: Vec::new(),
            selected: None,
        }
    }
}
