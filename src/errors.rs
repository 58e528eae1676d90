use crate::status::JobStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpoolerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Printer not found: {0}")]
    TargetNotFound(String),

    #[error("No output target available")]
    NoTargetAvailable,

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Print submission failed: {0}")]
    Submit(String),

    #[error("Invalid job transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SpoolerError>;
