//! Label print spooler: a FIFO job queue that renders label images to PDF
//! and hands them to the local print system, one job at a time, waiting out
//! printer outages instead of dropping work.

pub mod api;
pub mod config;
pub mod errors;
pub mod hotplug;
pub mod printer;
pub mod queue;
pub mod render;
pub mod sentry_init;
pub mod spooler;
pub mod status;

pub use errors::{Result, SpoolerError};
pub use queue::{JobId, JobSnapshot, QueueStats};
pub use spooler::Spooler;
pub use status::{JobStatus, PrinterStatus};
