// Common test utilities and fakes
#![allow(dead_code)]

use async_trait::async_trait;
use label_spooler::config::SpoolerConfig;
use label_spooler::printer::{OutputTarget, OutputTargetProvider};
use label_spooler::queue::{JobId, JobSnapshot};
use label_spooler::render::DocumentRenderer;
use label_spooler::{JobStatus, Spooler, SpoolerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Scripted print system
#[derive(Clone)]
pub struct FakePrinter {
    pub targets: Arc<RwLock<Vec<String>>>,
    /// Polls left that report no targets at all
    pub unavailable_polls: Arc<RwLock<u32>>,
    pub polls: Arc<RwLock<u32>>,
    pub submissions: Arc<RwLock<Vec<(String, Vec<u8>, String)>>>,
    pub should_fail: Arc<RwLock<bool>>,
    /// Calls left that panic instead of answering, like a crashing driver
    pub panicking_polls: Arc<RwLock<u32>>,
    pub panicking_submits: Arc<RwLock<u32>>,
    pub submit_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakePrinter {
    pub fn new(targets: &[&str]) -> Self {
        Self {
            targets: Arc::new(RwLock::new(targets.iter().map(|t| t.to_string()).collect())),
            unavailable_polls: Arc::new(RwLock::new(0)),
            polls: Arc::new(RwLock::new(0)),
            submissions: Arc::new(RwLock::new(Vec::new())),
            should_fail: Arc::new(RwLock::new(false)),
            panicking_polls: Arc::new(RwLock::new(0)),
            panicking_submits: Arc::new(RwLock::new(0)),
            submit_delay: Duration::from_millis(5),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn set_unavailable_polls(&self, polls: u32) {
        *self.unavailable_polls.write().await = polls;
    }

    pub async fn set_targets(&self, targets: &[&str]) {
        *self.targets.write().await = targets.iter().map(|t| t.to_string()).collect();
    }

    pub async fn set_should_fail(&self, fail: bool) {
        *self.should_fail.write().await = fail;
    }

    pub async fn set_panicking_polls(&self, calls: u32) {
        *self.panicking_polls.write().await = calls;
    }

    pub async fn set_panicking_submits(&self, calls: u32) {
        *self.panicking_submits.write().await = calls;
    }

    pub async fn get_polls(&self) -> u32 {
        *self.polls.read().await
    }

    pub async fn get_submissions(&self) -> Vec<(String, Vec<u8>, String)> {
        self.submissions.read().await.clone()
    }

    /// Highest number of overlapping `submit` calls seen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputTargetProvider for FakePrinter {
    async fn list_targets(&self) -> Vec<OutputTarget> {
        *self.polls.write().await += 1;
        if take_one(&self.panicking_polls).await {
            panic!("Simulated driver crash while listing printers");
        }

        let mut unavailable = self.unavailable_polls.write().await;
        if *unavailable > 0 {
            *unavailable -= 1;
            return Vec::new();
        }

        self.targets
            .read()
            .await
            .iter()
            .map(|name| OutputTarget::new(name.as_str()))
            .collect()
    }

    async fn submit(&self, target: &str, document: &[u8], label: &str) -> label_spooler::Result<String> {
        if take_one(&self.panicking_submits).await {
            panic!("Simulated driver crash while printing");
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.submit_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *self.should_fail.read().await {
            return Err(SpoolerError::Submit("Simulated printer failure".to_string()));
        }

        let mut submissions = self.submissions.write().await;
        submissions.push((target.to_string(), document.to_vec(), label.to_string()));
        Ok(format!("{}-{}", target, submissions.len()))
    }
}

async fn take_one(counter: &RwLock<u32>) -> bool {
    let mut left = counter.write().await;
    if *left == 0 {
        return false;
    }
    *left -= 1;
    true
}

/// Wraps the image in a marker; images starting with `corrupt` fail.
pub struct FakeRenderer;

impl DocumentRenderer for FakeRenderer {
    fn render(&self, image: &[u8]) -> label_spooler::Result<Vec<u8>> {
        if image.starts_with(b"corrupt") {
            return Err(SpoolerError::Render("Failed to decode image".to_string()));
        }
        let mut document = b"DOC:".to_vec();
        document.extend_from_slice(image);
        Ok(document)
    }
}

pub fn rendered(image: &[u8]) -> Vec<u8> {
    let mut document = b"DOC:".to_vec();
    document.extend_from_slice(image);
    document
}

pub fn fast_config() -> SpoolerConfig {
    SpoolerConfig {
        retry_interval_ms: 10,
        ..SpoolerConfig::default()
    }
}

pub fn start_spooler(printer: &FakePrinter) -> Spooler {
    Spooler::start(fast_config(), Arc::new(printer.clone()), Arc::new(FakeRenderer))
}

/// Records the queue snapshot taken at every notification.
#[derive(Clone, Default)]
pub struct TransitionRecorder {
    snapshots: Arc<Mutex<Vec<Vec<JobSnapshot>>>>,
}

impl TransitionRecorder {
    pub fn attach(spooler: &Spooler) -> Self {
        let recorder = Self::default();
        let snapshots = recorder.snapshots.clone();
        let observed = spooler.clone();
        spooler.set_notification_callback(move || {
            let snapshot = observed.inspect();
            snapshots.lock().unwrap().push(snapshot);
        });
        recorder
    }

    pub fn snapshots(&self) -> Vec<Vec<JobSnapshot>> {
        self.snapshots.lock().unwrap().clone()
    }

    /// Status history of one job, consecutive duplicates collapsed
    pub fn history(&self, id: JobId) -> Vec<JobStatus> {
        let mut history: Vec<JobStatus> = Vec::new();
        for snapshot in self.snapshots() {
            if let Some(job) = snapshot.iter().find(|j| j.id == id) {
                if history.last() != Some(&job.status) {
                    history.push(job.status);
                }
            }
        }
        history
    }

    /// Most jobs ever seen in `Printing`/`Retrying` at once
    pub fn max_in_flight(&self) -> usize {
        self.snapshots()
            .iter()
            .map(|s| s.iter().filter(|j| j.status.is_in_flight()).count())
            .max()
            .unwrap_or(0)
    }

    /// Order in which jobs first reached `Done`
    pub fn completion_order(&self) -> Vec<JobId> {
        let mut order = Vec::new();
        for snapshot in self.snapshots() {
            for job in snapshot {
                if job.status == JobStatus::Done && !order.contains(&job.id) {
                    order.push(job.id);
                }
            }
        }
        order
    }
}

/// Poll `condition` until it holds; panics after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
