use crate::config::SpoolerConfig;
use crate::errors::{Result, SpoolerError};
use crate::printer::{OutputTarget, OutputTargetProvider};
use crate::queue::{JobId, JobQueue, JobSnapshot, PrintJob, QueueStats};
use crate::render::DocumentRenderer;
use crate::sentry_init;
use crate::status::JobStatus;
use backon::{ConstantBuilder, Retryable};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Observer invoked after every queue change.
pub type NotificationCallback = Arc<dyn Fn() + Send + Sync>;

/// FIFO print spooler with a single execution loop.
///
/// Cloning is cheap and every clone drives the same queue. Jobs run strictly
/// one at a time in arrival order; while no output target is reachable the
/// head job waits in `Retrying` and nothing behind it starts.
#[derive(Clone)]
pub struct Spooler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SpoolerConfig,
    provider: Arc<dyn OutputTargetProvider>,
    renderer: Arc<dyn DocumentRenderer>,
    queue: Mutex<JobQueue>,
    callback: RwLock<NotificationCallback>,
    wakeup: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Spooler {
    /// Create the spooler and spawn its worker task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: SpoolerConfig,
        provider: Arc<dyn OutputTargetProvider>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        info!(
            "Starting spooler (retry interval {:?}, selection {:?})",
            config.retry_interval(),
            config.target_selection
        );

        let inner = Arc::new(Inner {
            config,
            provider,
            renderer,
            queue: Mutex::new(JobQueue::new()),
            callback: RwLock::new(Arc::new(|| {})),
            wakeup: Notify::new(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Inner::run(inner.clone()));
        *inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self { inner }
    }

    /// Enqueue a raw image. Never blocks and never fails.
    pub fn submit(&self, payload: Vec<u8>) -> JobId {
        let (id, depth) = {
            let mut queue = self.inner.lock_queue();
            let id = queue.enqueue(payload);
            (id, queue.len())
        };

        info!(job_id = %id, queue_depth = depth, "Job queued");
        self.inner.notify();
        self.inner.wakeup.notify_one();
        id
    }

    /// Point-in-time view of every job still in the queue, head first.
    pub fn inspect(&self) -> Vec<JobSnapshot> {
        self.inner.lock_queue().snapshot()
    }

    /// Replace the active callback. Only the most recently set one fires.
    pub fn set_notification_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut slot = self.inner.callback.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Arc::new(callback);
    }

    /// Lifetime counters.
    pub fn stats(&self) -> QueueStats {
        self.inner.lock_queue().stats()
    }

    /// True while a job is claimed, including while it waits in `Retrying`.
    pub fn is_busy(&self) -> bool {
        self.inner.lock_queue().is_busy()
    }

    /// Jobs still in the queue, the running one included.
    pub fn len(&self) -> usize {
        self.inner.lock_queue().len()
    }

    /// No job queued or running.
    pub fn is_empty(&self) -> bool {
        self.inner.lock_queue().is_empty()
    }

    /// Stop the worker and drop whatever is still queued.
    ///
    /// Returns the number of dropped jobs.
    pub fn shutdown(&self) -> usize {
        if let Some(handle) = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let dropped = self.inner.lock_queue().clear();
        if dropped > 0 {
            warn!("Spooler stopped with {} unprinted job(s)", dropped);
        } else {
            info!("Spooler stopped");
        }
        self.inner.notify();
        dropped
    }
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire the callback. Never called with the queue lock held.
    ///
    /// A panicking callback is logged and swallowed.
    fn notify(&self) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            error!("Notification callback panicked: {}", panic_message(&*panic));
        }
    }

    async fn run(self: Arc<Self>) {
        debug!("Spooler worker running");
        loop {
            let claimed = self.lock_queue().claim_front();
            match claimed {
                Some(job) => {
                    let id = job.id;
                    if let Err(panic) = AssertUnwindSafe(self.execute(job)).catch_unwind().await {
                        self.abandon(id, &panic_message(&*panic));
                    }
                }
                None => self.wakeup.notified().await,
            }
        }
    }

    /// Fail a job whose execution panicked and free the loop for the next one.
    fn abandon(&self, id: JobId, reason: &str) {
        error!(job_id = %id, "Job execution panicked: {}", reason);

        let marked = self.lock_queue().fail_claimed(id);
        if marked {
            self.notify();
        }

        let removed = self.lock_queue().remove_finished(id);
        if removed.is_some() {
            self.notify();
        }

        sentry_init::capture_job_failure(id.0, &format!("panic: {}", reason));
    }

    async fn execute(&self, job: PrintJob) {
        let id = job.id;
        debug!(job_id = %id, bytes = job.payload.len(), "Job claimed");

        let target = match self.acquire_target(id).await {
            Ok(target) => target,
            Err(e) => {
                error!(job_id = %id, "Gave up waiting for an output target: {}", e);
                self.finish(id, JobStatus::Error);
                sentry_init::capture_job_failure(id.0, &e.to_string());
                return;
            }
        };

        self.set_status(id, JobStatus::Printing);
        info!(job_id = %id, target = %target.name, "Printing");

        match self.print(&job, &target).await {
            Ok(reference) => {
                info!(job_id = %id, target = %target.name, reference = %reference, "Job printed");
                self.finish(id, JobStatus::Done);
            }
            Err(e) => {
                error!(job_id = %id, target = %target.name, "Job failed: {}", e);
                self.finish(id, JobStatus::Error);
                sentry_init::capture_job_failure(id.0, &e.to_string());
            }
        }
    }

    /// Poll the provider every retry interval until a target is selectable.
    async fn acquire_target(&self, id: JobId) -> Result<OutputTarget> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.config.retry_interval())
            .with_max_times(usize::MAX);

        (|| async {
            let targets = self.provider.list_targets().await;
            self.config
                .target_selection
                .select(&targets)
                .cloned()
                .ok_or(SpoolerError::NoTargetAvailable)
        })
        .retry(backoff)
        .notify(|err: &SpoolerError, delay: Duration| {
            warn!(job_id = %id, "{}, retrying in {:?}", err, delay);
            self.set_status(id, JobStatus::Retrying);
        })
        .await
    }

    async fn print(&self, job: &PrintJob, target: &OutputTarget) -> Result<String> {
        let renderer = self.renderer.clone();
        let payload = job.payload.clone();

        let document = tokio::task::spawn_blocking(move || renderer.render(&payload))
            .await
            .map_err(|e| SpoolerError::Render(format!("Render task failed: {}", e)))??;

        self.provider
            .submit(&target.name, &document, &self.config.job_label)
            .await
    }

    fn set_status(&self, id: JobId, next: JobStatus) {
        let result = self.lock_queue().transition(id, next);
        if let Err(e) = result {
            error!(job_id = %id, "Status update rejected: {}", e);
            return;
        }
        self.notify();
    }

    /// Record the terminal status, then dequeue the job and free the loop.
    fn finish(&self, id: JobId, terminal: JobStatus) {
        self.set_status(id, terminal);

        let removed = self.lock_queue().remove_finished(id);
        match removed {
            Some(job) => {
                debug!(
                    job_id = %id,
                    status = %terminal,
                    waited_ms = (chrono::Utc::now() - job.submitted_at).num_milliseconds(),
                    "Job removed"
                );
                self.notify();
            }
            None => error!(job_id = %id, "Finished job was not at the head of the queue"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::{MockOutputTargetProvider, TargetSelection};
    use crate::render::MockDocumentRenderer;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> SpoolerConfig {
        SpoolerConfig {
            retry_interval_ms: 10,
            ..SpoolerConfig::default()
        }
    }

    fn passthrough_renderer() -> MockDocumentRenderer {
        let mut renderer = MockDocumentRenderer::new();
        renderer.expect_render().returning(|image| Ok(image.to_vec()));
        renderer
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_submit_assigns_sequential_ids() {
        let mut provider = MockOutputTargetProvider::new();
        provider.expect_list_targets().returning(Vec::new);

        let spooler = Spooler::start(fast_config(), Arc::new(provider), Arc::new(passthrough_renderer()));
        assert_eq!(spooler.submit(b"a".to_vec()), JobId(1));
        assert_eq!(spooler.submit(b"b".to_vec()), JobId(2));
        assert_eq!(spooler.stats().submitted, 2);
        spooler.shutdown();
    }

    #[tokio::test]
    async fn test_head_waits_in_retrying_without_targets() {
        let mut provider = MockOutputTargetProvider::new();
        provider.expect_list_targets().returning(Vec::new);
        provider.expect_submit().never();

        let spooler = Spooler::start(fast_config(), Arc::new(provider), Arc::new(passthrough_renderer()));
        let first = spooler.submit(b"a".to_vec());
        let second = spooler.submit(b"b".to_vec());

        wait_until(|| spooler.stats().retries >= 3).await;

        assert_eq!(
            spooler.inspect(),
            vec![
                JobSnapshot { id: first, status: JobStatus::Retrying, position: 0 },
                JobSnapshot { id: second, status: JobStatus::Queued, position: 1 },
            ]
        );
        assert!(spooler.is_busy());
        assert_eq!(spooler.shutdown(), 2);
        assert!(spooler.is_empty());
    }

    #[tokio::test]
    async fn test_job_is_rendered_and_submitted_to_selected_target() {
        let mut provider = MockOutputTargetProvider::new();
        provider
            .expect_list_targets()
            .returning(|| vec![OutputTarget::new("Office_Laser"), OutputTarget::new("MUNBYN_Label")]);
        provider
            .expect_submit()
            .withf(|target, document, label| {
                target.to_string() == "MUNBYN_Label"
                    && document.to_vec() == b"%PDF-fake"
                    && label.to_string() == "Label Print"
            })
            .times(1)
            .returning(|_, _, _| Ok("MUNBYN_Label-1".to_string()));

        let mut renderer = MockDocumentRenderer::new();
        renderer
            .expect_render()
            .withf(|image| image.to_vec() == b"png")
            .times(1)
            .returning(|_| Ok(b"%PDF-fake".to_vec()));

        let config = SpoolerConfig {
            target_selection: TargetSelection::Prefer {
                patterns: vec!["munbyn".to_string()],
            },
            ..fast_config()
        };
        let spooler = Spooler::start(config, Arc::new(provider), Arc::new(renderer));
        spooler.submit(b"png".to_vec());

        wait_until(|| spooler.stats().completed == 1).await;
        wait_until(|| spooler.is_empty()).await;
        assert!(!spooler.is_busy());
        assert_eq!(spooler.stats().failed, 0);
        spooler.shutdown();
    }

    #[tokio::test]
    async fn test_render_failure_skips_submit_and_frees_queue() {
        let mut provider = MockOutputTargetProvider::new();
        provider.expect_list_targets().returning(|| vec![OutputTarget::new("PRN1")]);
        provider
            .expect_submit()
            .withf(|_, document, _| document.to_vec() == b"good")
            .times(1)
            .returning(|_, _, _| Ok("PRN1-2".to_string()));

        let mut renderer = MockDocumentRenderer::new();
        renderer.expect_render().returning(|image| {
            if image.to_vec() == b"bad" {
                Err(SpoolerError::Render("corrupt image".to_string()))
            } else {
                Ok(image.to_vec())
            }
        });

        let spooler = Spooler::start(fast_config(), Arc::new(provider), Arc::new(renderer));
        spooler.submit(b"bad".to_vec());
        spooler.submit(b"good".to_vec());

        wait_until(|| spooler.is_empty() && !spooler.is_busy()).await;
        let stats = spooler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        spooler.shutdown();
    }

    #[tokio::test]
    async fn test_callback_fires_for_every_change() {
        let mut provider = MockOutputTargetProvider::new();
        provider.expect_list_targets().returning(|| vec![OutputTarget::new("PRN1")]);
        provider.expect_submit().returning(|_, _, _| Ok("PRN1-1".to_string()));

        let spooler = Spooler::start(fast_config(), Arc::new(provider), Arc::new(passthrough_renderer()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        spooler.set_notification_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        spooler.submit(b"a".to_vec());
        wait_until(|| spooler.stats().completed == 1 && spooler.is_empty()).await;

        // submission, Printing, Done, removal
        wait_until(|| calls.load(Ordering::SeqCst) == 4).await;
        spooler.shutdown();
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_printing() {
        let mut provider = MockOutputTargetProvider::new();
        provider.expect_list_targets().returning(|| vec![OutputTarget::new("PRN1")]);
        provider.expect_submit().times(2).returning(|_, _, _| Ok("PRN1-1".to_string()));

        let spooler = Spooler::start(fast_config(), Arc::new(provider), Arc::new(passthrough_renderer()));
        spooler.set_notification_callback(|| panic!("observer bug"));

        spooler.submit(b"a".to_vec());
        spooler.submit(b"b".to_vec());

        wait_until(|| spooler.stats().completed == 2 && spooler.is_empty()).await;
        assert_eq!(spooler.stats().failed, 0);
        spooler.shutdown();
    }
}
