//! Bounded-concurrency, rate-limited fetch engine
//!
//! The engine owns a fixed pool of worker tasks that share one FIFO queue.
//! A worker takes a task, waits for the rate limiter, performs the GET and
//! then runs the task's callback before taking the next one. Callbacks may
//! submit more tasks through the engine handle they receive.
//!
//! Termination uses a liveness counter: `fetch` increments it before the task
//! is queued and the worker decrements it only after the callback returned.
//! A callback that enqueues follow-up work therefore always raises the counter
//! before its own task releases it, so the counter can only reach zero once
//! the whole task graph has resolved.

use super::fetcher::{build_http_client, fetch_url};
use super::handler::ResponseHandler;
use super::limiter::RateLimiter;
use crate::config::{EngineConfig, UserAgentConfig};
use crate::output::{CrawlStatistics, CrawlStats};
use crate::state::TaskState;
use crate::CrawlError;
use futures::FutureExt;
use reqwest::Client;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// A unit of work: one URL and the callbacks to run when it resolves
struct FetchTask {
    id: u64,
    url: String,
    handler: Arc<dyn ResponseHandler>,
    state: TaskState,
}

impl FetchTask {
    fn advance(&mut self, next: TaskState) -> Result<(), CrawlError> {
        if !self.state.can_transition_to(next) {
            return Err(CrawlError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Outcome of a completed drain
#[derive(Debug, Clone)]
pub struct DrainReport {
    pub statistics: CrawlStatistics,
    /// True if the crawl was cancelled before the queue emptied naturally
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Requests cancellation of an engine without holding the engine itself
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!("Cancellation requested, queued tasks will be dropped");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct EngineInner {
    client: Client,
    limiter: RateLimiter,
    queue_tx: mpsc::UnboundedSender<FetchTask>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FetchTask>>,
    /// Tasks submitted but not yet resolved, including their callback
    live: AtomicUsize,
    idle: Notify,
    cancelled: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    abort_reason: Mutex<Option<String>>,
    stats: CrawlStats,
    progress_every: u64,
    next_task_id: AtomicU64,
    started: Instant,
}

/// Handle to a running fetch engine
///
/// Cloning is cheap; all clones drive the same queue and worker pool.
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

impl FetchEngine {
    /// Builds the HTTP client and starts the worker pool
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(engine: &EngineConfig, user_agent: &UserAgentConfig) -> Result<Self, CrawlError> {
        let client = build_http_client(engine, user_agent)?;
        Ok(Self::with_client(client, engine))
    }

    /// Starts the worker pool around an existing client
    pub fn with_client(client: Client, engine: &EngineConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let worker_count = engine.max_concurrent_fetches.max(1) as usize;

        let inner = Arc::new(EngineInner {
            client,
            limiter: RateLimiter::new(engine.minimum_wait()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            live: AtomicUsize::new(0),
            idle: Notify::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            shutdown,
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            abort_reason: Mutex::new(None),
            stats: CrawlStats::new(),
            progress_every: engine.progress_every.max(1),
            next_task_id: AtomicU64::new(1),
            started: Instant::now(),
        });

        let engine_handle = Self { inner };
        let handles: Vec<_> = (0..worker_count)
            .map(|worker_id| {
                let worker = engine_handle.clone();
                let shutdown = worker.inner.shutdown.subscribe();
                tokio::spawn(async move { worker.worker_loop(worker_id, shutdown).await })
            })
            .collect();
        lock(&engine_handle.inner.workers).extend(handles);

        tracing::debug!(
            "Fetch engine started with {} workers, minimum wait {:?}",
            worker_count,
            engine.minimum_wait()
        );
        engine_handle
    }

    /// Submits a URL for fetching
    ///
    /// Returns as soon as the task is queued. Fails only if the engine has
    /// been closed or cancelled.
    pub fn fetch(
        &self,
        url: impl Into<String>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), CrawlError> {
        let url = url.into();
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.cancelled.load(Ordering::SeqCst)
        {
            tracing::debug!("Rejected {}: engine no longer accepts work", url);
            return Err(CrawlError::EngineClosed { url });
        }

        // Count the task before it becomes visible to workers
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        self.inner.stats.record_enqueued();
        let task = FetchTask {
            id: self.inner.next_task_id.fetch_add(1, Ordering::Relaxed),
            url,
            handler,
            state: TaskState::Queued,
        };
        tracing::trace!("Queued task {} for {}", task.id, task.url);

        if let Err(mpsc::error::SendError(task)) = self.inner.queue_tx.send(task) {
            self.release_task();
            return Err(CrawlError::EngineClosed { url: task.url });
        }
        Ok(())
    }

    /// Waits until every submitted task (and every task its callbacks
    /// submitted) has resolved, then stops the workers
    ///
    /// Returns `Err(CrawlError::Aborted)` if a callback hit a fatal error.
    pub async fn wait_and_close(&self) -> Result<DrainReport, CrawlError> {
        self.wait_idle().await;

        self.inner.closed.store(true, Ordering::SeqCst);
        // No receivers left just means every worker is already gone
        let _ = self.inner.shutdown.send(true);

        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Fetch worker ended abnormally: {}", e);
            }
        }

        let report = DrainReport {
            statistics: self.inner.stats.snapshot(),
            cancelled: self.inner.cancelled.load(Ordering::SeqCst),
            elapsed: self.inner.started.elapsed(),
        };

        tracing::info!(
            "Fetch engine drained: {} succeeded, {} failed, {} cancelled in {:.1}s",
            report.statistics.succeeded,
            report.statistics.failed,
            report.statistics.cancelled,
            report.elapsed.as_secs_f64()
        );

        if let Some(reason) = lock(&self.inner.abort_reason).take() {
            return Err(CrawlError::Aborted(reason));
        }
        Ok(report)
    }

    /// Stops accepting new work and drops every queued task
    ///
    /// Tasks already dispatched run to completion. Call [`wait_and_close`]
    /// afterwards to wait for them.
    ///
    /// [`wait_and_close`]: FetchEngine::wait_and_close
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.inner.cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Live counters of this engine
    pub fn stats(&self) -> &CrawlStats {
        &self.inner.stats
    }

    /// Number of tasks submitted but not yet resolved
    pub fn pending(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release between check and await is not lost
            notified.as_mut().enable();
            if self.inner.live.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn worker_loop(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::trace!("Fetch worker {} started", worker_id);
        loop {
            let task = {
                let mut queue = self.inner.queue_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => None,
                    task = queue.recv() => task,
                }
            };

            match task {
                Some(task) => self.run_task(task).await,
                None => break,
            }
        }
        tracing::trace!("Fetch worker {} stopped", worker_id);
    }

    async fn run_task(&self, mut task: FetchTask) {
        if self.is_cancelled() {
            self.cancel_task(task);
            return;
        }

        self.inner.limiter.acquire().await;
        if self.is_cancelled() {
            self.cancel_task(task);
            return;
        }

        advance(&mut task, TaskState::Dispatched);
        tracing::debug!("Fetching {}", task.url);

        match fetch_url(&self.inner.client, &task.url).await {
            Ok(response) => {
                tracing::info!(
                    "Fetched {} ({} bytes, HTTP {})",
                    response.url,
                    response.body.len(),
                    response.status
                );
                self.inner.stats.record_bytes(response.body.len());

                let outcome = AssertUnwindSafe(task.handler.on_success(self, response))
                    .catch_unwind()
                    .await;
                advance(&mut task, TaskState::Succeeded);
                self.inner.stats.record_succeeded();
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.callback_error(&task.url, e),
                    Err(panic) => self.callback_panic(&task.url, "success", panic),
                }
            }
            Err(failure) => {
                tracing::debug!("Fetch failed for {}: {}", failure.url, failure.error);
                advance(&mut task, TaskState::Failed);
                self.inner.stats.record_failed();

                let outcome = AssertUnwindSafe(task.handler.on_error(self, failure))
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    self.callback_panic(&task.url, "error", panic);
                }
            }
        }

        self.finish_task();
    }

    fn cancel_task(&self, mut task: FetchTask) {
        advance(&mut task, TaskState::Cancelled);
        tracing::debug!("Dropped queued task {} for {}", task.id, task.url);
        self.inner.stats.record_cancelled();
        self.finish_task();
    }

    fn callback_error(&self, url: &str, error: CrawlError) {
        if let CrawlError::EngineClosed { .. } = error {
            // Follow-up submission raced a cancellation
            tracing::debug!("Callback for {} could not submit more work: {}", url, error);
            return;
        }

        self.inner.stats.record_callback_fault();
        if error.is_fatal() {
            tracing::error!("Fatal error in callback for {}: {}", url, error);
            self.abort(error.to_string());
        } else {
            tracing::error!("Callback for {} failed: {}", url, error);
        }
    }

    fn callback_panic(&self, url: &str, kind: &str, panic: Box<dyn Any + Send>) {
        self.inner.stats.record_callback_fault();
        tracing::error!(
            "The {} callback for {} panicked: {}",
            kind,
            url,
            panic_message(panic.as_ref())
        );
    }

    /// Records the first fatal error and cancels the rest of the crawl
    fn abort(&self, reason: String) {
        {
            let mut slot = lock(&self.inner.abort_reason);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel();
    }

    fn finish_task(&self) {
        let resolved = self.inner.stats.resolved();
        if resolved > 0 && resolved % self.inner.progress_every == 0 {
            let elapsed = self.inner.started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                resolved as f64 / elapsed
            } else {
                0.0
            };
            tracing::info!(
                "Progress: {} tasks resolved, {} pending, {:.2} tasks/sec",
                resolved,
                self.inner.live.load(Ordering::SeqCst).saturating_sub(1),
                rate
            );
        }
        self.release_task();
    }

    fn release_task(&self) {
        if self.inner.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

fn advance(task: &mut FetchTask, next: TaskState) {
    if let Err(e) = task.advance(next) {
        tracing::error!("Task {} for {}: {}", task.id, task.url, e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
