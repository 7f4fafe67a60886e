//! Bounded-concurrency download queue
//!
//! Accepts fetch requests, tracks per-task progress and status, supports
//! cancel and retry, and registers successful results into the content
//! catalog before the completion event fires. A fixed worker limit bounds
//! the number of tasks in `Processing`; the drain loop dispatches queued
//! tasks FIFO as slots free up, guarded against reentrant draining.

use crate::catalog::{ContentCatalog, NewEntry};
use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::download::fetch::{MediaSource, ProgressUpdate};
use crate::download::task::{
    DownloadEvent, DownloadEventKind, DownloadTask, MediaFormat, TaskStatus, TrackMeta,
};
use crate::storage::db::{self, DbPool};
use crate::storage::policy::{PathOptions, StoragePolicy};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Buffered lifecycle events; slow subscribers miss old ones rather than
/// blocking the queue.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct QueueState {
    /// All known tasks, including terminal ones kept for history/audit
    tasks: HashMap<String, DownloadTask>,
    /// Queued task ids in FIFO dispatch order
    pending: VecDeque<String>,
    /// Cancellation handles for tasks currently processing
    cancel_tokens: HashMap<String, CancellationToken>,
    /// Number of tasks currently in `Processing`
    active: usize,
    /// Reentrancy guard: exactly one drain loop runs at a time
    draining: bool,
}

/// Worker pool with a configurable concurrency cap.
pub struct DownloadQueue {
    state: Mutex<QueueState>,
    limit: usize,
    events: broadcast::Sender<DownloadEvent>,
    catalog: Arc<ContentCatalog>,
    policy: Arc<dyn StoragePolicy>,
    source: Arc<dyn MediaSource>,
    pool: Arc<DbPool>,
}

impl DownloadQueue {
    /// Creates a queue with the default concurrency limit.
    pub fn new(
        catalog: Arc<ContentCatalog>,
        policy: Arc<dyn StoragePolicy>,
        source: Arc<dyn MediaSource>,
        pool: Arc<DbPool>,
    ) -> Self {
        Self::with_concurrency(
            catalog,
            policy,
            source,
            pool,
            config::queue::MAX_CONCURRENT_DOWNLOADS,
        )
    }

    /// Creates a queue with an explicit concurrency limit.
    pub fn with_concurrency(
        catalog: Arc<ContentCatalog>,
        policy: Arc<dyn StoragePolicy>,
        source: Arc<dyn MediaSource>,
        pool: Arc<DbPool>,
        limit: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState {
                tasks: HashMap::new(),
                pending: VecDeque::new(),
                cancel_tokens: HashMap::new(),
                active: 0,
                draining: false,
            }),
            limit: limit.max(1),
            events,
            catalog,
            policy,
            source,
            pool,
        }
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Adds a fetch request for a content id and format.
    ///
    /// Returns the new task id, or `Capacity` when the storage medium or
    /// the queue itself cannot take more work.
    pub async fn enqueue(
        self: &Arc<Self>,
        content_id: &str,
        format: MediaFormat,
    ) -> AppResult<String> {
        self.enqueue_with_metadata(content_id, format, TrackMeta::default())
            .await
    }

    /// Adds a fetch request carrying display metadata for the content.
    pub async fn enqueue_with_metadata(
        self: &Arc<Self>,
        content_id: &str,
        format: MediaFormat,
        meta: TrackMeta,
    ) -> AppResult<String> {
        let stats = self.policy.stats()?;
        if !stats.has_enough_space() {
            return Err(AppError::Capacity(format!(
                "insufficient storage: {} bytes available",
                stats.available_space
            )));
        }

        let task = DownloadTask::new(content_id.to_string(), format, meta);
        let task_id = task.id.clone();

        {
            let mut state = self.state.lock().await;
            if state.tasks.len() >= config::queue::MAX_QUEUE_SIZE {
                return Err(AppError::Capacity(format!(
                    "queue is full ({} tasks)",
                    state.tasks.len()
                )));
            }
            state.pending.push_back(task_id.clone());
            state.tasks.insert(task_id.clone(), task.clone());
        }

        log::info!("Enqueued task {} for content {} ({})", task_id, content_id, format);
        self.record_history(&task);
        self.emit(DownloadEvent::from_task(&task, DownloadEventKind::Added));
        self.spawn_drain();
        Ok(task_id)
    }

    /// Current snapshot of a task, if known.
    pub async fn status(&self, task_id: &str) -> Option<DownloadTask> {
        let state = self.state.lock().await;
        state.tasks.get(task_id).cloned()
    }

    /// All tasks currently in the given status, oldest first.
    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<DownloadTask> {
        let state = self.state.lock().await;
        let mut tasks: Vec<DownloadTask> = state
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// 1-based position of a queued task in dispatch order.
    pub async fn position(&self, task_id: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .position(|id| id == task_id)
            .map(|pos| pos + 1)
    }

    /// Drops terminal tasks from the in-memory history view.
    ///
    /// Returns the number of tasks cleared.
    pub async fn clear_finished(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, t| !t.status.is_terminal());
        before - state.tasks.len()
    }

    /// Cancels a task.
    ///
    /// A queued task leaves the pending set immediately; a processing task
    /// is told to stop and transitions to `Failed` with a cancellation
    /// error once its transfer unwinds. Returns false for unknown or
    /// already-terminal tasks.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let cancelled_task = {
            let mut state = self.state.lock().await;
            let Some(status) = state.tasks.get(task_id).map(|t| t.status) else {
                return false;
            };
            match status {
                TaskStatus::Queued => {
                    state.pending.retain(|id| id != task_id);
                    match state.tasks.get_mut(task_id) {
                        Some(task) => {
                            task.status = TaskStatus::Failed;
                            task.error = Some(AppError::Cancelled.to_string());
                            task.completed_at = Some(Utc::now());
                            Some(task.clone())
                        }
                        None => return false,
                    }
                }
                TaskStatus::Processing => {
                    if let Some(token) = state.cancel_tokens.get(task_id) {
                        token.cancel();
                    }
                    None
                }
                _ => return false,
            }
        };

        if let Some(task) = cancelled_task {
            log::info!("Cancelled queued task {}", task.id);
            self.record_history(&task);
            self.emit(DownloadEvent::from_task(&task, DownloadEventKind::Cancelled));
        } else {
            log::info!("Cancellation requested for processing task {}", task_id);
        }
        true
    }

    /// Re-queues a failed task at the tail of the pending set.
    ///
    /// Progress resets to 0 and the retry counter increments. The queue
    /// enforces no retry cap; that policy belongs to the caller.
    pub async fn retry(self: &Arc<Self>, task_id: &str) -> bool {
        let task = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Failed {
                return false;
            }
            task.status = TaskStatus::Queued;
            task.progress = 0;
            task.error = None;
            task.file_path = None;
            task.size_bytes = None;
            task.bytes_per_sec = None;
            task.eta_secs = None;
            task.completed_at = None;
            task.retries += 1;
            let task = task.clone();
            state.pending.push_back(task_id.to_string());
            task
        };

        log::info!("Retrying task {} (attempt {})", task_id, task.retries + 1);
        self.record_history(&task);
        self.emit(DownloadEvent::from_task(&task, DownloadEventKind::Added));
        self.spawn_drain();
        true
    }

    fn spawn_drain(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.drain().await });
    }

    /// Dispatch cycle: pulls queued tasks into processing while capacity
    /// allows. The `draining` flag keeps concurrent calls from
    /// double-dispatching the same task.
    async fn drain(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            enum Step {
                Run(DownloadTask, CancellationToken),
                Skip,
                Done,
            }

            let step = {
                let mut state = self.state.lock().await;
                // Reborrow through the guard once so the task entry and the
                // token/active fields can be borrowed disjointly below
                let state = &mut *state;
                if state.active >= self.limit {
                    state.draining = false;
                    Step::Done
                } else if let Some(task_id) = state.pending.pop_front() {
                    match state.tasks.get_mut(&task_id) {
                        Some(task) if task.status == TaskStatus::Queued => {
                            task.status = TaskStatus::Processing;
                            task.progress = 0;
                            let token = CancellationToken::new();
                            state.cancel_tokens.insert(task_id.clone(), token.clone());
                            state.active += 1;
                            Step::Run(task.clone(), token)
                        }
                        // Cancelled or cleared while waiting; skip the stale id
                        _ => Step::Skip,
                    }
                } else {
                    state.draining = false;
                    Step::Done
                }
            };

            match step {
                Step::Done => break,
                Step::Skip => continue,
                Step::Run(task, token) => {
                    self.record_history(&task);
                    self.emit(DownloadEvent::from_task(&task, DownloadEventKind::Started));
                    let queue = Arc::clone(&self);
                    tokio::spawn(async move { queue.run_task(task, token).await });
                }
            }
        }
    }

    /// Executes one dispatched task to a terminal state.
    async fn run_task(self: Arc<Self>, task: DownloadTask, token: CancellationToken) {
        let task_id = task.id.clone();
        let result = self.transfer(&task, &token).await;

        match result {
            Ok((path, written)) => self.finish_success(&task_id, path, written).await,
            Err(e) => self.finish_failure(&task_id, e).await,
        }

        {
            let mut state = self.state.lock().await;
            state.cancel_tokens.remove(&task_id);
            state.active = state.active.saturating_sub(1);
        }
        self.spawn_drain();
    }

    /// Path validation plus the actual fetch. Errors here are captured on
    /// the task, never propagated to the queue's caller.
    async fn transfer(
        self: &Arc<Self>,
        task: &DownloadTask,
        token: &CancellationToken,
    ) -> AppResult<(String, u64)> {
        // Mandatory safety check, once at dispatch time
        let path = self
            .policy
            .generate_path(&task.content_id, task.format, &PathOptions::default())?;
        if !self.policy.validate_path(&path) {
            return Err(AppError::Validation(format!(
                "storage policy rejected path {}",
                path.display()
            )));
        }

        let handle = self
            .source
            .stream_handle(&task.content_id, None)
            .await?;

        // Progress samples cross from the sync callback to an async
        // forwarder that updates the task and fans out events.
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let forwarder = {
            let queue = Arc::clone(self);
            let task_id = task.id.clone();
            tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    queue.apply_progress(&task_id, update).await;
                }
            })
        };

        let on_progress = move |update: ProgressUpdate| {
            let _ = tx.send(update);
        };
        let result = self.source.fetch(&handle, &path, token, &on_progress).await;
        // Dropping the sender ends the forwarder; drain its last samples
        // before inspecting the result so progress never trails the
        // terminal event.
        drop(on_progress);
        let _ = forwarder.await;
        let written = result?;

        // A cancel that lands after the last byte still wins: a cancelled
        // task must never surface as completed.
        if token.is_cancelled() {
            self.policy.delete(&path);
            return Err(AppError::Cancelled);
        }

        Ok((path.to_string_lossy().to_string(), written))
    }

    /// Applies a genuine transfer sample to the task, monotonic within the
    /// run, and fans it out as a progress event.
    async fn apply_progress(&self, task_id: &str, update: ProgressUpdate) {
        let event = {
            let mut state = self.state.lock().await;
            match state.tasks.get_mut(task_id) {
                Some(task) if task.status == TaskStatus::Processing => {
                    task.progress = task.progress.max(update.percent.min(100));
                    task.bytes_per_sec = Some(update.bytes_per_sec);
                    task.eta_secs = update.eta_secs;
                    Some(DownloadEvent::from_task(task, DownloadEventKind::Progress))
                }
                _ => None,
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn finish_success(&self, task_id: &str, path: String, written: u64) {
        // Register before the completed event so listeners can resolve the
        // new local copy immediately.
        let (content_id, format, meta) = {
            let state = self.state.lock().await;
            match state.tasks.get(task_id) {
                Some(t) => (t.content_id.clone(), t.format, t.meta.clone()),
                None => return,
            }
        };
        let registration = self
            .catalog
            .register(NewEntry {
                content_id,
                file_path: path.clone(),
                format,
                size_bytes: written,
                meta,
            })
            .await;
        let entry = match registration {
            Ok(entry) => entry,
            Err(e) => {
                self.finish_failure(task_id, AppError::Transport(format!(
                    "downloaded but failed to register: {}",
                    e
                )))
                .await;
                return;
            }
        };

        let task = {
            let mut state = self.state.lock().await;
            // A cancel acknowledged while registration ran still wins; the
            // same lock serializes this check against cancel()
            let cancelled = state
                .cancel_tokens
                .get(task_id)
                .map_or(false, |t| t.is_cancelled());
            if cancelled {
                None
            } else {
                match state.tasks.get_mut(task_id) {
                    Some(task) => {
                        task.status = TaskStatus::Completed;
                        task.progress = 100;
                        task.file_path = Some(path);
                        task.size_bytes = Some(written);
                        task.completed_at = Some(Utc::now());
                        Some(task.clone())
                    }
                    None => return,
                }
            }
        };

        match task {
            Some(task) => {
                log::info!("Task {} completed ({} bytes)", task_id, written);
                self.record_history(&task);
                self.emit(DownloadEvent::from_task(&task, DownloadEventKind::Completed));
            }
            None => {
                // Discard the just-registered copy; remove deletes the file
                if let Err(e) = self.catalog.remove(&entry.id).await {
                    log::warn!("Failed to discard cancelled download {}: {}", entry.id, e);
                }
                self.finish_failure(task_id, AppError::Cancelled).await;
            }
        }
    }

    async fn finish_failure(&self, task_id: &str, error: AppError) {
        let kind = if error.is_cancelled() {
            DownloadEventKind::Cancelled
        } else {
            DownloadEventKind::Failed
        };

        let task = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.completed_at = Some(Utc::now());
            task.clone()
        };

        log::warn!("Task {} failed: {}", task_id, error);
        self.record_history(&task);
        self.emit(DownloadEvent::from_task(&task, kind));
    }

    /// Appends the task's current state to the download-history log.
    ///
    /// History is an audit trail; a write failure is logged, never fatal.
    fn record_history(&self, task: &DownloadTask) {
        match db::get_connection(&self.pool) {
            Ok(conn) => {
                if let Err(e) = db::append_history(&conn, task) {
                    log::warn!("Failed to record history for task {}: {}", task.id, e);
                }
            }
            Err(e) => log::warn!("Failed to get DB connection for history: {}", e),
        }
    }

    fn emit(&self, event: DownloadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
