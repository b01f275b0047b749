//! Priority- and network-aware dispatch of persisted transfer tasks.
//!
//! # Overview
//!
//! The scheduler is a single-writer actor: one spawned loop owns the pending
//! queue and the active-transfer map, and every mutation flows through it as
//! a command, a completion report, a connectivity change, or a periodic
//! tick. Callers interact through a cloneable [`SchedulerHandle`] whose
//! methods send commands and await oneshot replies, so there is no shared
//! mutable state to lock.
//!
//! Dispatch policy: whenever the loop wakes it runs one dispatch pass,
//! starting queue-head tasks until the concurrency bound is reached. A head
//! task gated by its schedule time or retry backoff is rotated to the tail;
//! a head task whose network requirement is unmet halts the whole pass, so
//! constrained connectivity never lets lower-priority tasks overtake it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use downlink::connectivity::ConnectivityMonitor;
//! use downlink::engine::{DownloadScheduler, NullSink};
//! use downlink::limit::{BandwidthManager, RateLimiter};
//! use downlink::{Database, EngineConfig, NewTask, SqliteTaskStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let handle = DownloadScheduler::start(
//!     Arc::new(SqliteTaskStore::new(&db)),
//!     Arc::new(RateLimiter::new(4, Duration::from_millis(100))),
//!     Arc::new(BandwidthManager::new(1024 * 1024)),
//!     ConnectivityMonitor::default(),
//!     Arc::new(NullSink),
//!     EngineConfig::default(),
//! )
//! .await?;
//!
//! let task = handle
//!     .enqueue(NewTask::new("https://example.com/data.bin", "/tmp/data.bin", "data.bin"))
//!     .await?;
//! println!("enqueued task {}", task.id);
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::{EngineError, TransferError, parse_retry_after};
use super::executor::{TransferExecutor, TransferOutcome};
use super::progress::ProgressSink;
use super::queue::{Readiness, backoff_gate_open, schedule_gate_open, sort_queue};
use super::retry::BackoffPolicy;
use super::transport::HttpTransport;
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivitySnapshot};
use crate::limit::{BandwidthManager, RateLimiter};
use crate::task::{NetworkRequirement, NewTask, Task, TaskStatus, TaskStore};

/// How long shutdown waits for cancelled transfers to wind down.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;
type Completion = (i64, Result<TransferOutcome, TransferError>);

/// Control operations accepted by the scheduler loop.
enum Command {
    Enqueue(Box<NewTask>, Reply<Task>),
    Pause(i64, Reply<()>),
    Resume(i64, Reply<()>),
    Cancel {
        id: i64,
        delete_partial: bool,
        reply: Reply<()>,
    },
    Retry(i64, Reply<()>),
    Remove(i64, Reply<()>),
    Get(i64, Reply<Task>),
    ListByStatus(TaskStatus, Reply<Vec<Task>>),
    Shutdown(oneshot::Sender<()>),
}

/// Why an active transfer's cancellation token was fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Not stopped by the scheduler; a spontaneous cancellation (for
    /// example a rate limiter reset) re-queues the task.
    None,
    /// The caller paused it; it waits for an explicit resume.
    UserPause,
    /// Its network requirement became unsatisfied; it returns to the queue
    /// head and auto-resumes when connectivity allows.
    NetworkPause,
    /// The caller cancelled it.
    Cancel { delete_partial: bool },
    /// The scheduler is shutting down; it is re-queued for the next run.
    Shutdown,
}

/// Book-keeping for one dispatched transfer.
struct ActiveTransfer {
    token: CancellationToken,
    network: NetworkRequirement,
    stop: StopReason,
}

/// Caller-facing control surface of a running scheduler.
///
/// Cheap to clone; all clones talk to the same scheduler loop. Every method
/// returns [`EngineError::SchedulerStopped`] once the loop has exited.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| EngineError::SchedulerStopped)?;
        rx.await.map_err(|_| EngineError::SchedulerStopped)?
    }

    /// Persists and queues a new transfer, returning the stored task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidUrl`] for a URL that does not parse as
    /// http or https, or a store error if persistence fails.
    pub async fn enqueue(&self, new_task: NewTask) -> Result<Task, EngineError> {
        self.request(|reply| Command::Enqueue(Box::new(new_task), reply))
            .await
    }

    /// Pauses a queued or downloading task. A downloading task stops at its
    /// next chunk boundary, keeping the bytes already on disk.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTaskState`] if the task is neither
    /// queued nor downloading.
    pub async fn pause(&self, id: i64) -> Result<(), EngineError> {
        self.request(|reply| Command::Pause(id, reply)).await
    }

    /// Returns a paused task to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTaskState`] if the task is not paused.
    pub async fn resume(&self, id: i64) -> Result<(), EngineError> {
        self.request(|reply| Command::Resume(id, reply)).await
    }

    /// Cancels a pending or active task, optionally deleting its partial
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTaskState`] if the task is already in
    /// a terminal state.
    pub async fn cancel(&self, id: i64, delete_partial: bool) -> Result<(), EngineError> {
        self.request(|reply| Command::Cancel {
            id,
            delete_partial,
            reply,
        })
        .await
    }

    /// Manually retries a task in terminal `error` state: resets its retry
    /// budget and re-queues it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTaskState`] if the task is not in
    /// `error` state.
    pub async fn retry(&self, id: i64) -> Result<(), EngineError> {
        self.request(|reply| Command::Retry(id, reply)).await
    }

    /// Deletes a non-active task's record and any partial file on disk.
    /// Completed downloads keep their file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTaskState`] if the task is currently
    /// downloading.
    pub async fn remove(&self, id: i64) -> Result<(), EngineError> {
        self.request(|reply| Command::Remove(id, reply)).await
    }

    /// Fetches a task's current persisted state.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task does not exist.
    pub async fn task(&self, id: i64) -> Result<Task, EngineError> {
        self.request(|reply| Command::Get(id, reply)).await
    }

    /// Lists all tasks with the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, EngineError> {
        self.request(|reply| Command::ListByStatus(status, reply))
            .await
    }

    /// Stops dispatching, cancels active transfers, waits for them to wind
    /// down, and exits the scheduler loop. Interrupted transfers are
    /// re-queued in the store so the next scheduler run resumes them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SchedulerStopped`] if the loop already
    /// exited.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(tx))
            .map_err(|_| EngineError::SchedulerStopped)?;
        rx.await.map_err(|_| EngineError::SchedulerStopped)
    }
}

/// The scheduler actor. Constructed and spawned by [`start`](Self::start);
/// never touched directly afterwards.
pub struct DownloadScheduler {
    store: Arc<dyn TaskStore>,
    executor: Arc<TransferExecutor>,
    sink: Arc<dyn ProgressSink>,
    connectivity: ConnectivityMonitor,
    config: EngineConfig,
    backoff: BackoffPolicy,
    /// Pending tasks in dispatch order. Holds `queued`, backoff-gated
    /// `error`, and network-paused tasks; user-paused tasks live only in
    /// the store until resumed.
    queue: VecDeque<Task>,
    active: HashMap<i64, ActiveTransfer>,
    /// Tasks paused by the scheduler for connectivity, eligible for
    /// automatic resume.
    network_paused: HashSet<i64>,
    /// Server-supplied earliest-next-attempt times (Retry-After). An entry
    /// overrides the exponential backoff gate for that task.
    retry_gate: HashMap<i64, DateTime<Utc>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
}

impl DownloadScheduler {
    /// Recovers persisted state, spawns the scheduler loop, and returns its
    /// control handle.
    ///
    /// Any task left `downloading` by a previous process is reset to
    /// `queued` (keeping its byte checkpoint) and reloaded, together with
    /// `queued` and retry-eligible `error` tasks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] or
    /// [`EngineError::InvalidConfig`] for a bad configuration, or a store
    /// error if recovery fails.
    #[instrument(skip_all, fields(max_concurrent = config.max_concurrent_downloads))]
    pub async fn start(
        store: Arc<dyn TaskStore>,
        limiter: Arc<RateLimiter>,
        bandwidth: Arc<BandwidthManager>,
        connectivity: ConnectivityMonitor,
        sink: Arc<dyn ProgressSink>,
        config: EngineConfig,
    ) -> Result<SchedulerHandle, EngineError> {
        config.validate()?;

        let recovered = store.reset_downloading().await?;
        if recovered > 0 {
            info!(recovered, "re-queued transfers interrupted by the previous run");
        }

        let mut queue: VecDeque<Task> =
            store.list_by_status(TaskStatus::Queued).await?.into();
        let budget = i64::from(config.max_retry_attempts);
        for task in store.list_by_status(TaskStatus::Error).await? {
            if !task.is_terminal(budget) {
                queue.push_back(task);
            }
        }
        sort_queue(&mut queue);

        let transport = Arc::new(HttpTransport::with_timeouts(
            config.connect_timeout,
            config.read_timeout,
        ));
        let executor = Arc::new(TransferExecutor::new(
            transport,
            limiter,
            bandwidth,
            Arc::clone(&store),
            Arc::clone(&sink),
            &config,
        ));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let backoff = BackoffPolicy::new(config.backoff_base, config.backoff_cap);

        let scheduler = Self {
            store,
            executor,
            sink,
            connectivity,
            config,
            backoff,
            queue,
            active: HashMap::new(),
            network_paused: HashSet::new(),
            retry_gate: HashMap::new(),
            completions_tx,
        };
        tokio::spawn(scheduler.run(commands_rx, completions_rx));

        Ok(SchedulerHandle {
            commands: commands_tx,
        })
    }

    /// The actor loop: wait for a command, completion, connectivity change,
    /// or tick, then run one dispatch pass. Redundant wakeups coalesce into
    /// a single pass because dispatch is idempotent once capacity is full.
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut connectivity_rx = self.connectivity.subscribe();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_command = commands.recv() => match maybe_command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown(&mut completions).await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    // Every handle dropped; stop cleanly.
                    None => {
                        self.shutdown(&mut completions).await;
                        return;
                    }
                },
                Some((id, result)) = completions.recv() => {
                    self.on_completion(id, result).await;
                }
                changed = connectivity_rx.changed() => {
                    // The sender cannot drop while the scheduler holds the
                    // monitor, so changed() only fails at teardown.
                    if changed.is_err() {
                        return;
                    }
                    self.on_connectivity_change().await;
                }
                _ = ticker.tick() => {}
            }
            self.dispatch().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue(new_task, reply) => {
                let _ = reply.send(self.enqueue(*new_task).await);
            }
            Command::Pause(id, reply) => {
                let _ = reply.send(self.pause(id).await);
            }
            Command::Resume(id, reply) => {
                let _ = reply.send(self.resume(id).await);
            }
            Command::Cancel {
                id,
                delete_partial,
                reply,
            } => {
                let _ = reply.send(self.cancel(id, delete_partial).await);
            }
            Command::Retry(id, reply) => {
                let _ = reply.send(self.retry(id).await);
            }
            Command::Remove(id, reply) => {
                let _ = reply.send(self.remove(id).await);
            }
            Command::Get(id, reply) => {
                let _ = reply.send(self.store.get(id).await.map_err(EngineError::from));
            }
            Command::ListByStatus(status, reply) => {
                let _ = reply.send(
                    self.store
                        .list_by_status(status)
                        .await
                        .map_err(EngineError::from),
                );
            }
            // Handled in the loop so it can consume the receivers.
            Command::Shutdown(_) => {}
        }
    }

    // ==================== Dispatch ====================

    /// One dispatch pass: start queue-head tasks until capacity or queue
    /// exhaustion, rotating gated tasks to the tail at most once each.
    async fn dispatch(&mut self) {
        let now = Utc::now();
        let snapshot = self.connectivity.current();
        let mut budget = self.queue.len();

        while self.active.len() < self.config.max_concurrent_downloads && budget > 0 {
            budget -= 1;
            let Some(head) = self.queue.front() else {
                break;
            };

            match self.readiness(head, &snapshot, now) {
                Readiness::NotReady => {
                    if let Some(task) = self.queue.pop_front() {
                        self.queue.push_back(task);
                    }
                }
                // An unmet requirement at the head halts the whole pass;
                // less-restrictive tasks behind it must not overtake.
                Readiness::NetworkUnmet => break,
                Readiness::Ready => {
                    let Some(task) = self.queue.pop_front() else {
                        break;
                    };
                    self.launch(task, now).await;
                }
            }
        }
    }

    fn readiness(
        &self,
        task: &Task,
        snapshot: &ConnectivitySnapshot,
        now: DateTime<Utc>,
    ) -> Readiness {
        // Only network-paused tasks sit in the queue as `paused`; they hold
        // the head until connectivity satisfies them again.
        if task.status() == TaskStatus::Paused {
            return if snapshot.satisfies(task.network()) {
                Readiness::Ready
            } else {
                Readiness::NetworkUnmet
            };
        }

        if !schedule_gate_open(task, now) {
            return Readiness::NotReady;
        }
        let backoff_gated = match self.retry_gate.get(&task.id) {
            // A server-supplied delay replaces the computed backoff.
            Some(&until) => now < until,
            None => !backoff_gate_open(task, &self.backoff, now),
        };
        if backoff_gated {
            return Readiness::NotReady;
        }

        if snapshot.satisfies(task.network()) {
            Readiness::Ready
        } else {
            Readiness::NetworkUnmet
        }
    }

    /// Marks a task `downloading`, persists the transition, and spawns its
    /// transfer.
    async fn launch(&mut self, mut task: Task, now: DateTime<Utc>) {
        self.network_paused.remove(&task.id);
        self.retry_gate.remove(&task.id);
        task.set_status(TaskStatus::Downloading);
        task.started_at = Some(now);

        if let Err(error) = self.store.upsert(&task).await {
            warn!(task_id = task.id, %error, "failed to persist dispatch; re-queueing");
            task.set_status(TaskStatus::Queued);
            self.queue.push_back(task);
            return;
        }

        debug!(task_id = task.id, priority = %task.priority(), "dispatching transfer");
        let token = CancellationToken::new();
        self.active.insert(
            task.id,
            ActiveTransfer {
                token: token.clone(),
                network: task.network(),
                stop: StopReason::None,
            },
        );

        let executor = Arc::clone(&self.executor);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = executor.run(&task, &token).await;
            let _ = completions.send((task.id, result));
        });
    }

    // ==================== Completion handling ====================

    async fn on_completion(&mut self, id: i64, result: Result<TransferOutcome, TransferError>) {
        let Some(active) = self.active.remove(&id) else {
            return;
        };
        let task = match self.store.get(id).await {
            Ok(task) => task,
            Err(error) => {
                warn!(task_id = id, %error, "completed transfer has no stored task");
                return;
            }
        };

        match result {
            Ok(outcome) => self.on_success(task, &outcome).await,
            Err(error) if error.is_cancelled() => self.on_stopped(task, active.stop).await,
            Err(error) => self.on_failure(task, &error).await,
        }
    }

    async fn on_success(&mut self, mut task: Task, outcome: &TransferOutcome) {
        task.set_status(TaskStatus::Completed);
        task.completed_at = Some(Utc::now());
        task.partial_bytes = i64::try_from(outcome.bytes_downloaded).unwrap_or(i64::MAX);
        task.total_bytes = outcome
            .total_bytes
            .map(|t| i64::try_from(t).unwrap_or(i64::MAX));
        task.validator.clone_from(&outcome.validator);
        task.last_error = None;

        if let Err(error) = self.store.upsert(&task).await {
            warn!(task_id = task.id, %error, "failed to persist completion");
        }
        self.retry_gate.remove(&task.id);
        info!(task_id = task.id, bytes = outcome.bytes_downloaded, "task completed");
        self.sink.on_complete(task.id);
    }

    /// Applies the state the scheduler intended when it fired the task's
    /// cancellation token.
    async fn on_stopped(&mut self, mut task: Task, stop: StopReason) {
        match stop {
            StopReason::UserPause => {
                task.set_status(TaskStatus::Paused);
                self.persist(&task).await;
            }
            StopReason::NetworkPause => {
                // Connectivity can return before the cancelled transfer
                // reports back; re-queue directly in that case.
                if self.connectivity.current().satisfies(task.network()) {
                    task.set_status(TaskStatus::Queued);
                } else {
                    task.set_status(TaskStatus::Paused);
                    self.network_paused.insert(task.id);
                }
                self.persist(&task).await;
                // Queue head, so it is reconsidered first when
                // connectivity returns.
                self.queue.push_front(task);
                sort_queue(&mut self.queue);
            }
            StopReason::Cancel { delete_partial } => {
                task.set_status(TaskStatus::Cancelled);
                self.persist(&task).await;
                if delete_partial {
                    self.discard_file(&task).await;
                }
                info!(task_id = task.id, "task cancelled");
            }
            // Shutdown re-queues for the next run; a spontaneous
            // cancellation (limiter reset) re-queues for this one.
            StopReason::Shutdown | StopReason::None => {
                task.set_status(TaskStatus::Queued);
                self.persist(&task).await;
                if stop == StopReason::None {
                    self.queue.push_back(task);
                    sort_queue(&mut self.queue);
                }
            }
        }
    }

    async fn on_failure(&mut self, mut task: Task, error: &TransferError) {
        task.retry_count += 1;
        task.last_error = Some(error.to_string());
        task.set_status(TaskStatus::Error);
        self.persist(&task).await;

        if let Some(delay) = error.retry_after().and_then(parse_retry_after) {
            if let Ok(delay) = chrono::Duration::from_std(delay) {
                self.retry_gate.insert(task.id, Utc::now() + delay);
            }
        }

        let budget = i64::from(self.config.max_retry_attempts);
        if error.is_retryable() && task.retry_count <= budget {
            debug!(
                task_id = task.id,
                retry_count = task.retry_count,
                %error,
                "transfer failed; queued for retry"
            );
            self.queue.push_back(task);
            sort_queue(&mut self.queue);
            return;
        }

        warn!(task_id = task.id, retry_count = task.retry_count, %error, "task failed terminally");
        // A size mismatch means the bytes on disk cannot be trusted; the
        // next manual retry must restart from zero.
        if matches!(error, TransferError::Integrity { .. }) {
            self.discard_file(&task).await;
        }
        let message = task.last_error.clone().unwrap_or_default();
        self.sink.on_error(task.id, &message);
    }

    // ==================== Control operations ====================

    async fn enqueue(&mut self, new_task: NewTask) -> Result<Task, EngineError> {
        let parsed = Url::parse(&new_task.url).map_err(|_| EngineError::InvalidUrl {
            url: new_task.url.clone(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::InvalidUrl { url: new_task.url });
        }

        let task = self.store.insert(&new_task).await?;
        info!(task_id = task.id, url = %task.url, priority = %task.priority(), "task enqueued");
        self.queue.push_back(task.clone());
        sort_queue(&mut self.queue);
        Ok(task)
    }

    async fn pause(&mut self, id: i64) -> Result<(), EngineError> {
        if let Some(active) = self.active.get_mut(&id) {
            if active.stop == StopReason::None {
                active.stop = StopReason::UserPause;
                active.token.cancel();
            }
            return Ok(());
        }

        if let Some(position) = self.queue_position(id) {
            if let Some(mut task) = self.queue.remove(position) {
                // A network-paused task is already persisted as paused;
                // dropping it from the queue turns it into a user pause.
                self.network_paused.remove(&id);
                if task.status() != TaskStatus::Paused {
                    task.set_status(TaskStatus::Paused);
                    self.store.upsert(&task).await?;
                }
            }
            return Ok(());
        }

        let task = self.store.get(id).await?;
        Err(EngineError::InvalidTaskState {
            id,
            status: task.status(),
            required: "queued or downloading",
        })
    }

    async fn resume(&mut self, id: i64) -> Result<(), EngineError> {
        let mut task = self.store.get(id).await?;
        if task.status() != TaskStatus::Paused {
            return Err(EngineError::InvalidTaskState {
                id,
                status: task.status(),
                required: "paused",
            });
        }

        task.set_status(TaskStatus::Queued);
        self.store.upsert(&task).await?;
        self.network_paused.remove(&id);
        if let Some(position) = self.queue_position(id) {
            self.queue.remove(position);
        }
        self.queue.push_back(task);
        sort_queue(&mut self.queue);
        Ok(())
    }

    async fn cancel(&mut self, id: i64, delete_partial: bool) -> Result<(), EngineError> {
        if let Some(active) = self.active.get_mut(&id) {
            active.stop = StopReason::Cancel { delete_partial };
            active.token.cancel();
            return Ok(());
        }

        let mut task = self.store.get(id).await?;
        match task.status() {
            TaskStatus::Queued | TaskStatus::Paused | TaskStatus::Error => {
                if let Some(position) = self.queue_position(id) {
                    self.queue.remove(position);
                }
                self.network_paused.remove(&id);
                self.retry_gate.remove(&id);
                task.set_status(TaskStatus::Cancelled);
                self.store.upsert(&task).await?;
                if delete_partial {
                    self.discard_file(&task).await;
                }
                Ok(())
            }
            status @ (TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Downloading) => {
                Err(EngineError::InvalidTaskState {
                    id,
                    status,
                    required: "pending or active",
                })
            }
        }
    }

    async fn retry(&mut self, id: i64) -> Result<(), EngineError> {
        if self.active.contains_key(&id) {
            return Err(EngineError::InvalidTaskState {
                id,
                status: TaskStatus::Downloading,
                required: "error",
            });
        }

        let mut task = self.store.get(id).await?;
        if task.status() != TaskStatus::Error {
            return Err(EngineError::InvalidTaskState {
                id,
                status: task.status(),
                required: "error",
            });
        }

        task.retry_count = 0;
        task.set_status(TaskStatus::Queued);
        self.store.upsert(&task).await?;
        self.retry_gate.remove(&id);
        if let Some(position) = self.queue_position(id) {
            self.queue.remove(position);
        }
        info!(task_id = id, "manual retry requested");
        self.queue.push_back(task);
        sort_queue(&mut self.queue);
        Ok(())
    }

    async fn remove(&mut self, id: i64) -> Result<(), EngineError> {
        if self.active.contains_key(&id) {
            return Err(EngineError::InvalidTaskState {
                id,
                status: TaskStatus::Downloading,
                required: "non-active",
            });
        }

        let task = self.store.get(id).await?;
        if let Some(position) = self.queue_position(id) {
            self.queue.remove(position);
        }
        self.network_paused.remove(&id);
        self.retry_gate.remove(&id);
        // Partial bytes are useless without their task record; a finished
        // download's file belongs to the caller.
        if task.status() != TaskStatus::Completed {
            self.remove_file(task.destination()).await;
        }
        self.store.delete(id).await?;
        Ok(())
    }

    // ==================== Connectivity ====================

    /// Pauses every active transfer whose requirement the new snapshot no
    /// longer satisfies, and returns every network-paused queue entry the
    /// snapshot satisfies again to plain `queued`. The dispatch pass that
    /// follows launches the restored tasks as capacity allows.
    async fn on_connectivity_change(&mut self) {
        let snapshot = self.connectivity.current();
        for (id, active) in &mut self.active {
            if active.stop == StopReason::None && !snapshot.satisfies(active.network) {
                info!(task_id = id, "connectivity lost; pausing transfer");
                active.stop = StopReason::NetworkPause;
                active.token.cancel();
            }
        }

        let mut restored = Vec::new();
        for task in &mut self.queue {
            if self.network_paused.contains(&task.id) && snapshot.satisfies(task.network()) {
                task.set_status(TaskStatus::Queued);
                restored.push(task.clone());
            }
        }
        if !restored.is_empty() {
            sort_queue(&mut self.queue);
        }
        for task in restored {
            self.network_paused.remove(&task.id);
            info!(task_id = task.id, "connectivity restored; task re-queued");
            self.persist(&task).await;
        }
    }

    // ==================== Shutdown ====================

    async fn shutdown(&mut self, completions: &mut mpsc::UnboundedReceiver<Completion>) {
        info!(active = self.active.len(), "scheduler shutting down");
        for active in self.active.values_mut() {
            active.stop = StopReason::Shutdown;
            active.token.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while !self.active.is_empty() {
            match tokio::time::timeout_at(deadline, completions.recv()).await {
                Ok(Some((id, result))) => self.on_completion(id, result).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.active.len(),
                        "shutdown drain timed out; transfers will recover on next start"
                    );
                    break;
                }
            }
        }
    }

    // ==================== Helpers ====================

    fn queue_position(&self, id: i64) -> Option<usize> {
        self.queue.iter().position(|task| task.id == id)
    }

    async fn persist(&self, task: &Task) {
        if let Err(error) = self.store.upsert(task).await {
            warn!(task_id = task.id, %error, "failed to persist task state");
        }
    }

    /// Removes the task's file and zeroes its byte checkpoint.
    async fn discard_file(&self, task: &Task) {
        self.remove_file(task.destination()).await;
        if let Err(error) = self.store.checkpoint_progress(task.id, 0, None, None).await {
            warn!(task_id = task.id, %error, "failed to zero progress checkpoint");
        }
    }

    async fn remove_file(&self, path: &std::path::Path) {
        if let Err(error) = tokio::fs::remove_file(path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %error, "failed to remove file");
            }
        }
    }
}
