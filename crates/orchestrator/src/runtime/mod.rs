//! Agent Runtime
//!
//! Hosts the task handlers of one agent. Tasks arrive either through
//! [`AgentRuntime::submit`] or from the `tasks.<type>` partitions of the
//! messaging substrate, pass admission control, and run in their own tokio
//! task. Every admitted task yields exactly one [`TaskResult`].
//!
//! Background loops started by [`AgentRuntime::start`]:
//!
//! - one intake loop per registered task type
//! - the `control.cancel` listener
//! - the checkpoint ticker
//! - the queue sweep failing tasks that waited too long

mod admission;
mod context;
mod handler;
mod lifecycle;

pub use context::{CancelReason, TaskContext};
pub use handler::{HandlerRegistry, RegistryError, TaskHandler};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::admission::{Admission, Admit};
use self::context::{CancelRequest, TaskControl};
use crate::checkpoint::{AgentState, CheckpointError, CheckpointManager, MemoryCheckpointStore};
use crate::config::{AgentConfig, ConfigError, MessagingConfig, RuntimeConfig};
use crate::error::{Classify, ErrorClass, HandlerError, TaskError, TaskErrorKind};
use crate::messaging::{subjects, Delivery, DeliveryMode, MessagingError, MessagingSubstrate, Subscription};
use crate::reliability::ResilienceLayer;
use crate::task::{AgentId, CorrelationId, ResultStatus, Task, TaskId, TaskResult, TaskStatus};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("task {0} was abandoned before producing a result")]
    Abandoned(TaskId),
}

impl Classify for RuntimeError {
    fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::Config(e) => e.class(),
            RuntimeError::Messaging(e) => e.class(),
            RuntimeError::Checkpoint(e) => e.class(),
            RuntimeError::Lifecycle(_) | RuntimeError::Registry(_) | RuntimeError::Abandoned(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

/// Why a task was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("queue full")]
    QueueFull,
    #[error("runtime draining")]
    Draining,
    #[error("runtime not running")]
    NotRunning,
    #[error("no handler for task type '{0}'")]
    UnknownTaskType(String),
    #[error("task already in flight")]
    DuplicateTask,
}

impl Classify for RejectReason {
    fn class(&self) -> ErrorClass {
        match self {
            RejectReason::QueueFull | RejectReason::Draining | RejectReason::NotRunning => ErrorClass::Capacity,
            RejectReason::UnknownTaskType(_) | RejectReason::DuplicateTask => ErrorClass::Permanent,
        }
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted(TaskTicket),
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted(_))
    }

    pub fn rejection(&self) -> Option<&RejectReason> {
        match self {
            SubmitOutcome::Rejected(reason) => Some(reason),
            SubmitOutcome::Accepted(_) => None,
        }
    }

    pub fn into_result(self) -> Result<TaskTicket, RejectReason> {
        match self {
            SubmitOutcome::Accepted(ticket) => Ok(ticket),
            SubmitOutcome::Rejected(reason) => Err(reason),
        }
    }
}

#[derive(Debug)]
enum TicketState {
    Pending(oneshot::Receiver<TaskResult>),
    Ready(Box<TaskResult>),
}

/// Handle to the eventual result of an accepted task.
#[derive(Debug)]
pub struct TaskTicket {
    task_id: TaskId,
    state: TicketState,
}

impl TaskTicket {
    fn pending(task_id: TaskId, rx: oneshot::Receiver<TaskResult>) -> Self {
        Self {
            task_id,
            state: TicketState::Pending(rx),
        }
    }

    fn resolved(result: TaskResult) -> Self {
        Self {
            task_id: result.task_id(),
            state: TicketState::Ready(Box::new(result)),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn wait(self) -> Result<TaskResult, RuntimeError> {
        match self.state {
            TicketState::Ready(result) => Ok(*result),
            TicketState::Pending(rx) => rx.await.map_err(|_| RuntimeError::Abandoned(self.task_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from the queue before it ran
    Cancelled,
    /// Running; the handler observes the request at its next checkpoint
    Requested,
    /// Past its commit point, completes normally
    AlreadyCommitted,
    NotFound,
}

/// Broadcast on `control.cancel`. Either field selects tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelCommand {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub issued_by: AgentId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCounters {
    pub submitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub queue_timeouts: u64,
    pub cancelled: u64,
    pub checkpoints_saved: u64,
    pub checkpoint_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    queue_timeouts: AtomicU64,
    cancelled: AtomicU64,
    checkpoints_saved: AtomicU64,
    checkpoint_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RuntimeCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RuntimeCounters {
            submitted: load(&self.submitted),
            rejected: load(&self.rejected),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            timed_out: load(&self.timed_out),
            queue_timeouts: load(&self.queue_timeouts),
            cancelled: load(&self.cancelled),
            checkpoints_saved: load(&self.checkpoints_saved),
            checkpoint_failures: load(&self.checkpoint_failures),
        }
    }
}

/// Side-effect free snapshot for liveness and readiness probes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeHealth {
    pub agent_id: AgentId,
    pub lifecycle_state: LifecycleState,
    pub queue_depth: usize,
    pub in_flight_count: usize,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    pub delivery_mode: DeliveryMode,
    pub broker_degraded: bool,
    pub task_types: Vec<String>,
    pub counters: RuntimeCounters,
}

enum Source {
    Direct(oneshot::Sender<TaskResult>),
    Message(Delivery),
}

struct Job {
    task: Task,
    attempt: u32,
    control: Arc<TaskControl>,
    source: Source,
}

struct ActiveTask {
    control: Arc<TaskControl>,
    correlation_id: Option<CorrelationId>,
}

struct RuntimeInner {
    agent_id: AgentId,
    config: RuntimeConfig,
    handlers: HandlerRegistry,
    lifecycle: Lifecycle,
    admission: Admission<Job>,
    /// Queued or executing tasks; at most one entry per id
    active: DashMap<TaskId, ActiveTask>,
    results: Mutex<LruCache<TaskId, TaskResult>>,
    messaging: Arc<MessagingSubstrate>,
    checkpoints: Arc<CheckpointManager>,
    resilience: Arc<ResilienceLayer>,
    counters: Counters,
    last_checkpoint: Mutex<Option<DateTime<Utc>>>,
    consecutive_transient_failures: AtomicU32,
    consecutive_checkpoint_failures: AtomicU32,
    /// Signalled when `active` becomes empty
    idle: Notify,
    /// Stops intake loops at the start of a drain
    intake_stop: CancellationToken,
    /// Stops every background loop
    stop: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; all clones drive the same runtime.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent_id", &self.inner.agent_id)
            .field("lifecycle", &self.inner.lifecycle.current())
            .field("task_types", &self.inner.handlers.task_types())
            .finish()
    }
}

pub struct RuntimeBuilder {
    agent_id: AgentId,
    config: RuntimeConfig,
    handlers: Vec<Arc<dyn TaskHandler>>,
    messaging: Option<Arc<MessagingSubstrate>>,
    checkpoints: Option<Arc<CheckpointManager>>,
    resilience: Option<Arc<ResilienceLayer>>,
}

impl RuntimeBuilder {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            config: RuntimeConfig::default(),
            handlers: Vec::new(),
            messaging: None,
            checkpoints: None,
            resilience: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn messaging(mut self, messaging: Arc<MessagingSubstrate>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn resilience(mut self, resilience: Arc<ResilienceLayer>) -> Self {
        self.resilience = Some(resilience);
        self
    }

    pub fn build(self) -> Result<AgentRuntime, RuntimeError> {
        self.config.validate()?;

        let mut handlers = HandlerRegistry::new();
        for handler in self.handlers {
            handlers.register(handler)?;
        }

        let resilience = self
            .resilience
            .unwrap_or_else(|| Arc::new(ResilienceLayer::default()));
        let messaging = self
            .messaging
            .unwrap_or_else(|| MessagingSubstrate::in_process(MessagingConfig::default()));
        let checkpoints = self.checkpoints.unwrap_or_else(|| {
            Arc::new(CheckpointManager::new(
                Arc::new(MemoryCheckpointStore::new()),
                resilience.clone(),
            ))
        });

        let cache_size = NonZeroUsize::new(self.config.result_cache_size).unwrap_or(NonZeroUsize::MIN);
        let admission = Admission::new(
            self.config.concurrency_limit,
            self.config.queue_capacity,
            self.config.queue_wait_timeout,
        );

        Ok(AgentRuntime {
            inner: Arc::new(RuntimeInner {
                lifecycle: Lifecycle::new(self.agent_id.clone()),
                agent_id: self.agent_id,
                config: self.config,
                handlers,
                admission,
                active: DashMap::new(),
                results: Mutex::new(LruCache::new(cache_size)),
                messaging,
                checkpoints,
                resilience,
                counters: Counters::default(),
                last_checkpoint: Mutex::new(None),
                consecutive_transient_failures: AtomicU32::new(0),
                consecutive_checkpoint_failures: AtomicU32::new(0),
                idle: Notify::new(),
                intake_stop: CancellationToken::new(),
                stop: CancellationToken::new(),
                background: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl AgentRuntime {
    pub fn builder(agent_id: impl Into<AgentId>) -> RuntimeBuilder {
        RuntimeBuilder::new(agent_id)
    }

    /// Wire a runtime from a full agent configuration: connect the broker,
    /// open the checkpoint store, register `handlers`.
    pub async fn from_config(
        agent_id: impl Into<AgentId>,
        config: &AgentConfig,
        handlers: Vec<Arc<dyn TaskHandler>>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let resilience = Arc::new(ResilienceLayer::new(config.reliability.clone()));
        let messaging = MessagingSubstrate::connect(config.messaging.clone(), resilience.clone()).await;
        let checkpoints = Arc::new(CheckpointManager::open(&config.checkpoint, resilience.clone())?);

        let mut builder = RuntimeBuilder::new(agent_id)
            .config(config.runtime.clone())
            .messaging(messaging)
            .checkpoints(checkpoints)
            .resilience(resilience);
        for handler in handlers {
            builder = builder.handler(handler);
        }
        builder.build()
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn messaging(&self) -> &Arc<MessagingSubstrate> {
        &self.inner.messaging
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.inner.resilience
    }

    pub fn task_types(&self) -> Vec<String> {
        self.inner.handlers.task_types()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lifecycle.current()
    }

    pub fn watch_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.inner.lifecycle.subscribe()
    }

    /// Restore the last checkpoint, subscribe to the task partitions and
    /// start the background loops.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let inner = &self.inner;
        inner.lifecycle.transition(LifecycleState::Initializing)?;
        inner.restore().await;

        let subscribed = inner.subscribe_all().await;
        let (intake, cancel) = match subscribed {
            Ok(subs) => subs,
            Err(err) => {
                error!(agent_id = %inner.agent_id, error = %err, "Failed to subscribe, stopping runtime");
                inner.halt();
                return Err(err.into());
            }
        };

        inner.lifecycle.transition(LifecycleState::Running)?;

        let mut background = Vec::with_capacity(intake.len() + 3);
        for sub in intake {
            background.push(tokio::spawn(inner.clone().intake_loop(sub)));
        }
        background.push(tokio::spawn(inner.clone().cancel_listener(cancel)));
        background.push(tokio::spawn(inner.clone().checkpoint_loop()));
        background.push(tokio::spawn(inner.clone().queue_sweep()));
        inner.background.lock().extend(background);

        info!(
            agent_id = %inner.agent_id,
            task_types = ?inner.handlers.task_types(),
            delivery_mode = %inner.messaging.mode(),
            concurrency_limit = inner.config.concurrency_limit,
            queue_capacity = inner.config.queue_capacity,
            "Agent runtime started"
        );
        Ok(())
    }

    pub fn submit(&self, task: Task) -> SubmitOutcome {
        let inner = &self.inner;
        if let Some(result) = inner.cached_result(&task.id) {
            debug!(agent_id = %inner.agent_id, task_id = %task.id, "Task already completed, returning cached result");
            return SubmitOutcome::Accepted(TaskTicket::resolved(result));
        }

        let (tx, rx) = oneshot::channel();
        let task_id = task.id;
        match inner.admit(task, 1, Source::Direct(tx)) {
            Ok(()) => SubmitOutcome::Accepted(TaskTicket::pending(task_id, rx)),
            Err((reason, _)) => SubmitOutcome::Rejected(reason),
        }
    }

    pub fn cancel(&self, task_id: TaskId) -> CancelOutcome {
        self.inner.cancel_task(task_id, CancelReason::User)
    }

    pub fn health(&self) -> RuntimeHealth {
        let inner = &self.inner;
        RuntimeHealth {
            agent_id: inner.agent_id.clone(),
            lifecycle_state: inner.lifecycle.current(),
            queue_depth: inner.admission.queue_depth(),
            in_flight_count: inner.admission.in_flight(),
            last_checkpoint_time: *inner.last_checkpoint.lock(),
            delivery_mode: inner.messaging.mode(),
            broker_degraded: inner.messaging.is_degraded(),
            task_types: inner.handlers.task_types(),
            counters: inner.counters.snapshot(),
        }
    }

    pub async fn checkpoint_now(&self) -> Result<u64, CheckpointError> {
        self.inner.checkpoint().await
    }

    /// Graceful stop: reject new intake, let in-flight work finish within the
    /// drain grace period, cancel the rest, write a final checkpoint.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let inner = &self.inner;
        match inner.lifecycle.current() {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Created | LifecycleState::Initializing => {
                inner.halt();
                return Ok(());
            }
            LifecycleState::Draining => {
                inner.lifecycle.stopped().await;
                return Ok(());
            }
            LifecycleState::Running | LifecycleState::Degraded => {}
        }

        inner.lifecycle.transition(LifecycleState::Draining)?;
        inner.intake_stop.cancel();
        info!(
            agent_id = %inner.agent_id,
            in_flight = inner.admission.in_flight(),
            queued = inner.admission.queue_depth(),
            "Draining agent runtime"
        );

        if !inner.wait_idle(inner.config.drain_grace_period).await {
            warn!(
                agent_id = %inner.agent_id,
                remaining = inner.active.len(),
                "Drain grace period elapsed, cancelling remaining tasks"
            );
            inner.cancel_everything(CancelReason::Shutdown);
            if !inner.wait_idle(inner.config.cancellation_grace_period).await {
                warn!(
                    agent_id = %inner.agent_id,
                    remaining = inner.active.len(),
                    "Tasks still running after cancellation grace period"
                );
            }
        }

        if let Err(err) = inner.checkpoint().await {
            warn!(agent_id = %inner.agent_id, error = %err, "Final checkpoint failed");
        }

        inner.stop.cancel();
        let handles = std::mem::take(&mut *inner.background.lock());
        for handle in handles {
            let _ = handle.await;
        }

        inner.lifecycle.transition(LifecycleState::Stopped)?;
        info!(agent_id = %inner.agent_id, "Agent runtime stopped");
        Ok(())
    }

    /// Stop immediately without draining or a final checkpoint, as a crash
    /// would. Unacknowledged messages are left to broker redelivery.
    pub fn abort(&self) {
        warn!(agent_id = %self.inner.agent_id, "Aborting agent runtime");
        self.inner.halt();
    }

    /// Resolves once the runtime is `Stopped`.
    pub async fn stopped(&self) {
        self.inner.lifecycle.stopped().await
    }
}

impl RuntimeInner {
    fn cached_result(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.results.lock().get(task_id).cloned()
    }

    fn reject(&self, task: &Task, reason: RejectReason, source: Source) -> Result<(), (RejectReason, Source)> {
        Counters::bump(&self.counters.rejected);
        debug!(agent_id = %self.agent_id, task_id = %task.id, reason = %reason, "Task rejected");
        Err((reason, source))
    }

    fn admit(self: &Arc<Self>, mut task: Task, attempt: u32, source: Source) -> Result<(), (RejectReason, Source)> {
        let state = self.lifecycle.current();
        if state == LifecycleState::Draining {
            return self.reject(&task, RejectReason::Draining, source);
        }
        if !state.accepts_tasks() {
            return self.reject(&task, RejectReason::NotRunning, source);
        }
        if !self.handlers.contains(&task.task_type) {
            let reason = RejectReason::UnknownTaskType(task.task_type.clone());
            return self.reject(&task, reason, source);
        }

        let control = TaskControl::new();
        match self.active.entry(task.id) {
            Entry::Occupied(_) => return self.reject(&task, RejectReason::DuplicateTask, source),
            Entry::Vacant(slot) => {
                slot.insert(ActiveTask {
                    control: control.clone(),
                    correlation_id: task.correlation_id,
                });
            }
        }
        // completed between the cache check and the insert
        if self.results.lock().contains(&task.id) {
            self.release_active(&task.id);
            return self.reject(&task, RejectReason::DuplicateTask, source);
        }

        task.status = TaskStatus::Queued;
        let priority = task.priority;
        let job = Job {
            task,
            attempt,
            control,
            source,
        };
        match self.admission.admit(job, priority) {
            Admit::Run(job, permit) => {
                Counters::bump(&self.counters.submitted);
                self.launch(job, permit);
                Ok(())
            }
            Admit::Queued => {
                Counters::bump(&self.counters.submitted);
                Ok(())
            }
            Admit::Full(job) => {
                self.release_active(&job.task.id);
                let Job { task, source, .. } = job;
                self.reject(&task, RejectReason::QueueFull, source)
            }
        }
    }

    fn launch(self: &Arc<Self>, mut job: Job, permit: OwnedSemaphorePermit) {
        job.task.status = TaskStatus::Executing;
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.invoke(&job.task, job.attempt, &job.control).await;
            inner.release_slot(permit);
            inner.finish(job, result).await;
        });
    }

    fn release_slot(self: &Arc<Self>, permit: OwnedSemaphorePermit) {
        let handoff = self.admission.release(permit);
        for job in handoff.expired {
            self.expire_queued(job);
        }
        if let Some((job, permit)) = handoff.next {
            self.launch(job, permit);
        }
    }

    async fn invoke(&self, task: &Task, attempt: u32, control: &Arc<TaskControl>) -> TaskResult {
        let started = Instant::now();
        let agent = &self.agent_id;

        if let Some(reason) = control.cancel_reason() {
            return cancelled_result(task, agent, reason, Duration::ZERO);
        }
        if task.time_remaining() == Some(Duration::ZERO) {
            debug!(agent_id = %agent, task_id = %task.id, "Deadline passed before execution");
            Counters::bump(&self.counters.timed_out);
            return TaskResult::timeout(task, agent, Duration::ZERO);
        }
        let Some(handler) = self.handlers.get(&task.task_type).cloned() else {
            let error = TaskError::new(
                TaskErrorKind::Permanent,
                format!("no handler for task type '{}'", task.task_type),
            );
            return TaskResult::failure(task, agent, error, Duration::ZERO);
        };

        debug!(agent_id = %agent, task_id = %task.id, task_type = %task.task_type, attempt, "Executing task");
        let ctx = TaskContext::new(task, attempt, control.clone());
        let payload = task.payload.clone();
        let mut execution = tokio::spawn(async move { handler.execute(&ctx, payload).await });

        let joined = match task.time_remaining() {
            None => (&mut execution).await,
            Some(left) => {
                tokio::select! {
                    joined = &mut execution => joined,
                    _ = tokio::time::sleep(left) => {
                        if control.request_cancel(CancelReason::Deadline) == CancelRequest::AlreadyCommitted {
                            debug!(agent_id = %agent, task_id = %task.id, "Deadline passed after commit point");
                            (&mut execution).await
                        } else {
                            self.await_cancelled(task, &mut execution).await;
                            warn!(agent_id = %agent, task_id = %task.id, "Task timed out");
                            Counters::bump(&self.counters.timed_out);
                            return TaskResult::timeout(task, agent, started.elapsed());
                        }
                    }
                }
            }
        };

        let elapsed = started.elapsed();
        match joined {
            Ok(Ok(output)) => TaskResult::success(task, agent, output, elapsed),
            Ok(Err(HandlerError::Cancelled)) => {
                let reason = control.cancel_reason().unwrap_or(CancelReason::User);
                cancelled_result(task, agent, reason, elapsed)
            }
            Ok(Err(err)) => TaskResult::failure(task, agent, err.into(), elapsed),
            Err(join) if join.is_panic() => {
                error!(agent_id = %agent, task_id = %task.id, task_type = %task.task_type, "Handler panicked");
                TaskResult::failure(
                    task,
                    agent,
                    TaskError::new(TaskErrorKind::Panicked, "handler panicked"),
                    elapsed,
                )
            }
            Err(_) => TaskResult::failure(
                task,
                agent,
                TaskError::new(TaskErrorKind::Cancelled, "handler task aborted"),
                elapsed,
            ),
        }
    }

    /// Wait for a handler that was asked to stop. It is never interrupted.
    async fn await_cancelled<T>(&self, task: &Task, execution: &mut JoinHandle<T>) {
        let grace = self.config.cancellation_grace_period;
        if tokio::time::timeout(grace, &mut *execution).await.is_err() {
            warn!(
                agent_id = %self.agent_id,
                task_id = %task.id,
                grace_ms = grace.as_millis() as u64,
                "Handler has not honored cancellation within the grace period"
            );
            let _ = execution.await;
        }
    }

    fn expire_queued(self: &Arc<Self>, job: Job) {
        Counters::bump(&self.counters.queue_timeouts);
        warn!(
            agent_id = %self.agent_id,
            task_id = %job.task.id,
            wait_ms = self.config.queue_wait_timeout.as_millis() as u64,
            "Task expired in queue"
        );
        let error = TaskError::new(
            TaskErrorKind::QueueTimeout,
            format!("queued for longer than {:?}", self.config.queue_wait_timeout),
        );
        let result = TaskResult::failure(&job.task, &self.agent_id, error, Duration::ZERO);
        let inner = self.clone();
        tokio::spawn(async move { inner.finish(job, result).await });
    }

    fn cancel_queued(self: &Arc<Self>, job: Job, reason: CancelReason) {
        job.control.request_cancel(reason);
        let result = cancelled_result(&job.task, &self.agent_id, reason, Duration::ZERO);
        let inner = self.clone();
        tokio::spawn(async move { inner.finish(job, result).await });
    }

    async fn finish(self: &Arc<Self>, job: Job, result: TaskResult) {
        let Job {
            task,
            source,
            control,
            ..
        } = job;

        let shutdown_cancel = control.cancel_reason() == Some(CancelReason::Shutdown)
            && result.error().map(|e| e.kind) == Some(TaskErrorKind::Cancelled);
        if let (true, Source::Message(delivery)) = (shutdown_cancel, &source) {
            self.release_active(&task.id);
            if let Err(err) = delivery.nak(Duration::ZERO).await {
                warn!(agent_id = %self.agent_id, task_id = %task.id, error = %err, "Failed to release message");
            }
            info!(agent_id = %self.agent_id, task_id = %task.id, "Task released for redelivery");
            return;
        }

        self.record_outcome(&task, &result);
        self.results.lock().put(task.id, result.clone());
        self.release_active(&task.id);

        let published = self.publish_result(&task, &result).await;
        match source {
            Source::Direct(tx) => {
                let _ = tx.send(result);
            }
            Source::Message(delivery) => {
                let settled = if published {
                    delivery.ack().await
                } else {
                    delivery.nak(self.config.nak_delay).await
                };
                if let Err(err) = settled {
                    warn!(agent_id = %self.agent_id, task_id = %task.id, error = %err, "Failed to settle task message");
                }
            }
        }
    }

    fn record_outcome(&self, task: &Task, result: &TaskResult) {
        match result.status() {
            ResultStatus::Success => {
                Counters::bump(&self.counters.succeeded);
                self.consecutive_transient_failures.store(0, Ordering::Relaxed);
                self.lifecycle.set_degraded(false);
            }
            // counted where the timeout is detected
            ResultStatus::Timeout => {}
            ResultStatus::Failure => {
                Counters::bump(&self.counters.failed);
                let Some(error) = result.error() else {
                    return;
                };
                debug!(agent_id = %self.agent_id, task_id = %task.id, error = %error, "Task failed");
                match error.kind {
                    TaskErrorKind::Cancelled => Counters::bump(&self.counters.cancelled),
                    TaskErrorKind::Transient => {
                        let n = self.consecutive_transient_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        let threshold = self.config.degrade_after_failures;
                        if threshold > 0 && n >= threshold && self.lifecycle.current() == LifecycleState::Running {
                            warn!(agent_id = %self.agent_id, consecutive_failures = n, "Transient handler failures, runtime degraded");
                            self.lifecycle.set_degraded(true);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    async fn publish_result(&self, task: &Task, result: &TaskResult) -> bool {
        let Some(subject) = &task.reply_to else {
            return true;
        };
        match self.messaging.publish(subject, result).await {
            Ok(_) => true,
            Err(err) => {
                warn!(agent_id = %self.agent_id, task_id = %task.id, subject = %subject, error = %err, "Failed to publish task result");
                false
            }
        }
    }

    fn release_active(&self, task_id: &TaskId) {
        self.active.remove(task_id);
        if self.active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// True if every task finished within `limit`.
    async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.active.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.active.is_empty();
            }
        }
    }

    fn cancel_task(self: &Arc<Self>, task_id: TaskId, reason: CancelReason) -> CancelOutcome {
        let Some(control) = self.active.get(&task_id).map(|entry| entry.control.clone()) else {
            return CancelOutcome::NotFound;
        };
        if let Some(job) = self.admission.remove(|job| job.task.id == task_id) {
            info!(agent_id = %self.agent_id, task_id = %task_id, reason = %reason, "Queued task cancelled");
            self.cancel_queued(job, reason);
            return CancelOutcome::Cancelled;
        }
        match control.request_cancel(reason) {
            CancelRequest::AlreadyCommitted => CancelOutcome::AlreadyCommitted,
            CancelRequest::Requested | CancelRequest::AlreadyRequested => {
                info!(agent_id = %self.agent_id, task_id = %task_id, reason = %reason, "Cancellation requested");
                CancelOutcome::Requested
            }
        }
    }

    fn cancel_everything(self: &Arc<Self>, reason: CancelReason) {
        for job in self.admission.drain_queue() {
            self.cancel_queued(job, reason);
        }
        let controls: Vec<Arc<TaskControl>> = self.active.iter().map(|e| e.control.clone()).collect();
        for control in controls {
            control.request_cancel(reason);
        }
    }

    fn apply_cancel(self: &Arc<Self>, command: &CancelCommand) {
        if let Some(task_id) = command.task_id {
            self.cancel_task(task_id, CancelReason::User);
        }
        if let Some(correlation_id) = command.correlation_id {
            let matching: Vec<TaskId> = self
                .active
                .iter()
                .filter(|e| e.correlation_id == Some(correlation_id))
                .map(|e| *e.key())
                .collect();
            for task_id in matching {
                self.cancel_task(task_id, CancelReason::User);
            }
        }
    }

    fn halt(self: &Arc<Self>) {
        self.intake_stop.cancel();
        self.stop.cancel();
        self.cancel_everything(CancelReason::Shutdown);
        let _ = self.lifecycle.transition(LifecycleState::Stopped);
    }

    async fn restore(&self) {
        match self.checkpoints.load(&self.agent_id).await {
            Ok(Some(state)) => {
                for (task_type, slice) in state.handlers {
                    match self.handlers.get(&task_type) {
                        Some(handler) => {
                            if let Err(err) = handler.restore_state(slice) {
                                warn!(agent_id = %self.agent_id, task_type = %task_type, error = %err, "Handler rejected checkpointed state");
                            }
                        }
                        None => warn!(agent_id = %self.agent_id, task_type = %task_type, "Checkpoint holds state of an unregistered handler"),
                    }
                }
                *self.last_checkpoint.lock() = Some(state.last_checkpoint_at);
                info!(
                    agent_id = %self.agent_id,
                    generation = state.generation,
                    checkpointed_at = %state.last_checkpoint_at,
                    config_version = %state.config_version,
                    "Restored agent state from checkpoint"
                );
            }
            Ok(None) => info!(agent_id = %self.agent_id, "No checkpoint found, starting fresh"),
            Err(err) => warn!(agent_id = %self.agent_id, error = %err, "Checkpoint load failed, starting with empty state"),
        }
    }

    async fn checkpoint(&self) -> Result<u64, CheckpointError> {
        let mut state = AgentState::new(
            self.agent_id.clone(),
            self.lifecycle.current(),
            self.config.config_version.clone(),
        );
        for (task_type, handler) in self.handlers.iter() {
            if let Some(slice) = handler.snapshot_state() {
                state.handlers.insert(task_type.to_string(), slice);
            }
        }

        match self.checkpoints.save(&state).await {
            Ok(generation) => {
                *self.last_checkpoint.lock() = Some(state.last_checkpoint_at);
                self.consecutive_checkpoint_failures.store(0, Ordering::Relaxed);
                Counters::bump(&self.counters.checkpoints_saved);
                Ok(generation)
            }
            Err(err) => {
                Counters::bump(&self.counters.checkpoint_failures);
                let n = self.consecutive_checkpoint_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(agent_id = %self.agent_id, consecutive_failures = n, error = %err, "Checkpoint failed, retrying next interval");
                Err(err)
            }
        }
    }

    async fn subscribe_all(self: &Arc<Self>) -> Result<(Vec<Subscription>, Subscription), MessagingError> {
        let mut intake = Vec::new();
        for task_type in self.handlers.task_types() {
            intake.push(
                self.messaging
                    .subscribe(&subjects::tasks(&task_type), &subjects::workers(&task_type))
                    .await?,
            );
        }
        let cancel = self
            .messaging
            .subscribe(subjects::CONTROL_CANCEL, &subjects::private_consumer(&self.agent_id))
            .await?;
        Ok((intake, cancel))
    }

    async fn intake_loop(self: Arc<Self>, mut sub: Subscription) {
        let stop = self.intake_stop.clone();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.admission.wait_for_capacity() => {}
            }
            let Some(delivery) = sub.next(&stop).await else {
                break;
            };
            self.accept_delivery(delivery).await;
        }
        debug!(agent_id = %self.agent_id, subject = sub.subject(), "Intake loop stopped");
    }

    async fn accept_delivery(self: &Arc<Self>, delivery: Delivery) {
        let task: Task = match delivery.decode() {
            Ok(task) => task,
            Err(err) => {
                error!(
                    agent_id = %self.agent_id,
                    subject = delivery.subject(),
                    sequence = delivery.sequence(),
                    error = %err,
                    "Dropping malformed task message"
                );
                if let Err(err) = delivery.ack().await {
                    warn!(agent_id = %self.agent_id, error = %err, "Failed to ack malformed message");
                }
                return;
            }
        };

        if let Some(result) = self.cached_result(&task.id) {
            debug!(agent_id = %self.agent_id, task_id = %task.id, "Redelivery of a completed task, republishing result");
            let settled = if self.publish_result(&task, &result).await {
                delivery.ack().await
            } else {
                delivery.nak(self.config.nak_delay).await
            };
            if let Err(err) = settled {
                warn!(agent_id = %self.agent_id, task_id = %task.id, error = %err, "Failed to settle redelivered message");
            }
            return;
        }

        // lease renewed until the task settles or the runtime stops
        delivery.keep_alive(self.messaging.config().ack_wait / 2, self.stop.child_token());
        let attempt = delivery.delivery_count();
        let Err((reason, Source::Message(delivery))) = self.admit(task, attempt, Source::Message(delivery)) else {
            return;
        };
        let settled = match reason {
            RejectReason::UnknownTaskType(_) => {
                warn!(agent_id = %self.agent_id, reason = %reason, "Task on a partition this runtime does not serve");
                delivery.ack().await
            }
            _ => delivery.nak(self.config.nak_delay).await,
        };
        if let Err(err) = settled {
            warn!(agent_id = %self.agent_id, error = %err, "Failed to settle rejected message");
        }
    }

    async fn cancel_listener(self: Arc<Self>, mut sub: Subscription) {
        let stop = self.stop.clone();
        while let Some(delivery) = sub.next(&stop).await {
            match delivery.decode::<CancelCommand>() {
                Ok(command) => self.apply_cancel(&command),
                Err(err) => warn!(agent_id = %self.agent_id, error = %err, "Ignoring malformed cancel command"),
            }
            if let Err(err) = delivery.ack().await {
                warn!(agent_id = %self.agent_id, error = %err, "Failed to ack cancel command");
            }
        }
    }

    async fn checkpoint_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.checkpoint_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    if self.checkpoint().await.is_ok() {
                        continue;
                    }
                    let failures = self.consecutive_checkpoint_failures.load(Ordering::Relaxed);
                    if let Some(max) = self.config.max_consecutive_checkpoint_failures {
                        if failures >= max {
                            error!(agent_id = %self.agent_id, consecutive_failures = failures, "Checkpoint store unrecoverable, stopping runtime");
                            self.halt();
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn queue_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.admission.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    for job in self.admission.take_expired() {
                        self.expire_queued(job);
                    }
                }
            }
        }
    }
}

fn cancelled_result(task: &Task, agent: &AgentId, reason: CancelReason, elapsed: Duration) -> TaskResult {
    TaskResult::failure(
        task,
        agent,
        TaskError::new(TaskErrorKind::Cancelled, format!("cancelled ({reason})")),
        elapsed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        fn task_type(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _ctx: &TaskContext, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
            Ok(payload)
        }
    }

    struct Flaky;

    #[async_trait]
    impl TaskHandler for Flaky {
        fn task_type(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _ctx: &TaskContext, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
            if payload["fail"].as_bool().unwrap_or(false) {
                Err(HandlerError::Transient("upstream reset".into()))
            } else {
                Ok(json!("ok"))
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        fn task_type(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _ctx: &TaskContext, _payload: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
            panic!("boom");
        }
    }

    fn runtime(config: RuntimeConfig) -> AgentRuntime {
        AgentRuntime::builder("unit")
            .config(config)
            .handler(Arc::new(Echo))
            .handler(Arc::new(Flaky))
            .handler(Arc::new(Panics))
            .build()
            .unwrap()
    }

    fn task(task_type: &str, payload: serde_json::Value) -> Task {
        Task::new(task_type, payload, AgentId::new("tester"))
    }

    #[tokio::test]
    async fn test_rejects_before_start() {
        let rt = runtime(RuntimeConfig::default());
        let outcome = rt.submit(task("echo", json!(1)));
        assert_eq!(outcome.rejection(), Some(&RejectReason::NotRunning));
    }

    #[tokio::test]
    async fn test_duplicate_handler_fails_build() {
        let err = AgentRuntime::builder("dup")
            .handler(Arc::new(Echo))
            .handler(Arc::new(Echo))
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Registry(RegistryError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_echo_round_trip_and_cached_resubmission() {
        let rt = runtime(RuntimeConfig::default());
        rt.start().await.unwrap();

        let t = task("echo", json!({"hello": "world"}));
        let result = rt.submit(t.clone()).into_result().unwrap().wait().await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output(), Some(&json!({"hello": "world"})));

        let again = rt.submit(t).into_result().unwrap().wait().await.unwrap();
        assert_eq!(again, result);
        assert_eq!(rt.health().counters.succeeded, 1);
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_task_type_rejected() {
        let rt = runtime(RuntimeConfig::default());
        rt.start().await.unwrap();
        let outcome = rt.submit(task("nope", json!(null)));
        assert_eq!(outcome.rejection(), Some(&RejectReason::UnknownTaskType("nope".into())));
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let rt = runtime(RuntimeConfig::default());
        rt.start().await.unwrap();
        let result = rt.submit(task("panics", json!(null))).into_result().unwrap().wait().await.unwrap();
        assert_eq!(result.error().map(|e| e.kind), Some(TaskErrorKind::Panicked));
        assert_eq!(rt.lifecycle_state(), LifecycleState::Running);
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_degrade_and_success_recovers() {
        let rt = runtime(RuntimeConfig {
            degrade_after_failures: 2,
            ..Default::default()
        });
        rt.start().await.unwrap();

        for _ in 0..2 {
            let r = rt.submit(task("flaky", json!({"fail": true}))).into_result().unwrap().wait().await.unwrap();
            assert_eq!(r.error().map(|e| e.kind), Some(TaskErrorKind::Transient));
        }
        assert_eq!(rt.lifecycle_state(), LifecycleState::Degraded);
        // degraded runtimes keep accepting work
        let ok = rt.submit(task("flaky", json!({}))).into_result().unwrap().wait().await.unwrap();
        assert!(ok.is_success());
        assert_eq!(rt.lifecycle_state(), LifecycleState::Running);
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out_without_running() {
        let rt = runtime(RuntimeConfig::default());
        rt.start().await.unwrap();
        let t = task("echo", json!(1)).with_deadline(Utc::now() - chrono::Duration::seconds(1));
        let result = rt.submit(t).into_result().unwrap().wait().await.unwrap();
        assert_eq!(result.status(), ResultStatus::Timeout);
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let rt = runtime(RuntimeConfig::default());
        assert_eq!(rt.cancel(TaskId::new()), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_with_draining_then_stops() {
        let rt = runtime(RuntimeConfig::default());
        rt.start().await.unwrap();
        rt.shutdown().await.unwrap();
        assert_eq!(rt.lifecycle_state(), LifecycleState::Stopped);
        assert_eq!(rt.submit(task("echo", json!(1))).rejection(), Some(&RejectReason::NotRunning));
        // final checkpoint taken during shutdown
        assert!(rt.health().last_checkpoint_time.is_some());
    }
}
