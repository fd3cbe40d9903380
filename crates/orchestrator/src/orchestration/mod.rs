//! Orchestrator: turns one request into a dependency graph of sub-tasks,
//! dispatches them over the messaging substrate and aggregates the results.
//!
//! An orchestrator is an [`AgentRuntime`] with the built-in `orchestrate`
//! handler, so plans share the runtime's admission control, cancellation and
//! shutdown. Sub-task results come back on `results.<agent_id>` and are routed
//! to the driving plan by correlation id.

pub mod plan;

pub use plan::{
    OrchestrationPlan, PlanError, PlanFailure, PlanResult, PlanStatus, RecordOutcome, SubTaskOutcome,
    SubTaskSpec, SubTaskStatus,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::{AgentConfig, OrchestratorConfig, RuntimeConfig};
use crate::error::{Classify, ErrorClass, HandlerError, TaskError, TaskErrorKind};
use crate::messaging::{subjects, DeliveryMode, MessagingSubstrate, Subscription};
use crate::registry::AgentRegistry;
use crate::reliability::ResilienceLayer;
use crate::runtime::{
    AgentRuntime, CancelCommand, RejectReason, RuntimeError, RuntimeHealth, SubmitOutcome, TaskContext,
    TaskHandler, TaskTicket,
};
use crate::task::{AgentId, CorrelationId, Task, TaskPriority, TaskResult};

/// Task type served by every orchestrator
pub const ORCHESTRATE_TASK_TYPE: &str = "orchestrate";

/// What happens to the rest of a plan after a sub-task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop publishing, cancel what is in flight, fail the plan
    #[default]
    Abort,
    /// Skip dependents of the failed sub-task and keep going
    ContinueBestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Abort => f.write_str("abort"),
            FailurePolicy::ContinueBestEffort => f.write_str("continue-best-effort"),
        }
    }
}

/// Payload of an `orchestrate` task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub request_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default, with = "humantime_serde")]
    pub deadline: Option<Duration>,
    /// Opaque identity forwarded as the originator of every sub-task
    #[serde(default)]
    pub principal: Option<AgentId>,
}

impl OrchestrationRequest {
    pub fn new(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
            failure_policy: None,
            deadline: None,
            principal: None,
        }
    }

    /// Request whose payload lists the sub-tasks directly.
    pub fn explicit(request_id: impl Into<String>, subtasks: Vec<SubTaskSpec>) -> Self {
        Self::new(request_id, serde_json::json!({ "subtasks": subtasks }))
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_principal(mut self, principal: AgentId) -> Self {
        self.principal = Some(principal);
        self
    }
}

/// Decomposes a request into sub-tasks.
pub trait RequestPlanner: Send + Sync {
    fn plan(&self, request: &OrchestrationRequest) -> Result<Vec<SubTaskSpec>, PlanError>;
}

/// Reads the sub-tasks from `payload.subtasks`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitPlanner;

impl RequestPlanner for ExplicitPlanner {
    fn plan(&self, request: &OrchestrationRequest) -> Result<Vec<SubTaskSpec>, PlanError> {
        let subtasks = request
            .payload
            .get("subtasks")
            .cloned()
            .ok_or_else(|| PlanError::InvalidRequest {
                reason: "payload has no 'subtasks' list".into(),
            })?;
        serde_json::from_value(subtasks).map_err(|err| PlanError::InvalidRequest {
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("orchestration request rejected: {0}")]
    Rejected(RejectReason),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("orchestration task failed: {0}")]
    Task(TaskError),

    #[error("malformed plan result: {0}")]
    MalformedResult(String),
}

impl Classify for OrchestratorError {
    fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::Plan(e) => e.class(),
            OrchestratorError::Rejected(e) => e.class(),
            OrchestratorError::Runtime(e) => e.class(),
            OrchestratorError::Task(e) => e.class(),
            OrchestratorError::MalformedResult(_) => ErrorClass::Permanent,
        }
    }
}

struct Shared {
    agent_id: AgentId,
    config: OrchestratorConfig,
    planner: Arc<dyn RequestPlanner>,
    registry: Option<Arc<AgentRegistry>>,
    messaging: Arc<MessagingSubstrate>,
    /// Live plans by correlation id
    routes: DashMap<CorrelationId, mpsc::UnboundedSender<TaskResult>>,
    stop: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn validate(&self, request: &OrchestrationRequest) -> Result<Vec<SubTaskSpec>, PlanError> {
        let specs = self.planner.plan(request)?;
        if self.config.require_registered_task_types {
            if let Some(registry) = &self.registry {
                for spec in &specs {
                    if !registry.supports(&spec.task_type) {
                        return Err(PlanError::NoAgentForTaskType {
                            subtask: spec.key.clone(),
                            task_type: spec.task_type.clone(),
                        });
                    }
                }
            }
        }
        Ok(specs)
    }

    fn subtask(&self, plan: &OrchestrationPlan, key: &str, principal: &AgentId) -> Option<Task> {
        let spec = plan.spec(key)?;
        let mut task = Task::new(spec.task_type.clone(), spec.payload.clone(), principal.clone())
            .with_priority(spec.priority)
            .with_correlation(plan.correlation_id())
            .with_reply_to(subjects::results(&self.agent_id));
        if let Some(timeout) = spec.timeout {
            task = task.with_timeout(timeout);
        }
        Some(task)
    }

    async fn publish_eligible(&self, plan: &mut OrchestrationPlan, principal: &AgentId) {
        for key in plan.eligible() {
            let Some(task) = self.subtask(plan, &key, principal) else {
                continue;
            };
            match self.messaging.publish(&subjects::tasks(&task.task_type), &task).await {
                Ok(_) => {
                    debug!(
                        request_id = %plan.request_id(),
                        subtask = %key,
                        task_id = %task.id,
                        task_type = %task.task_type,
                        "Sub-task published"
                    );
                    plan.mark_published(&key, task.id);
                }
                Err(err) => {
                    warn!(request_id = %plan.request_id(), subtask = %key, error = %err, "Failed to publish sub-task");
                    plan.fail_unpublished(&key, TaskError::new(TaskErrorKind::PublishFailed, err.to_string()));
                }
            }
        }
    }

    async fn drive(&self, ctx: &TaskContext, request: OrchestrationRequest) -> Result<PlanResult, HandlerError> {
        let specs = self
            .validate(&request)
            .map_err(|err| HandlerError::InvalidPayload(err.to_string()))?;
        let policy = request.failure_policy.unwrap_or(self.config.default_failure_policy);
        let deadline = request.deadline.unwrap_or(self.config.default_plan_deadline);
        let correlation_id = ctx.correlation_id().unwrap_or_default();
        let principal = request.principal.clone().unwrap_or_else(|| self.agent_id.clone());

        let mut plan = OrchestrationPlan::build(request.request_id.clone(), correlation_id, policy, specs)
            .map_err(|err| HandlerError::InvalidPayload(err.to_string()))?;

        if self.messaging.mode() == DeliveryMode::BestEffort {
            warn!(
                request_id = %request.request_id,
                correlation_id = %correlation_id,
                "Plan running with best-effort delivery, results may be lost on crash"
            );
        }
        info!(
            request_id = %request.request_id,
            correlation_id = %correlation_id,
            subtasks = plan.len(),
            policy = %policy,
            deadline_ms = deadline.as_millis() as u64,
            "Plan started"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.routes.insert(correlation_id, tx);
        let _route = RouteGuard {
            routes: &self.routes,
            correlation_id,
        };

        let deadline_at = Instant::now() + deadline;
        loop {
            self.publish_eligible(&mut plan, &principal).await;
            if plan.is_terminal() {
                break;
            }
            if plan.is_stalled() {
                let pending = plan.pending();
                warn!(request_id = %request.request_id, pending = ?pending, "Plan cannot make progress");
                plan.abort(TaskError::new(
                    TaskErrorKind::UnmetDependency,
                    PlanError::Deadlock { pending }.to_string(),
                ));
                break;
            }

            tokio::select! {
                Some(result) = rx.recv() => {
                    match plan.record_result(&result) {
                        RecordOutcome::Applied => debug!(
                            request_id = %request.request_id,
                            task_id = %result.task_id(),
                            status = ?result.status(),
                            "Sub-task result recorded"
                        ),
                        RecordOutcome::Duplicate | RecordOutcome::Unknown => debug!(
                            request_id = %request.request_id,
                            task_id = %result.task_id(),
                            "Ignoring late or duplicate sub-task result"
                        ),
                    }
                }
                _ = tokio::time::sleep_until(deadline_at) => {
                    warn!(
                        request_id = %request.request_id,
                        in_flight = plan.in_flight().len(),
                        "Plan deadline exceeded"
                    );
                    plan.expire();
                }
                _ = ctx.cancelled() => {
                    info!(request_id = %request.request_id, "Plan cancelled");
                    plan.abort(TaskError::new(TaskErrorKind::Cancelled, "plan cancelled"));
                }
            }
        }

        // committed first so the broadcast below cannot cancel this task
        let _ = ctx.commit();
        let abandoned = plan.take_abandoned();
        if !abandoned.is_empty() {
            let command = CancelCommand {
                task_id: None,
                correlation_id: Some(correlation_id),
                issued_by: self.agent_id.clone(),
            };
            if let Err(err) = self.messaging.publish(subjects::CONTROL_CANCEL, &command).await {
                warn!(request_id = %request.request_id, error = %err, "Failed to broadcast sub-task cancellation");
            }
        }

        let result = plan.outcome(self.messaging.mode());
        info!(
            request_id = %result.request_id,
            correlation_id = %correlation_id,
            status = ?result.status,
            abandoned = abandoned.len(),
            "Plan finished"
        );
        Ok(result)
    }

    async fn results_listener(self: Arc<Self>, mut sub: Subscription) {
        while let Some(delivery) = sub.next(&self.stop).await {
            match delivery.decode::<TaskResult>() {
                Ok(result) => {
                    let route = result
                        .correlation_id()
                        .and_then(|id| self.routes.get(&id).map(|tx| tx.clone()));
                    match route {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => debug!(
                            agent_id = %self.agent_id,
                            task_id = %result.task_id(),
                            "Result for a finished or unknown plan"
                        ),
                    }
                }
                Err(err) => warn!(agent_id = %self.agent_id, error = %err, "Dropping undecodable result"),
            }
            if let Err(err) = delivery.ack().await {
                warn!(agent_id = %self.agent_id, error = %err, "Failed to ack result");
            }
        }
    }
}

struct RouteGuard<'a> {
    routes: &'a DashMap<CorrelationId, mpsc::UnboundedSender<TaskResult>>,
    correlation_id: CorrelationId,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        self.routes.remove(&self.correlation_id);
    }
}

struct OrchestrateHandler {
    shared: Arc<Shared>,
}

#[async_trait]
impl TaskHandler for OrchestrateHandler {
    fn task_type(&self) -> &str {
        ORCHESTRATE_TASK_TYPE
    }

    async fn execute(&self, ctx: &TaskContext, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        let request: OrchestrationRequest = serde_json::from_value(payload)?;
        let result = self.shared.drive(ctx, request).await?;
        Ok(serde_json::to_value(result)?)
    }
}

pub struct OrchestratorBuilder {
    agent_id: AgentId,
    runtime: RuntimeConfig,
    config: OrchestratorConfig,
    planner: Arc<dyn RequestPlanner>,
    registry: Option<Arc<AgentRegistry>>,
    messaging: Option<Arc<MessagingSubstrate>>,
    checkpoints: Option<Arc<CheckpointManager>>,
    resilience: Option<Arc<ResilienceLayer>>,
}

impl OrchestratorBuilder {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            runtime: RuntimeConfig::default(),
            config: OrchestratorConfig::default(),
            planner: Arc::new(ExplicitPlanner),
            registry: None,
            messaging: None,
            checkpoints: None,
            resilience: None,
        }
    }

    pub fn runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime = config;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn RequestPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
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

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let messaging = self
            .messaging
            .unwrap_or_else(|| MessagingSubstrate::in_process(Default::default()));
        let shared = Arc::new(Shared {
            agent_id: self.agent_id.clone(),
            config: self.config,
            planner: self.planner,
            registry: self.registry,
            messaging: messaging.clone(),
            routes: DashMap::new(),
            stop: CancellationToken::new(),
            listener: Mutex::new(None),
        });

        let mut runtime = AgentRuntime::builder(self.agent_id)
            .config(self.runtime)
            .messaging(messaging)
            .handler(Arc::new(OrchestrateHandler { shared: shared.clone() }));
        if let Some(checkpoints) = self.checkpoints {
            runtime = runtime.checkpoints(checkpoints);
        }
        if let Some(resilience) = self.resilience {
            runtime = runtime.resilience(resilience);
        }

        Ok(Orchestrator {
            runtime: runtime.build()?,
            shared,
        })
    }
}

/// Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: AgentRuntime,
    shared: Arc<Shared>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agent_id", &self.shared.agent_id)
            .field("live_plans", &self.shared.routes.len())
            .finish()
    }
}

impl Orchestrator {
    pub fn builder(agent_id: impl Into<AgentId>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(agent_id)
    }

    /// Wire an orchestrator from a full agent configuration.
    pub async fn from_config(
        agent_id: impl Into<AgentId>,
        config: &AgentConfig,
        registry: Option<Arc<AgentRegistry>>,
    ) -> Result<Self, OrchestratorError> {
        config.validate().map_err(RuntimeError::from)?;
        let resilience = Arc::new(ResilienceLayer::new(config.reliability.clone()));
        let messaging = MessagingSubstrate::connect(config.messaging.clone(), resilience.clone()).await;
        let checkpoints = Arc::new(
            CheckpointManager::open(&config.checkpoint, resilience.clone()).map_err(RuntimeError::from)?,
        );

        let mut builder = OrchestratorBuilder::new(agent_id)
            .runtime_config(config.runtime.clone())
            .config(config.orchestrator.clone())
            .messaging(messaging)
            .checkpoints(checkpoints)
            .resilience(resilience);
        if let Some(registry) = registry {
            builder = builder.registry(registry);
        }
        builder.build()
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.shared.agent_id
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    /// Start the runtime, then listen for sub-task results.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let shared = &self.shared;
        let sub = shared
            .messaging
            .subscribe(
                &subjects::results(&shared.agent_id),
                &subjects::private_consumer(&shared.agent_id),
            )
            .await
            .map_err(RuntimeError::from)?;
        self.runtime.start().await?;
        *shared.listener.lock() = Some(tokio::spawn(shared.clone().results_listener(sub)));
        Ok(())
    }

    /// Validate `request` and admit it as an `orchestrate` task.
    pub fn submit(&self, request: OrchestrationRequest) -> Result<TaskTicket, OrchestratorError> {
        self.shared.validate(&request)?;
        let payload = serde_json::to_value(&request).map_err(|err| PlanError::InvalidRequest {
            reason: err.to_string(),
        })?;
        let origin = request.principal.unwrap_or_else(|| self.shared.agent_id.clone());
        let task = Task::new(ORCHESTRATE_TASK_TYPE, payload, origin)
            .with_priority(TaskPriority::Medium)
            .with_correlation(CorrelationId::new());

        match self.runtime.submit(task) {
            SubmitOutcome::Accepted(ticket) => Ok(ticket),
            SubmitOutcome::Rejected(reason) => Err(OrchestratorError::Rejected(reason)),
        }
    }

    /// Run `request` to completion.
    ///
    /// A plan that fails on a sub-task still returns `Ok` with
    /// [`PlanStatus::Failed`]; `Err` means the plan never ran to an outcome.
    pub async fn execute(&self, request: OrchestrationRequest) -> Result<PlanResult, OrchestratorError> {
        let ticket = self.submit(request)?;
        let result = ticket.wait().await?;
        match result.output() {
            Some(output) if result.is_success() => serde_json::from_value(output.clone())
                .map_err(|err| OrchestratorError::MalformedResult(err.to_string())),
            _ => Err(OrchestratorError::Task(result.error().cloned().unwrap_or_else(|| {
                TaskError::new(TaskErrorKind::DeadlineExceeded, "orchestration task timed out")
            }))),
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.runtime.health()
    }

    /// Number of plans currently being driven.
    pub fn live_plans(&self) -> usize {
        self.shared.routes.len()
    }

    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.runtime.shutdown().await?;
        self.shared.stop.cancel();
        let listener = self.shared.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_policy_wire_names() {
        assert_eq!(serde_json::to_value(FailurePolicy::ContinueBestEffort).unwrap(), json!("continue-best-effort"));
        let parsed: FailurePolicy = serde_json::from_value(json!("abort")).unwrap();
        assert_eq!(parsed, FailurePolicy::Abort);
        assert_eq!(FailurePolicy::default().to_string(), "abort");
    }

    #[test]
    fn test_explicit_planner_reads_subtasks() {
        let request = OrchestrationRequest::explicit(
            "r1",
            vec![SubTaskSpec::new("a", "echo", json!(1)), SubTaskSpec::new("b", "echo", json!(2)).after("a")],
        );
        let specs = ExplicitPlanner.plan(&request).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].depends_on, vec!["a".to_string()]);

        let missing = OrchestrationRequest::new("r2", json!({}));
        assert!(matches!(ExplicitPlanner.plan(&missing), Err(PlanError::InvalidRequest { .. })));
    }

    #[test]
    fn test_request_deadline_uses_humantime() {
        let request: OrchestrationRequest = serde_json::from_value(json!({
            "request_id": "r",
            "deadline": "1m 30s",
            "failure_policy": "continue-best-effort"
        }))
        .unwrap();
        assert_eq!(request.deadline, Some(Duration::from_secs(90)));
        assert_eq!(request.failure_policy, Some(FailurePolicy::ContinueBestEffort));
    }

    #[tokio::test]
    async fn test_invalid_plan_rejected_before_admission() {
        let orchestrator = Orchestrator::builder("orch").build().unwrap();
        orchestrator.start().await.unwrap();

        let cyclic = OrchestrationRequest::explicit(
            "cyclic",
            vec![
                SubTaskSpec::new("a", "echo", json!(null)).after("b"),
                SubTaskSpec::new("b", "echo", json!(null)).after("a"),
            ],
        );
        let err = orchestrator.execute(cyclic).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Plan(PlanError::Cycle { .. })));
        assert_eq!(err.class(), ErrorClass::Plan);
        assert_eq!(orchestrator.health().counters.submitted, 0);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_task_type_rejected_with_registry() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register_remote(AgentId::new("worker"), ["echo"]);
        let orchestrator = Orchestrator::builder("orch")
            .config(OrchestratorConfig {
                require_registered_task_types: true,
                ..Default::default()
            })
            .registry(registry)
            .build()
            .unwrap();

        let request = OrchestrationRequest::explicit("r", vec![SubTaskSpec::new("a", "translate", json!(null))]);
        assert!(matches!(
            orchestrator.submit(request),
            Err(OrchestratorError::Plan(PlanError::NoAgentForTaskType { .. }))
        ));
    }
}
