//! Dependency graph of one orchestration request.

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

use super::FailurePolicy;
use crate::error::{Classify, ErrorClass, TaskError, TaskErrorKind};
use crate::messaging::DeliveryMode;
use crate::task::{CorrelationId, ResultStatus, TaskId, TaskPriority, TaskResult};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanError {
    #[error("plan has no sub-tasks")]
    Empty,

    #[error("sub-task '{subtask}' is defined more than once")]
    DuplicateSubTask { subtask: String },

    #[error("sub-task '{subtask}' depends on unknown sub-task '{dependency}'")]
    UnknownDependency { subtask: String, dependency: String },

    #[error("dependency cycle through sub-task '{subtask}'")]
    Cycle { subtask: String },

    #[error("no registered agent serves task type '{task_type}' of sub-task '{subtask}'")]
    NoAgentForTaskType { subtask: String, task_type: String },

    #[error("plan cannot make progress, pending: {pending:?}")]
    Deadlock { pending: Vec<String> },

    #[error("invalid orchestration request: {reason}")]
    InvalidRequest { reason: String },
}

impl Classify for PlanError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Plan
    }
}

/// One node of a plan as supplied by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    pub key: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Deadline of the published sub-task, independent of the plan deadline
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl SubTaskSpec {
    pub fn new(key: impl Into<String>, task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            task_type: task_type.into(),
            payload,
            depends_on: Vec::new(),
            priority: TaskPriority::default(),
            timeout: None,
        }
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Published,
    Succeeded,
    Failed,
    /// A dependency failed under best-effort
    Skipped,
    /// The plan was aborted first
    Cancelled,
}

impl SubTaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubTaskStatus::Pending | SubTaskStatus::Published)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Succeeded,
    PartiallySucceeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskOutcome {
    pub task_type: String,
    pub status: SubTaskStatus,
    pub task_id: Option<TaskId>,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub duration_ms: Option<u64>,
}

/// First failure that decided the plan outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFailure {
    /// `None` when the plan as a whole was stopped
    pub subtask: Option<String>,
    pub error: TaskError,
}

/// Aggregated response of an orchestration request, keyed by sub-task key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub request_id: String,
    pub correlation_id: CorrelationId,
    pub status: PlanStatus,
    pub subtasks: BTreeMap<String, SubTaskOutcome>,
    pub failure: Option<PlanFailure>,
    pub delivery_mode: DeliveryMode,
    pub completed_at: DateTime<Utc>,
}

impl PlanResult {
    pub fn output(&self, key: &str) -> Option<&serde_json::Value> {
        self.subtasks.get(key).and_then(|s| s.output.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied,
    /// Already terminal or never published; ignored
    Duplicate,
    /// Not part of this plan
    Unknown,
}

#[derive(Debug)]
struct Node {
    spec: SubTaskSpec,
    status: SubTaskStatus,
    task_id: Option<TaskId>,
    output: Option<serde_json::Value>,
    error: Option<TaskError>,
    duration_ms: Option<u64>,
}

#[derive(Debug)]
pub struct OrchestrationPlan {
    request_id: String,
    correlation_id: CorrelationId,
    policy: FailurePolicy,
    /// Edges run dependency → dependent
    graph: DiGraph<Node, ()>,
    by_key: HashMap<String, NodeIndex>,
    by_task: HashMap<TaskId, NodeIndex>,
    order: Vec<NodeIndex>,
    failure: Option<PlanFailure>,
    aborted: bool,
    /// Published sub-tasks abandoned by an abort or the deadline
    abandoned: Vec<TaskId>,
}

impl OrchestrationPlan {
    pub fn build(
        request_id: impl Into<String>,
        correlation_id: CorrelationId,
        policy: FailurePolicy,
        specs: Vec<SubTaskSpec>,
    ) -> Result<Self, PlanError> {
        if specs.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut graph = DiGraph::with_capacity(specs.len(), specs.len());
        let mut by_key = HashMap::with_capacity(specs.len());
        for spec in specs {
            if by_key.contains_key(&spec.key) {
                return Err(PlanError::DuplicateSubTask { subtask: spec.key });
            }
            let key = spec.key.clone();
            let idx = graph.add_node(Node {
                spec,
                status: SubTaskStatus::Pending,
                task_id: None,
                output: None,
                error: None,
                duration_ms: None,
            });
            by_key.insert(key, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            let node = &graph[idx];
            for dependency in &node.spec.depends_on {
                let Some(&dep_idx) = by_key.get(dependency) else {
                    return Err(PlanError::UnknownDependency {
                        subtask: node.spec.key.clone(),
                        dependency: dependency.clone(),
                    });
                };
                edges.push((dep_idx, idx));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let order = toposort(&graph, None).map_err(|cycle| PlanError::Cycle {
            subtask: graph[cycle.node_id()].spec.key.clone(),
        })?;

        Ok(Self {
            request_id: request_id.into(),
            correlation_id,
            policy,
            graph,
            by_key,
            by_task: HashMap::new(),
            order,
            failure: None,
            aborted: false,
            abandoned: Vec::new(),
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn spec(&self, key: &str) -> Option<&SubTaskSpec> {
        self.by_key.get(key).map(|idx| &self.graph[*idx].spec)
    }

    pub fn status(&self, key: &str) -> Option<SubTaskStatus> {
        self.by_key.get(key).map(|idx| self.graph[*idx].status)
    }

    /// Pending sub-tasks whose dependencies all succeeded, in topological order.
    pub fn eligible(&self) -> Vec<String> {
        if self.aborted {
            return Vec::new();
        }
        self.order
            .iter()
            .filter(|idx| self.graph[**idx].status == SubTaskStatus::Pending)
            .filter(|idx| {
                self.graph
                    .neighbors_directed(**idx, Direction::Incoming)
                    .all(|dep| self.graph[dep].status == SubTaskStatus::Succeeded)
            })
            .map(|idx| self.graph[*idx].spec.key.clone())
            .collect()
    }

    pub fn mark_published(&mut self, key: &str, task_id: TaskId) {
        let Some(&idx) = self.by_key.get(key) else {
            return;
        };
        let node = &mut self.graph[idx];
        if node.status == SubTaskStatus::Pending {
            node.status = SubTaskStatus::Published;
            node.task_id = Some(task_id);
            self.by_task.insert(task_id, idx);
        }
    }

    /// A sub-task that could not be published at all.
    pub fn fail_unpublished(&mut self, key: &str, error: TaskError) {
        if let Some(&idx) = self.by_key.get(key) {
            if self.graph[idx].status == SubTaskStatus::Pending {
                self.fail(idx, error);
            }
        }
    }

    pub fn record_result(&mut self, result: &TaskResult) -> RecordOutcome {
        let Some(&idx) = self.by_task.get(&result.task_id()) else {
            return RecordOutcome::Unknown;
        };
        if self.graph[idx].status != SubTaskStatus::Published {
            return RecordOutcome::Duplicate;
        }

        self.graph[idx].duration_ms = Some(result.duration_ms());
        match result.status() {
            ResultStatus::Success => {
                let node = &mut self.graph[idx];
                node.status = SubTaskStatus::Succeeded;
                node.output = result.output().cloned();
            }
            ResultStatus::Failure => {
                let error = result
                    .error()
                    .cloned()
                    .unwrap_or_else(|| TaskError::new(TaskErrorKind::Permanent, "sub-task failed"));
                self.fail(idx, error);
            }
            ResultStatus::Timeout => {
                self.fail(idx, TaskError::new(TaskErrorKind::DeadlineExceeded, "sub-task deadline exceeded"));
            }
        }
        RecordOutcome::Applied
    }

    /// Plan deadline reached: outstanding sub-tasks fail with
    /// `PlanDeadlineExceeded`, everything not yet published is skipped.
    pub fn expire(&mut self) {
        let outstanding: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| self.graph[*idx].status == SubTaskStatus::Published)
            .collect();
        // marked directly: the failure policy must not cascade over nodes
        // this loop still has to visit
        for idx in outstanding {
            let error = TaskError::new(TaskErrorKind::PlanDeadlineExceeded, "plan deadline exceeded");
            let node = &mut self.graph[idx];
            node.status = SubTaskStatus::Failed;
            node.error = Some(error.clone());
            if let Some(task_id) = node.task_id {
                self.abandoned.push(task_id);
            }
            if self.failure.is_none() {
                self.failure = Some(PlanFailure {
                    subtask: Some(node.spec.key.clone()),
                    error,
                });
            }
        }
        let unstarted: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| self.graph[*idx].status == SubTaskStatus::Pending)
            .collect();
        for idx in unstarted {
            if self.failure.is_none() {
                let error = TaskError::new(TaskErrorKind::PlanDeadlineExceeded, "plan deadline exceeded");
                self.failure = Some(PlanFailure {
                    subtask: Some(self.graph[idx].spec.key.clone()),
                    error: error.clone(),
                });
                self.graph[idx].error = Some(error);
            }
            self.graph[idx].status = SubTaskStatus::Skipped;
        }
    }

    /// Stop the plan: nothing further is published and in-flight sub-tasks
    /// are abandoned.
    pub fn abort(&mut self, error: TaskError) {
        if self.failure.is_none() {
            self.failure = Some(PlanFailure { subtask: None, error });
        }
        self.abort_remaining();
    }

    fn abort_remaining(&mut self) {
        self.aborted = true;
        for idx in self.graph.node_indices() {
            let node = &mut self.graph[idx];
            match node.status {
                SubTaskStatus::Pending => node.status = SubTaskStatus::Cancelled,
                SubTaskStatus::Published => {
                    node.status = SubTaskStatus::Cancelled;
                    if let Some(task_id) = node.task_id {
                        self.abandoned.push(task_id);
                    }
                }
                _ => {}
            }
        }
    }

    fn fail(&mut self, idx: NodeIndex, error: TaskError) {
        let key = self.graph[idx].spec.key.clone();
        {
            let node = &mut self.graph[idx];
            node.status = SubTaskStatus::Failed;
            node.error = Some(error.clone());
        }
        if self.failure.is_none() {
            self.failure = Some(PlanFailure {
                subtask: Some(key.clone()),
                error,
            });
        }

        match self.policy {
            FailurePolicy::Abort => self.abort_remaining(),
            FailurePolicy::ContinueBestEffort => {
                let mut dfs = Dfs::new(&self.graph, idx);
                while let Some(dependent) = dfs.next(&self.graph) {
                    if dependent == idx {
                        continue;
                    }
                    let node = &mut self.graph[dependent];
                    if node.status == SubTaskStatus::Pending {
                        node.status = SubTaskStatus::Skipped;
                        node.error = Some(TaskError::new(
                            TaskErrorKind::UnmetDependency,
                            format!("dependency '{key}' did not succeed"),
                        ));
                    }
                }
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.aborted || self.graph.node_weights().all(|n| n.status.is_terminal())
    }

    /// Not terminal, yet nothing in flight and nothing publishable.
    pub fn is_stalled(&self) -> bool {
        !self.is_terminal() && self.in_flight().is_empty() && self.eligible().is_empty()
    }

    pub fn pending(&self) -> Vec<String> {
        self.graph
            .node_weights()
            .filter(|n| n.status == SubTaskStatus::Pending)
            .map(|n| n.spec.key.clone())
            .collect()
    }

    pub fn in_flight(&self) -> Vec<TaskId> {
        self.graph
            .node_weights()
            .filter(|n| n.status == SubTaskStatus::Published)
            .filter_map(|n| n.task_id)
            .collect()
    }

    /// Published sub-tasks left behind by an abort or the deadline, drained.
    pub fn take_abandoned(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.abandoned)
    }

    pub fn outcome(&self, delivery_mode: DeliveryMode) -> PlanResult {
        let succeeded = self
            .graph
            .node_weights()
            .filter(|n| n.status == SubTaskStatus::Succeeded)
            .count();
        let status = if succeeded == self.graph.node_count() {
            PlanStatus::Succeeded
        } else if self.policy == FailurePolicy::ContinueBestEffort && !self.aborted && succeeded > 0 {
            PlanStatus::PartiallySucceeded
        } else {
            PlanStatus::Failed
        };

        let subtasks = self
            .graph
            .node_weights()
            .map(|n| {
                (
                    n.spec.key.clone(),
                    SubTaskOutcome {
                        task_type: n.spec.task_type.clone(),
                        status: n.status,
                        task_id: n.task_id,
                        output: n.output.clone(),
                        error: n.error.clone(),
                        duration_ms: n.duration_ms,
                    },
                )
            })
            .collect();

        PlanResult {
            request_id: self.request_id.clone(),
            correlation_id: self.correlation_id,
            status,
            subtasks,
            failure: self.failure.clone(),
            delivery_mode,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AgentId, Task};
    use serde_json::json;

    fn spec(key: &str, deps: &[&str]) -> SubTaskSpec {
        let mut s = SubTaskSpec::new(key, "work", json!({ "key": key }));
        s.depends_on = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    fn plan(policy: FailurePolicy, specs: Vec<SubTaskSpec>) -> OrchestrationPlan {
        OrchestrationPlan::build("req", CorrelationId::new(), policy, specs).unwrap()
    }

    /// Publish `key` and return the task that stands for it.
    fn publish(plan: &mut OrchestrationPlan, key: &str) -> Task {
        let task = Task::new("work", json!({}), AgentId::new("orch"));
        plan.mark_published(key, task.id);
        task
    }

    fn agent() -> AgentId {
        AgentId::new("worker")
    }

    #[test]
    fn test_build_rejects_invalid_graphs() {
        let build = |specs| OrchestrationPlan::build("r", CorrelationId::new(), FailurePolicy::Abort, specs);
        assert_eq!(build(vec![]).unwrap_err(), PlanError::Empty);
        assert!(matches!(
            build(vec![spec("a", &[]), spec("a", &[])]).unwrap_err(),
            PlanError::DuplicateSubTask { .. }
        ));
        assert_eq!(
            build(vec![spec("a", &["ghost"])]).unwrap_err(),
            PlanError::UnknownDependency {
                subtask: "a".into(),
                dependency: "ghost".into()
            }
        );
        assert!(matches!(
            build(vec![spec("a", &["c"]), spec("b", &["a"]), spec("c", &["b"])]).unwrap_err(),
            PlanError::Cycle { .. }
        ));
        assert!(matches!(build(vec![spec("a", &["a"])]).unwrap_err(), PlanError::Cycle { .. }));
    }

    #[test]
    fn test_dependents_become_eligible_after_success() {
        let mut p = plan(FailurePolicy::Abort, vec![spec("b", &["a"]), spec("a", &[]), spec("c", &["a", "b"])]);
        assert_eq!(p.eligible(), vec!["a".to_string()]);

        let a = publish(&mut p, "a");
        assert!(p.eligible().is_empty());
        assert_eq!(
            p.record_result(&TaskResult::success(&a, &agent(), json!(1), Duration::ZERO)),
            RecordOutcome::Applied
        );
        assert_eq!(p.eligible(), vec!["b".to_string()]);

        let b = publish(&mut p, "b");
        p.record_result(&TaskResult::success(&b, &agent(), json!(2), Duration::ZERO));
        let c = publish(&mut p, "c");
        p.record_result(&TaskResult::success(&c, &agent(), json!(3), Duration::ZERO));

        assert!(p.is_terminal());
        let outcome = p.outcome(DeliveryMode::Durable);
        assert_eq!(outcome.status, PlanStatus::Succeeded);
        assert_eq!(outcome.output("c"), Some(&json!(3)));
    }

    #[test]
    fn test_abort_policy_stops_dependents() {
        let mut p = plan(FailurePolicy::Abort, vec![spec("a", &[]), spec("b", &["a"]), spec("x", &[])]);
        let a = publish(&mut p, "a");
        let x = publish(&mut p, "x");
        let err = TaskError::new(TaskErrorKind::Permanent, "bad input");
        p.record_result(&TaskResult::failure(&a, &agent(), err.clone(), Duration::ZERO));

        assert!(p.is_terminal());
        assert!(p.eligible().is_empty());
        assert_eq!(p.status("b"), Some(SubTaskStatus::Cancelled));
        assert_eq!(p.take_abandoned(), vec![x.id]);

        let outcome = p.outcome(DeliveryMode::Durable);
        assert_eq!(outcome.status, PlanStatus::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.subtask.as_deref(), Some("a"));
        assert_eq!(failure.error, err);
    }

    #[test]
    fn test_best_effort_skips_only_the_failed_branch() {
        let mut p = plan(
            FailurePolicy::ContinueBestEffort,
            vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["b"]), spec("x", &[])],
        );
        let a = publish(&mut p, "a");
        let x = publish(&mut p, "x");
        p.record_result(&TaskResult::timeout(&a, &agent(), Duration::ZERO));
        assert_eq!(p.status("b"), Some(SubTaskStatus::Skipped));
        assert_eq!(p.status("c"), Some(SubTaskStatus::Skipped));
        assert!(!p.is_terminal());

        p.record_result(&TaskResult::success(&x, &agent(), json!("done"), Duration::ZERO));
        assert!(p.is_terminal());
        let outcome = p.outcome(DeliveryMode::BestEffort);
        assert_eq!(outcome.status, PlanStatus::PartiallySucceeded);
        assert_eq!(outcome.subtasks["a"].error.as_ref().unwrap().kind, TaskErrorKind::DeadlineExceeded);
        assert_eq!(outcome.delivery_mode, DeliveryMode::BestEffort);
    }

    #[test]
    fn test_duplicate_and_unknown_results_ignored() {
        let mut p = plan(FailurePolicy::Abort, vec![spec("a", &[]), spec("b", &[])]);
        let a = publish(&mut p, "a");
        let ok = TaskResult::success(&a, &agent(), json!(1), Duration::ZERO);
        assert_eq!(p.record_result(&ok), RecordOutcome::Applied);
        assert_eq!(p.record_result(&ok), RecordOutcome::Duplicate);

        let stranger = Task::new("work", json!({}), agent());
        let other = TaskResult::success(&stranger, &agent(), json!(1), Duration::ZERO);
        assert_eq!(p.record_result(&other), RecordOutcome::Unknown);
    }

    #[test]
    fn test_expire_fails_outstanding_with_plan_deadline() {
        let mut p = plan(FailurePolicy::ContinueBestEffort, vec![spec("a", &[]), spec("b", &["a"])]);
        let a = publish(&mut p, "a");
        p.expire();

        assert!(p.is_terminal());
        assert_eq!(p.take_abandoned(), vec![a.id]);
        let outcome = p.outcome(DeliveryMode::Durable);
        assert_eq!(outcome.status, PlanStatus::Failed);
        assert_eq!(outcome.failure.unwrap().error.kind, TaskErrorKind::PlanDeadlineExceeded);
        assert_eq!(outcome.subtasks["b"].status, SubTaskStatus::Skipped);
    }

    #[test]
    fn test_expire_under_abort_abandons_each_subtask_once() {
        let mut p = plan(
            FailurePolicy::Abort,
            vec![spec("a", &[]), spec("b", &[]), spec("c", &[]), spec("d", &["a"])],
        );
        let a = publish(&mut p, "a");
        let b = publish(&mut p, "b");
        let c = publish(&mut p, "c");
        p.expire();

        let mut abandoned = p.take_abandoned();
        abandoned.sort_by_key(|id| id.to_string());
        let mut expected = vec![a.id, b.id, c.id];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(abandoned, expected);

        let outcome = p.outcome(DeliveryMode::Durable);
        for key in ["a", "b", "c"] {
            assert_eq!(outcome.subtasks[key].status, SubTaskStatus::Failed);
            assert_eq!(
                outcome.subtasks[key].error.as_ref().map(|e| e.kind),
                Some(TaskErrorKind::PlanDeadlineExceeded)
            );
        }
        assert_eq!(outcome.subtasks["d"].status, SubTaskStatus::Skipped);
    }

    #[test]
    fn test_spec_parses_with_humantime_timeout() {
        let spec: SubTaskSpec = serde_json::from_value(json!({
            "key": "fetch",
            "task_type": "http",
            "depends_on": ["auth"],
            "timeout": "2s"
        }))
        .unwrap();
        assert_eq!(spec.timeout, Some(Duration::from_secs(2)));
        assert_eq!(spec.priority, TaskPriority::Medium);
    }
}
