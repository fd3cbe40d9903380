//! Task and result types exchanged between agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::TaskError;

/// Unique identifier of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ties the sub-tasks of one orchestration plan together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable name of an agent runtime instance. Also used as the opaque
/// principal of tasks it originates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Task priority levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
    Critical = 3,
}

/// Where a task is in its own lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet admitted by any runtime
    #[default]
    Pending,
    Queued,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Executing => "executing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Unit of work routed to a handler by its `task_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub originating_agent_id: AgentId,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    /// Subject the result is published to, if any
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Task {
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        originating_agent_id: AgentId,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            priority: TaskPriority::default(),
            payload,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            deadline: None,
            originating_agent_id,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now. Durations chrono cannot represent are ignored.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(delta) = chrono::Duration::from_std(timeout) {
            self.deadline = Utc::now().checked_add_signed(delta);
        }
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, subject: impl Into<String>) -> Self {
        self.reply_to = Some(subject.into());
        self
    }

    /// Time left until the deadline. `Some(ZERO)` once it has passed.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

/// Terminal outcome reported by the executing runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Timeout,
}

impl From<ResultStatus> for TaskStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Success => TaskStatus::Succeeded,
            ResultStatus::Failure => TaskStatus::Failed,
            ResultStatus::Timeout => TaskStatus::TimedOut,
        }
    }
}

/// Immutable result of a task. Built through the constructors so `error` is
/// present exactly when `status` is `Failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    task_id: TaskId,
    correlation_id: Option<CorrelationId>,
    agent_id: AgentId,
    status: ResultStatus,
    output: Option<serde_json::Value>,
    error: Option<TaskError>,
    duration_ms: u64,
    completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task: &Task, agent_id: &AgentId, output: serde_json::Value, duration: Duration) -> Self {
        Self::build(task, agent_id, ResultStatus::Success, Some(output), None, duration)
    }

    pub fn failure(task: &Task, agent_id: &AgentId, error: TaskError, duration: Duration) -> Self {
        Self::build(task, agent_id, ResultStatus::Failure, None, Some(error), duration)
    }

    pub fn timeout(task: &Task, agent_id: &AgentId, duration: Duration) -> Self {
        Self::build(task, agent_id, ResultStatus::Timeout, None, None, duration)
    }

    fn build(
        task: &Task,
        agent_id: &AgentId,
        status: ResultStatus,
        output: Option<serde_json::Value>,
        error: Option<TaskError>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task.id,
            correlation_id: task.correlation_id,
            agent_id: agent_id.clone(),
            status,
            output,
            error,
            duration_ms: duration.as_millis() as u64,
            completed_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskErrorKind;
    use serde_json::json;

    #[test]
    fn test_task_builder() {
        let correlation = CorrelationId::new();
        let task = Task::new("summarize", json!({"text": "hi"}), AgentId::new("planner"))
            .with_priority(TaskPriority::High)
            .with_correlation(correlation)
            .with_reply_to("results.planner")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.correlation_id, Some(correlation));
        let remaining = task.time_remaining().expect("deadline set");
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(3));
    }

    #[test]
    fn test_expired_deadline_reports_zero() {
        let task = Task::new("noop", json!(null), AgentId::new("a"))
            .with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(task.time_remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_result_error_only_on_failure() {
        let task = Task::new("noop", json!(null), AgentId::new("a"));
        let agent = AgentId::new("worker");

        let ok = TaskResult::success(&task, &agent, json!(1), Duration::from_millis(3));
        assert!(ok.error().is_none());
        assert_eq!(ok.output(), Some(&json!(1)));

        let failed = TaskResult::failure(
            &task,
            &agent,
            TaskError::new(TaskErrorKind::Permanent, "boom"),
            Duration::ZERO,
        );
        assert_eq!(TaskStatus::from(failed.status()), TaskStatus::Failed);
        assert!(failed.output().is_none());
        assert!(failed.error().is_some());

        let timed_out = TaskResult::timeout(&task, &agent, Duration::ZERO);
        assert!(timed_out.error().is_none());
        assert_eq!(TaskStatus::from(timed_out.status()), TaskStatus::TimedOut);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }
}
