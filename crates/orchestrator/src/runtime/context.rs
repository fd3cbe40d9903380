//! Per-execution context and the cooperative cancellation flag behind it.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::task::{CorrelationId, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    Deadline,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::User => "user",
            CancelReason::Deadline => "deadline",
            CancelReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Active,
    CancelRequested(CancelReason),
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelRequest {
    Requested,
    AlreadyRequested,
    AlreadyCommitted,
}

/// Shared between the runtime and the running handler. Once committed, a
/// cancellation request is refused; once a cancellation is requested, the
/// handler can no longer commit.
#[derive(Debug)]
pub(crate) struct TaskControl {
    state: Mutex<ControlState>,
    token: CancellationToken,
}

impl TaskControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlState::Active),
            token: CancellationToken::new(),
        })
    }

    pub(crate) fn request_cancel(&self, reason: CancelReason) -> CancelRequest {
        let mut state = self.state.lock();
        match *state {
            ControlState::Committed => CancelRequest::AlreadyCommitted,
            ControlState::CancelRequested(_) => CancelRequest::AlreadyRequested,
            ControlState::Active => {
                *state = ControlState::CancelRequested(reason);
                self.token.cancel();
                CancelRequest::Requested
            }
        }
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        match *self.state.lock() {
            ControlState::CancelRequested(reason) => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn is_committed(&self) -> bool {
        *self.state.lock() == ControlState::Committed
    }

    fn commit(&self) -> Result<(), CancelReason> {
        let mut state = self.state.lock();
        match *state {
            ControlState::CancelRequested(reason) => Err(reason),
            _ => {
                *state = ControlState::Committed;
                Ok(())
            }
        }
    }
}

/// Handed to [`TaskHandler::execute`](super::TaskHandler::execute).
///
/// Cancellation is cooperative: handlers call [`checkpoint`](Self::checkpoint)
/// at safe points and [`commit`](Self::commit) right before an effect that must
/// not be abandoned halfway.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: String,
    correlation_id: Option<CorrelationId>,
    deadline: Option<Instant>,
    attempt: u32,
    control: Arc<TaskControl>,
}

impl TaskContext {
    pub(crate) fn new(task: &Task, attempt: u32, control: Arc<TaskControl>) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            correlation_id: task.correlation_id,
            deadline: task.time_remaining().map(|left| Instant::now() + left),
            attempt,
            control,
        }
    }

    /// Context with its own control, for driving a handler outside a runtime.
    pub fn detached(task: &Task) -> Self {
        Self::new(task, 1, TaskControl::new())
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Delivery attempt, 1 for the first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time left until the task deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.cancel_reason().is_some()
    }

    /// `Err(Cancelled)` once a cancellation was requested and the task has not
    /// committed.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Passes the commit point. Fails if cancellation won the race.
    pub fn commit(&self) -> Result<(), HandlerError> {
        self.control.commit().map_err(|_| HandlerError::Cancelled)
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.control.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AgentId;
    use serde_json::json;

    fn task() -> Task {
        Task::new("t", json!({}), AgentId::new("tester"))
    }

    #[test]
    fn test_cancel_before_commit() {
        let control = TaskControl::new();
        let ctx = TaskContext::new(&task(), 1, control.clone());
        assert!(ctx.checkpoint().is_ok());

        assert_eq!(control.request_cancel(CancelReason::User), CancelRequest::Requested);
        assert!(matches!(ctx.checkpoint(), Err(HandlerError::Cancelled)));
        assert!(ctx.commit().is_err());
        assert_eq!(control.request_cancel(CancelReason::Deadline), CancelRequest::AlreadyRequested);
        assert_eq!(control.cancel_reason(), Some(CancelReason::User));
    }

    #[test]
    fn test_commit_blocks_cancel() {
        let control = TaskControl::new();
        let ctx = TaskContext::new(&task(), 1, control.clone());
        ctx.commit().unwrap();
        assert_eq!(control.request_cancel(CancelReason::User), CancelRequest::AlreadyCommitted);
        assert!(ctx.checkpoint().is_ok());
        assert!(control.is_committed());
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let control = TaskControl::new();
        let ctx = TaskContext::new(&task(), 1, control.clone());
        let waiter = tokio::spawn(async move { ctx.cancelled().await });
        control.request_cancel(CancelReason::Shutdown);
        waiter.await.unwrap();
    }

    #[test]
    fn test_remaining_follows_deadline() {
        let t = task().with_timeout(Duration::from_secs(10));
        let ctx = TaskContext::detached(&t);
        let left = ctx.remaining().unwrap();
        assert!(left <= Duration::from_secs(10) && left > Duration::from_secs(8));
        assert!(TaskContext::detached(&task()).remaining().is_none());
    }
}
