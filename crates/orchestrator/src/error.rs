//! Error taxonomy shared by every layer.
//!
//! Each concrete error type maps onto an [`ErrorClass`]. The resilience layer
//! only retries [`ErrorClass::Transient`]; everything else is handed back to
//! the caller on the first occurrence.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network blips, broker unavailable, timeouts. Retried with backoff.
    Transient,
    /// Validation failures, unknown task types. Never retried.
    Permanent,
    /// Queue full or draining. Surfaced to the caller without retry.
    Capacity,
    /// Checkpoint load/save failed. Never fatal to task processing.
    Recovery,
    /// Invalid plan or unrecoverable plan execution.
    Plan,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Capacity => "capacity",
            ErrorClass::Recovery => "recovery",
            ErrorClass::Plan => "plan",
        };
        f.write_str(s)
    }
}

/// Implemented by every error the runtime can observe.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Kind of a task level failure carried inside a `TaskResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Transient,
    Permanent,
    InvalidPayload,
    QueueTimeout,
    DeadlineExceeded,
    Cancelled,
    Panicked,
    PlanDeadlineExceeded,
    UnmetDependency,
    PublishFailed,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskErrorKind::Transient => "transient",
            TaskErrorKind::Permanent => "permanent",
            TaskErrorKind::InvalidPayload => "invalid_payload",
            TaskErrorKind::QueueTimeout => "queue_timeout",
            TaskErrorKind::DeadlineExceeded => "deadline_exceeded",
            TaskErrorKind::Cancelled => "cancelled",
            TaskErrorKind::Panicked => "panicked",
            TaskErrorKind::PlanDeadlineExceeded => "plan_deadline_exceeded",
            TaskErrorKind::UnmetDependency => "unmet_dependency",
            TaskErrorKind::PublishFailed => "publish_failed",
        };
        f.write_str(s)
    }
}

/// Structured failure detail of a task. Serializable so it can cross the
/// messaging substrate inside a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Classify for TaskError {
    fn class(&self) -> ErrorClass {
        match self.kind {
            TaskErrorKind::Transient | TaskErrorKind::DeadlineExceeded => ErrorClass::Transient,
            TaskErrorKind::QueueTimeout => ErrorClass::Capacity,
            TaskErrorKind::PlanDeadlineExceeded | TaskErrorKind::UnmetDependency => {
                ErrorClass::Plan
            }
            TaskErrorKind::PublishFailed => ErrorClass::Transient,
            TaskErrorKind::Permanent
            | TaskErrorKind::InvalidPayload
            | TaskErrorKind::Cancelled
            | TaskErrorKind::Panicked => ErrorClass::Permanent,
        }
    }
}

/// Error returned by a task handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("task cancelled")]
    Cancelled,
}

impl Classify for HandlerError {
    fn class(&self) -> ErrorClass {
        match self {
            HandlerError::Transient(_) => ErrorClass::Transient,
            HandlerError::Permanent(_) | HandlerError::InvalidPayload(_) | HandlerError::Cancelled => {
                ErrorClass::Permanent
            }
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

impl From<HandlerError> for TaskError {
    fn from(err: HandlerError) -> Self {
        let kind = match &err {
            HandlerError::Transient(_) => TaskErrorKind::Transient,
            HandlerError::Permanent(_) => TaskErrorKind::Permanent,
            HandlerError::InvalidPayload(_) => TaskErrorKind::InvalidPayload,
            HandlerError::Cancelled => TaskErrorKind::Cancelled,
        };
        TaskError::new(kind, err.to_string())
    }
}
