//! Agent runtime and orchestration substrate.
//!
//! The crate hosts long-lived agent runtimes that pull typed tasks from a
//! durable pub/sub substrate, execute them under admission control, checkpoint
//! their state, and report results. An orchestrator is a runtime whose
//! `orchestrate` handler decomposes a request into a dependency graph of
//! sub-tasks and fans them out to other runtimes.
//!
//! # Layers
//!
//! - [`reliability`]: circuit breaker, retry with backoff and jitter
//! - [`messaging`]: durable pub/sub with an in-process fallback
//! - [`checkpoint`]: atomic snapshot persistence
//! - [`runtime`]: lifecycle, admission, cancellation, health
//! - [`orchestration`]: plan graph, dispatch, aggregation
//! - [`registry`]: explicit directory of known agents
//!
//! # Usage
//!
//! ```no_run
//! use orchestrator::{AgentRuntime, Orchestrator, OrchestrationRequest, SubTaskSpec};
//! use serde_json::json;
//!
//! # async fn run(worker: AgentRuntime) -> anyhow::Result<()> {
//! worker.start().await?;
//!
//! let orchestrator = Orchestrator::builder("planner")
//!     .messaging(worker.messaging().clone())
//!     .build()?;
//! orchestrator.start().await?;
//!
//! let request = OrchestrationRequest::explicit(
//!     "req-1",
//!     vec![
//!         SubTaskSpec::new("fetch", "http", json!({"url": "https://example.com"})),
//!         SubTaskSpec::new("sum", "summarize", json!({})).after("fetch"),
//!     ],
//! );
//! let result = orchestrator.execute(request).await?;
//! println!("{:?}", result.status);
//!
//! orchestrator.shutdown().await?;
//! worker.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod messaging;
pub mod orchestration;
pub mod registry;
pub mod reliability;
pub mod runtime;
pub mod task;

pub use checkpoint::{AgentState, CheckpointError, CheckpointManager, CheckpointStore};
pub use config::{AgentConfig, CheckpointConfig, ConfigError, MessagingConfig, OrchestratorConfig, RuntimeConfig};
pub use error::{Classify, ErrorClass, HandlerError, TaskError, TaskErrorKind};
pub use messaging::{DeliveryMode, MessagingError, MessagingSubstrate};
pub use orchestration::{
    FailurePolicy, OrchestrationRequest, Orchestrator, OrchestratorError, PlanError, PlanResult, PlanStatus,
    RequestPlanner, SubTaskSpec,
};
pub use registry::{AgentRegistry, AggregatedHealth, HealthSource};
pub use reliability::{ResilienceConfig, ResilienceError, ResilienceLayer};
pub use runtime::{
    AgentRuntime, CancelOutcome, LifecycleState, RejectReason, RuntimeError, RuntimeHealth, SubmitOutcome,
    TaskContext, TaskHandler, TaskTicket,
};
pub use task::{AgentId, CorrelationId, Task, TaskId, TaskPriority, TaskResult};

use thiserror::Error;

/// Any error the crate's public operations can return.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Registry(#[from] registry::AgentRegistryError),
}

impl Classify for OrchestrationError {
    fn class(&self) -> ErrorClass {
        match self {
            OrchestrationError::Config(e) => e.class(),
            OrchestrationError::Messaging(e) => e.class(),
            OrchestrationError::Checkpoint(e) => e.class(),
            OrchestrationError::Runtime(e) => e.class(),
            OrchestrationError::Orchestrator(e) => e.class(),
            OrchestrationError::Registry(_) => ErrorClass::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
