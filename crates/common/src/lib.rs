//! Shared plumbing for the agent runtime crates: logging bootstrap and
//! environment helpers used by the configuration loaders.

pub mod env;
pub mod structured_logging;

pub use structured_logging::{
    init_structured_logging, init_test_logging, ExecutionContext, JsonFormatter, LoggingConfig,
    OperationTimer, StructuredLogEntry,
};
