//! Task handlers and the startup-time registry resolving task types to them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::context::TaskContext;
use crate::error::HandlerError;

/// Executes one task type.
///
/// Handlers are shared between concurrent executions; any mutable state lives
/// behind the handler's own synchronization. That state is the slice handed to
/// the checkpoint manager through [`TaskHandler::snapshot_state`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    async fn execute(
        &self,
        ctx: &TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;

    fn snapshot_state(&self) -> Option<serde_json::Value> {
        None
    }

    fn restore_state(&self, _state: serde_json::Value) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler for task type '{0}' already registered")]
    Duplicate(String),

    #[error("task type must not be empty")]
    EmptyTaskType,
}

/// Task type → handler map, frozen once the runtime is built.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let task_type = handler.task_type().to_string();
        if task_type.is_empty() {
            return Err(RegistryError::EmptyTaskType);
        }
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::Duplicate(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn with(mut self, handler: Arc<dyn TaskHandler>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn TaskHandler>)> {
        self.handlers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl TaskHandler for Echo {
        fn task_type(&self) -> &str {
            self.0
        }

        async fn execute(
            &self,
            _ctx: &TaskContext,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(payload)
        }
    }

    #[test]
    fn test_duplicate_task_type_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Echo("echo"))).unwrap();
        assert_eq!(
            registry.register(Arc::new(Echo("echo"))),
            Err(RegistryError::Duplicate("echo".into()))
        );
        assert_eq!(registry.register(Arc::new(Echo(""))), Err(RegistryError::EmptyTaskType));
    }

    #[test]
    fn test_task_types_sorted() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Echo("b")))
            .and_then(|r| r.with(Arc::new(Echo("a"))))
            .unwrap();
        assert_eq!(registry.task_types(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.get("a").is_some());
        assert!(!registry.contains("c"));
    }
}
