use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::Payload;

/// Error returned by a task handler. Becomes the `error` of a failed outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("missing {0}")]
    MissingField(String),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Something that can execute one type of task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: Payload) -> HandlerResult;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: Payload) -> HandlerResult {
        (self.f)(payload).await
    }
}

/// Mapping from task type to handler. Built once at startup; read-only after
/// [`HandlerRegistryBuilder::build`].
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
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

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler. A later registration for the same type replaces the
    /// earlier one.
    pub fn handler(mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        let task_type = task_type.into();
        if self
            .handlers
            .insert(task_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::warn!(task_type = %task_type, "Handler replaced");
        }
        self
    }

    /// Register an async closure as a handler.
    pub fn handler_fn<F, Fut>(self, task_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(task_type, FnHandler { f })
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}
