//! Capability registry and invocation.
//!
//! A capability is an external callable named by `Step::tool`. Failures must
//! be reported through `Err`, never through a partial result.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use waypoint_core::types::TaskId;

use crate::cancel::CancellationToken;

/// Capability invocation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// Capability not registered.
    #[error("Capability not found: {0}")]
    NotFound(String),

    /// Invalid parameters.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Execution failed, optionally with an error code (e.g. `ECONNRESET`).
    #[error("{message}")]
    Failed {
        /// Error message.
        message: String,
        /// Machine-readable error code.
        code: Option<String>,
    },
}

impl CapabilityError {
    /// A failure without an error code.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            code: None,
        }
    }

    /// A failure carrying an error code.
    #[must_use]
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// The error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Failed { code, .. } => code.as_deref(),
            Self::NotFound(_) | Self::InvalidParams(_) => None,
        }
    }
}

/// Context handed to a capability invocation.
#[derive(Debug, Clone, Default)]
pub struct CapabilityContext {
    /// Task the step belongs to.
    pub task_id: Option<TaskId>,
    /// Index of the step in the current plan.
    pub step_index: usize,
    /// Results of earlier successful steps in this attempt, by step index.
    pub previous: Vec<Option<serde_json::Value>>,
    /// Caller-supplied values (e.g. `target_path`).
    pub values: serde_json::Map<String, serde_json::Value>,
    /// Cancellation token of the task.
    pub cancellation: CancellationToken,
}

impl CapabilityContext {
    /// Create a context for a task.
    #[must_use]
    pub fn new(task_id: TaskId, cancellation: CancellationToken) -> Self {
        Self {
            task_id: Some(task_id),
            cancellation,
            ..Self::default()
        }
    }

    /// Set a context value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Get a context value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Result of the step immediately before this one.
    #[must_use]
    pub fn previous_result(&self) -> Option<&serde_json::Value> {
        self.step_index
            .checked_sub(1)
            .and_then(|i| self.previous.get(i))
            .and_then(Option::as_ref)
    }
}

/// Trait for implementing capabilities.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Capability id.
    fn name(&self) -> &str;

    /// Capability description.
    fn description(&self) -> &str;

    /// Whether the capability writes the file named by its params.
    fn mutates_files(&self) -> bool {
        false
    }

    /// Invoke the capability.
    async fn invoke(
        &self,
        params: &serde_json::Value,
        ctx: &CapabilityContext,
    ) -> Result<serde_json::Value, CapabilityError>;
}

/// Registry of available capabilities.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in capabilities.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register a capability, replacing any with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    /// Get a capability by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    /// List all capability names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke a capability by name.
    ///
    /// # Errors
    ///
    /// Returns error if the capability is not found or its invocation fails.
    pub async fn invoke(
        &self,
        name: &str,
        params: &serde_json::Value,
        ctx: &CapabilityContext,
    ) -> Result<serde_json::Value, CapabilityError> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
        capability.invoke(params, ctx).await
    }
}
