//! External actions
//!
//! Flows reach the outside world through `ActionExecutor`s registered by name.
//! Executors are stateless; everything about the call arrives in the
//! `ActionContext`. Whatever happens inside an executor (error, panic,
//! timeout) comes back as a failed `ActionResult`, never as an error.

pub mod webhook;

pub use webhook::WebhookExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Structured outcome of an external action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Map::new(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            message: String::new(),
            data: Map::new(),
            error: Some(error),
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// Everything an executor may know about the call
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Fires when the turn that requested the action is superseded
    pub cancel: CancellationToken,
    pub user_id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub answers: Map<String, Value>,
}

impl ActionContext {
    /// The `context` map handed to executors
    pub fn to_value(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "tenant_id": self.tenant_id,
            "session_id": self.session_id,
            "flow_id": self.flow_id,
            "node_id": self.node_id,
            "answers": self.answers,
        })
    }
}

/// An external action the engine can dispatch
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// One line shown to the LLM next to the action name
    fn description(&self) -> String;

    /// JSON schema of the accepted parameters
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    /// Run the action. Long-running executors should watch `ctx.cancel`.
    async fn execute(&self, parameters: Map<String, Value>, ctx: ActionContext) -> ActionResult;
}

/// Executors available to a runtime, keyed by name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    executors: BTreeMap<String, Arc<dyn ActionExecutor>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own name, replacing any previous one
    pub fn register(&mut self, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    #[must_use]
    pub fn with(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// `(name, description, parameters schema)` of every executor
    pub fn catalog(&self) -> Vec<(String, String, Value)> {
        self.executors
            .values()
            .map(|e| (e.name().to_string(), e.description(), e.parameters_schema()))
            .collect()
    }

    /// Dispatch an action with a hard time limit.
    ///
    /// Unknown actions, panics, cancellation and timeouts all produce a failed
    /// result.
    pub async fn execute(
        &self,
        name: &str,
        parameters: Map<String, Value>,
        ctx: ActionContext,
        limit: Duration,
    ) -> ActionResult {
        let Some(executor) = self.executors.get(name).cloned() else {
            tracing::warn!(action = %name, "No executor registered for action");
            return ActionResult::failure(format!("no executor registered for '{name}'"));
        };

        let session_id = ctx.session_id.clone();
        let cancel = ctx.cancel.clone();
        let started = Instant::now();

        // Spawned so a panicking executor cannot take the turn down with it
        let mut handle = tokio::spawn(async move { executor.execute(parameters, ctx).await });

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                handle.abort();
                ActionResult::failure("cancelled")
            }
            joined = tokio::time::timeout(limit, &mut handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => {
                    tracing::error!(action = %name, error = %join_error, "Action executor panicked");
                    ActionResult::failure(format!("executor failed: {join_error}"))
                }
                Err(_) => {
                    handle.abort();
                    ActionResult::failure(format!("timed out after {}ms", limit.as_millis()))
                }
            }
        };

        tracing::info!(
            action = %name,
            session_id = %session_id,
            success = result.success,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error = result.error.as_deref().unwrap_or(""),
            "External action finished"
        );
        result
    }
}
