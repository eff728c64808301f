//! Action and condition-evaluator registries.
//!
//! An action is the named, pluggable behavior a step invokes: a stable
//! string key mapped to an async callable that performs the real work given
//! resolved parameters and an execution context. Condition evaluators are
//! the predicate counterpart, dispatched by name from `custom` conditions.
//!
//! Registries are constructor-injected into the orchestrator -- never
//! ambient global state -- so multiple independently configured engines can
//! coexist in one process.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors an action invocation can produce.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// No action registered under the requested name.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The action rejected its resolved parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The action ran and failed.
    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Context handed to an action alongside its resolved parameters.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The workflow being executed.
    pub workflow_id: Uuid,
    /// The step invoking the action.
    pub step_id: String,
    /// Merged execution-time variables: workflow params, caller-supplied
    /// context, and prior step results keyed by step ID.
    pub vars: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Action trait
// ---------------------------------------------------------------------------

/// A pluggable unit of behavior invoked by name.
///
/// Returns a boxed future so the registry can hold `Arc<dyn Action>` trait
/// objects; implementors typically `Box::pin(async move { .. })`.
pub trait Action: Send + Sync {
    /// Perform the step's work with fully resolved parameters.
    fn execute(
        &self,
        params: Value,
        ctx: ActionContext,
    ) -> BoxFuture<'_, Result<Map<String, Value>, ActionError>>;
}

/// Adapter implementing `Action` for plain async closures.
struct FnAction<F>(F);

impl<F> Action for FnAction<F>
where
    F: Fn(Value, ActionContext) -> BoxFuture<'static, Result<Map<String, Value>, ActionError>>
        + Send
        + Sync,
{
    fn execute(
        &self,
        params: Value,
        ctx: ActionContext,
    ) -> BoxFuture<'_, Result<Map<String, Value>, ActionError>> {
        (self.0)(params, ctx)
    }
}

// ---------------------------------------------------------------------------
// Condition evaluator trait
// ---------------------------------------------------------------------------

/// A named predicate dispatched from `custom` conditions.
///
/// Receives the condition's own `params` payload and the full results map;
/// returns whether the gated step may execute.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, def: &Value, results: &Map<String, Value>) -> bool;
}

impl<F> ConditionEvaluator for F
where
    F: Fn(&Value, &Map<String, Value>) -> bool + Send + Sync,
{
    fn evaluate(&self, def: &Value, results: &Map<String, Value>) -> bool {
        self(def, results)
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Maps action names to callables and evaluator names to predicates.
///
/// Pure lookup table, no behavior of its own. Read-mostly and shared across
/// all workflows; `DashMap` supports concurrent lookup while still allowing
/// dynamic registration at runtime.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<String, Arc<dyn Action>>,
    evaluators: DashMap<String, Arc<dyn ConditionEvaluator>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under a name. A later registration under the same
    /// name replaces the earlier one.
    pub fn register(&self, name: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.insert(name.into(), action);
    }

    /// Register an async closure as an action.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, ActionContext) -> BoxFuture<'static, Result<Map<String, Value>, ActionError>>
            + Send
            + Sync
            + 'static,
    {
        self.actions.insert(name.into(), Arc::new(FnAction(f)));
    }

    /// Look up an action by name.
    pub fn action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).map(|entry| entry.value().clone())
    }

    /// All registered action names.
    pub fn action_names(&self) -> Vec<String> {
        self.actions.iter().map(|e| e.key().clone()).collect()
    }

    /// Register a condition evaluator under a name.
    pub fn register_evaluator(
        &self,
        name: impl Into<String>,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) {
        self.evaluators.insert(name.into(), evaluator);
    }

    /// Register a plain closure as a condition evaluator.
    pub fn register_evaluator_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.evaluators.insert(name.into(), Arc::new(f));
    }

    /// Look up a condition evaluator by name.
    pub fn evaluator(&self, name: &str) -> Option<Arc<dyn ConditionEvaluator>> {
        self.evaluators.get(name).map(|entry| entry.value().clone())
    }

    /// Whether an evaluator is registered under the given name.
    pub fn has_evaluator(&self, name: &str) -> bool {
        self.evaluators.contains_key(name)
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.len())
            .field("evaluators", &self.evaluators.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
