//! Round-based wavefront orchestrator.
//!
//! The orchestrator drives one workflow at a time through scheduling rounds:
//! each round computes the executable set (pending, dependencies completed,
//! conditions passing), launches those steps concurrently via
//! `tokio::task::JoinSet`, and folds outcomes back into workflow state
//! single-threaded as they arrive. The loop terminates when a round yields
//! nothing executable.
//!
//! # Failure semantics
//!
//! - A step failure (action error, timeout, unknown action) is captured on
//!   the step and governed by its `on_failure` policy. Under `stop`, steps
//!   already launched in the same round are *not* force-cancelled; they run
//!   to completion and their results are kept before the run terminates.
//!   This mirrors the don't-waste-started-work behavior of the systems this
//!   engine descends from and is part of the contract, not an accident.
//! - An engine fault (task join error, e.g. a panicking action) aborts the
//!   run, marks the workflow failed, *and* propagates to the caller of
//!   `execute` -- polling callers and synchronous callers both observe it.
//!
//! # Cancellation
//!
//! Cooperative and non-preemptive: `cancel` immediately marks the workflow
//! and its running steps cancelled in the snapshot, but does not interrupt
//! in-flight action invocations. Their late results are discarded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use stepline_types::config::EngineConfig;
use stepline_types::event::EngineEvent;
use stepline_types::workflow::{
    OnFailure, StepDefinition, StepStatus, Workflow, WorkflowSnapshot, WorkflowStatus,
    WorkflowTemplate,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;

use super::action::{Action as _, ActionContext, ActionError, ActionRegistry};
use super::condition;
use super::definition::{self, DefinitionError};
use super::params::resolve_params;
use super::store::{WorkflowHandle, WorkflowStore};
use super::template::{TemplateCatalog, TemplateError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// No workflow stored under the requested ID.
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// `execute` was called on a workflow that already left `Created`.
    #[error("workflow {id} already started (status {status:?})")]
    AlreadyStarted { id: Uuid, status: WorkflowStatus },

    /// `cancel` was called on a workflow that is not running.
    #[error("workflow {id} is not running (status {status:?})")]
    NotRunning { id: Uuid, status: WorkflowStatus },

    /// The maximum-concurrent-workflows gate rejected the execute call.
    #[error("maximum concurrent workflows reached")]
    ConcurrencyLimitReached,

    /// An unexpected error inside the scheduling loop itself (not an
    /// individual step's controlled failure).
    #[error("orchestration fault: {0}")]
    Fault(String),
}

// ---------------------------------------------------------------------------
// Execution outcome
// ---------------------------------------------------------------------------

/// Structured result of a finished `execute` call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    /// True iff the workflow completed without any failed step.
    pub success: bool,
    /// Step ID -> result map for every completed step.
    pub results: Map<String, Value>,
    /// Accumulated failure strings.
    pub errors: Vec<String>,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub duration_seconds: f64,
}

// ---------------------------------------------------------------------------
// Round planning
// ---------------------------------------------------------------------------

/// Everything a spawned step task needs, captured before launch so the task
/// never touches shared workflow state.
struct Launch {
    idx: usize,
    step_id: String,
    action_name: String,
    params: Value,
    vars: Map<String, Value>,
    timeout: Duration,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The scheduler driving workflow execution.
///
/// Owns constructor-injected registries and the store, so multiple
/// independently configured engines can coexist in one process.
pub struct Orchestrator {
    registry: Arc<ActionRegistry>,
    templates: Arc<TemplateCatalog>,
    store: Arc<WorkflowStore>,
    events: EventBus,
    config: EngineConfig,
    /// Gate on concurrently executing workflows; exceeding it fails the
    /// execute call immediately rather than queuing.
    workflow_permits: Arc<Semaphore>,
    /// Cancellation tokens keyed by workflow ID, present while running.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(
        registry: Arc<ActionRegistry>,
        templates: Arc<TemplateCatalog>,
        store: Arc<WorkflowStore>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        let workflow_permits = Arc::new(Semaphore::new(config.max_concurrent_workflows));
        Self {
            registry,
            templates,
            store,
            events,
            config,
            workflow_permits,
            cancellations: DashMap::new(),
        }
    }

    /// The action registry this engine dispatches against.
    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// The template catalog backing `create_from_template`.
    pub fn templates(&self) -> &Arc<TemplateCatalog> {
        &self.templates
    }

    /// The workflow store.
    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    /// The engine event bus; subscribe for analytics/audit.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Creation surface
    // -----------------------------------------------------------------------

    /// Build a workflow from caller-supplied step definitions and store it.
    pub fn create_workflow(
        &self,
        name: impl Into<String>,
        description: Option<String>,
        owner: Option<String>,
        definitions: Vec<StepDefinition>,
        params: Map<String, Value>,
    ) -> Result<Uuid, DefinitionError> {
        let workflow = definition::build_workflow(
            name,
            description,
            owner,
            definitions,
            params,
            &self.registry,
        )?;
        Ok(self.store.insert(workflow))
    }

    /// Instantiate a workflow from a registered template and store it.
    pub fn create_from_template(
        &self,
        template_id: &str,
        params: Map<String, Value>,
        owner: Option<String>,
    ) -> Result<Uuid, TemplateError> {
        let workflow = self
            .templates
            .instantiate(template_id, params, owner)?;
        Ok(self.store.insert(workflow))
    }

    // -----------------------------------------------------------------------
    // Query surface
    // -----------------------------------------------------------------------

    /// Current status snapshot of a workflow.
    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowSnapshot, ExecutorError> {
        let handle = self
            .store
            .get(workflow_id)
            .ok_or(ExecutorError::NotFound(workflow_id))?;
        let workflow = handle.read().await;
        Ok(workflow.snapshot())
    }

    /// List workflows, optionally filtered by status and/or owner.
    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        owner: Option<&str>,
    ) -> Vec<WorkflowSnapshot> {
        self.store.list(status, owner).await
    }

    /// List templates, optionally filtered by category.
    pub fn list_templates(&self, category: Option<&str>) -> Vec<WorkflowTemplate> {
        self.templates.list(category)
    }

    /// Spawn the store's periodic retention sweep using this engine's config.
    pub fn spawn_retention_cleanup(&self) -> CancellationToken {
        self.store.spawn_cleanup(
            Duration::from_secs(self.config.cleanup_interval_secs),
            self.config.retention_keep,
        )
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Request cancellation of a running workflow.
    ///
    /// Effective only while the workflow is `Running`. The workflow and its
    /// currently running steps are marked `Cancelled` immediately, even
    /// though in-flight action invocations are not interrupted; their late
    /// results are discarded when they eventually resolve.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        let handle = self
            .store
            .get(workflow_id)
            .ok_or(ExecutorError::NotFound(workflow_id))?;

        let mut guard = handle.write().await;
        let workflow = &mut *guard;
        if workflow.status != WorkflowStatus::Running {
            return Err(ExecutorError::NotRunning {
                id: workflow_id,
                status: workflow.status,
            });
        }

        let now = Utc::now();
        workflow.status = WorkflowStatus::Cancelled;
        workflow.completed_at = Some(now);
        workflow.total_duration_seconds = workflow.started_at.map(|s| elapsed_seconds(s, now));
        for step in &mut workflow.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Cancelled;
                step.completed_at = Some(now);
                step.duration_seconds = step.started_at.map(|s| elapsed_seconds(s, now));
            }
        }

        if let Some((_, token)) = self.cancellations.remove(&workflow_id) {
            token.cancel();
        }

        self.events
            .publish(EngineEvent::WorkflowCancelled { workflow_id });
        tracing::info!(workflow_id = %workflow_id, "workflow cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a stored workflow to a terminal state.
    ///
    /// Returns a structured outcome for completed, failed, and cancelled
    /// runs; returns `Err` only for definition-level problems (unknown ID,
    /// already started, concurrency gate) and engine faults. Step failures
    /// are reported through the outcome, never as `Err`.
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        context: Map<String, Value>,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let handle = self
            .store
            .get(workflow_id)
            .ok_or(ExecutorError::NotFound(workflow_id))?;

        // Released on drop, including every early-return path below.
        let _permit = self
            .workflow_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExecutorError::ConcurrencyLimitReached)?;

        let started = Utc::now();
        {
            let mut guard = handle.write().await;
            let workflow = &mut *guard;
            if workflow.status != WorkflowStatus::Created {
                return Err(ExecutorError::AlreadyStarted {
                    id: workflow_id,
                    status: workflow.status,
                });
            }
            workflow.status = WorkflowStatus::Running;
            workflow.started_at = Some(started);

            self.events.publish(EngineEvent::WorkflowStarted {
                workflow_id,
                name: workflow.name.clone(),
                step_count: workflow.steps.len(),
            });
            tracing::info!(
                workflow_id = %workflow_id,
                workflow = workflow.name.as_str(),
                steps = workflow.steps.len(),
                "starting workflow execution"
            );
        }

        let token = CancellationToken::new();
        self.cancellations.insert(workflow_id, token.clone());

        let run_result = self.run_rounds(workflow_id, &handle, &context, &token).await;

        self.cancellations.remove(&workflow_id);

        let mut guard = handle.write().await;
        let workflow = &mut *guard;
        let now = Utc::now();
        let duration = elapsed_seconds(started, now);

        match run_result {
            Err(fault) => {
                workflow.status = WorkflowStatus::Failed;
                workflow.errors.push(fault.to_string());
                workflow.completed_at = Some(now);
                workflow.total_duration_seconds = Some(duration);

                self.events.publish(EngineEvent::WorkflowFailed {
                    workflow_id,
                    duration_seconds: duration,
                    errors: workflow.errors.clone(),
                });
                tracing::error!(
                    workflow_id = %workflow_id,
                    error = %fault,
                    "workflow execution aborted by engine fault"
                );
                Err(fault)
            }
            Ok(()) => {
                if workflow.status != WorkflowStatus::Cancelled {
                    let any_failed = workflow
                        .steps
                        .iter()
                        .any(|s| s.status == StepStatus::Failed);
                    workflow.status = if any_failed {
                        WorkflowStatus::Failed
                    } else {
                        WorkflowStatus::Completed
                    };
                    workflow.completed_at = Some(now);
                    workflow.total_duration_seconds = Some(duration);

                    if any_failed {
                        self.events.publish(EngineEvent::WorkflowFailed {
                            workflow_id,
                            duration_seconds: duration,
                            errors: workflow.errors.clone(),
                        });
                        tracing::warn!(
                            workflow_id = %workflow_id,
                            errors = workflow.errors.len(),
                            "workflow execution failed"
                        );
                    } else {
                        self.events.publish(EngineEvent::WorkflowCompleted {
                            workflow_id,
                            duration_seconds: duration,
                            steps_completed: workflow.completed_count(),
                        });
                        tracing::info!(
                            workflow_id = %workflow_id,
                            duration_seconds = duration,
                            "workflow execution completed"
                        );
                    }
                }

                Ok(ExecutionOutcome {
                    workflow_id,
                    status: workflow.status,
                    success: workflow.status == WorkflowStatus::Completed,
                    results: workflow.results.clone(),
                    errors: workflow.errors.clone(),
                    steps_completed: workflow.completed_count(),
                    steps_total: workflow.steps.len(),
                    duration_seconds: workflow.total_duration_seconds.unwrap_or(duration),
                })
            }
        }
    }

    /// The scheduling loop: plan a round, launch it, fold outcomes, repeat
    /// until no step is executable.
    async fn run_rounds(
        &self,
        workflow_id: Uuid,
        handle: &WorkflowHandle,
        context: &Map<String, Value>,
        token: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let launches = {
                let mut guard = handle.write().await;
                let workflow = &mut *guard;
                if workflow.status != WorkflowStatus::Running {
                    return Ok(());
                }
                self.plan_round(workflow, context)?
            };

            if launches.is_empty() {
                return Ok(());
            }

            tracing::debug!(
                workflow_id = %workflow_id,
                steps = launches.len(),
                "launching round"
            );

            let mut join_set: JoinSet<(usize, Result<Map<String, Value>, String>)> =
                JoinSet::new();
            for launch in launches {
                let action = self.registry.action(&launch.action_name);
                let Launch {
                    idx,
                    step_id,
                    action_name,
                    params,
                    vars,
                    timeout,
                } = launch;
                let ctx = ActionContext {
                    workflow_id,
                    step_id,
                    vars,
                };

                join_set.spawn(async move {
                    let Some(action) = action else {
                        return (idx, Err(ActionError::UnknownAction(action_name).to_string()));
                    };
                    match tokio::time::timeout(timeout, action.execute(params, ctx)).await {
                        Ok(Ok(result)) => (idx, Ok(result)),
                        Ok(Err(err)) => (idx, Err(err.to_string())),
                        Err(_) => (idx, Err("step execution timeout".to_string())),
                    }
                });
            }

            // Fold outcomes in completion order. A `stop` failure only takes
            // effect once the whole round has drained, so siblings launched
            // alongside the failing step still finish and keep their results.
            // Cancellation interrupts the drain instead: in-flight actions
            // are detached (not aborted) and their results discarded.
            let mut stop = false;
            loop {
                tokio::select! {
                    joined = join_set.join_next() => {
                        let Some(joined) = joined else { break };
                        let (idx, outcome) = joined
                            .map_err(|e| ExecutorError::Fault(format!("task join error: {e}")))?;
                        let mut guard = handle.write().await;
                        let workflow = &mut *guard;
                        if self.fold_outcome(workflow_id, workflow, idx, outcome) {
                            stop = true;
                        }
                    }
                    _ = token.cancelled() => {
                        join_set.detach_all();
                        return Ok(());
                    }
                }
            }

            let mut guard = handle.write().await;
            let workflow = &mut *guard;
            let total = workflow.steps.len();
            if total > 0 {
                workflow.progress = workflow.completed_count() as f64 / total as f64 * 100.0;
            }
            if stop {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    "stopping failure encountered; terminating run after round drain"
                );
                return Ok(());
            }
            if workflow.status != WorkflowStatus::Running {
                return Ok(());
            }
        }
    }

    /// Compute this round's executable set, mark those steps running, and
    /// capture everything their tasks need.
    fn plan_round(
        &self,
        workflow: &mut Workflow,
        context: &Map<String, Value>,
    ) -> Result<Vec<Launch>, ExecutorError> {
        let completed: HashSet<&str> = workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.as_str())
            .collect();

        let mut ready = Vec::new();
        for (idx, step) in workflow.steps.iter().enumerate() {
            if step.status != StepStatus::Pending {
                continue;
            }
            if !step
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
            {
                continue;
            }
            match condition::evaluate_all(&step.conditions, &workflow.results, &self.registry) {
                Ok(true) => ready.push(idx),
                Ok(false) => {}
                Err(e) => return Err(ExecutorError::Fault(e.to_string())),
            }
        }

        if ready.is_empty() {
            return Ok(Vec::new());
        }

        // Context visible to this round's steps: workflow static params,
        // then caller-supplied context, then prior results (later wins).
        let mut vars = workflow.params.clone();
        for (key, value) in context {
            vars.insert(key.clone(), value.clone());
        }
        for (key, value) in &workflow.results {
            vars.insert(key.clone(), value.clone());
        }

        let workflow_id = workflow.id;
        let now = Utc::now();
        let default_timeout = self.config.default_step_timeout_secs;
        let mut launches = Vec::with_capacity(ready.len());
        for idx in ready {
            let step = &mut workflow.steps[idx];
            step.status = StepStatus::Running;
            step.started_at = Some(now);

            let resolved = resolve_params(&step.params, &vars);
            self.events.publish(EngineEvent::StepStarted {
                workflow_id,
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                action: step.action.clone(),
            });
            tracing::debug!(
                workflow_id = %workflow_id,
                step_id = step.id.as_str(),
                action = step.action.as_str(),
                "step launched"
            );

            launches.push(Launch {
                idx,
                step_id: step.id.clone(),
                action_name: step.action.clone(),
                params: resolved,
                vars: vars.clone(),
                timeout: Duration::from_secs(step.timeout_secs.unwrap_or(default_timeout)),
            });
        }
        Ok(launches)
    }

    /// Fold one step outcome into workflow state. Returns `true` when a
    /// stopping failure was recorded.
    fn fold_outcome(
        &self,
        workflow_id: Uuid,
        workflow: &mut Workflow,
        idx: usize,
        outcome: Result<Map<String, Value>, String>,
    ) -> bool {
        let now = Utc::now();
        let step = &mut workflow.steps[idx];

        if step.status != StepStatus::Running {
            // Cancelled while in flight; the late result is discarded.
            tracing::debug!(
                workflow_id = %workflow_id,
                step_id = step.id.as_str(),
                status = ?step.status,
                "discarding outcome for step no longer running"
            );
            return false;
        }

        let duration = step.started_at.map(|s| elapsed_seconds(s, now));

        match outcome {
            Ok(result) => {
                step.status = StepStatus::Completed;
                step.completed_at = Some(now);
                step.duration_seconds = duration;
                step.result = Some(result.clone());
                let step_id = step.id.clone();

                workflow
                    .results
                    .insert(step_id.clone(), Value::Object(result));
                self.events.publish(EngineEvent::StepCompleted {
                    workflow_id,
                    step_id: step_id.clone(),
                    duration_ms: (duration.unwrap_or(0.0) * 1000.0) as u64,
                });
                tracing::debug!(
                    workflow_id = %workflow_id,
                    step_id = step_id.as_str(),
                    "step completed"
                );
                false
            }
            Err(message) => {
                let step_id = step.id.clone();
                let will_retry = step.retry.on_failure == OnFailure::Retry
                    && step.retry_count < step.retry.max_retries;

                workflow
                    .errors
                    .push(format!("step '{step_id}' failed: {message}"));
                self.events.publish(EngineEvent::StepFailed {
                    workflow_id,
                    step_id: step_id.clone(),
                    error: message.clone(),
                    will_retry,
                });

                let step = &mut workflow.steps[idx];
                if will_retry {
                    step.retry_count += 1;
                    step.status = StepStatus::Pending;
                    step.error = None;
                    step.started_at = None;
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        step_id = step_id.as_str(),
                        attempt = step.retry_count,
                        max_retries = step.retry.max_retries,
                        error = message.as_str(),
                        "step failed, scheduling retry"
                    );
                    return false;
                }

                step.status = StepStatus::Failed;
                step.error = Some(message.clone());
                step.completed_at = Some(now);
                step.duration_seconds = duration;
                tracing::warn!(
                    workflow_id = %workflow_id,
                    step_id = step_id.as_str(),
                    error = message.as_str(),
                    policy = ?step.retry.on_failure,
                    "step failed"
                );

                step.retry.on_failure == OnFailure::Stop
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("active_cancellations", &self.cancellations.len())
            .finish()
    }
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::action::ActionError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stepline_types::workflow::{Condition, RetryPolicy};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("stepline_core=debug")
            .try_init();
    }

    fn step_def(id: &str, action: &str, dependencies: Vec<&str>) -> StepDefinition {
        StepDefinition {
            id: Some(id.to_string()),
            name: None,
            action: action.to_string(),
            params: Value::Null,
            dependencies: dependencies.into_iter().map(String::from).collect(),
            conditions: vec![],
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    /// Registry with the stock test actions:
    /// - `ok` completes with `{"ok": true}`
    /// - `emit` completes with its own resolved params as the result map
    /// - `fail` always fails with "boom"
    /// - `hang` sleeps for an hour
    fn base_registry() -> Arc<ActionRegistry> {
        let registry = ActionRegistry::new();
        registry.register_fn("ok", |_params, _ctx| {
            Box::pin(async { Ok(Map::from_iter([("ok".to_string(), json!(true))])) })
        });
        registry.register_fn("emit", |params: Value, _ctx| {
            Box::pin(async move {
                match params {
                    Value::Object(map) => Ok(map),
                    other => Ok(Map::from_iter([("value".to_string(), other)])),
                }
            })
        });
        registry.register_fn("fail", |_params, _ctx| {
            Box::pin(async { Err(ActionError::Failed("boom".to_string())) })
        });
        registry.register_fn("hang", |_params, _ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Map::new())
            })
        });
        Arc::new(registry)
    }

    fn engine_with(registry: Arc<ActionRegistry>) -> Arc<Orchestrator> {
        init_tracing();
        Arc::new(Orchestrator::new(
            registry,
            Arc::new(TemplateCatalog::new()),
            Arc::new(WorkflowStore::new()),
            EventBus::new(256),
            EngineConfig::default(),
        ))
    }

    fn engine() -> Arc<Orchestrator> {
        engine_with(base_registry())
    }

    /// Poll the status snapshot until `pred` passes (bounded).
    async fn wait_for(
        engine: &Orchestrator,
        id: Uuid,
        pred: impl Fn(&WorkflowSnapshot) -> bool,
    ) -> WorkflowSnapshot {
        for _ in 0..500 {
            let snap = engine.status(id).await.unwrap();
            if pred(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached before poll limit");
    }

    // -----------------------------------------------------------------------
    // Happy path and dependency ordering
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn linear_chain_completes_in_dependency_order() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "chain",
                None,
                None,
                vec![
                    step_def("a", "ok", vec![]),
                    step_def("b", "ok", vec!["a"]),
                    step_def("c", "ok", vec!["b"]),
                ],
                Map::new(),
            )
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Completed);
        assert!(outcome.success);
        assert_eq!(outcome.steps_completed, 3);
        assert_eq!(outcome.steps_total, 3);

        // Every step finished no earlier than each of its dependencies
        let snap = engine.status(id).await.unwrap();
        let completed_at = |step_id: &str| {
            snap.steps
                .iter()
                .find(|s| s.id == step_id)
                .and_then(|s| s.completed_at)
                .expect("completed step has completed_at")
        };
        assert!(completed_at("b") >= completed_at("a"));
        assert!(completed_at("c") >= completed_at("b"));
        assert!((snap.progress - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn independent_steps_launch_in_one_round() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "fanout",
                None,
                None,
                vec![
                    step_def("a", "ok", vec![]),
                    step_def("b", "ok", vec![]),
                    step_def("c", "ok", vec!["a", "b"]),
                ],
                Map::new(),
            )
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.results.len(), 3);
    }

    // -----------------------------------------------------------------------
    // Parameter flow across step boundaries
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn results_feed_later_steps_params() {
        let engine = engine();
        let mut producer = step_def("gather", "emit", vec![]);
        producer.params = json!({ "topic": "rust" });
        let mut consumer = step_def("summarize", "emit", vec!["gather"]);
        consumer.params = json!({ "input": "${gather.topic}", "user": "${user}" });

        let id = engine
            .create_workflow("pipeline", None, None, vec![producer, consumer], Map::new())
            .unwrap();

        let context = Map::from_iter([("user".to_string(), json!("kit"))]);
        let outcome = engine.execute(id, context).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.results["summarize"]["input"], json!("rust"));
        assert_eq!(outcome.results["summarize"]["user"], json!("kit"));
    }

    #[tokio::test]
    async fn unresolved_placeholder_reaches_action_verbatim() {
        let engine = engine();
        let mut step = step_def("a", "emit", vec![]);
        step.params = json!({ "ref": "${nothing.here}" });
        let id = engine
            .create_workflow("verbatim", None, None, vec![step], Map::new())
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.results["a"]["ref"], json!("${nothing.here}"));
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn progress_is_recomputed_after_each_round() {
        let registry = base_registry();
        let gate = Arc::new(tokio::sync::Notify::new());
        let action_gate = gate.clone();
        registry.register_fn("gated", move |_p, _c| {
            let gate = action_gate.clone();
            Box::pin(async move {
                gate.notified().await;
                Ok(Map::new())
            })
        });
        let engine = engine_with(registry);

        let id = engine
            .create_workflow(
                "staged",
                None,
                None,
                vec![step_def("a", "ok", vec![]), step_def("b", "gated", vec!["a"])],
                Map::new(),
            )
            .unwrap();

        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.execute(id, Map::new()).await });

        // After round 1 resolves, b is running and progress reflects 1/2
        let snap = wait_for(&engine, id, |s| {
            s.steps.iter().any(|st| st.id == "b" && st.status == StepStatus::Running)
        })
        .await;
        assert!((snap.progress - 50.0).abs() < 0.01);

        gate.notify_one();
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.success);
        let final_snap = engine.status(id).await.unwrap();
        assert!((final_snap.progress - 100.0).abs() < f64::EPSILON);
        assert!(final_snap.progress >= snap.progress, "progress never regresses");
    }

    // -----------------------------------------------------------------------
    // Stop semantics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stop_failure_lets_same_round_siblings_finish() {
        let engine = engine();
        let mut failing = step_def("a", "fail", vec![]);
        failing.retry = RetryPolicy {
            max_retries: 0,
            on_failure: OnFailure::Stop,
        };
        let sibling = step_def("b", "ok", vec![]);

        let id = engine
            .create_workflow("stopper", None, None, vec![failing, sibling], Map::new())
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert!(!outcome.success);
        assert!(
            outcome.errors.iter().any(|e| e.contains("boom")),
            "errors: {:?}",
            outcome.errors
        );

        let snap = engine.status(id).await.unwrap();
        let step = |id: &str| snap.steps.iter().find(|s| s.id == id).unwrap().clone();
        assert_eq!(step("a").status, StepStatus::Failed);
        // B was launched in the same round and is not retroactively cancelled
        assert_eq!(step("b").status, StepStatus::Completed);
        assert!(outcome.results.contains_key("b"), "B's result is kept");
    }

    #[tokio::test]
    async fn stop_failure_leaves_unlaunched_steps_pending() {
        let engine = engine();
        let mut failing = step_def("a", "fail", vec![]);
        failing.retry = RetryPolicy {
            max_retries: 0,
            on_failure: OnFailure::Stop,
        };
        let downstream = step_def("b", "ok", vec!["a"]);

        let id = engine
            .create_workflow("stopper", None, None, vec![failing, downstream], Map::new())
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Failed);

        let snap = engine.status(id).await.unwrap();
        let b = snap.steps.iter().find(|s| s.id == "b").unwrap();
        assert_eq!(b.status, StepStatus::Pending);
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn retry_exhaustion_attempts_initial_plus_max_retries() {
        let registry = base_registry();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        registry.register_fn("always_fail", move |_p, _c| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(ActionError::Failed("persistent".to_string())) })
        });
        let engine = engine_with(registry);

        let mut step = step_def("a", "always_fail", vec![]);
        step.retry = RetryPolicy {
            max_retries: 2,
            on_failure: OnFailure::Retry,
        };
        let id = engine
            .create_workflow("retrier", None, None, vec![step], Map::new())
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        // Initial attempt + 2 retries, then the continue fallback applies
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert_eq!(outcome.errors.len(), 3);

        let snap = engine.status(id).await.unwrap();
        assert_eq!(snap.steps[0].status, StepStatus::Failed);
        assert_eq!(snap.steps[0].retry_count, 2);
    }

    #[tokio::test]
    async fn retry_recovers_when_action_starts_succeeding() {
        let registry = base_registry();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        registry.register_fn("flaky", move |_p, _c| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    Err(ActionError::Failed("transient".to_string()))
                } else {
                    Ok(Map::from_iter([("attempt".to_string(), json!(n + 1))]))
                }
            })
        });
        let engine = engine_with(registry);

        let mut step = step_def("a", "flaky", vec![]);
        step.retry = RetryPolicy {
            max_retries: 3,
            on_failure: OnFailure::Retry,
        };
        let id = engine
            .create_workflow("flaky-wf", None, None, vec![step], Map::new())
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert!(outcome.success, "second attempt should succeed");
        assert_eq!(outcome.results["a"]["attempt"], json!(2));
        assert_eq!(outcome.errors.len(), 1, "first failure is still recorded");

        let snap = engine.status(id).await.unwrap();
        assert_eq!(snap.steps[0].retry_count, 1);
        assert!(snap.steps[0].error.is_none());
    }

    // -----------------------------------------------------------------------
    // Starvation via continue
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn continue_failure_starves_dependents() {
        let engine = engine();
        let mut failing = step_def("b", "fail", vec![]);
        failing.retry = RetryPolicy {
            max_retries: 0,
            on_failure: OnFailure::Continue,
        };
        let dependent = step_def("c", "ok", vec!["b"]);

        let id = engine
            .create_workflow("starver", None, None, vec![failing, dependent], Map::new())
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert!(!outcome.errors.is_empty());

        let snap = engine.status(id).await.unwrap();
        let step = |id: &str| snap.steps.iter().find(|s| s.id == id).unwrap().clone();
        assert_eq!(step("b").status, StepStatus::Failed);
        // C never becomes executable and never errors -- it simply starves
        assert_eq!(step("c").status, StepStatus::Pending);
        assert!(step("c").error.is_none());
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timeout_converts_to_step_failure() {
        let engine = engine();
        let mut step = step_def("a", "hang", vec![]);
        step.timeout_secs = Some(1);
        step.retry = RetryPolicy {
            max_retries: 0,
            on_failure: OnFailure::Continue,
        };
        let id = engine
            .create_workflow("sleeper", None, None, vec![step], Map::new())
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Failed);

        let snap = engine.status(id).await.unwrap();
        assert_eq!(snap.steps[0].status, StepStatus::Failed);
        assert_eq!(snap.steps[0].error.as_deref(), Some("step execution timeout"));
    }

    // -----------------------------------------------------------------------
    // Unknown action
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unknown_action_is_a_step_failure_not_a_creation_error() {
        let engine = engine();
        // Creation succeeds; the missing action only surfaces at execution
        let id = engine
            .create_workflow(
                "ghost",
                None,
                None,
                vec![step_def("a", "not_registered", vec![])],
                Map::new(),
            )
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Failed);

        let snap = engine.status(id).await.unwrap();
        assert_eq!(snap.steps[0].status, StepStatus::Failed);
        assert!(
            snap.steps[0]
                .error
                .as_deref()
                .unwrap()
                .contains("unknown action: not_registered")
        );
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn conditions_gate_execution_and_reevaluate_each_round() {
        let engine = engine();
        let mut producer = step_def("check", "emit", vec![]);
        producer.params = json!({ "verdict": "ok" });

        // No dependency on `check`: the condition alone holds this step back
        // until a later round where the result exists.
        let mut on_pass = step_def("publish", "ok", vec![]);
        on_pass.conditions = vec![Condition::ResultEquals {
            step: "check".to_string(),
            field: "verdict".to_string(),
            value: json!("ok"),
        }];

        let mut never = step_def("rollback", "ok", vec![]);
        never.conditions = vec![Condition::ResultEquals {
            step: "check".to_string(),
            field: "verdict".to_string(),
            value: json!("rejected"),
        }];

        let id = engine
            .create_workflow(
                "conditional",
                None,
                None,
                vec![producer, on_pass, never],
                Map::new(),
            )
            .unwrap();

        let outcome = engine.execute(id, Map::new()).await.unwrap();
        // No step failed, so the run completes even though `rollback` starved
        assert_eq!(outcome.status, WorkflowStatus::Completed);

        let snap = engine.status(id).await.unwrap();
        let step = |id: &str| snap.steps.iter().find(|s| s.id == id).unwrap().clone();
        assert_eq!(step("publish").status, StepStatus::Completed);
        assert_eq!(step("rollback").status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn custom_condition_dispatches_through_registry() {
        let registry = base_registry();
        registry.register_evaluator_fn("field_nonempty", |def, results| {
            let step = def.get("step").and_then(Value::as_str).unwrap_or_default();
            let field = def.get("field").and_then(Value::as_str).unwrap_or_default();
            results
                .get(step)
                .and_then(|r| r.get(field))
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty())
        });
        let engine = engine_with(registry);

        let mut producer = step_def("draft", "emit", vec![]);
        producer.params = json!({ "text": "hello" });
        let mut gated = step_def("publish", "ok", vec!["draft"]);
        gated.conditions = vec![Condition::Custom {
            evaluator: "field_nonempty".to_string(),
            params: json!({ "step": "draft", "field": "text" }),
        }];

        let id = engine
            .create_workflow("custom-cond", None, None, vec![producer, gated], Map::new())
            .unwrap();
        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert!(outcome.success);
    }

    // -----------------------------------------------------------------------
    // Engine faults: both channels (raised error + FAILED status)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn panicking_action_is_an_engine_fault_on_both_channels() {
        let registry = base_registry();
        registry.register_fn("explode", |_p, _c| {
            Box::pin(async { panic!("kaboom") })
        });
        let engine = engine_with(registry);

        let id = engine
            .create_workflow(
                "volatile",
                None,
                None,
                vec![step_def("a", "explode", vec![])],
                Map::new(),
            )
            .unwrap();

        let err = engine.execute(id, Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Fault(_)), "got: {err:?}");

        // Polling callers observe the same failure
        let snap = engine.status(id).await.unwrap();
        assert_eq!(snap.status, WorkflowStatus::Failed);
        assert!(!snap.errors.is_empty());
    }

    // -----------------------------------------------------------------------
    // Lifecycle guards
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn execute_unknown_workflow_is_not_found() {
        let engine = engine();
        let err = engine.execute(Uuid::now_v7(), Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));

        let err = engine.status(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn second_execution_attempt_is_rejected() {
        let engine = engine();
        let id = engine
            .create_workflow("once", None, None, vec![step_def("a", "ok", vec![])], Map::new())
            .unwrap();

        engine.execute(id, Map::new()).await.unwrap();
        let err = engine.execute(id, Map::new()).await.unwrap_err();
        assert!(
            matches!(
                err,
                ExecutorError::AlreadyStarted {
                    status: WorkflowStatus::Completed,
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn cancel_requires_running_workflow() {
        let engine = engine();
        let id = engine
            .create_workflow("idle", None, None, vec![step_def("a", "ok", vec![])], Map::new())
            .unwrap();

        let err = engine.cancel(id).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::NotRunning {
                status: WorkflowStatus::Created,
                ..
            }
        ));

        let err = engine.cancel(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Cancellation scenario: cooperative, non-preemptive
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_marks_workflow_while_action_still_in_flight() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "endless",
                None,
                None,
                vec![step_def("a", "hang", vec![])],
                Map::new(),
            )
            .unwrap();

        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.execute(id, Map::new()).await });

        wait_for(&engine, id, |s| {
            s.steps[0].status == StepStatus::Running
        })
        .await;

        engine.cancel(id).await.unwrap();

        // Status flips immediately even though the hung action never returned
        let snap = engine.status(id).await.unwrap();
        assert_eq!(snap.status, WorkflowStatus::Cancelled);
        assert_eq!(snap.steps[0].status, StepStatus::Cancelled);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Cancelled);
        assert!(!outcome.success);
    }

    // -----------------------------------------------------------------------
    // Concurrency gate
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn exceeding_max_concurrent_workflows_fails_immediately() {
        let registry = base_registry();
        init_tracing();
        let engine = Arc::new(Orchestrator::new(
            registry,
            Arc::new(TemplateCatalog::new()),
            Arc::new(WorkflowStore::new()),
            EventBus::new(64),
            EngineConfig {
                max_concurrent_workflows: 1,
                ..EngineConfig::default()
            },
        ));

        let first = engine
            .create_workflow("one", None, None, vec![step_def("a", "hang", vec![])], Map::new())
            .unwrap();
        let second = engine
            .create_workflow("two", None, None, vec![step_def("a", "ok", vec![])], Map::new())
            .unwrap();

        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.execute(first, Map::new()).await });
        wait_for(&engine, first, |s| s.status == WorkflowStatus::Running).await;

        let err = engine.execute(second, Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ConcurrencyLimitReached));

        engine.cancel(first).await.unwrap();
        task.await.unwrap().unwrap();

        // Permit released; the second workflow can now run
        let outcome = engine.execute(second, Map::new()).await.unwrap();
        assert!(outcome.success);
    }

    // -----------------------------------------------------------------------
    // Events: analytics contract
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let engine = engine();
        let mut rx = engine.events().subscribe();

        let id = engine
            .create_workflow(
                "observed",
                None,
                None,
                vec![step_def("a", "ok", vec![]), step_def("b", "fail", vec![])],
                Map::new(),
            )
            .unwrap();
        let outcome = engine.execute(id, Map::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Failed);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(
            events.first(),
            Some(EngineEvent::WorkflowStarted { step_count: 2, .. })
        ));
        assert!(events.iter().any(
            |e| matches!(e, EngineEvent::StepCompleted { step_id, .. } if step_id == "a")
        ));
        assert!(events.iter().any(
            |e| matches!(e, EngineEvent::StepFailed { step_id, will_retry: false, .. } if step_id == "b")
        ));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::WorkflowFailed { errors, .. }) if !errors.is_empty()
        ));
    }

    // -----------------------------------------------------------------------
    // Template-instantiated workflow end to end
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn template_instantiation_executes_end_to_end() {
        use stepline_types::workflow::WorkflowTemplate;

        let engine = engine();
        engine.templates().register(WorkflowTemplate {
            id: "digest".to_string(),
            name: "Daily Digest".to_string(),
            category: "content".to_string(),
            description: None,
            steps: vec![
                StepDefinition {
                    id: Some("gather".to_string()),
                    name: None,
                    action: "emit".to_string(),
                    params: json!({ "topic": "${topic}" }),
                    dependencies: vec![],
                    conditions: vec![],
                    retry: RetryPolicy::default(),
                    timeout_secs: None,
                },
                StepDefinition {
                    id: Some("summarize".to_string()),
                    name: None,
                    action: "emit".to_string(),
                    params: json!({ "input": "${gather.topic}" }),
                    dependencies: vec!["gather".to_string()],
                    conditions: vec![],
                    retry: RetryPolicy::default(),
                    timeout_secs: None,
                },
            ],
            required_params: vec!["topic".to_string()],
            default_params: Map::new(),
            estimated_duration_secs: None,
            tags: vec![],
        });

        let params = Map::from_iter([("topic".to_string(), json!("rust"))]);
        let id = engine.create_from_template("digest", params, None).unwrap();
        let outcome = engine.execute(id, Map::new()).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.results["gather"]["topic"], json!("rust"));
        assert_eq!(outcome.results["summarize"]["input"], json!("rust"));
    }

    #[tokio::test]
    async fn list_workflows_and_templates_filters() {
        let engine = engine();
        engine
            .create_workflow(
                "mine",
                None,
                Some("ops".to_string()),
                vec![step_def("a", "ok", vec![])],
                Map::new(),
            )
            .unwrap();
        engine
            .create_workflow(
                "theirs",
                None,
                Some("data".to_string()),
                vec![step_def("a", "ok", vec![])],
                Map::new(),
            )
            .unwrap();

        assert_eq!(engine.list_workflows(None, None).await.len(), 2);
        assert_eq!(engine.list_workflows(None, Some("ops")).await.len(), 1);
        assert!(
            engine
                .list_workflows(Some(WorkflowStatus::Running), None)
                .await
                .is_empty()
        );
        assert!(engine.list_templates(None).is_empty());
    }
}
