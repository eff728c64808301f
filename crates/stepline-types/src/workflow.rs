//! Workflow domain types for Stepline.
//!
//! Defines the canonical representation for workflows: `StepDefinition` is
//! the authoring shape (used by templates and custom workflow creation),
//! `Step`/`Workflow` carry execution state, and `WorkflowTemplate` is the
//! reusable blueprint a concrete workflow is instantiated from. Snapshot
//! types (`WorkflowSnapshot`, `StepSnapshot`) are the read-only view served
//! to status queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of an individual workflow step.
///
/// Once a step leaves `Pending` it only moves forward
/// (`Running` -> `Completed` | `Failed` | `Cancelled`), with one exception:
/// a `Failed` step governed by `OnFailure::Retry` with remaining attempts is
/// reset to `Pending` by the orchestrator.
///
/// `Skipped` is declared for wire compatibility but no engine code path
/// currently produces it: a step whose conditions never pass simply stays
/// `Pending` until the run terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Whether the step has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

/// Overall status of a workflow.
///
/// `Paused` is reserved: it is declared for wire compatibility but no engine
/// transition produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowStatus {
    /// Whether the workflow has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the run after the current round's in-flight steps finish.
    #[default]
    Stop,
    /// Leave the step failed; dependents starve rather than error.
    Continue,
    /// Reset the step to pending while attempts remain, then behave as
    /// `Continue`.
    Retry,
}

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Failure policy applied when the step fails.
    #[serde(default)]
    pub on_failure: OnFailure,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            on_failure: OnFailure::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A predicate gating step execution, evaluated against the accumulated
/// results map each scheduling round. All of a step's conditions must pass
/// before it becomes executable.
///
/// Internally tagged by `type` to match the authoring format:
/// ```yaml
/// conditions:
///   - type: result_equals
///     step: validate
///     field: verdict
///     value: ok
/// ```
///
/// Unknown condition kinds fail at deserialization, so a malformed
/// definition never reaches the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Trivially true.
    Always,
    /// A named step's result (optionally a specific field of it) is present.
    ResultExists {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// A named step's result field equals a literal value.
    ResultEquals {
        step: String,
        field: String,
        value: Value,
    },
    /// Dispatch to a registered predicate by name. `params` is handed to the
    /// evaluator verbatim alongside the full results map.
    Custom {
        evaluator: String,
        #[serde(default)]
        params: Value,
    },
}

// ---------------------------------------------------------------------------
// Step definition (authoring shape)
// ---------------------------------------------------------------------------

/// The authoring shape of a step, used by template step lists and custom
/// workflow creation. `id` is optional; the engine assigns `step_N` defaults
/// at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step ID, unique within a workflow. Defaulted to `step_N` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display label. Defaults to the step ID when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of the registered action this step invokes.
    pub action: String,
    /// Parameter tree; string leaves may be `${...}` placeholders.
    #[serde(default)]
    pub params: Value,
    /// Step IDs that must complete before this step is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Predicates evaluated against accumulated results; all must pass.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Retry/failure policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Step-level timeout in seconds (engine default 300 when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Step (execution state)
// ---------------------------------------------------------------------------

/// A single unit of work inside a workflow, carrying both its definition
/// and its mutable execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step ID, unique within the workflow.
    pub id: String,
    /// Display label.
    pub name: String,
    /// Name of the registered action this step invokes.
    pub action: String,
    /// Resolved-or-placeholder parameter tree.
    #[serde(default)]
    pub params: Value,
    /// Step IDs that must complete before this step is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Predicates gating execution.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Retry/failure policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Step-level timeout in seconds (engine default 300 when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    // -- Mutable execution state --
    /// Current status.
    #[serde(default)]
    pub status: StepStatus,
    /// Result map, set only on `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    /// Error message, set only on `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// When the most recent attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the final attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl Step {
    /// Build a fresh `Pending` step from its authoring shape and a resolved ID.
    pub fn from_definition(id: String, def: StepDefinition) -> Self {
        let name = def.name.unwrap_or_else(|| id.clone());
        Self {
            id,
            name,
            action: def.action,
            params: def.params,
            dependencies: def.dependencies,
            conditions: def.conditions,
            retry: def.retry,
            timeout_secs: def.timeout_secs,
            status: StepStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// An instantiated, executable DAG of steps with aggregate status, progress,
/// results, and errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned at creation.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional free-form owner tag, used for list filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Ordered list of steps forming the workflow DAG.
    pub steps: Vec<Step>,
    /// Static workflow-level parameters, visible to every step's resolver.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Current workflow status.
    pub status: WorkflowStatus,
    /// `completed_steps / total_steps * 100`, recomputed after every round.
    #[serde(default)]
    pub progress: f64,
    /// Step ID -> result map, populated only for completed steps.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub results: Map<String, Value>,
    /// Append-only list of human-readable failure strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// When execution started (None while `Created`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Total wall-clock duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<f64>,
}

impl Workflow {
    /// Create a fresh workflow in `Created` status.
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        owner: Option<String>,
        steps: Vec<Step>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description,
            owner,
            steps,
            params,
            status: WorkflowStatus::Created,
            progress: 0.0,
            results: Map::new(),
            errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_duration_seconds: None,
        }
    }

    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Number of completed steps.
    pub fn completed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Produce a read-only snapshot for status queries.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner.clone(),
            status: self.status,
            progress: self.progress,
            steps: self.steps.iter().map(StepSnapshot::from).collect(),
            results: self.results.clone(),
            errors: self.errors.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            total_duration_seconds: self.total_duration_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots (status query view)
// ---------------------------------------------------------------------------

/// Read-only per-step view served by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: String,
    pub name: String,
    pub action: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl From<&Step> for StepSnapshot {
    fn from(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            action: step.action.clone(),
            status: step.status,
            error: step.error.clone(),
            retry_count: step.retry_count,
            started_at: step.started_at,
            completed_at: step.completed_at,
            duration_seconds: step.duration_seconds,
        }
    }
}

/// Read-only workflow view served by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub status: WorkflowStatus,
    pub progress: f64,
    pub steps: Vec<StepSnapshot>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub results: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<f64>,
}

// ---------------------------------------------------------------------------
// Workflow template
// ---------------------------------------------------------------------------

/// A named, reusable workflow blueprint.
///
/// Templates are data: they can be authored as YAML and registered with the
/// template catalog at startup. A workflow instantiated from a template owns
/// its own copies of the step definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Stable template identifier (e.g. "social_media_campaign").
    pub id: String,
    /// Human-readable template name.
    pub name: String,
    /// Grouping category, used for list filtering.
    #[serde(default)]
    pub category: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step templates with placeholder-bearing params.
    pub steps: Vec<StepDefinition>,
    /// Parameter names that must be supplied at instantiation.
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Defaults merged under caller-supplied params (caller values win).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub default_params: Map<String, Value>,
    /// Rough duration estimate for display purposes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
