//! Creation-time validation and custom workflow construction.
//!
//! All definition errors are caught here, before a workflow is stored or
//! reaches `Running`: duplicate step IDs, dependencies referencing
//! non-existent steps, cyclic graphs, and custom conditions naming
//! unregistered evaluators. A broken definition is never partially
//! registered.

use std::collections::HashSet;

use serde_json::{Map, Value};
use stepline_types::workflow::{Condition, Step, StepDefinition, Workflow};

use super::action::ActionRegistry;
use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while building or validating a workflow definition.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The workflow has no steps.
    #[error("workflow must have at least one step")]
    EmptyWorkflow,

    /// Two steps share an ID.
    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    /// One or more dependencies reference non-existent step IDs.
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    /// The dependency graph contains a cycle.
    #[error("{0}")]
    CycleDetected(String),

    /// A custom condition references an evaluator that is not registered.
    #[error("unknown condition evaluator: '{0}' (step '{1}')")]
    UnknownEvaluator(String, String),
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build a workflow directly from caller-supplied step definitions.
///
/// Steps without an ID get `step_N` defaults (1-based, by position). The
/// full ID set is collected first, then every dependency is checked against
/// it -- the error names every unknown dependency, not just the first.
pub fn build_workflow(
    name: impl Into<String>,
    description: Option<String>,
    owner: Option<String>,
    definitions: Vec<StepDefinition>,
    params: Map<String, Value>,
    registry: &ActionRegistry,
) -> Result<Workflow, DefinitionError> {
    let steps = build_steps(definitions)?;
    validate_steps(&steps, registry)?;
    Ok(Workflow::new(name, description, owner, steps, params))
}

/// Materialize step definitions into fresh `Pending` steps, assigning
/// `step_N` IDs to unnamed steps.
pub fn build_steps(definitions: Vec<StepDefinition>) -> Result<Vec<Step>, DefinitionError> {
    if definitions.is_empty() {
        return Err(DefinitionError::EmptyWorkflow);
    }

    Ok(definitions
        .into_iter()
        .enumerate()
        .map(|(i, def)| {
            let id = def
                .id
                .clone()
                .unwrap_or_else(|| format!("step_{}", i + 1));
            Step::from_definition(id, def)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a step list.
///
/// Checks, in order:
/// - at least one step exists
/// - all step IDs are unique
/// - every dependency references an existing step ID (all violations
///   reported in one error)
/// - the dependency graph is acyclic
/// - every `custom` condition names a registered evaluator
pub fn validate_steps(steps: &[Step], registry: &ActionRegistry) -> Result<(), DefinitionError> {
    if steps.is_empty() {
        return Err(DefinitionError::EmptyWorkflow);
    }

    let mut seen_ids = HashSet::new();
    for step in steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::DuplicateStepId(step.id.clone()));
        }
    }

    let mut unknown = Vec::new();
    for step in steps {
        for dep in &step.dependencies {
            if !seen_ids.contains(dep.as_str()) {
                unknown.push(format!("'{}' (required by step '{}')", dep, step.id));
            }
        }
    }
    if !unknown.is_empty() {
        return Err(DefinitionError::InvalidDependency(unknown.join(", ")));
    }

    dag::validate_dag(steps)?;

    for step in steps {
        for condition in &step.conditions {
            if let Condition::Custom { evaluator, .. } = condition {
                if !registry.has_evaluator(evaluator) {
                    return Err(DefinitionError::UnknownEvaluator(
                        evaluator.clone(),
                        step.id.clone(),
                    ));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
