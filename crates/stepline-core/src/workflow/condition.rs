//! Condition evaluation against accumulated workflow results.
//!
//! Conditions are structured data (see `stepline_types::workflow::Condition`)
//! rather than an expression language: `always`, `result_exists`,
//! `result_equals`, and `custom` (dispatched by name through the registry).
//! Unknown condition kinds never reach this module -- they fail at
//! deserialization -- and custom conditions naming unregistered evaluators
//! are rejected at workflow creation.

use serde_json::{Map, Value};
use stepline_types::workflow::Condition;

use super::action::{ActionRegistry, ConditionEvaluator as _};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during condition evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    /// A custom condition referenced an evaluator that is not registered.
    /// Creation-time validation makes this unreachable for workflows built
    /// through the engine; it can still surface if the registry is mutated
    /// after creation.
    #[error("unknown condition evaluator: '{0}'")]
    UnknownEvaluator(String),
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a full condition list; all entries must pass.
pub fn evaluate_all(
    conditions: &[Condition],
    results: &Map<String, Value>,
    registry: &ActionRegistry,
) -> Result<bool, ConditionError> {
    for condition in conditions {
        if !evaluate(condition, results, registry)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluate a single condition against the current results map.
pub fn evaluate(
    condition: &Condition,
    results: &Map<String, Value>,
    registry: &ActionRegistry,
) -> Result<bool, ConditionError> {
    match condition {
        Condition::Always => Ok(true),

        Condition::ResultExists { step, field } => {
            let Some(result) = results.get(step) else {
                return Ok(false);
            };
            match field {
                None => Ok(true),
                Some(field) => Ok(result
                    .as_object()
                    .is_some_and(|map| map.contains_key(field))),
            }
        }

        Condition::ResultEquals { step, field, value } => {
            let actual = results
                .get(step)
                .and_then(|result| result.as_object())
                .and_then(|map| map.get(field));
            Ok(actual == Some(value))
        }

        Condition::Custom { evaluator, params } => {
            let predicate = registry
                .evaluator(evaluator)
                .ok_or_else(|| ConditionError::UnknownEvaluator(evaluator.clone()))?;
            Ok(predicate.evaluate(params, results))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
