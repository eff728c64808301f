//! Template catalog: registration, instantiation, and YAML authoring.
//!
//! Templates are data -- named, reusable workflow blueprints with required
//! and default parameters. The catalog is process-wide and read-mostly;
//! instantiation produces a concrete workflow that owns its own copies of
//! the step definitions, with no shared mutable state back to the template.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde_json::{Map, Value};
use stepline_types::workflow::{Workflow, WorkflowTemplate};

use super::definition::{self, DefinitionError};
use super::params::resolve_params;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during template operations.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// No template registered under the requested ID.
    #[error("template not found: '{0}'")]
    NotFound(String),

    /// Required parameters absent at instantiation. Lists every missing key.
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingRequiredParams(Vec<String>),

    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The template's step list failed structural validation.
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

// ---------------------------------------------------------------------------
// TemplateCatalog
// ---------------------------------------------------------------------------

/// Process-wide registry of workflow templates.
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: DashMap<String, WorkflowTemplate>,
}

impl TemplateCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template. A later registration under the same ID replaces
    /// the earlier one.
    pub fn register(&self, template: WorkflowTemplate) {
        tracing::debug!(template_id = template.id.as_str(), "registering template");
        self.templates.insert(template.id.clone(), template);
    }

    /// Look up a template by ID.
    pub fn get(&self, id: &str) -> Option<WorkflowTemplate> {
        self.templates.get(id).map(|entry| entry.value().clone())
    }

    /// List templates, optionally filtered by category.
    pub fn list(&self, category: Option<&str>) -> Vec<WorkflowTemplate> {
        let mut templates: Vec<WorkflowTemplate> = self
            .templates
            .iter()
            .filter(|entry| category.is_none_or(|c| entry.value().category == c))
            .map(|entry| entry.value().clone())
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    /// Number of registered templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Instantiate a concrete workflow from a template.
    ///
    /// Fails with `NotFound` for unknown IDs and `MissingRequiredParams`
    /// naming every absent required key. Defaults are merged under the
    /// caller's params (caller values win) and every step template's params
    /// tree is resolved against the merged set.
    ///
    /// No dependency-validity check happens here beyond what the template
    /// author declared; that cross-check belongs to custom workflow
    /// creation, where step lists arrive from untrusted callers.
    pub fn instantiate(
        &self,
        template_id: &str,
        params: Map<String, Value>,
        owner: Option<String>,
    ) -> Result<Workflow, TemplateError> {
        let template = self
            .get(template_id)
            .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))?;

        let missing: Vec<String> = template
            .required_params
            .iter()
            .filter(|key| !params.contains_key(*key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(TemplateError::MissingRequiredParams(missing));
        }

        // Defaults first, caller values overwrite
        let mut merged = template.default_params.clone();
        for (key, value) in params {
            merged.insert(key, value);
        }

        let mut definitions = template.steps.clone();
        for def in &mut definitions {
            def.params = resolve_params(&def.params, &merged);
        }

        let steps = definition::build_steps(definitions)?;

        let workflow = Workflow::new(
            template.name.clone(),
            template.description.clone(),
            owner,
            steps,
            merged,
        );
        tracing::info!(
            workflow_id = %workflow.id,
            template_id,
            steps = workflow.steps.len(),
            "instantiated workflow from template"
        );
        Ok(workflow)
    }
}

// ---------------------------------------------------------------------------
// YAML authoring
// ---------------------------------------------------------------------------

/// Parse a YAML string into a `WorkflowTemplate`.
pub fn parse_template_yaml(yaml: &str) -> Result<WorkflowTemplate, TemplateError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| TemplateError::Parse(e.to_string()))
}

/// Serialize a `WorkflowTemplate` to a YAML string.
pub fn serialize_template_yaml(template: &WorkflowTemplate) -> Result<String, TemplateError> {
    serde_yaml_ng::to_string(template).map_err(|e| TemplateError::Parse(e.to_string()))
}

/// Load a template from a YAML file.
pub fn load_template_file(path: &Path) -> Result<WorkflowTemplate, TemplateError> {
    let content = std::fs::read_to_string(path)?;
    parse_template_yaml(&content)
}

/// Save a template to a YAML file, creating parent directories as needed.
pub fn save_template_file(path: &Path, template: &WorkflowTemplate) -> Result<(), TemplateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_template_yaml(template)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all template YAML files under `base_dir`.
///
/// Scans `.yaml` and `.yml` files recursively. Files that fail to parse are
/// skipped with a warning rather than failing the whole discovery.
pub fn discover_templates(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowTemplate)>, TemplateError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowTemplate)>,
) -> Result<(), TemplateError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_template_file(&path) {
                    Ok(template) => results.push((path, template)),
                    Err(_) => {
                        tracing::warn!(?path, "skipping unparseable template file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
