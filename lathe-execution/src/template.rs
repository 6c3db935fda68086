//! Third-party configuration file rendering seam

use std::path::PathBuf;

use serde_json::Value as JsonValue;

use crate::error::ExecutionError;

/// Request to materialize one configuration file before a third-party
/// task is spawned.
#[derive(Debug, Clone)]
pub struct TemplateRequest {
    /// Identifier of the template to render
    pub template_id: String,
    /// Substitution values
    pub values: JsonValue,
    /// Destination path for the rendered file
    pub target: PathBuf,
}

/// Collaborator that turns a [`TemplateRequest`] into a file on disk.
///
/// The executor only depends on this contract; which template engine
/// backs it is up to the embedding application.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, request: &TemplateRequest) -> Result<(), ExecutionError>;
}

/// Renderer used when an invocation carries no templates.
pub struct NoTemplates;

impl TemplateRenderer for NoTemplates {
    fn render(&self, request: &TemplateRequest) -> Result<(), ExecutionError> {
        Err(ExecutionError::TemplateError {
            template: request.template_id.clone(),
            message: "no template renderer configured".to_string(),
        })
    }
}
