//! Parameter document loader
//!
//! A parameter document is a two-document YAML stream: the first document is
//! the shared analysis header, the second maps task names to their supplied
//! parameter maps. Values stay untyped here; typing happens when the task's
//! [`crate::ParameterModel`] resolves them.

use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::path::Path;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::header::AnalysisHeader;

/// Parsed parameter document
#[derive(Debug, Clone)]
pub struct ParameterDocument {
    pub header: AnalysisHeader,
    tasks: JsonMap<String, JsonValue>,
}

impl ParameterDocument {
    /// Supplied parameters for one task, empty if the task has no section.
    pub fn supplied_for(&self, task_name: &str) -> JsonMap<String, JsonValue> {
        match self.tasks.get(task_name) {
            Some(JsonValue::Object(map)) => map.clone(),
            _ => JsonMap::new(),
        }
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

/// Load and split a two-document YAML parameter file.
pub fn load_parameter_document(path: &Path) -> ConfigResult<ParameterDocument> {
    let text = std::fs::read_to_string(path)?;
    parse_parameter_document(&text)
}

/// Split and parse a two-document YAML parameter stream.
pub fn parse_parameter_document(text: &str) -> ConfigResult<ParameterDocument> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value: serde_yaml::Value = serde_yaml::Value::deserialize(document)?;
        documents.push(value);
    }
    if documents.len() != 2 {
        return Err(ConfigError::InvalidDocument(format!(
            "expected 2 YAML documents (header, tasks), found {}",
            documents.len()
        )));
    }
    let header: AnalysisHeader = serde_yaml::from_value(documents[0].clone())?;
    let tasks_value: JsonValue = serde_yaml::from_value(documents[1].clone())?;
    let tasks = match tasks_value {
        JsonValue::Object(map) => map,
        JsonValue::Null => JsonMap::new(),
        _ => {
            return Err(ConfigError::InvalidDocument(
                "task document must be a mapping of task names".to_string(),
            ))
        }
    };
    debug!(tasks = tasks.len(), "parameter document loaded");
    Ok(ParameterDocument { header, tasks })
}
