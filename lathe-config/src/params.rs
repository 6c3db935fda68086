//! Ordered task parameter model
//!
//! A task declares its parameters as a list of [`FieldSpec`]s. Resolution
//! walks the list in declaration order: a supplied value always wins, an
//! absent value falls back to the field's default, which may be a literal,
//! a pure derivation over the fields already resolved, or a lookup of the
//! latest value another task recorded in the database. Absence itself
//! (`supplied.get(name) == None`) is the one and only "unset"
//! representation, for every parameter type.

use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigError, ConfigResult};

/// Pure derivation over already-resolved fields.
pub type DeriveFn = Arc<dyn Fn(&ResolvedParameters) -> Result<JsonValue, String> + Send + Sync>;

/// Where a field's value comes from when it is not supplied explicitly.
#[derive(Clone)]
pub enum FieldDefault {
    /// Resolution fails if the value is not supplied
    Required,
    /// Literal default
    Value(JsonValue),
    /// Derived from earlier fields' resolved values
    Derive(DeriveFn),
    /// Latest value recorded for another task's parameter, valid rows only.
    /// This gives tasks implicit data dependencies without code coupling.
    FromDatabase { task: String, param: String },
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDefault::Required => write!(f, "Required"),
            FieldDefault::Value(v) => write!(f, "Value({})", v),
            FieldDefault::Derive(_) => write!(f, "Derive(..)"),
            FieldDefault::FromDatabase { task, param } => {
                write!(f, "FromDatabase({}.{})", task, param)
            }
        }
    }
}

/// One declared parameter
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub default: FieldDefault,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: FieldDefault::Required,
        }
    }

    pub fn with_value(name: impl Into<String>, value: JsonValue) -> Self {
        Self {
            name: name.into(),
            default: FieldDefault::Value(value),
        }
    }

    pub fn derived<F>(name: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&ResolvedParameters) -> Result<JsonValue, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            default: FieldDefault::Derive(Arc::new(rule)),
        }
    }

    pub fn from_database(
        name: impl Into<String>,
        task: impl Into<String>,
        param: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            default: FieldDefault::FromDatabase {
                task: task.into(),
                param: param.into(),
            },
        }
    }
}

/// Supplier of database-derived defaults. Implemented by the storage layer;
/// [`NoDefaults`] serves models with no implicit data dependencies.
pub trait DefaultSource {
    fn latest(&self, task: &str, param: &str) -> Option<JsonValue>;
}

/// A [`DefaultSource`] that never supplies anything.
pub struct NoDefaults;

impl DefaultSource for NoDefaults {
    fn latest(&self, _task: &str, _param: &str) -> Option<JsonValue> {
        None
    }
}

/// The declared parameter set of one task type
#[derive(Debug, Clone)]
pub struct ParameterModel {
    pub task_name: String,
    pub fields: Vec<FieldSpec>,
}

impl ParameterModel {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Resolve all fields in declaration order.
    ///
    /// Precedence is fixed: an explicitly supplied value always wins over
    /// any default, derivation, or database-derived value.
    pub fn resolve(
        &self,
        supplied: &JsonMap<String, JsonValue>,
        defaults: &dyn DefaultSource,
    ) -> ConfigResult<ResolvedParameters> {
        let mut resolved = ResolvedParameters::empty();
        for spec in &self.fields {
            let value = match supplied.get(&spec.name) {
                Some(value) => value.clone(),
                None => match &spec.default {
                    FieldDefault::Required => {
                        return Err(ConfigError::MissingParameter(spec.name.clone()))
                    }
                    FieldDefault::Value(value) => value.clone(),
                    FieldDefault::Derive(rule) => {
                        rule(&resolved).map_err(|message| ConfigError::DerivationError {
                            name: spec.name.clone(),
                            message,
                        })?
                    }
                    FieldDefault::FromDatabase { task, param } => defaults
                        .latest(task, param)
                        .ok_or_else(|| ConfigError::MissingParameter(spec.name.clone()))?,
                },
            };
            resolved.values.push((spec.name.clone(), value));
        }
        Ok(resolved)
    }
}

/// Ordered name/value pairs after resolution
#[derive(Debug, Clone, Default)]
pub struct ResolvedParameters {
    values: Vec<(String, JsonValue)>,
}

impl ResolvedParameters {
    pub fn empty() -> Self {
        Self { values: Vec::new() }
    }

    /// Resolved values in an arbitrary but fixed order, mainly for tests
    /// and callers that already validated elsewhere.
    pub fn from_pairs(values: Vec<(String, JsonValue)>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Flatten to dotted column keys: a nested object value
    /// `opts = {"a": 1}` becomes the pair `("opts.a", 1)`. This is the
    /// exact shape the database persists, one column per key.
    pub fn flatten(&self) -> Vec<(String, JsonValue)> {
        let mut flat = Vec::new();
        for (name, value) in &self.values {
            flatten_into(name, value, &mut flat);
        }
        flat
    }
}

fn flatten_into(key: &str, value: &JsonValue, out: &mut Vec<(String, JsonValue)>) {
    match value {
        JsonValue::Object(map) => {
            for (sub, subvalue) in map {
                flatten_into(&format!("{}.{}", key, sub), subvalue, out);
            }
        }
        other => out.push((key.to_string(), other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn supplied(pairs: &[(&str, JsonValue)]) -> JsonMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_declaration_order_derivation() {
        let model = ParameterModel::new("IndexFrames")
            .field(FieldSpec::with_value("run", json!(12)))
            .field(FieldSpec::derived("outfile", |resolved| {
                let run = resolved
                    .get("run")
                    .and_then(|v| v.as_i64())
                    .ok_or("run not resolved yet")?;
                Ok(json!(format!("run{}.stream", run)))
            }));

        let resolved = model.resolve(&supplied(&[]), &NoDefaults).unwrap();
        assert_eq!(resolved.get("outfile"), Some(&json!("run12.stream")));
    }

    #[test]
    fn test_supplied_value_beats_every_default() {
        struct Fixed;
        impl DefaultSource for Fixed {
            fn latest(&self, _: &str, _: &str) -> Option<JsonValue> {
                Some(json!("from-db"))
            }
        }
        let model = ParameterModel::new("Merge")
            .field(FieldSpec::from_database("infile", "IndexFrames", "outfile"))
            .field(FieldSpec::with_value("cycles", json!(3)));

        let resolved = model
            .resolve(&supplied(&[("infile", json!("explicit.stream")), ("cycles", json!(10))]), &Fixed)
            .unwrap();
        assert_eq!(resolved.get("infile"), Some(&json!("explicit.stream")));
        assert_eq!(resolved.get("cycles"), Some(&json!(10)));
    }

    #[test]
    fn test_database_default_fills_unset_field() {
        struct Fixed;
        impl DefaultSource for Fixed {
            fn latest(&self, task: &str, param: &str) -> Option<JsonValue> {
                (task == "IndexFrames" && param == "outfile").then(|| json!("run7.stream"))
            }
        }
        let model = ParameterModel::new("Merge")
            .field(FieldSpec::from_database("infile", "IndexFrames", "outfile"));
        let resolved = model.resolve(&supplied(&[]), &Fixed).unwrap();
        assert_eq!(resolved.get("infile"), Some(&json!("run7.stream")));
    }

    #[test]
    fn test_missing_required_parameter() {
        let model = ParameterModel::new("Merge").field(FieldSpec::required("infile"));
        let err = model.resolve(&supplied(&[]), &NoDefaults).unwrap_err();
        assert!(matches!(err, ConfigError::MissingParameter(name) if name == "infile"));
    }

    #[test]
    fn test_flatten_nested_values() {
        let resolved = ResolvedParameters::from_pairs(vec![
            ("n".to_string(), json!(5)),
            ("opts".to_string(), json!({"a": 1, "b": {"c": 0.5}})),
        ]);
        let flat = resolved.flatten();
        assert!(flat.contains(&("n".to_string(), json!(5))));
        assert!(flat.contains(&("opts.a".to_string(), json!(1))));
        assert!(flat.contains(&("opts.b.c".to_string(), json!(0.5))));
    }
}
