//! Analysis header and typed task parameter model
//!
//! Parameters are declared as an ordered list of field descriptors and
//! resolved strictly in declaration order, so a later field's derivation
//! rule may read earlier fields' resolved values. Business validation lives
//! here; the Executor receives only fully resolved parameter sets.

pub mod error;
pub mod header;
pub mod loader;
pub mod params;

pub use error::{ConfigError, ConfigResult};
pub use header::AnalysisHeader;
pub use loader::{load_parameter_document, parse_parameter_document, ParameterDocument};
pub use params::{
    DefaultSource, FieldDefault, FieldSpec, NoDefaults, ParameterModel, ResolvedParameters,
};
