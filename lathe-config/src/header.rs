//! Shared analysis header

use serde::{Deserialize, Serialize};

fn default_title() -> String {
    "Lathe Task Configuration".to_string()
}

fn default_experiment() -> String {
    "EXPX00000".to_string()
}

fn default_date() -> String {
    "1970/01/01".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_timeout() -> u64 {
    600
}

/// Header information shared across many invocations in one working
/// directory. Persisted once per distinct value set and referenced by id
/// from every invocation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisHeader {
    /// Description of the configuration or experiment
    #[serde(default = "default_title")]
    pub title: String,
    /// Experiment identifier
    #[serde(default = "default_experiment")]
    pub experiment: String,
    /// Data acquisition run
    #[serde(default)]
    pub run: String,
    /// Start date of analysis
    #[serde(default = "default_date")]
    pub date: String,
    /// Software version used for the analysis
    #[serde(default = "default_version")]
    pub version: String,
    /// Seconds until a task times out. Should be slightly shorter than any
    /// outer job-manager limit.
    #[serde(default = "default_timeout")]
    pub task_timeout_s: u64,
    /// Working directory. Not part of the persisted header row; derived
    /// from the experiment when empty.
    #[serde(default)]
    pub work_dir: String,
}

impl Default for AnalysisHeader {
    fn default() -> Self {
        Self {
            title: default_title(),
            experiment: default_experiment(),
            run: String::new(),
            date: default_date(),
            version: default_version(),
            task_timeout_s: default_timeout(),
            work_dir: String::new(),
        }
    }
}

impl AnalysisHeader {
    /// Working directory with the experiment-scratch fallback applied.
    pub fn resolved_work_dir(&self) -> String {
        if self.work_dir.is_empty() {
            format!("./{}/scratch", self.experiment)
        } else {
            self.work_dir.clone()
        }
    }
}
