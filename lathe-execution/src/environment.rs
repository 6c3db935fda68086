//! Child process environment preparation

use std::collections::HashMap;

use crate::task::PathPolicy;

/// Prefixes that identify variables worth recording with an invocation
const SUMMARY_PREFIXES: &[&str] = &["LATHE_", "SLURM_"];

/// Builds the full environment for a child process.
///
/// The parent environment is inherited wholesale, then overrides are
/// merged on top. `PATH` gets special handling so an override can extend
/// rather than replace the inherited search path.
pub fn prepare_environment(
    overrides: &HashMap<String, String>,
    policy: PathPolicy,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in overrides {
        if key == "PATH" {
            let merged = merge_path(env.get("PATH").map(String::as_str), value, policy);
            env.insert(key.clone(), merged);
        } else {
            env.insert(key.clone(), value.clone());
        }
    }
    env
}

fn merge_path(inherited: Option<&str>, supplied: &str, policy: PathPolicy) -> String {
    match (policy, inherited) {
        (PathPolicy::Overwrite, _) | (_, None) => supplied.to_string(),
        (PathPolicy::Prepend, Some(old)) => format!("{supplied}:{old}"),
        (PathPolicy::Append, Some(old)) => format!("{old}:{supplied}"),
    }
}

/// Deterministic one-line summary of the variables relevant to an
/// invocation. Keys are sorted so identical environments always dedupe to
/// the same descriptor row.
pub fn summarize_environment(env: &HashMap<String, String>) -> String {
    let mut entries: Vec<String> = env
        .iter()
        .filter(|(key, _)| SUMMARY_PREFIXES.iter().any(|p| key.starts_with(p)))
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    entries.sort();
    entries.join(";")
}
