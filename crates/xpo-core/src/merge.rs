//! Merging agent outcomes into run outputs
//!
//! Provides:
//! - [`merge_parallel`]: field-wise union of several agents' outcomes
//! - [`degrade`]: context with an error marker in place of an agent's field
//! - [`error_marker`] / [`is_error_marker`]: the marker format
//! - [`approval_granted`]: terminal approval check
//!
//! Each object outcome is diffed against the shared input. Changed fields
//! are applied in configuration order, so on a conflict the last agent wins
//! and the conflict is reported.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;

/// What one agent contributed to a parallel stage
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    /// Settled with a value
    Value(Value),
    /// Settled with a soft error
    Soft(String),
}

/// One settled agent of a parallel stage, in configuration order
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    /// Agent name
    pub agent: String,
    /// Field used for non-object outcomes and error markers
    pub output_field: String,
    /// Outcome
    pub contribution: Contribution,
}

/// Field written by two agents with different values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConflict {
    /// Field name
    pub field: String,
    /// Agent whose value was overwritten
    pub overwritten: String,
    /// Agent whose value was kept
    pub kept: String,
}

impl fmt::Display for FieldConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} overwritten by {}", self.field, self.overwritten, self.kept)
    }
}

/// Result of [`merge_parallel`]
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    /// Combined context
    pub output: Value,
    /// Conflicts resolved last-writer-wins
    pub conflicts: Vec<FieldConflict>,
}

/// Error marker stored in place of a missing result
#[must_use]
pub fn error_marker(kind: &str, agent: &str, stage: &str, message: &str) -> Value {
    json!({
        "error": {
            "kind": kind,
            "agent": agent,
            "stage": stage,
            "message": message,
        }
    })
}

/// Whether `value` is an error marker
#[must_use]
pub fn is_error_marker(value: &Value) -> bool {
    value
        .get("error")
        .and_then(|e| e.get("kind"))
        .and_then(Value::as_str)
        .is_some_and(|kind| kind == "soft" || kind == "fatal")
}

/// `input` as an object, or an empty object for non-object contexts
fn base_object(input: &Value) -> Map<String, Value> {
    match input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    }
}

/// Context with `field` replaced by a soft error marker
#[must_use]
pub fn degrade(input: &Value, field: &str, agent: &str, stage: &str, message: &str) -> Value {
    let mut base = base_object(input);
    base.insert(field.to_string(), error_marker("soft", agent, stage, message));
    Value::Object(base)
}

/// Merge the settled outcomes of a parallel stage
#[must_use]
pub fn merge_parallel(input: &Value, stage: &str, settled: &[Settled]) -> Merged {
    let mut output = base_object(input);
    let mut writers: HashMap<String, String> = HashMap::new();
    let mut conflicts = Vec::new();

    for entry in settled {
        let changes: Vec<(String, Value)> = match &entry.contribution {
            Contribution::Value(Value::Object(fields)) => fields
                .iter()
                .filter(|(k, v)| input.get(k.as_str()) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Contribution::Value(other) => vec![(entry.output_field.clone(), other.clone())],
            Contribution::Soft(message) => vec![(
                entry.output_field.clone(),
                error_marker("soft", &entry.agent, stage, message),
            )],
        };

        for (field, value) in changes {
            if let Some(previous) = writers.get(&field) {
                if output.get(&field) != Some(&value) {
                    conflicts.push(FieldConflict {
                        field: field.clone(),
                        overwritten: previous.clone(),
                        kept: entry.agent.clone(),
                    });
                }
            }
            writers.insert(field.clone(), entry.agent.clone());
            output.insert(field, value);
        }
    }

    Merged {
        output: Value::Object(output),
        conflicts,
    }
}

/// Whether a terminal output grants deployment approval through `field`
#[must_use]
pub fn approval_granted(output: &Value, field: &str) -> bool {
    match output.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(granted)) => *granted,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(value) => !is_error_marker(value),
    }
}
