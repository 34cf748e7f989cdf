//! Agent invocation seam
//!
//! Implement [`AgentInvoker`] to plug an analysis unit into a stage. The
//! executor only sees the context it hands in and the outcome it gets back.

use crate::error::AgentError;
use serde_json::Value;

/// Successful agent outcome
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// One context bundle
    Single(Value),
    /// K bundles from a fan-out capable agent
    Branches(Vec<Value>),
}

impl AgentOutcome {
    /// Branches for a fan-out stage; a bare JSON array counts as branches
    #[must_use]
    pub fn into_branches(self) -> Vec<Value> {
        match self {
            Self::Branches(branches) | Self::Single(Value::Array(branches)) => branches,
            Self::Single(value) => vec![value],
        }
    }
}

/// Opaque unit of work: `(context) -> outcome | error`
#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Field that receives this agent's result (or error marker) in a merged context
    fn output_field(&self) -> &str {
        self.name()
    }

    /// Run against `context`
    async fn invoke(&self, context: &Value) -> Result<AgentOutcome, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arrays_split_into_branches() {
        assert_eq!(AgentOutcome::Single(json!([1, 2])).into_branches(), vec![json!(1), json!(2)]);
        assert_eq!(AgentOutcome::Single(json!({"a": 1})).into_branches().len(), 1);
        assert!(AgentOutcome::Branches(vec![]).into_branches().is_empty());
    }
}
