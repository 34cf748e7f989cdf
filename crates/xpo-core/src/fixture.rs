//! Agents built from pipeline-file fixtures

use crate::agent::{AgentInvoker, AgentOutcome};
use crate::config::AgentFixture;
use crate::error::{AgentError, PipelineError};
use crate::registry::AgentRegistry;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Behavior {
    Output(Value),
    Branches(Vec<Value>),
    Soft(String),
    Fatal(String),
}

/// Static agent that annotates its input with a configured result
#[derive(Debug, Clone)]
pub struct FixtureAgent {
    name: String,
    output_field: String,
    behavior: Behavior,
    delay: Duration,
}

impl FixtureAgent {
    /// Build from a fixture
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] unless exactly one behavior is set.
    pub fn from_fixture(fixture: &AgentFixture) -> Result<Self, PipelineError> {
        let mut behaviors = Vec::new();
        if let Some(v) = &fixture.output {
            behaviors.push(Behavior::Output(v.clone()));
        }
        if let Some(b) = &fixture.branches {
            behaviors.push(Behavior::Branches(b.clone()));
        }
        if let Some(m) = &fixture.soft_error {
            behaviors.push(Behavior::Soft(m.clone()));
        }
        if let Some(m) = &fixture.fatal_error {
            behaviors.push(Behavior::Fatal(m.clone()));
        }
        if behaviors.len() != 1 {
            return Err(PipelineError::configuration(format!(
                "agent {} must declare exactly one of output, branches, soft_error, fatal_error",
                fixture.name
            )));
        }

        Ok(Self {
            output_field: fixture.output_field.clone().unwrap_or_else(|| fixture.name.clone()),
            name: fixture.name.clone(),
            behavior: behaviors.remove(0),
            delay: Duration::from_millis(fixture.delay_ms),
        })
    }

    fn annotate(&self, context: &Value, value: Value) -> Value {
        let mut map = match context {
            Value::Object(m) => m.clone(),
            _ => Map::new(),
        };
        map.insert(self.output_field.clone(), value);
        Value::Object(map)
    }
}

#[async_trait::async_trait]
impl AgentInvoker for FixtureAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_field(&self) -> &str {
        &self.output_field
    }

    async fn invoke(&self, context: &Value) -> Result<AgentOutcome, AgentError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            Behavior::Output(v) => Ok(AgentOutcome::Single(self.annotate(context, v.clone()))),
            Behavior::Branches(bs) => Ok(AgentOutcome::Branches(
                bs.iter().map(|b| self.annotate(context, b.clone())).collect(),
            )),
            Behavior::Soft(m) => Err(AgentError::soft(m.clone())),
            Behavior::Fatal(m) => Err(AgentError::fatal(m.clone())),
        }
    }
}

/// Registry holding one [`FixtureAgent`] per fixture
///
/// # Errors
///
/// The first fixture that fails [`FixtureAgent::from_fixture`].
pub fn registry_from_fixtures(fixtures: &[AgentFixture]) -> Result<AgentRegistry, PipelineError> {
    let mut registry = AgentRegistry::new();
    for fixture in fixtures {
        registry.register(Arc::new(FixtureAgent::from_fixture(fixture)?));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture(name: &str) -> AgentFixture {
        AgentFixture {
            name: name.into(),
            output_field: None,
            output: None,
            branches: None,
            soft_error: None,
            fatal_error: None,
            delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn branches_annotate_the_context() {
        let agent = FixtureAgent::from_fixture(&AgentFixture {
            branches: Some(vec![json!("g1"), json!("g2")]),
            ..fixture("gaps")
        })
        .unwrap();

        let out = agent.invoke(&json!({"plan": 1})).await.unwrap();
        assert_eq!(
            out,
            AgentOutcome::Branches(vec![json!({"plan": 1, "gaps": "g1"}), json!({"plan": 1, "gaps": "g2"})])
        );
    }

    #[test]
    fn exactly_one_behavior() {
        assert!(FixtureAgent::from_fixture(&fixture("none")).is_err());
        assert!(FixtureAgent::from_fixture(&AgentFixture {
            output: Some(json!(1)),
            fatal_error: Some("x".into()),
            ..fixture("two")
        })
        .is_err());
    }

    #[tokio::test]
    async fn errors_keep_their_class() {
        let soft = FixtureAgent::from_fixture(&AgentFixture {
            soft_error: Some("unparseable".into()),
            ..fixture("s")
        })
        .unwrap();
        assert_eq!(soft.invoke(&json!({})).await, Err(AgentError::soft("unparseable")));
    }
}
