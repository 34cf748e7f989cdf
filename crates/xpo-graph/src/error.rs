//! Graph construction and lookup errors

use thiserror::Error;

/// Errors raised while building or querying a [`StageGraph`](crate::StageGraph)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Stage id not present in the graph
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    /// Two definitions share one id
    #[error("stage defined twice: {0}")]
    DuplicateStage(String),

    /// `next` points at an undefined stage
    #[error("stage {stage} names unknown successor {next}")]
    UnknownSuccessor {
        /// Stage carrying the bad reference
        stage: String,
        /// Missing successor
        next: String,
    },

    /// Agent count does not match the merge policy
    #[error("stage {stage} has {count} agent(s), which `{policy}` does not allow")]
    InvalidArity {
        /// Offending stage
        stage: String,
        /// Merge policy name
        policy: &'static str,
        /// Configured agents
        count: usize,
    },

    /// Agent binding with an empty name
    #[error("stage {0} binds an empty agent name")]
    EmptyAgentName(String),

    /// Same agent listed twice in one stage
    #[error("stage {stage} lists agent {agent} more than once")]
    DuplicateAgent {
        /// Offending stage
        stage: String,
        /// Repeated agent
        agent: String,
    },

    /// The successor links loop back on themselves
    #[error("stage order contains a cycle")]
    Cycle,

    /// Two stages share one successor
    #[error("stage {0} is the successor of more than one stage")]
    Join(String),

    /// A stage outside the main chain declares a successor
    #[error("on-demand stage {0} must not declare a successor")]
    DetachedWithSuccessor(String),

    /// Approval field on a stage that is not terminal
    #[error("approval field is only allowed on terminal stages, found on {0}")]
    ApprovalOnNonTerminal(String),

    /// Configuration text could not be parsed
    #[error("failed to parse graph configuration: {0}")]
    Parse(String),
}

impl GraphError {
    /// Stage the error refers to, when there is one
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::UnknownStage(s)
            | Self::DuplicateStage(s)
            | Self::EmptyAgentName(s)
            | Self::Join(s)
            | Self::DetachedWithSuccessor(s)
            | Self::ApprovalOnNonTerminal(s) => Some(s),
            Self::UnknownSuccessor { stage, .. }
            | Self::InvalidArity { stage, .. }
            | Self::DuplicateAgent { stage, .. } => Some(stage),
            Self::Cycle | Self::Parse(_) => None,
        }
    }
}
