//! TOML form of a stage graph

use crate::error::GraphError;
use crate::graph::{StageGraph, StageGraphBuilder};
use crate::stage::{StageDefinition, StageId};
use serde::{Deserialize, Serialize};

/// Serializable graph description
///
/// ```toml
/// entry = "segments_loaded"
///
/// [[stages]]
/// id = "segments_loaded"
/// agents = ["segment"]
/// next = "roi_gap_analyzer_run"
///
/// [[stages]]
/// id = "roi_gap_analyzer_run"
/// agents = ["roi_gap"]
/// merge = "fan-out"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Entry stage
    pub entry: StageId,
    /// Stage definitions
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

impl GraphConfig {
    /// Parse from TOML text
    ///
    /// # Errors
    ///
    /// [`GraphError::Parse`] on malformed input.
    pub fn from_toml_str(text: &str) -> Result<Self, GraphError> {
        toml::from_str(text).map_err(|e| GraphError::Parse(e.to_string()))
    }

    /// Validate into a [`StageGraph`]
    ///
    /// # Errors
    ///
    /// Any validation error from [`StageGraphBuilder::build`].
    pub fn build(&self) -> Result<StageGraph, GraphError> {
        StageGraphBuilder::new(self.entry.clone())
            .stages(self.stages.iter().cloned())
            .build()
    }
}
