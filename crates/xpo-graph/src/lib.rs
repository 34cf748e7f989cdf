//! XPO Stage Graph
//!
//! Static description of an experiment pipeline:
//! - [`StageDefinition`]: the agents bound to one stage and how their outcomes combine
//! - [`MergePolicy`]: `single`, `parallel-merge` or `fan-out`
//! - [`StageGraph`]: validated, read-only registry built once at startup
//! - [`GraphConfig`]: TOML form of a graph
//!
//! Stages form a straight line from the entry stage. Stages that are not
//! reachable from the entry are *on-demand* stages, run only when a caller
//! asks for them explicitly (feedback collection, for instance).
//!
//! # Example
//!
//! ```rust
//! use xpo_graph::{StageDefinition, StageGraphBuilder};
//!
//! let graph = StageGraphBuilder::new("segments_loaded")
//!     .stage(StageDefinition::single("segments_loaded", "segment_agent").then("roi_gap_analyzer_run"))
//!     .stage(StageDefinition::fan_out("roi_gap_analyzer_run", "roi_gap_agent"))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(graph.first_stage().as_str(), "segments_loaded");
//! assert_eq!(
//!     graph.next_stage("segments_loaded").unwrap().map(|s| s.as_str()),
//!     Some("roi_gap_analyzer_run")
//! );
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod config;
mod error;
mod graph;
mod stage;

pub use config::GraphConfig;
pub use error::GraphError;
pub use graph::{StageGraph, StageGraphBuilder};
pub use stage::{MergePolicy, StageDefinition, StageId};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
