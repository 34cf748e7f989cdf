//! XPO Core - Experiment Pipeline Executor
//!
//! Runs experiment requests through a stage graph:
//! - Invokes the agents bound to each stage, bounded by a timeout
//! - Combines outcomes per merge policy (`single`, `parallel-merge`, `fan-out`)
//! - Appends every settled step to the lineage store, one lineage per fan-out branch
//! - Resumes and retries from recorded history without repeating work
//! - Drives approval, deployment and feedback bookkeeping
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xpo_core::prelude::*;
//! use xpo_store::{MemoryStore, Stores};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let file = PipelineFile::load("config/pricing_experiment.toml".as_ref())?;
//! let graph = Arc::new(file.graph.build()?);
//! let agents = registry_from_fixtures(&file.agents)?;
//! let stores = Stores::shared(Arc::new(MemoryStore::new()));
//!
//! let executor = PipelineExecutor::new(graph, agents, stores, file.executor)?;
//! let service = ExperimentService::new(executor);
//!
//! let id = service.create_request("account-7", "raise ARPU", "pricing").await?;
//! let forest = service.wait(id).await?;
//! println!("{} runs across {} lineages", forest.len(), forest.lineages().len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod fixture;
pub mod merge;
pub mod projection;
pub mod registry;
pub mod service;

pub use agent::{AgentInvoker, AgentOutcome};
pub use config::{AgentFixture, ExecutorConfig, PipelineFile};
pub use error::{AgentError, PipelineError};
pub use executor::PipelineExecutor;
pub use fixture::{registry_from_fixtures, FixtureAgent};
pub use merge::{approval_granted, merge_parallel, FieldConflict, Merged};
pub use projection::project_phase;
pub use registry::AgentRegistry;
pub use service::ExperimentService;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for building and running pipelines
    pub use crate::{
        registry_from_fixtures, AgentError, AgentInvoker, AgentOutcome, AgentRegistry, ExecutorConfig,
        ExperimentService, PipelineError, PipelineExecutor, PipelineFile,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
