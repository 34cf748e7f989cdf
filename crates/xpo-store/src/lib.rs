//! XPO Store
//!
//! Records and storage contracts for experiment pipelines:
//! - [`Request`]: one experiment intent with its coarse phase
//! - [`Run`]: immutable lineage node; runs form a forest per request
//! - [`RunForest`]: derived lineages, leaves and progress counters
//! - [`StepAudit`]: flat observability log
//! - [`LineageStore`], [`RequestStore`], [`AuditSink`]: backend seams
//! - [`MemoryStore`]: in-memory backend

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod audit;
mod error;
mod forest;
mod ids;
mod memory;
mod request;
mod run;
mod store;

pub use audit::StepAudit;
pub use error::StoreError;
pub use forest::{is_finished, ForestSummary, Lineage, RunForest};
pub use ids::{InvocationId, RequestId, RunId};
pub use memory::{check_flag_update, MemoryStore};
pub use request::{NewRequest, Request, PHASE_COMPLETED};
pub use run::{input_digest, FlagUpdate, LineageEnd, Run, RunDraft, RunStatus, StepKey, TerminalFlags};
pub use store::{AuditSink, LineageStore, RequestStore, Stores};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
