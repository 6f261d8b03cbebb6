//! Dependency-aware autonomous work dispatch.
//!
//! Foreman drives a bounded pool of external workers over a work-item
//! dependency graph: it claims ready items in impact order, gates every
//! completion through an ordered validation pipeline, escalates resource
//! conflicts through a three-tier strategy, bounds retries, and feeds
//! classified failure patterns back into future dispatch context.
//!
//! The two heavyweight collaborators, the dependency store (issue tracker)
//! and the graph analyzer, sit behind traits; in-process implementations
//! ship for embedding and testing. Workers are external commands.

pub mod config;
pub mod graph;
pub mod item;
pub mod journal;
pub mod learning;
pub mod lock;
pub mod resolve;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod testkit;
pub mod validate;
pub mod worker;

pub use config::ForemanConfig;
pub use graph::{GraphAnalyzer, StoreGraphAnalyzer};
pub use item::{ItemKind, ItemStatus, WorkItem};
pub use scheduler::{DispatchStats, Scheduler, SchedulerError};
pub use store::{DependencyStore, MemoryStore};
pub use validate::{GitWorkspace, Workspace};
pub use worker::{CommandWorker, Worker};
