//! # taskchain
//!
//! A small task-scheduling core for UIs that load data lazily: a list view
//! asks for a row's content, the row's fetch and transform steps run on a
//! bounded worker pool, and the result is cached per key so scrolling back
//! is free.
//!
//! ## Architecture Overview
//!
//! - **[`task::Task`]**: a cancellable unit of work with a monotonic
//!   `Ready -> Executing -> Finished` lifecycle and a completion callback
//! - **[`task::DependencyGraph`]**: "depends-on" edges, readiness queries
//!   and transitive cancellation
//! - **[`task::Scheduler`]**: bounded worker pool that dispatches ready
//!   tasks in submission order
//! - **[`task::KeyedTaskCache`]**: at most one in-flight chain per key,
//!   with completed values cached and stale results dropped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskchain::{Chain, KeyedTaskCache, Scheduler, SchedulerConfig, Task};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scheduler = Scheduler::new(SchedulerConfig::default())?;
//!     let cache: KeyedTaskCache<usize, String> = KeyedTaskCache::new(scheduler.clone());
//!
//!     cache.request(
//!         5,
//!         || {
//!             Chain::new(Task::from_fn("fetch", |_| "raw".to_string()))
//!                 .then(Task::from_fn("transform", |inputs: Vec<String>| inputs[0].to_uppercase()))
//!         },
//!         |value| println!("row 5 ready: {}", value),
//!     )?;
//!
//!     scheduler.wait_idle().await;
//!     Ok(())
//! }
//! ```

/// Task lifecycle, dependency tracking, worker pool and keyed cache.
pub mod task;

/// Command-line front end for the row-loading simulation.
pub mod cli;

// Re-export main task types
pub use task::{
    Chain, DependencyGraph, KeyedTaskCache, Lookup, Outcome, Scheduler, SchedulerConfig,
    SchedulerError, SchedulerEvent, SchedulerEventHandler, SchedulerStats, Task, TaskBody,
    TaskContext, TaskId, TaskState,
};
