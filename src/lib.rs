//! # Task Balancer
//!
//! Resource-aware admission control for long-running administrative tasks.
//!
//! Clients submit a task by type name with positional arguments. The balancer
//! validates the arguments, persists the task, and queues it. A distribution
//! loop asks each task's implementation which named resources it needs, and a
//! scheduling pass starts every waiting task whose resources are all free.
//! Two tasks that name the same resource never execute at the same time.
//!
//! ## Lifecycle
//!
//! ```text
//! CREATED ──verify──▶ WAITING ──resources free──▶ EXECUTING ──▶ FINISHED
//!    │                   │                            │
//!    └──▶ FAILED         └──▶ ABORTED                 ├──▶ FAILED
//!                                                     └──▶ ABORTED
//! ```
//!
//! Every transition is published as a `task.updated` event and persisted as a
//! snapshot. Progress polled from running tasks goes out as `task.progress`
//! events marked `nolog`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use task_balancer::builders::BalancerBuilder;
//! use task_balancer::core::{AppResult, Resource, TaskImplementation, TaskRegistry};
//!
//! struct Scrub;
//!
//! impl TaskImplementation for Scrub {
//!     fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
//!         Ok(vec![Resource::new(format!("zpool:{}", args[0]))])
//!     }
//!
//!     fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
//!         Ok(Value::Null)
//!     }
//! }
//!
//! let mut registry = TaskRegistry::new();
//! registry.register("zfs.pool.scrub", None, |_ctx| Box::new(Scrub))?;
//!
//! let balancer = BalancerBuilder::new(registry).build_started()?;
//! let id = balancer.submit("zfs.pool.scrub", vec![json!("tank")])?;
//! ```
//!
//! For complete scenarios, see `tests/balancer_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task model, resource graph, and the balancer.
pub mod core;
/// Configuration models.
pub mod config;
/// Builders assembling a balancer from its collaborators.
pub mod builders;
/// In-memory event bus and datastore adapters.
pub mod infra;
/// API surface over the balancer.
pub mod runtime;
/// Shared utilities.
pub mod util;
