//! Core task model, resource accounting, and the balancer.

pub mod balancer;
pub mod datastore;
pub mod error;
pub mod events;
pub mod implementation;
pub mod resource_graph;
pub mod schema;
pub mod signal;
pub mod task;

pub use balancer::{Balancer, BalancerStats, SubtaskHandle};
pub use datastore::{Datastore, StorageSemantics};
pub use error::{AppResult, BalancerError};
pub use events::{EventSink, TASK_CREATED, TASK_PROGRESS, TASK_UPDATED};
pub use implementation::{TaskContext, TaskDescriptor, TaskFactory, TaskImplementation, TaskRegistry};
pub use resource_graph::{Resource, ResourceGraph, ResourceGraphGuard};
pub use schema::{
    serialize_errors, DefaultValidator, ParamSpec, ParamType, ParamsSchema, ValidationError, Validator,
};
pub use signal::CompletionSignal;
pub use task::{Task, TaskId, TaskProgress, TaskSnapshot, TaskState};
