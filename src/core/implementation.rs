//! Task implementation capability trait and the task type registry.
//!
//! A task type is a name bound to a factory producing [`TaskImplementation`]
//! instances, optionally with a [`ParamsSchema`] describing its arguments.
//!
//! # Example
//!
//! ```rust,ignore
//! use task_balancer::core::{AppResult, Resource, TaskImplementation, TaskRegistry};
//! use serde_json::Value;
//!
//! struct ScrubPool;
//!
//! impl TaskImplementation for ScrubPool {
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
//! registry.register("zfs.pool.scrub", None, |_ctx| Box::new(ScrubPool))?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::core::balancer::{Balancer, BalancerInner, SubtaskHandle};
use crate::core::resource_graph::Resource;
use crate::core::schema::ParamsSchema;
use crate::core::task::{Task, TaskId, TaskProgress};
use crate::core::{AppResult, BalancerError};

/// Business logic of one task type.
///
/// Methods take `&self` because `abort` and `get_status` are called from
/// other threads while `run` is executing.
pub trait TaskImplementation: Send + Sync {
    /// Validate arguments and return the resources the task holds while running.
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>>;

    /// Perform the work. Receives its own copy of the arguments.
    fn run(&self, args: Vec<Value>) -> AppResult<Value>;

    /// Ask a running task to stop. Returns `true` if it agreed.
    fn abort(&self) -> bool {
        false
    }

    /// Incremental progress, polled while the task executes.
    fn get_status(&self) -> Option<TaskProgress> {
        None
    }
}

/// Context handed to implementation factories.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    name: String,
    balancer: Weak<BalancerInner>,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, name: impl Into<String>, balancer: Weak<BalancerInner>) -> Self {
        Self {
            task_id,
            name: name.into(),
            balancer,
        }
    }

    /// Id of the task this implementation belongs to.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Task type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the owning balancer, if it is still alive.
    #[must_use]
    pub fn balancer(&self) -> Option<Balancer> {
        self.balancer.upgrade().map(Balancer::from_inner)
    }

    /// Start a subtask owned by this task.
    ///
    /// # Errors
    ///
    /// Propagates submission and verification failures of the subtask, and
    /// returns [`BalancerError::Shutdown`] if the balancer is gone.
    pub fn run_subtask(&self, name: &str, args: Vec<Value>) -> Result<SubtaskHandle, BalancerError> {
        let balancer = self.balancer().ok_or(BalancerError::Shutdown)?;
        balancer.run_subtask(Some(self.task_id), name, args)
    }

    /// Block until every given subtask has finished and return them in order.
    pub fn join_subtasks(&self, handles: impl IntoIterator<Item = SubtaskHandle>) -> Vec<Arc<Task>> {
        Balancer::join_subtasks(handles)
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Factory producing a fresh implementation instance per task.
pub type TaskFactory = Arc<dyn Fn(TaskContext) -> Box<dyn TaskImplementation> + Send + Sync>;

/// Registered task type: factory plus optional parameter schema.
#[derive(Clone)]
pub struct TaskDescriptor {
    factory: TaskFactory,
    schema: Option<ParamsSchema>,
}

impl TaskDescriptor {
    /// Declared parameter schema, if any.
    #[must_use]
    pub const fn schema(&self) -> Option<&ParamsSchema> {
        self.schema.as_ref()
    }

    /// Instantiate the implementation for one task.
    #[must_use]
    pub fn instantiate(&self, ctx: TaskContext) -> Arc<dyn TaskImplementation> {
        Arc::from((self.factory)(ctx))
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Mapping from task type name to descriptor.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    types: HashMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::DuplicateTaskType`] if `name` is taken.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        schema: Option<ParamsSchema>,
        factory: F,
    ) -> Result<(), BalancerError>
    where
        F: Fn(TaskContext) -> Box<dyn TaskImplementation> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.types.contains_key(&name) {
            return Err(BalancerError::DuplicateTaskType(name));
        }
        self.types.insert(
            name,
            TaskDescriptor {
                factory: Arc::new(factory),
                schema,
            },
        );
        Ok(())
    }

    /// Look up a task type.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TaskDescriptor> {
        self.types.get(name)
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}
