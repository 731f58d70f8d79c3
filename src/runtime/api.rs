//! API-facing request/response models.
//!
//! Maps balancer results onto errno-style failures for an RPC layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{
    serialize_errors, Balancer, BalancerError, BalancerStats, Resource, Task, TaskId, TaskProgress, TaskState,
};

/// Invalid argument.
pub const EINVAL: i32 = 22;
/// No such task.
pub const ENOENT: i32 = 2;
/// Balancer no longer accepts work.
pub const ESHUTDOWN: i32 = 108;
/// Backend failure.
pub const EIO: i32 = 5;

/// Caller-facing failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// errno-style code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Structured detail, e.g. serialized validation errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl ApiError {
    /// Error without extra detail.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extra: None,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<BalancerError> for ApiError {
    fn from(err: BalancerError) -> Self {
        let code = if err.is_invalid_argument() {
            EINVAL
        } else if matches!(err, BalancerError::Shutdown) {
            ESHUTDOWN
        } else {
            EIO
        };
        let extra = match &err {
            BalancerError::SchemaViolation(errors) => Some(serialize_errors(errors)),
            _ => None,
        };
        Self {
            code,
            message: err.to_string(),
            extra,
        }
    }
}

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Registered task type name.
    pub name: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Task status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    /// Task identifier.
    pub id: TaskId,
    /// Task type name.
    pub name: String,
    /// Current state.
    pub state: TaskState,
    /// Resources reported by verification.
    pub resources: Vec<Resource>,
    /// Last reported progress.
    pub progress: Option<TaskProgress>,
    /// Result of a successful run.
    pub result: Option<Value>,
    /// Owning task for subtasks.
    pub parent: Option<TaskId>,
    /// Creation time (ms since epoch).
    pub created_at: u64,
    /// Execution start time (ms since epoch).
    pub started_at: Option<u64>,
    /// Terminal transition time (ms since epoch).
    pub finished_at: Option<u64>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        let snapshot = task.snapshot();
        Self {
            id: task.id(),
            name: snapshot.name,
            state: snapshot.state,
            resources: snapshot.resources,
            progress: snapshot.progress,
            result: snapshot.result,
            parent: snapshot.parent,
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag: the balancer accepts submissions.
    pub ok: bool,
    /// Per-state counts.
    pub stats: BalancerStats,
}

/// Submit a task.
///
/// # Errors
///
/// `EINVAL` for unknown types and schema violations (with the itemized
/// violations in `extra`), `ESHUTDOWN` after shutdown, `EIO` otherwise.
pub fn submit_task(balancer: &Balancer, req: TaskSubmission) -> Result<TaskId, ApiError> {
    balancer.submit(&req.name, req.args).map_err(ApiError::from)
}

/// Ask a task to abort. Returns whether it was aborted.
///
/// # Errors
///
/// `ENOENT` if no task with `id` is known.
pub fn abort_task(balancer: &Balancer, id: TaskId) -> Result<bool, ApiError> {
    if balancer.get_task(id).is_none() {
        return Err(ApiError::new(ENOENT, format!("task {id} not found")));
    }
    Ok(balancer.abort(id))
}

/// Current view of one task.
///
/// # Errors
///
/// `ENOENT` if no task with `id` is known.
pub fn task_view(balancer: &Balancer, id: TaskId) -> Result<TaskView, ApiError> {
    balancer
        .get_task(id)
        .map(|t| TaskView::from(t.as_ref()))
        .ok_or_else(|| ApiError::new(ENOENT, format!("task {id} not found")))
}

/// Views of all known tasks, optionally only those in `state`.
#[must_use]
pub fn list_tasks(balancer: &Balancer, state: Option<TaskState>) -> Vec<TaskView> {
    balancer
        .get_tasks(state)
        .iter()
        .map(|t| TaskView::from(t.as_ref()))
        .collect()
}

/// Return a health payload.
#[must_use]
pub fn health(balancer: &Balancer) -> Health {
    Health {
        ok: !balancer.is_shutdown(),
        stats: balancer.stats(),
    }
}
