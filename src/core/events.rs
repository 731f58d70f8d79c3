//! Event sink abstraction for lifecycle notifications.

use serde_json::Value;

use crate::core::AppResult;

/// Topic emitted once when a task record is created.
pub const TASK_CREATED: &str = "task.created";
/// Topic emitted on every task state transition.
pub const TASK_UPDATED: &str = "task.updated";
/// Topic emitted on progress changes; payloads carry `nolog: true`.
pub const TASK_PROGRESS: &str = "task.progress";

/// Receiver of lifecycle events (the dispatcher's pub-sub bus).
///
/// Events are dispatched with no balancer lock held, so a sink may query the
/// balancer. It must not synchronously drive a state change of the task the
/// event is about.
pub trait EventSink: Send + Sync {
    /// Publish `payload` under `topic`.
    fn dispatch_event(&self, topic: &str, payload: Value) -> AppResult<()>;
}

/// Whether a payload asks sinks not to write it to persistent logs.
#[must_use]
pub fn is_nolog(payload: &Value) -> bool {
    payload
        .get("nolog")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
