//! API surface over the balancer.

pub mod api;

pub use api::{
    abort_task, health, list_tasks, submit_task, task_view, ApiError, Health, TaskSubmission, TaskView,
};
