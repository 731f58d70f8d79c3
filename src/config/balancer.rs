//! Balancer configuration structure.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_tasks_collection() -> String {
    "tasks".into()
}

fn default_initial_resources() -> Vec<String> {
    vec!["system".into()]
}

const fn default_intake_warn_depth() -> usize {
    1000
}

/// Balancer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Interval between `get_status` polls of an executing task, in milliseconds.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Datastore collection holding task snapshots.
    #[serde(default = "default_tasks_collection")]
    pub tasks_collection: String,
    /// Resources registered in the graph at startup.
    #[serde(default = "default_initial_resources")]
    pub initial_resources: Vec<String>,
    /// Intake depth above which submissions log a warning. The queue itself is unbounded.
    #[serde(default = "default_intake_warn_depth")]
    pub intake_warn_depth: usize,
    /// Stack size for task threads; platform default when absent.
    #[serde(default)]
    pub task_stack_size: Option<usize>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            tasks_collection: default_tasks_collection(),
            initial_resources: default_initial_resources(),
            intake_warn_depth: default_intake_warn_depth(),
            task_stack_size: None,
        }
    }
}

impl BalancerConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the progress poll interval.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the tasks collection name.
    #[must_use]
    pub fn with_tasks_collection(mut self, name: impl Into<String>) -> Self {
        self.tasks_collection = name.into();
        self
    }

    /// Set the resources registered at startup.
    #[must_use]
    pub fn with_initial_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Set the intake warning depth.
    #[must_use]
    pub const fn with_intake_warn_depth(mut self, depth: usize) -> Self {
        self.intake_warn_depth = depth;
        self
    }

    /// Set the task thread stack size.
    #[must_use]
    pub const fn with_task_stack_size(mut self, bytes: usize) -> Self {
        self.task_stack_size = Some(bytes);
        self
    }

    /// Progress poll interval as a duration.
    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.progress_interval_ms == 0 {
            return Err("progress_interval_ms must be greater than 0".into());
        }
        if self.tasks_collection.trim().is_empty() {
            return Err("tasks_collection must not be empty".into());
        }
        if self.intake_warn_depth == 0 {
            return Err("intake_warn_depth must be greater than 0".into());
        }
        if self.initial_resources.iter().any(|r| r.trim().is_empty()) {
            return Err("initial_resources must not contain blank names".into());
        }
        if self.task_stack_size == Some(0) {
            return Err("task_stack_size must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `BALANCER_*` environment variables.
    ///
    /// A `.env` file in the working directory (or a parent) is loaded first if
    /// present. Recognized variables: `BALANCER_PROGRESS_INTERVAL_MS`,
    /// `BALANCER_TASKS_COLLECTION`, `BALANCER_INITIAL_RESOURCES` (comma
    /// separated), `BALANCER_INTAKE_WARN_DEPTH`, `BALANCER_TASK_STACK_SIZE`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the malformed variable, or a validation error.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a message naming the malformed variable, or a validation error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup("BALANCER_PROGRESS_INTERVAL_MS") {
            cfg.progress_interval_ms = parse_var("BALANCER_PROGRESS_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("BALANCER_TASKS_COLLECTION") {
            cfg.tasks_collection = v;
        }
        if let Some(v) = lookup("BALANCER_INITIAL_RESOURCES") {
            cfg.initial_resources = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("BALANCER_INTAKE_WARN_DEPTH") {
            cfg.intake_warn_depth = parse_var("BALANCER_INTAKE_WARN_DEPTH", &v)?;
        }
        if let Some(v) = lookup("BALANCER_TASK_STACK_SIZE") {
            cfg.task_stack_size = Some(parse_var("BALANCER_TASK_STACK_SIZE", &v)?);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{key}: invalid value `{value}`: {e}"))
}
