//! Task balancer: submission, distribution, admission control, and abort.
//!
//! The balancer owns the intake queue, the roster of verified tasks, and the
//! distribution loop. Admission is decided by a scheduling pass that runs
//! under the resource graph's lock:
//!
//! 1. A task is submitted, validated against its schema, persisted, and queued.
//! 2. The distribution loop verifies queued tasks one at a time, obtaining
//!    their resource lists, and marks them WAITING.
//! 3. A scheduling pass scans WAITING tasks in roster order and starts every
//!    task whose resources can all be acquired right now.
//! 4. When a task's thread exits, its resources are released and another
//!    pass runs.
//!
//! There is no partial acquisition and no fairness policy beyond roster order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::BalancerConfig;
use crate::core::datastore::{Datastore, StorageSemantics};
use crate::core::events::{EventSink, TASK_CREATED};
use crate::core::implementation::{TaskContext, TaskDescriptor, TaskRegistry};
use crate::core::resource_graph::{Resource, ResourceGraph};
use crate::core::schema::Validator;
use crate::core::task::{panic_message, Task, TaskId, TaskReporter, TaskSnapshot, TaskState};
use crate::core::BalancerError;
use crate::util::clock::now_ms;

/// Shared state behind every [`Balancer`] handle.
pub(crate) struct BalancerInner {
    config: BalancerConfig,
    registry: TaskRegistry,
    validator: Arc<dyn Validator>,
    resource_graph: Arc<ResourceGraph>,
    reporter: Arc<TaskReporter>,
    /// Verified tasks and subtasks in insertion order. Never evicted.
    roster: RwLock<Vec<Arc<Task>>>,
    /// Sender side of the intake queue; `None` after shutdown.
    intake_tx: Mutex<Option<Sender<Arc<Task>>>>,
    intake_rx: Receiver<Arc<Task>>,
    distribution: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// Point-in-time counts of roster tasks per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerStats {
    /// Tasks waiting in the intake queue for verification.
    pub queued: usize,
    /// Roster tasks in CREATED.
    pub created: usize,
    /// Roster tasks in WAITING.
    pub waiting: usize,
    /// Roster tasks in EXECUTING.
    pub executing: usize,
    /// Roster tasks in FINISHED.
    pub finished: usize,
    /// Roster tasks in FAILED.
    pub failed: usize,
    /// Roster tasks in ABORTED.
    pub aborted: usize,
}

/// Running subtask and its thread of control.
#[derive(Debug)]
pub struct SubtaskHandle {
    task: Arc<Task>,
    thread: JoinHandle<()>,
}

impl SubtaskHandle {
    /// The subtask.
    #[must_use]
    pub const fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Id of the subtask.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Block until the subtask's thread has finished.
    pub fn join(self) -> Arc<Task> {
        if self.thread.join().is_err() {
            warn!(task_id = self.task.id(), "subtask thread panicked");
        }
        self.task
    }
}

/// Handle to the task balancer. Cheap to clone.
#[derive(Clone)]
pub struct Balancer {
    inner: Arc<BalancerInner>,
}

impl Balancer {
    /// Create a balancer from its collaborators.
    ///
    /// Declares the tasks collection with serial, log semantics and registers
    /// the configured initial resources. The distribution loop is not running
    /// until [`Balancer::start`].
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::InvalidConfig`] for an invalid configuration and
    /// [`BalancerError::Datastore`] if the collection cannot be declared.
    pub fn new(
        config: BalancerConfig,
        registry: TaskRegistry,
        events: Arc<dyn EventSink>,
        datastore: Arc<dyn Datastore>,
        resource_graph: Arc<ResourceGraph>,
        validator: Arc<dyn Validator>,
    ) -> Result<Self, BalancerError> {
        config.validate().map_err(BalancerError::InvalidConfig)?;

        datastore
            .require_collection(
                &config.tasks_collection,
                &[StorageSemantics::Serial, StorageSemantics::Log],
            )
            .map_err(|e| BalancerError::Datastore(e.to_string()))?;

        {
            let mut graph = resource_graph.lock();
            for name in &config.initial_resources {
                graph.add_resource(Resource::new(name.clone()));
            }
        }

        let reporter = Arc::new(TaskReporter {
            events,
            datastore,
            collection: config.tasks_collection.clone(),
        });
        let (intake_tx, intake_rx) = unbounded();

        Ok(Self {
            inner: Arc::new(BalancerInner {
                config,
                registry,
                validator,
                resource_graph,
                reporter,
                roster: RwLock::new(Vec::new()),
                intake_tx: Mutex::new(Some(intake_tx)),
                intake_rx,
                distribution: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) const fn from_inner(inner: Arc<BalancerInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<BalancerInner> {
        Arc::downgrade(&self.inner)
    }

    /// Start the distribution loop. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::Shutdown`] after shutdown, or
    /// [`BalancerError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), BalancerError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(BalancerError::Shutdown);
        }
        let mut distribution = self.inner.distribution.lock();
        if distribution.is_some() {
            debug!("balancer already started");
            return Ok(());
        }

        let balancer = self.clone();
        let rx = self.inner.intake_rx.clone();
        let handle = thread::Builder::new()
            .name("balancer-distribution".into())
            .spawn(move || balancer.distribution_loop(&rx))?;
        *distribution = Some(handle);

        info!("Balancer started");
        Ok(())
    }

    /// Stop accepting submissions and stop the distribution loop.
    ///
    /// Tasks still queued are verified before the loop exits. Executing tasks
    /// are not interrupted.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down balancer");

        // Dropping the only sender ends the distribution loop once the queue drains.
        self.inner.intake_tx.lock().take();

        let handle = self.inner.distribution.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("distribution loop panicked");
            }
        }
        info!("Balancer shut down complete");
    }

    /// Whether [`Balancer::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Submit a task by type name. Returns the persisted task id.
    ///
    /// # Errors
    ///
    /// - [`BalancerError::UnknownTaskType`] if `name` is not registered
    /// - [`BalancerError::SchemaViolation`] with every violation if `args` do not match
    /// - [`BalancerError::Datastore`] if the task cannot be persisted
    /// - [`BalancerError::Shutdown`] after shutdown
    ///
    /// No task is created, persisted, or announced on any error path before persistence.
    pub fn submit(&self, name: &str, args: Vec<Value>) -> Result<TaskId, BalancerError> {
        if self.is_shutdown() {
            return Err(BalancerError::Shutdown);
        }
        let descriptor = self.descriptor(name)?;
        self.verify_schema(name, descriptor, &args)?;

        let task = self.create_task(name, args, None)?;
        self.emit_created(&task);

        {
            let intake = self.inner.intake_tx.lock();
            let Some(tx) = intake.as_ref() else {
                task.fail("balancer shut down before the task was queued", None);
                return Err(BalancerError::Shutdown);
            };
            if tx.send(Arc::clone(&task)).is_err() {
                task.fail("balancer shut down before the task was queued", None);
                return Err(BalancerError::Shutdown);
            }
        }

        let depth = self.intake_depth();
        if depth > self.inner.config.intake_warn_depth {
            warn!(depth = depth, "intake queue is growing");
        }

        info!(task_id = task.id(), name = name, "Task submitted");
        Ok(task.id())
    }

    /// Create and start a subtask immediately, bypassing the intake queue.
    ///
    /// Verification runs on the caller's thread and its failure is returned.
    /// The subtask does not take part in resource admission; it runs under
    /// whatever its parent holds.
    ///
    /// The subtask is stored and announced with `task.created` before it is
    /// verified, because its implementation is built with the task id. A
    /// subtask failing verification therefore stays on record as FAILED.
    ///
    /// # Errors
    ///
    /// Same submission errors as [`Balancer::submit`], including
    /// [`BalancerError::Shutdown`] once the balancer is shut down, plus
    /// [`BalancerError::Verification`] / [`BalancerError::InvalidResources`]
    /// from verification and [`BalancerError::Spawn`] if the thread cannot start.
    pub fn run_subtask(
        &self,
        parent: Option<TaskId>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<SubtaskHandle, BalancerError> {
        if self.is_shutdown() {
            return Err(BalancerError::Shutdown);
        }
        let descriptor = self.descriptor(name)?;
        self.verify_schema(name, descriptor, &args)?;

        let task = self.create_task(name, args, parent)?;
        self.emit_created(&task);

        if let Err(err) = self.verify_task(&task, descriptor) {
            warn!(task_id = task.id(), error = %err, "Cannot verify subtask");
            task.fail(&err.to_string(), None);
            return Err(err);
        }

        self.inner.roster.write().push(Arc::clone(&task));
        task.set_state(TaskState::Executing, None);

        match self.spawn_execution(&task) {
            Ok(thread) => {
                debug!(task_id = task.id(), parent = ?parent, "subtask started");
                Ok(SubtaskHandle { task, thread })
            }
            Err(e) => {
                task.fail(&format!("failed to start task thread: {e}"), None);
                Err(BalancerError::Spawn(e))
            }
        }
    }

    /// Block until every given subtask's thread has finished.
    pub fn join_subtasks(handles: impl IntoIterator<Item = SubtaskHandle>) -> Vec<Arc<Task>> {
        handles.into_iter().map(SubtaskHandle::join).collect()
    }

    /// Ask a task to abort. Returns `true` if it transitioned to ABORTED.
    ///
    /// Unknown ids, implementations that decline, and implementations that
    /// panic are all reported as `false`.
    pub fn abort(&self, id: TaskId) -> bool {
        let Some(task) = self.get_task(id) else {
            warn!(task_id = id, "Cannot abort task: unknown task id");
            return false;
        };
        let Some(instance) = task.instance() else {
            warn!(task_id = id, "Cannot abort task: no implementation instance");
            return false;
        };

        let success = match catch_unwind(AssertUnwindSafe(|| instance.abort())) {
            Ok(success) => success,
            Err(payload) => {
                debug!(
                    task_id = id,
                    error = %panic_message(payload.as_ref()),
                    "abort panicked"
                );
                false
            }
        };

        if success && task.mark_aborted() {
            info!(task_id = id, "Task aborted");
            true
        } else {
            false
        }
    }

    /// Roster tasks not yet in a terminal state.
    #[must_use]
    pub fn get_active_tasks(&self) -> Vec<Arc<Task>> {
        self.inner
            .roster
            .read()
            .iter()
            .filter(|t| t.state().is_active())
            .cloned()
            .collect()
    }

    /// All roster tasks, optionally only those in `state`.
    #[must_use]
    pub fn get_tasks(&self, state: Option<TaskState>) -> Vec<Arc<Task>> {
        let roster = self.inner.roster.read();
        match state {
            None => roster.clone(),
            Some(state) => roster.iter().filter(|t| t.state() == state).cloned().collect(),
        }
    }

    /// First roster task with the given id.
    #[must_use]
    pub fn get_task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.inner.roster.read().iter().find(|t| t.id() == id).cloned()
    }

    /// Tasks queued for verification.
    #[must_use]
    pub fn intake_depth(&self) -> usize {
        self.inner.intake_rx.len()
    }

    /// Counts of roster tasks per state.
    #[must_use]
    pub fn stats(&self) -> BalancerStats {
        let mut stats = BalancerStats {
            queued: self.intake_depth(),
            ..BalancerStats::default()
        };
        for task in self.inner.roster.read().iter() {
            match task.state() {
                TaskState::Created => stats.created += 1,
                TaskState::Waiting => stats.waiting += 1,
                TaskState::Executing => stats.executing += 1,
                TaskState::Finished => stats.finished += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Aborted => stats.aborted += 1,
            }
        }
        stats
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BalancerConfig {
        &self.inner.config
    }

    /// Registered task types.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Shared resource graph.
    #[must_use]
    pub fn resource_graph(&self) -> &Arc<ResourceGraph> {
        &self.inner.resource_graph
    }

    fn descriptor(&self, name: &str) -> Result<&TaskDescriptor, BalancerError> {
        self.inner.registry.get(name).ok_or_else(|| {
            warn!(name = name, "Cannot submit task: unknown task type");
            BalancerError::UnknownTaskType(name.to_string())
        })
    }

    fn verify_schema(
        &self,
        name: &str,
        descriptor: &TaskDescriptor,
        args: &[Value],
    ) -> Result<(), BalancerError> {
        let Some(schema) = descriptor.schema() else {
            return Ok(());
        };
        let errors = self.inner.validator.validate(schema, args);
        if errors.is_empty() {
            return Ok(());
        }
        warn!(name = name, errors = errors.len(), "Cannot submit task: schema verification failed");
        Err(BalancerError::SchemaViolation(errors))
    }

    fn create_task(
        &self,
        name: &str,
        args: Vec<Value>,
        parent: Option<TaskId>,
    ) -> Result<Arc<Task>, BalancerError> {
        let snapshot = TaskSnapshot::created(name, args, now_ms(), parent);
        let document =
            serde_json::to_value(&snapshot).map_err(|e| BalancerError::Datastore(e.to_string()))?;
        let id = self
            .inner
            .reporter
            .datastore
            .insert(&self.inner.config.tasks_collection, document)
            .map_err(|e| BalancerError::Datastore(e.to_string()))?;
        Ok(Arc::new(Task::new(id, snapshot, Arc::clone(&self.inner.reporter))))
    }

    fn emit_created(&self, task: &Task) {
        let mut payload = json!({
            "id": task.id(),
            "type": task.name(),
            "state": task.state(),
        });
        if let (Some(parent), Some(map)) = (task.parent(), payload.as_object_mut()) {
            map.insert("parent".into(), json!(parent));
        }
        self.inner.reporter.emit(TASK_CREATED, payload);
    }

    /// Instantiate the implementation and compute the task's resources.
    fn verify_task(&self, task: &Task, descriptor: &TaskDescriptor) -> Result<Vec<Resource>, BalancerError> {
        let ctx = TaskContext::new(task.id(), task.name(), self.downgrade());
        let instance = catch_unwind(AssertUnwindSafe(|| descriptor.instantiate(ctx))).map_err(|p| {
            BalancerError::Verification(format!(
                "task factory panicked: {}",
                panic_message(p.as_ref())
            ))
        })?;
        task.set_instance(Arc::clone(&instance));

        let resources = match catch_unwind(AssertUnwindSafe(|| instance.verify(task.args()))) {
            Ok(Ok(resources)) => resources,
            Ok(Err(err)) => return Err(BalancerError::Verification(format!("{err:#}"))),
            Err(payload) => {
                return Err(BalancerError::Verification(panic_message(payload.as_ref())));
            }
        };

        check_resources(&resources)?;
        task.set_resources(resources.clone());
        Ok(resources)
    }

    fn distribution_loop(&self, rx: &Receiver<Arc<Task>>) {
        debug!("distribution loop running");
        while let Ok(task) = rx.recv() {
            debug!(
                task_id = task.id(),
                name = task.name(),
                args = ?task.args(),
                "Picked up task"
            );

            let Some(descriptor) = self.inner.registry.get(task.name()) else {
                task.fail(&format!("unknown task type {}", task.name()), None);
                continue;
            };

            let resources = match self.verify_task(&task, descriptor) {
                Ok(resources) => resources,
                Err(err) => {
                    warn!(task_id = task.id(), error = %err, "Cannot verify task");
                    task.fail(&err.to_string(), None);
                    continue;
                }
            };

            if !task.set_state(TaskState::Waiting, None) {
                continue;
            }
            self.inner.roster.write().push(Arc::clone(&task));
            self.schedule_tasks();
            debug!(task_id = task.id(), resources = ?resources, "Task assigned to resources");
        }
        debug!("distribution loop exiting");
    }

    /// Start every WAITING task whose resources can all be acquired now.
    ///
    /// Runs on whichever thread triggers it; the resource graph lock makes
    /// passes mutually exclusive. Transitions are published once the graph
    /// lock is released, so event sinks and datastores never run under it.
    fn schedule_tasks(&self) {
        let mut started = Vec::new();
        let mut unstartable = Vec::new();
        {
            let mut graph = self.inner.resource_graph.lock();

            let waiting: Vec<Arc<Task>> = self
                .inner
                .roster
                .read()
                .iter()
                .filter(|t| t.state() == TaskState::Waiting)
                .cloned()
                .collect();

            for task in waiting {
                let resources = task.resources();
                if !graph.can_acquire_all(&resources) {
                    debug!(task_id = task.id(), "resources busy, task keeps waiting");
                    continue;
                }
                // Lost a race with abort.
                let Some(emission) = task.transition(TaskState::Executing, None) else {
                    continue;
                };

                for resource in &resources {
                    graph.acquire(resource, task.id());
                }
                task.set_acquired(resources);

                if let Err(e) = self.spawn_execution(&task) {
                    error!(task_id = task.id(), error = %e, "failed to start task thread");
                    for resource in task.take_acquired() {
                        graph.release(&resource);
                    }
                    unstartable.push((Arc::clone(&task), format!("failed to start task thread: {e}")));
                }
                started.push((task, emission));
            }
        }

        for (task, emission) in started {
            task.publish(emission);
        }
        for (task, message) in unstartable {
            task.fail(&message, None);
        }
    }

    fn spawn_execution(&self, task: &Arc<Task>) -> std::io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(format!("task-{}", task.id()));
        if let Some(size) = self.inner.config.task_stack_size {
            builder = builder.stack_size(size);
        }

        let balancer = self.clone();
        let task = Arc::clone(task);
        let interval = self.inner.config.progress_interval();
        builder.spawn(move || {
            task.execute(interval);
            balancer.task_exited(&task);
        })
    }

    /// Release a finished task's resources and run a scheduling pass.
    fn task_exited(&self, task: &Task) {
        {
            let mut graph = self.inner.resource_graph.lock();
            for resource in task.take_acquired() {
                graph.release(&resource);
            }
        }
        debug!(task_id = task.id(), state = %task.state(), "task exited, resources released");
        self.schedule_tasks();
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("config", &self.inner.config)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Reject resource lists a task type should never produce.
fn check_resources(resources: &[Resource]) -> Result<(), BalancerError> {
    for (idx, resource) in resources.iter().enumerate() {
        if resource.as_str().trim().is_empty() {
            return Err(BalancerError::InvalidResources(format!(
                "verify() returned an empty resource name at position {idx}"
            )));
        }
        if resources[..idx].contains(resource) {
            return Err(BalancerError::InvalidResources(format!(
                "verify() listed resource {resource} more than once"
            )));
        }
    }
    Ok(())
}
