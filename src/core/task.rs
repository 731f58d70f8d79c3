//! Task record and lifecycle state machine.
//!
//! A [`Task`] moves through `CREATED → WAITING → EXECUTING → {FINISHED | FAILED | ABORTED}`.
//! Every accepted transition is published as a `task.updated` event and
//! persisted as a [`TaskSnapshot`]; progress changes go out separately as
//! `task.progress` events marked `nolog`.
//!
//! Payloads are built under the task's record lock but dispatched after it is
//! released, so sinks and stores may call back into the balancer. Each
//! emission takes a sequence number under the record lock and is published
//! strictly in that order, so the event stream of a task still matches its
//! state changes.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::core::datastore::Datastore;
use crate::core::events::{EventSink, TASK_PROGRESS, TASK_UPDATED};
use crate::core::implementation::TaskImplementation;
use crate::core::resource_graph::Resource;
use crate::core::signal::CompletionSignal;
use crate::util::clock::now_ms;

/// Task identifier assigned by the datastore.
pub type TaskId = u64;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Submitted, not yet verified.
    Created,
    /// Verified, waiting for its resources.
    Waiting,
    /// Holding its resources and running.
    Executing,
    /// `run` returned normally.
    Finished,
    /// Verification or execution failed.
    Failed,
    /// Aborted at the implementation's request.
    Aborted,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }

    /// Whether the task still counts as in flight.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Waiting | Self::Executing | Self::Failed)
                | (Self::Waiting, Self::Executing | Self::Failed | Self::Aborted)
                | (Self::Executing, Self::Finished | Self::Failed | Self::Aborted)
        )
    }

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Waiting => "WAITING",
            Self::Executing => "EXECUTING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Completion percentage, 0 to 100.
    pub percentage: f64,
    /// Human-readable status line.
    pub message: String,
    /// Implementation-defined detail (stack traces on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl TaskProgress {
    /// Progress without extra detail.
    pub fn new(percentage: f64, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
            extra: None,
        }
    }

    /// Attach extra detail.
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Serializable view of a task, as persisted in the datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Datastore id; absent before the first insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    /// Task type name.
    pub name: String,
    /// Submitted arguments.
    pub args: Vec<Value>,
    /// Lifecycle state.
    pub state: TaskState,
    /// Creation time, ms since epoch.
    pub created_at: u64,
    /// Execution start time, ms since epoch.
    pub started_at: Option<u64>,
    /// Terminal transition time, ms since epoch.
    pub finished_at: Option<u64>,
    /// Resources reported by verification.
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Last reported progress.
    #[serde(default)]
    pub progress: Option<TaskProgress>,
    /// Value returned by a successful run.
    #[serde(default)]
    pub result: Option<Value>,
    /// Owning task for subtasks.
    #[serde(default)]
    pub parent: Option<TaskId>,
}

impl TaskSnapshot {
    /// Snapshot of a freshly created task, before it has an id.
    pub fn created(name: impl Into<String>, args: Vec<Value>, created_at: u64, parent: Option<TaskId>) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
            state: TaskState::Created,
            created_at,
            started_at: None,
            finished_at: None,
            resources: Vec::new(),
            progress: None,
            result: None,
            parent,
        }
    }
}

/// Collaborators a task reports its transitions to.
pub(crate) struct TaskReporter {
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) datastore: Arc<dyn Datastore>,
    pub(crate) collection: String,
}

impl TaskReporter {
    pub(crate) fn emit(&self, topic: &str, payload: Value) {
        if let Err(e) = self.events.dispatch_event(topic, payload) {
            error!(topic = topic, error = %e, "failed to dispatch event");
        }
    }

    fn persist(&self, id: TaskId, snapshot: &TaskSnapshot) {
        let document = match serde_json::to_value(snapshot) {
            Ok(doc) => doc,
            Err(e) => {
                error!(task_id = id, error = %e, "failed to serialize task snapshot");
                return;
            }
        };
        if let Err(e) = self.datastore.update(&self.collection, id, document) {
            error!(task_id = id, error = %e, "failed to persist task snapshot");
        }
    }
}

/// Mutable part of a task, guarded by the record lock.
struct TaskRecord {
    state: TaskState,
    started_at: Option<u64>,
    finished_at: Option<u64>,
    resources: Vec<Resource>,
    acquired: Vec<Resource>,
    progress: Option<TaskProgress>,
    result: Option<Value>,
    /// Sequence number handed to the next emission.
    next_seq: u64,
}

/// Events and snapshot produced by one accepted change, published after the
/// record lock is released.
#[must_use = "an unpublished emission blocks every later emission of the task"]
pub(crate) struct Emission {
    seq: u64,
    updated: Option<Value>,
    snapshot: Option<TaskSnapshot>,
    progress: Option<Value>,
}

/// One unit of submitted work.
pub struct Task {
    id: TaskId,
    name: String,
    args: Vec<Value>,
    created_at: u64,
    parent: Option<TaskId>,
    record: Mutex<TaskRecord>,
    instance: OnceLock<Arc<dyn TaskImplementation>>,
    ended: CompletionSignal,
    reporter: Arc<TaskReporter>,
    /// Sequence number of the next emission allowed to publish.
    published: Mutex<u64>,
    turn: Condvar,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        snapshot: TaskSnapshot,
        reporter: Arc<TaskReporter>,
    ) -> Self {
        Self {
            id,
            name: snapshot.name,
            args: snapshot.args,
            created_at: snapshot.created_at,
            parent: snapshot.parent,
            record: Mutex::new(TaskRecord {
                state: snapshot.state,
                started_at: None,
                finished_at: None,
                resources: Vec::new(),
                acquired: Vec::new(),
                progress: None,
                result: None,
                next_seq: 0,
            }),
            instance: OnceLock::new(),
            ended: CompletionSignal::new(),
            reporter,
            published: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    /// Datastore-assigned id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Task type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments as submitted.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Owning task, for subtasks.
    #[must_use]
    pub const fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    /// Creation time, ms since epoch.
    #[must_use]
    pub const fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.record.lock().state
    }

    /// Execution start time.
    #[must_use]
    pub fn started_at(&self) -> Option<u64> {
        self.record.lock().started_at
    }

    /// Terminal transition time.
    #[must_use]
    pub fn finished_at(&self) -> Option<u64> {
        self.record.lock().finished_at
    }

    /// Resources reported by verification.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.record.lock().resources.clone()
    }

    /// Last reported progress.
    #[must_use]
    pub fn progress(&self) -> Option<TaskProgress> {
        self.record.lock().progress.clone()
    }

    /// Result of a successful run.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        self.record.lock().result.clone()
    }

    /// Serializable view of the current record.
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let rec = self.record.lock();
        self.snapshot_locked(&rec)
    }

    /// Whether the completion signal has fired.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.is_fired()
    }

    /// Block until the task reaches a terminal state.
    pub fn wait(&self) {
        self.ended.wait();
    }

    /// Block until the task ends or `timeout` elapses. Returns `true` if it ended.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.ended.wait_for(timeout)
    }

    /// Wait for the task to end from an async context.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self) {
        self.ended.wait_async().await;
    }

    pub(crate) fn instance(&self) -> Option<Arc<dyn TaskImplementation>> {
        self.instance.get().cloned()
    }

    pub(crate) fn set_instance(&self, instance: Arc<dyn TaskImplementation>) {
        if self.instance.set(instance).is_err() {
            warn!(task_id = self.id, "task implementation already set");
        }
    }

    pub(crate) fn set_resources(&self, resources: Vec<Resource>) {
        self.record.lock().resources = resources;
    }

    /// Record resources acquired from the graph on the task's behalf.
    pub(crate) fn set_acquired(&self, acquired: Vec<Resource>) {
        self.record.lock().acquired = acquired;
    }

    /// Hand back acquired resources for release. Yields them only once.
    pub(crate) fn take_acquired(&self) -> Vec<Resource> {
        std::mem::take(&mut self.record.lock().acquired)
    }

    /// Apply a guarded transition and publish it. Returns `false` if the state machine forbids it.
    pub(crate) fn set_state(&self, state: TaskState, progress: Option<TaskProgress>) -> bool {
        match self.transition(state, progress) {
            Some(emission) => {
                self.publish(emission);
                true
            }
            None => false,
        }
    }

    /// Apply a guarded transition, leaving its emission to the caller.
    ///
    /// Used where the caller holds other locks; the emission must be passed to
    /// [`Task::publish`] once they are released.
    pub(crate) fn transition(&self, state: TaskState, progress: Option<TaskProgress>) -> Option<Emission> {
        let mut rec = self.record.lock();
        self.transition_locked(&mut rec, state, progress)
    }

    /// Dispatch an emission to the event sink and the datastore, after every
    /// earlier emission of this task.
    ///
    /// Sinks must not synchronously drive a transition of the same task.
    pub(crate) fn publish(&self, emission: Emission) {
        {
            let mut published = self.published.lock();
            while *published != emission.seq {
                self.turn.wait(&mut published);
            }
        }
        let _turn = PublishTurn(self);

        if let Some(payload) = emission.updated {
            self.reporter.emit(TASK_UPDATED, payload);
        }
        if let Some(snapshot) = emission.snapshot.as_ref() {
            self.reporter.persist(self.id, snapshot);
        }
        if let Some(payload) = emission.progress {
            self.reporter.emit(TASK_PROGRESS, payload);
        }
    }

    /// Transition to FAILED with a message and optional stack trace, then fire the signal.
    pub(crate) fn fail(&self, message: &str, stacktrace: Option<String>) {
        let mut progress = TaskProgress::new(0.0, message);
        if let Some(trace) = stacktrace {
            progress = progress.with_extra(json!({ "stacktrace": trace }));
        }
        self.set_state(TaskState::Failed, Some(progress));
        self.ended.fire();
    }

    /// Transition to ABORTED and fire the signal. Returns `false` if already terminal.
    pub(crate) fn mark_aborted(&self) -> bool {
        let applied = self.set_state(TaskState::Aborted, Some(TaskProgress::new(0.0, "Aborted")));
        if applied {
            self.ended.fire();
        }
        applied
    }

    fn finish(&self, result: Value) {
        let emission = {
            let mut rec = self.record.lock();
            if rec.state.can_transition_to(TaskState::Finished) {
                rec.result = Some(result);
                self.transition_locked(&mut rec, TaskState::Finished, Some(TaskProgress::new(100.0, "")))
            } else {
                debug!(task_id = self.id, state = %rec.state, "discarding result of task that already ended");
                None
            }
        };
        if let Some(emission) = emission {
            self.publish(emission);
        }
        self.ended.fire();
    }

    /// Body of the task's thread of control: run the implementation and record the outcome.
    ///
    /// Never panics; any failure of `run` becomes a FAILED transition. A panic
    /// stores the backtrace captured where it was raised. A returned error
    /// stores its `{:?}` rendering, which includes a backtrace only when
    /// `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE` enables capture in `anyhow`.
    pub(crate) fn execute(self: &Arc<Self>, progress_interval: Duration) {
        let Some(instance) = self.instance() else {
            self.fail("task has no implementation instance", None);
            return;
        };

        let watcher = self.spawn_progress_watcher(Arc::clone(&instance), progress_interval);

        debug!(task_id = self.id, name = %self.name, "running task");
        let outcome = catch_panic_with_trace(|| instance.run(self.args.clone()));
        match outcome {
            Ok(Ok(result)) => self.finish(result),
            Ok(Err(err)) => {
                warn!(task_id = self.id, error = %err, "task failed");
                self.fail(&err.to_string(), Some(format!("{err:?}")));
            }
            Err((payload, trace)) => {
                let message = panic_message(payload.as_ref());
                warn!(task_id = self.id, error = %message, "task panicked");
                self.fail(&message, Some(trace));
            }
        }

        if let Some(handle) = watcher {
            if handle.join().is_err() {
                warn!(task_id = self.id, "progress watcher panicked");
            }
        }
    }

    fn spawn_progress_watcher(
        self: &Arc<Self>,
        instance: Arc<dyn TaskImplementation>,
        interval: Duration,
    ) -> Option<thread::JoinHandle<()>> {
        let task = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("task-{}-progress", self.id))
            .spawn(move || task.watch_progress(instance.as_ref(), interval));
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(task_id = self.id, error = %e, "failed to spawn progress watcher");
                None
            }
        }
    }

    fn watch_progress(&self, instance: &dyn TaskImplementation, interval: Duration) {
        while !self.ended.wait_for(interval) {
            match catch_unwind(AssertUnwindSafe(|| instance.get_status())) {
                Ok(Some(progress)) => self.report_progress(progress),
                Ok(None) => {}
                Err(payload) => {
                    warn!(
                        task_id = self.id,
                        error = %panic_message(payload.as_ref()),
                        "get_status panicked"
                    );
                }
            }
        }
    }

    /// Store and publish progress of an executing task.
    pub(crate) fn report_progress(&self, progress: TaskProgress) {
        let emission = {
            let mut rec = self.record.lock();
            if rec.state != TaskState::Executing {
                return;
            }
            rec.progress = Some(progress);
            let seq = rec.next_seq;
            rec.next_seq += 1;
            Emission {
                seq,
                updated: None,
                snapshot: None,
                progress: self.progress_payload(&rec),
            }
        };
        self.publish(emission);
    }

    fn transition_locked(
        &self,
        rec: &mut MutexGuard<'_, TaskRecord>,
        state: TaskState,
        progress: Option<TaskProgress>,
    ) -> Option<Emission> {
        if !rec.state.can_transition_to(state) {
            warn!(
                task_id = self.id,
                from = %rec.state,
                to = %state,
                "rejected invalid task state transition"
            );
            return None;
        }

        let mut event = Map::new();
        event.insert("id".into(), json!(self.id));
        event.insert("state".into(), json!(state));

        let now = now_ms();
        if state == TaskState::Executing {
            rec.started_at = Some(now);
            event.insert("started_at".into(), json!(now));
        }
        if state.is_terminal() {
            rec.finished_at = Some(now);
            event.insert("finished_at".into(), json!(now));
        }
        if state == TaskState::Finished {
            event.insert("result".into(), rec.result.clone().unwrap_or(Value::Null));
        }
        if let (TaskState::Failed, Some(p)) = (state, progress.as_ref()) {
            event.insert("error".into(), json!(p.message));
        }

        rec.state = state;
        let has_progress = progress.is_some();
        if let Some(progress) = progress {
            rec.progress = Some(progress);
        }

        let seq = rec.next_seq;
        rec.next_seq += 1;

        debug!(task_id = self.id, state = %state, "task state changed");
        Some(Emission {
            seq,
            updated: Some(Value::Object(event)),
            snapshot: Some(self.snapshot_locked(rec)),
            progress: if has_progress { self.progress_payload(rec) } else { None },
        })
    }

    fn progress_payload(&self, rec: &TaskRecord) -> Option<Value> {
        let progress = rec.progress.as_ref()?;
        Some(json!({
            "id": self.id,
            "nolog": true,
            "percentage": progress.percentage,
            "message": progress.message,
            "extra": progress.extra,
        }))
    }

    fn snapshot_locked(&self, rec: &TaskRecord) -> TaskSnapshot {
        TaskSnapshot {
            id: Some(self.id),
            name: self.name.clone(),
            args: self.args.clone(),
            state: rec.state,
            created_at: self.created_at,
            started_at: rec.started_at,
            finished_at: rec.finished_at,
            resources: rec.resources.clone(),
            progress: rec.progress.clone(),
            result: rec.result.clone(),
            parent: self.parent,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Hands the publish turn to the next emission, also when a sink panics.
struct PublishTurn<'a>(&'a Task);

impl Drop for PublishTurn<'_> {
    fn drop(&mut self) {
        *self.0.published.lock() += 1;
        self.0.turn.notify_all();
    }
}

thread_local! {
    /// Set while the current thread runs task code whose panics should be traced.
    static TRACE_PANICS: Cell<bool> = const { Cell::new(false) };
    /// Backtrace of the last traced panic on this thread.
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the current panic hook that records a backtrace
/// at the panic site, for threads inside [`catch_panic_with_trace`] only.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if TRACE_PANICS.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

/// Panic payload and the backtrace captured where it was raised.
pub(crate) type TracedPanic = (Box<dyn Any + Send>, String);

/// Run `f`, catching a panic together with the backtrace of where it was raised.
pub(crate) fn catch_panic_with_trace<R>(f: impl FnOnce() -> R) -> Result<R, TracedPanic> {
    install_panic_hook();
    let was_tracing = TRACE_PANICS.with(|flag| flag.replace(true));
    PANIC_TRACE.with(|slot| slot.borrow_mut().take());

    let outcome = catch_unwind(AssertUnwindSafe(f));

    TRACE_PANICS.with(|flag| flag.set(was_tracing));
    outcome.map_err(|payload| {
        let trace = PANIC_TRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| Backtrace::force_capture().to_string());
        (payload, trace)
    })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
