//! Integration tests for the balancer's admission control and task lifecycle.
//!
//! This test validates:
//! 1. Submission rejects unknown types and schema violations without side effects
//! 2. A task moves CREATED → WAITING → EXECUTING → FINISHED with ordered events
//! 3. Tasks sharing a resource never execute at the same time
//! 4. Failed verification and failed runs do not stall the balancer
//! 5. Abort works for executing and waiting tasks
//! 6. Subtasks run under their parent and are joined
//! 7. Exclusivity holds under a randomized workload
//! 8. Event sinks may read back task state and resources while events are dispatched

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};

use task_balancer::builders::BalancerBuilder;
use task_balancer::config::BalancerConfig;
use task_balancer::core::{
    AppResult, Balancer, BalancerError, Datastore, EventSink, ParamSpec, ParamType, ParamsSchema, Resource,
    TaskContext, TaskImplementation, TaskProgress, TaskRegistry, TaskState, TASK_CREATED, TASK_PROGRESS,
    TASK_UPDATED,
};
use task_balancer::infra::{InMemoryDatastore, InMemoryEventBus};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    balancer: Balancer,
    events: Arc<InMemoryEventBus>,
    store: Arc<InMemoryDatastore>,
}

impl Harness {
    fn start(registry: TaskRegistry) -> Self {
        let events = Arc::new(InMemoryEventBus::default());
        let store = Arc::new(InMemoryDatastore::new());
        let balancer = BalancerBuilder::new(registry)
            .config(BalancerConfig::default().with_progress_interval(Duration::from_millis(10)))
            .event_sink(Arc::clone(&events) as Arc<dyn EventSink>)
            .datastore(Arc::clone(&store) as Arc<dyn Datastore>)
            .build_started()
            .unwrap();
        Self {
            balancer,
            events,
            store,
        }
    }

    fn stored_state(&self, id: u64) -> Option<String> {
        self.store
            .get("tasks", id)
            .and_then(|doc| doc["state"].as_str().map(String::from))
    }

    fn state(&self, id: u64) -> Option<TaskState> {
        self.balancer.get_task(id).map(|t| t.state())
    }

    fn wait_state(&self, id: u64, state: TaskState) {
        wait_until(&format!("task {id} to reach {state}"), || self.state(id) == Some(state));
    }

    fn wait_idle(&self) {
        wait_until("resources to be released", || {
            self.balancer.resource_graph().lock().held_count() == 0
        });
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.balancer.shutdown();
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Resources named by the first argument, a list of strings.
fn claimed(args: &[Value]) -> AppResult<Vec<Resource>> {
    let names = args
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("first argument must be a list of resource names"))?;
    names
        .iter()
        .map(|n| {
            n.as_str()
                .map(Resource::from)
                .ok_or_else(|| anyhow!("resource names must be strings"))
        })
        .collect()
}

/// Claims its resources and returns its second argument.
struct Claims;

impl TaskImplementation for Claims {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        claimed(args)
    }

    fn run(&self, args: Vec<Value>) -> AppResult<Value> {
        Ok(args.get(1).cloned().unwrap_or(Value::Null))
    }
}

/// Claims its resources and runs until the test opens the gate once.
struct Gated {
    gate: Receiver<()>,
}

impl TaskImplementation for Gated {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        claimed(args)
    }

    fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
        self.gate
            .recv_timeout(TIMEOUT)
            .map_err(|_| anyhow!("gate never opened"))?;
        Ok(json!("released"))
    }
}

fn gated_registry() -> (TaskRegistry, Sender<()>) {
    let (tx, rx) = unbounded();
    let mut registry = TaskRegistry::new();
    registry.register("claims", None, |_ctx| Box::new(Claims)).unwrap();
    registry
        .register("gated", None, move |_ctx| Box::new(Gated { gate: rx.clone() }))
        .unwrap();
    (registry, tx)
}

#[test]
fn test_unknown_task_type_is_rejected() {
    let h = Harness::start(TaskRegistry::new());
    let err = h.balancer.submit("zfs.pool.scrub", vec![json!("tank")]).unwrap_err();
    assert!(matches!(err, BalancerError::UnknownTaskType(ref name) if name == "zfs.pool.scrub"));
    assert!(err.is_invalid_argument());
    assert!(h.events.is_empty());
    assert_eq!(h.store.count("tasks"), 0);
}

#[test]
fn test_schema_violations_are_itemized() {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "typed",
            Some(ParamsSchema::new(vec![
                ParamSpec::required("resources", ParamType::Array),
                ParamSpec::optional("label", ParamType::String),
            ])),
            |_ctx| Box::new(Claims),
        )
        .unwrap();
    let h = Harness::start(registry);

    let err = h.balancer.submit("typed", Vec::new()).unwrap_err();
    assert_eq!(err.validation_errors()[0].code, "minItems");

    let err = h.balancer.submit("typed", vec![json!("R"), json!(7)]).unwrap_err();
    let errors = err.validation_errors();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.code == "type"));
    assert_eq!(errors[0].path, "0");
    assert_eq!(errors[1].path, "1");

    let err = h
        .balancer
        .submit("typed", vec![json!([]), json!("x"), json!(true)])
        .unwrap_err();
    assert_eq!(err.validation_errors()[0].code, "maxItems");

    assert!(h.events.is_empty());
    assert_eq!(h.store.count("tasks"), 0);

    // Optional trailing parameter may be omitted.
    let id = h.balancer.submit("typed", vec![json!([])]).unwrap();
    h.wait_state(id, TaskState::Finished);
}

#[test]
fn test_lifecycle_events_are_ordered() {
    let (registry, _gate) = gated_registry();
    let h = Harness::start(registry);

    let id = h.balancer.submit("claims", vec![json!([]), json!("done")]).unwrap();
    wait_until("task to be verified", || h.balancer.get_task(id).is_some());
    let task = h.balancer.get_task(id).unwrap();
    assert!(task.wait_timeout(TIMEOUT));
    h.wait_idle();

    let lifecycle: Vec<(String, String)> = h
        .events
        .events_for_task(id)
        .into_iter()
        .filter(|e| e.topic != TASK_PROGRESS)
        .map(|e| (e.topic, e.payload["state"].as_str().unwrap_or_default().to_string()))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            (TASK_CREATED.to_string(), "CREATED".to_string()),
            (TASK_UPDATED.to_string(), "WAITING".to_string()),
            (TASK_UPDATED.to_string(), "EXECUTING".to_string()),
            (TASK_UPDATED.to_string(), "FINISHED".to_string()),
        ]
    );

    let created = &h.events.events_for(TASK_CREATED)[0];
    assert_eq!(created.payload["type"], "claims");

    assert_eq!(task.result(), Some(json!("done")));
    assert!(task.resources().is_empty());
    let progress = task.progress().unwrap();
    assert!((progress.percentage - 100.0).abs() < f64::EPSILON);
    assert!(task.started_at().unwrap() <= task.finished_at().unwrap());

    let states: Vec<Value> = h
        .store
        .history("tasks", id)
        .into_iter()
        .map(|doc| doc["state"].clone())
        .collect();
    assert_eq!(states, vec![json!("CREATED"), json!("WAITING"), json!("EXECUTING"), json!("FINISHED")]);
}

/// Sink that looks the task up on the balancer for every state change.
#[derive(Default)]
struct Inspecting {
    balancer: OnceLock<Balancer>,
    seen: Mutex<Vec<(u64, String, Option<TaskState>)>>,
}

impl EventSink for Inspecting {
    fn dispatch_event(&self, topic: &str, payload: Value) -> AppResult<()> {
        if topic != TASK_UPDATED {
            return Ok(());
        }
        let Some(balancer) = self.balancer.get() else {
            return Ok(());
        };
        let id = payload["id"].as_u64().ok_or_else(|| anyhow!("event without id"))?;
        let current = balancer.get_task(id).map(|t| t.state());
        let _held = balancer.resource_graph().lock().held_count();
        let announced = payload["state"].as_str().unwrap_or_default().to_string();
        self.seen.lock().push((id, announced, current));
        Ok(())
    }
}

#[test]
fn test_event_sink_can_read_back_tasks() {
    let sink = Arc::new(Inspecting::default());
    let mut registry = TaskRegistry::new();
    registry.register("claims", None, |_ctx| Box::new(Claims)).unwrap();
    let balancer = BalancerBuilder::new(registry)
        .config(BalancerConfig::default().with_progress_interval(Duration::from_millis(10)))
        .event_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
        .build_started()
        .unwrap();
    assert!(sink.balancer.set(balancer.clone()).is_ok());

    let ids: Vec<u64> = (0..3)
        .map(|i| balancer.submit("claims", vec![json!(["R"]), json!(i)]).unwrap())
        .collect();
    for &id in &ids {
        wait_until("task to be verified", || balancer.get_task(id).is_some());
        assert!(balancer.get_task(id).unwrap().wait_timeout(TIMEOUT));
    }
    wait_until("resources to be released", || balancer.resource_graph().lock().held_count() == 0);

    // Scheduling still runs after the sink has re-entered the balancer.
    let late = balancer.submit("claims", vec![json!(["R"]), json!("late")]).unwrap();
    wait_until("late task to be verified", || balancer.get_task(late).is_some());
    assert!(balancer.get_task(late).unwrap().wait_timeout(TIMEOUT));
    assert_eq!(balancer.get_task(late).map(|t| t.state()), Some(TaskState::Finished));

    let seen = sink.seen.lock().clone();
    for id in ids.into_iter().chain([late]) {
        let executing = seen
            .iter()
            .find(|(task, announced, _)| *task == id && announced == "EXECUTING")
            .unwrap_or_else(|| panic!("no EXECUTING event seen for task {id}"));
        assert!(matches!(executing.2, Some(TaskState::Executing | TaskState::Finished)));
        assert!(seen
            .iter()
            .any(|(task, announced, current)| *task == id
                && announced == "FINISHED"
                && *current == Some(TaskState::Finished)));
    }
    balancer.shutdown();
}

#[test]
fn test_conflicting_tasks_run_one_at_a_time() {
    let (registry, gate) = gated_registry();
    let h = Harness::start(registry);

    let first = h.balancer.submit("gated", vec![json!(["zpool:tank"])]).unwrap();
    h.wait_state(first, TaskState::Executing);
    assert_eq!(
        h.balancer.resource_graph().lock().holder(&Resource::from("zpool:tank")),
        Some(first)
    );

    let second = h.balancer.submit("gated", vec![json!(["zpool:tank", "system"])]).unwrap();
    h.wait_state(second, TaskState::Waiting);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.state(second), Some(TaskState::Waiting));
    assert_eq!(h.balancer.get_active_tasks().len(), 2);

    gate.send(()).unwrap();
    h.wait_state(first, TaskState::Finished);
    h.wait_state(second, TaskState::Executing);
    gate.send(()).unwrap();
    h.wait_state(second, TaskState::Finished);
    h.wait_idle();

    let a = h.balancer.get_task(first).unwrap();
    let b = h.balancer.get_task(second).unwrap();
    assert!(b.started_at().unwrap() >= a.finished_at().unwrap());
    assert!(h.balancer.get_active_tasks().is_empty());
}

#[test]
fn test_disjoint_tasks_run_concurrently() {
    let (registry, gate) = gated_registry();
    let h = Harness::start(registry);

    let a = h.balancer.submit("gated", vec![json!(["A"])]).unwrap();
    let b = h.balancer.submit("gated", vec![json!(["B"])]).unwrap();
    h.wait_state(a, TaskState::Executing);
    h.wait_state(b, TaskState::Executing);
    assert_eq!(h.balancer.stats().executing, 2);

    gate.send(()).unwrap();
    gate.send(()).unwrap();
    h.wait_state(a, TaskState::Finished);
    h.wait_state(b, TaskState::Finished);
}

#[test]
fn test_task_without_resources_starts_immediately() {
    let (registry, gate) = gated_registry();
    let h = Harness::start(registry);

    let holder = h.balancer.submit("gated", vec![json!(["system"])]).unwrap();
    h.wait_state(holder, TaskState::Executing);

    let free = h.balancer.submit("claims", vec![json!([])]).unwrap();
    h.wait_state(free, TaskState::Finished);

    gate.send(()).unwrap();
    h.wait_state(holder, TaskState::Finished);
}

struct RejectsPool;

impl TaskImplementation for RejectsPool {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        Err(anyhow!("pool {} does not exist", args[0]))
    }

    fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
        unreachable!("verification always fails")
    }
}

#[test]
fn test_verification_failure_does_not_stall_balancer() {
    let (mut registry, _gate) = gated_registry();
    registry.register("rejects", None, |_ctx| Box::new(RejectsPool)).unwrap();
    let h = Harness::start(registry);

    let bad = h.balancer.submit("rejects", vec![json!("ghost")]).unwrap();
    let good = h.balancer.submit("claims", vec![json!(["R"])]).unwrap();
    h.wait_state(good, TaskState::Finished);

    wait_until("failed verification to be persisted", || {
        h.stored_state(bad).as_deref() == Some("FAILED")
    });
    assert!(h.balancer.get_task(bad).is_none());
    let doc = h.store.get("tasks", bad).unwrap();
    assert!(doc["progress"]["message"].as_str().unwrap().contains("does not exist"));
    assert_eq!(doc["progress"]["percentage"], 0.0);

    let failed = h
        .events
        .events_for_task(bad)
        .into_iter()
        .find(|e| e.topic == TASK_UPDATED)
        .unwrap();
    assert_eq!(failed.payload["state"], "FAILED");
    assert!(failed.payload["error"].as_str().unwrap().contains("ghost"));
}

struct Breaks;

impl TaskImplementation for Breaks {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        claimed(args)
    }

    fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
        Err(anyhow!("device busy"))
    }
}

struct Panics;

impl TaskImplementation for Panics {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        claimed(args)
    }

    fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
        panic!("controller reset");
    }
}

#[test]
fn test_failed_runs_release_resources() {
    let (mut registry, _gate) = gated_registry();
    registry.register("breaks", None, |_ctx| Box::new(Breaks)).unwrap();
    registry.register("panics", None, |_ctx| Box::new(Panics)).unwrap();
    let h = Harness::start(registry);

    let broken = h.balancer.submit("breaks", vec![json!(["disk:ada0"])]).unwrap();
    let panicked = h.balancer.submit("panics", vec![json!(["disk:ada0"])]).unwrap();
    let after = h.balancer.submit("claims", vec![json!(["disk:ada0"]), json!(1)]).unwrap();
    h.wait_state(after, TaskState::Finished);
    h.wait_idle();

    for (id, message) in [(broken, "device busy"), (panicked, "controller reset")] {
        let task = h.balancer.get_task(id).unwrap();
        assert_eq!(task.state(), TaskState::Failed);
        let progress = task.progress().unwrap();
        assert_eq!(progress.message, message);
        assert!(progress.extra.unwrap()["stacktrace"].is_string());
        assert!(task.result().is_none());
    }
}

/// Runs until aborted.
struct Cancellable {
    stop: AtomicBool,
}

impl TaskImplementation for Cancellable {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        claimed(args)
    }

    fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
        let deadline = Instant::now() + TIMEOUT;
        while !self.stop.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(json!("late"))
    }

    fn abort(&self) -> bool {
        self.stop.store(true, Ordering::Release);
        true
    }
}

struct Stubborn;

impl TaskImplementation for Stubborn {
    fn verify(&self, _args: &[Value]) -> AppResult<Vec<Resource>> {
        Ok(Vec::new())
    }

    fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
        thread::sleep(Duration::from_millis(100));
        Ok(Value::Null)
    }

    fn abort(&self) -> bool {
        panic!("abort not supported");
    }
}

fn abort_registry() -> (TaskRegistry, Sender<()>) {
    let (mut registry, gate) = gated_registry();
    registry
        .register("cancellable", None, |_ctx| {
            Box::new(Cancellable {
                stop: AtomicBool::new(false),
            })
        })
        .unwrap();
    registry.register("stubborn", None, |_ctx| Box::new(Stubborn)).unwrap();
    (registry, gate)
}

#[test]
fn test_abort_executing_task() {
    let (registry, _gate) = abort_registry();
    let h = Harness::start(registry);

    let id = h.balancer.submit("cancellable", vec![json!(["R"])]).unwrap();
    h.wait_state(id, TaskState::Executing);
    assert!(h.balancer.abort(id));
    assert!(!h.balancer.abort(id));

    let task = h.balancer.get_task(id).unwrap();
    assert!(task.wait_timeout(TIMEOUT));
    assert_eq!(task.state(), TaskState::Aborted);
    assert_eq!(task.progress().unwrap().message, "Aborted");
    h.wait_idle();
    // The run returning afterwards must not resurrect the task.
    assert_eq!(task.state(), TaskState::Aborted);
    assert!(task.result().is_none());
    assert!(task.finished_at().is_some());
}

#[test]
fn test_abort_waiting_task_never_runs() {
    let (registry, gate) = abort_registry();
    let h = Harness::start(registry);

    let holder = h.balancer.submit("gated", vec![json!(["R"])]).unwrap();
    h.wait_state(holder, TaskState::Executing);
    let waiter = h.balancer.submit("cancellable", vec![json!(["R"])]).unwrap();
    h.wait_state(waiter, TaskState::Waiting);

    assert!(h.balancer.abort(waiter));
    assert_eq!(h.state(waiter), Some(TaskState::Aborted));

    gate.send(()).unwrap();
    h.wait_state(holder, TaskState::Finished);
    h.wait_idle();
    assert!(h
        .events
        .events_for_task(waiter)
        .iter()
        .all(|e| e.payload["state"] != "EXECUTING"));
}

#[test]
fn test_abort_refusals() {
    let (registry, _gate) = abort_registry();
    let h = Harness::start(registry);

    assert!(!h.balancer.abort(4242));

    let id = h.balancer.submit("stubborn", Vec::new()).unwrap();
    wait_until("task to be verified", || h.balancer.get_task(id).is_some());
    assert!(!h.balancer.abort(id));
    h.wait_state(id, TaskState::Finished);
}

/// Reports fixed progress while it sleeps.
struct Reports;

impl TaskImplementation for Reports {
    fn verify(&self, _args: &[Value]) -> AppResult<Vec<Resource>> {
        Ok(Vec::new())
    }

    fn run(&self, _args: Vec<Value>) -> AppResult<Value> {
        thread::sleep(Duration::from_millis(100));
        Ok(Value::Null)
    }

    fn get_status(&self) -> Option<TaskProgress> {
        Some(TaskProgress::new(40.0, "copying blocks").with_extra(json!({"copied": 4})))
    }
}

#[test]
fn test_progress_is_polled_and_marked_nolog() {
    let mut registry = TaskRegistry::new();
    registry.register("reports", None, |_ctx| Box::new(Reports)).unwrap();
    let h = Harness::start(registry);

    let id = h.balancer.submit("reports", Vec::new()).unwrap();
    h.wait_state(id, TaskState::Finished);

    let progress = h.events.events_for(TASK_PROGRESS);
    let polled = progress
        .iter()
        .find(|e| e.payload["message"] == "copying blocks")
        .unwrap();
    assert_eq!(polled.payload["id"], id);
    assert_eq!(polled.payload["extra"]["copied"], 4);
    assert!(progress.iter().all(|e| e.payload["nolog"] == true));
}

/// Fans out two `claims` subtasks and sums their results.
struct FansOut {
    ctx: TaskContext,
}

impl TaskImplementation for FansOut {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        claimed(args)
    }

    fn run(&self, args: Vec<Value>) -> AppResult<Value> {
        let child = args.get(1).and_then(Value::as_str).unwrap_or("claims");
        let handles = vec![
            self.ctx.run_subtask(child, vec![json!([]), json!(2)])?,
            self.ctx.run_subtask(child, vec![json!(["R"]), json!(3)])?,
        ];
        let total: i64 = self
            .ctx
            .join_subtasks(handles)
            .iter()
            .filter_map(|t| t.result().and_then(|v| v.as_i64()))
            .sum();
        Ok(json!(total))
    }
}

#[test]
fn test_subtasks_run_under_parent() {
    let (mut registry, _gate) = gated_registry();
    registry
        .register("fans_out", None, |ctx| Box::new(FansOut { ctx }))
        .unwrap();
    let h = Harness::start(registry);

    let parent = h.balancer.submit("fans_out", vec![json!(["R"])]).unwrap();
    h.wait_state(parent, TaskState::Finished);
    let task = h.balancer.get_task(parent).unwrap();
    assert_eq!(task.result(), Some(json!(5)));

    let children: Vec<_> = h
        .balancer
        .get_tasks(None)
        .into_iter()
        .filter(|t| t.parent() == Some(parent))
        .collect();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.state(), TaskState::Finished);
        let states: Vec<Value> = h
            .events
            .events_for_task(child.id())
            .into_iter()
            .filter(|e| e.topic == TASK_UPDATED)
            .map(|e| e.payload["state"].clone())
            .collect();
        assert_eq!(states, vec![json!("EXECUTING"), json!("FINISHED")]);
    }

    let created: Vec<_> = h
        .events
        .events_for(TASK_CREATED)
        .into_iter()
        .filter(|e| e.payload["parent"] == parent)
        .collect();
    assert_eq!(created.len(), 2);
    h.wait_idle();
}

#[test]
fn test_subtask_errors_fail_parent() {
    let (mut registry, _gate) = gated_registry();
    registry
        .register("fans_out", None, |ctx| Box::new(FansOut { ctx }))
        .unwrap();
    let h = Harness::start(registry);

    let parent = h
        .balancer
        .submit("fans_out", vec![json!([]), json!("no.such.type")])
        .unwrap();
    h.wait_state(parent, TaskState::Failed);
    let progress = h.balancer.get_task(parent).unwrap().progress().unwrap();
    assert!(progress.message.contains("no.such.type"));
}

#[test]
fn test_run_subtask_verification_error_propagates() {
    let (mut registry, _gate) = gated_registry();
    registry.register("rejects", None, |_ctx| Box::new(RejectsPool)).unwrap();
    let h = Harness::start(registry);

    let err = h
        .balancer
        .run_subtask(None, "rejects", vec![json!("ghost")])
        .unwrap_err();
    assert!(matches!(err, BalancerError::Verification(_)));
    assert_eq!(h.store.count("tasks"), 1);
    assert_eq!(h.stored_state(1).as_deref(), Some("FAILED"));
}

#[test]
fn test_submit_after_shutdown() {
    let h = Harness::start(gated_registry().0);
    h.balancer.shutdown();
    assert!(h.balancer.is_shutdown());
    assert!(matches!(
        h.balancer.submit("claims", vec![json!([])]),
        Err(BalancerError::Shutdown)
    ));
}

/// Records how many tasks hold each resource while running.
struct Tracked {
    active: Arc<Mutex<HashMap<Resource, usize>>>,
    violations: Arc<AtomicUsize>,
}

impl TaskImplementation for Tracked {
    fn verify(&self, args: &[Value]) -> AppResult<Vec<Resource>> {
        claimed(args)
    }

    fn run(&self, args: Vec<Value>) -> AppResult<Value> {
        let resources = claimed(&args)?;
        {
            let mut active = self.active.lock();
            for r in &resources {
                let count = active.entry(r.clone()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    self.violations.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let pause = args.get(1).and_then(Value::as_u64).unwrap_or(1);
        thread::sleep(Duration::from_millis(pause));
        let mut active = self.active.lock();
        for r in &resources {
            if let Some(count) = active.get_mut(r) {
                *count -= 1;
            }
        }
        Ok(Value::Null)
    }
}

#[test]
fn test_randomized_exclusivity() {
    let active = Arc::new(Mutex::new(HashMap::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    {
        let active = Arc::clone(&active);
        let violations = Arc::clone(&violations);
        registry
            .register("tracked", None, move |_ctx| {
                Box::new(Tracked {
                    active: Arc::clone(&active),
                    violations: Arc::clone(&violations),
                })
            })
            .unwrap();
    }
    let h = Harness::start(registry);

    let pool = ["disk:ada0", "disk:ada1", "zpool:tank", "system"];
    let mut rng = rand::rng();
    let mut ids = Vec::new();
    for _ in 0..40 {
        let names: Vec<&str> = pool.iter().copied().filter(|_| rng.random_bool(0.4)).collect();
        let pause = rng.random_range(1..8_u64);
        ids.push(h.balancer.submit("tracked", vec![json!(names), json!(pause)]).unwrap());
    }

    for id in &ids {
        h.wait_state(*id, TaskState::Finished);
    }
    h.wait_idle();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(h.balancer.stats().finished, ids.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_async() {
    let (registry, gate) = gated_registry();
    let h = Harness::start(registry);

    let id = h.balancer.submit("gated", vec![json!(["R"])]).unwrap();
    let deadline = Instant::now() + TIMEOUT;
    let task = loop {
        if let Some(task) = h.balancer.get_task(id) {
            break task;
        }
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    gate.send(()).unwrap();
    tokio::time::timeout(TIMEOUT, task.wait_async()).await.unwrap();
    assert_eq!(task.state(), TaskState::Finished);
}
