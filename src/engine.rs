//! The demand-driven incremental engine.
//!
//! The engine is single-threaded and cooperative: rule lookup, task
//! construction, value delivery, and completion all happen on the engine
//! thread, serialized through an op queue.  Task callbacks never re-enter
//! the engine; they buffer requests which the scheduling loop drains.
//! Worker lanes communicate with the loop exclusively through the
//! completion channel.
//!
//! Keys and values cross this boundary as raw byte strings; the layer above
//! owns their encoding.  A rule's cached result carries two counters:
//! `computed_at` (when the result was last brought up to date) and
//! `built_at` (when its value last actually changed).  A rule with a prior
//! result is *scanned* on demand: if its validity predicate holds and no
//! recorded dependency has `built_at` newer than the rule's `computed_at`,
//! the prior value is reused without running a task.

use crate::db::BuildDb;
use crate::densemap::{declare_id, DenseMap};
use crate::trace::Trace;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::time::Instant;

declare_id!(RuleId);
declare_id!(TaskId);

/// The record a finishing task sends back to the engine loop.
pub struct TaskCompletion {
    pub task: TaskId,
    pub value: Vec<u8>,
    /// Dirty dependents even if the value is unchanged.
    pub force_change: bool,
    /// Dependency keys discovered while running (e.g. from a deps file).
    pub discovered: Vec<Vec<u8>>,
    /// Wall-clock span of the work, for tracing.
    pub span: Option<(Instant, Instant)>,
    /// Lane the work ran on, for tracing.
    pub lane: usize,
}

impl TaskCompletion {
    pub fn new(value: Vec<u8>) -> TaskCompletion {
        TaskCompletion {
            task: TaskId(0),
            value,
            force_change: false,
            discovered: Vec::new(),
            span: None,
            lane: 0,
        }
    }
}

/// A cloneable handle a task hands to off-thread work so the work can send
/// the task's completion when it finishes.
#[derive(Clone)]
pub struct CompletionSender {
    task: TaskId,
    tx: mpsc::Sender<TaskCompletion>,
}

impl CompletionSender {
    pub fn send(&self, mut completion: TaskCompletion) {
        completion.task = self.task;
        // Fails only if the engine is gone, in which case nobody cares.
        let _ = self.tx.send(completion);
    }
}

/// Handle passed into task callbacks.  Requests are buffered and processed
/// when the callback returns.
pub struct TaskInterface<'a> {
    task: TaskId,
    ops: &'a mut VecDeque<EngineOp>,
    tx: &'a mpsc::Sender<TaskCompletion>,
}

impl TaskInterface<'_> {
    /// Request the value of `key`; it is delivered tagged with `input_id`.
    pub fn needs_input(&mut self, key: Vec<u8>, input_id: usize) {
        self.ops.push_back(EngineOp::NeedsInput {
            task: self.task,
            key,
            input_id,
        });
    }

    /// Order this task after `key` without receiving its value.
    pub fn must_follow(&mut self, key: Vec<u8>) {
        self.ops.push_back(EngineOp::MustFollow {
            task: self.task,
            key,
        });
    }

    /// Record a dependency edge observed while running, to be scanned on
    /// the next build.
    pub fn discovered_dependency(&mut self, key: Vec<u8>) {
        self.ops.push_back(EngineOp::Discovered {
            task: self.task,
            key,
        });
    }

    /// Complete the task synchronously.
    pub fn complete(&mut self, value: Vec<u8>, force_change: bool) {
        let mut c = TaskCompletion::new(value);
        c.force_change = force_change;
        self.completion_sender().send(c);
    }

    /// Obtain the async completion handle for work scheduled elsewhere.
    pub fn completion_sender(&self) -> CompletionSender {
        CompletionSender {
            task: self.task,
            tx: self.tx.clone(),
        }
    }
}

/// The layer above the engine: provides rules and tasks for demanded keys
/// and receives diagnostics.
pub trait EngineDelegate {
    /// Opaque binding from a key to whatever will build it.
    type Rule;
    type Task;

    fn lookup_rule(&mut self, key: &[u8]) -> Self::Rule;
    /// Whether a cached value may still be used for this rule.
    fn rule_is_valid(&mut self, rule: &Self::Rule, value: &[u8]) -> bool;
    fn create_task(&mut self, rule: &Self::Rule) -> Self::Task;

    fn task_start(&mut self, ti: &mut TaskInterface, task: &mut Self::Task);
    fn task_provide_prior_value(
        &mut self,
        ti: &mut TaskInterface,
        task: &mut Self::Task,
        value: &[u8],
    );
    fn task_provide_value(
        &mut self,
        ti: &mut TaskInterface,
        task: &mut Self::Task,
        input_id: usize,
        value: &[u8],
    );
    fn task_inputs_available(&mut self, ti: &mut TaskInterface, task: &mut Self::Task);

    /// The full key path of a dependency cycle, root first, with the
    /// repeated key at both the entry point and the end.
    fn cycle_detected(&mut self, cycle: &[Vec<u8>]);
    fn error(&mut self, message: &str);

    /// Human-readable key form for trace output.
    fn describe_key(&self, key: &[u8]) -> String {
        String::from_utf8_lossy(key).into_owned()
    }
}

enum EngineOp {
    NeedsInput {
        task: TaskId,
        key: Vec<u8>,
        input_id: usize,
    },
    MustFollow {
        task: TaskId,
        key: Vec<u8>,
    },
    Discovered {
        task: TaskId,
        key: Vec<u8>,
    },
    ProvideValue {
        task: TaskId,
        input_id: usize,
        value: Vec<u8>,
    },
    NotifyDone {
        task: TaskId,
    },
    CheckReady {
        task: TaskId,
    },
}

#[derive(Clone, Copy)]
enum Waiter {
    Task {
        task: TaskId,
        input_id: usize,
        wants_value: bool,
    },
    Scan(RuleId),
    /// Demanded for its side effects only (the root, discovered deps).
    Ignore,
}

struct RuleResult {
    value: Vec<u8>,
    deps: Vec<Vec<u8>>,
    computed_at: u64,
    built_at: u64,
}

#[derive(Clone, Copy)]
enum RuleState {
    Incomplete,
    Scanning,
    Running(TaskId),
    Complete,
}

struct RuleInfo<R> {
    key: Vec<u8>,
    rule: R,
    result: Option<RuleResult>,
    state: RuleState,
    scan_pending: usize,
    scan_changed: bool,
    scan_deps: Vec<RuleId>,
    waiters: Vec<Waiter>,
}

struct TaskInfo<T> {
    /// Taken out of the slot while a callback runs on it.
    task: Option<T>,
    rule: RuleId,
    wait_count: usize,
    started: bool,
    fired: bool,
    completed: bool,
    computing: bool,
    /// Rules requested via needs_input/must_follow, in request order.
    requested: Vec<RuleId>,
    discovered: Vec<Vec<u8>>,
}

pub struct Engine<D: EngineDelegate> {
    pub delegate: D,
    rule_ids: HashMap<Vec<u8>, RuleId>,
    rules: DenseMap<RuleId, RuleInfo<D::Rule>>,
    tasks: DenseMap<TaskId, TaskInfo<D::Task>>,
    ops: VecDeque<EngineOp>,
    tx: mpsc::Sender<TaskCompletion>,
    rx: mpsc::Receiver<TaskCompletion>,
    /// Tasks whose inputs_available has fired but whose completion has not
    /// yet been received.
    computing: usize,
    current_ts: u64,
    db: Option<BuildDb>,
    trace: Option<Trace>,
}

impl<D: EngineDelegate> Engine<D> {
    pub fn new(delegate: D) -> Engine<D> {
        let (tx, rx) = mpsc::channel();
        Engine {
            delegate,
            rule_ids: HashMap::new(),
            rules: DenseMap::new(),
            tasks: DenseMap::new(),
            ops: VecDeque::new(),
            tx,
            rx,
            computing: 0,
            current_ts: 0,
            db: None,
            trace: None,
        }
    }

    /// Attach the persistent result store.  Prior results load with both
    /// counters at epoch, so an unchanged graph scans clean.
    pub fn attach_db(&mut self, db: BuildDb) {
        self.db = Some(db);
    }

    pub fn enable_tracing(&mut self, path: &str) -> Result<(), String> {
        self.trace = Some(Trace::open(path).map_err(|err| err.to_string())?);
        Ok(())
    }

    /// Bring `key` up to date.  Returns the built value, or None if the
    /// build stalled on a dependency cycle.
    pub fn build(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.current_ts += 1;
        self.reset();

        let root = self.demand(key.to_vec(), Waiter::Ignore);
        loop {
            self.run_ops();
            while let Ok(c) = self.rx.try_recv() {
                self.process_completion(c);
            }
            if !self.ops.is_empty() {
                continue;
            }
            let root_done = matches!(self.rules.get(root).state, RuleState::Complete);
            if root_done && self.computing == 0 {
                break;
            }
            if self.computing > 0 {
                // Block until some in-flight work finishes.
                match self.rx.recv() {
                    Ok(c) => self.process_completion(c),
                    Err(_) => break,
                }
                continue;
            }
            // No runnable op, nothing in flight, root incomplete: the
            // remaining work is waiting on itself.
            self.report_cycle(root);
            return None;
        }

        let info = self.rules.get(root);
        if !matches!(info.state, RuleState::Complete) {
            return None;
        }
        info.result.as_ref().map(|r| r.value.clone())
    }

    /// Clear per-build state, keeping rules and their results.
    fn reset(&mut self) {
        self.tasks = DenseMap::new();
        self.ops.clear();
        self.computing = 0;
        // Stale completions from an aborted build reference dead task ids.
        while self.rx.try_recv().is_ok() {}
        for i in 0..self.rules.len() {
            let info = self.rules.get_mut(RuleId(i));
            info.state = RuleState::Incomplete;
            info.scan_pending = 0;
            info.scan_changed = false;
            info.scan_deps.clear();
            info.waiters.clear();
        }
    }

    fn rule_id(&mut self, key: Vec<u8>) -> RuleId {
        if let Some(&rid) = self.rule_ids.get(&key) {
            return rid;
        }
        let rule = self.delegate.lookup_rule(&key);
        let result = self
            .db
            .as_ref()
            .and_then(|db| db.lookup(&key))
            .map(|r| RuleResult {
                value: r.value.clone(),
                deps: r.deps.clone(),
                computed_at: 0,
                built_at: 0,
            });
        let rid = self.rules.push(RuleInfo {
            key: key.clone(),
            rule,
            result,
            state: RuleState::Incomplete,
            scan_pending: 0,
            scan_changed: false,
            scan_deps: Vec::new(),
            waiters: Vec::new(),
        });
        self.rule_ids.insert(key, rid);
        rid
    }

    fn demand(&mut self, key: Vec<u8>, waiter: Waiter) -> RuleId {
        let rid = self.rule_id(key);
        match self.rules.get(rid).state {
            RuleState::Complete => self.deliver(rid, waiter),
            RuleState::Scanning | RuleState::Running(_) => {
                self.rules.get_mut(rid).waiters.push(waiter)
            }
            RuleState::Incomplete => {
                self.rules.get_mut(rid).waiters.push(waiter);
                self.activate(rid);
            }
        }
        rid
    }

    /// Decide how a just-demanded rule gets brought up to date: reuse,
    /// scan its recorded deps, or run a fresh task.
    fn activate(&mut self, rid: RuleId) {
        let reusable_deps = {
            let info = self.rules.get(rid);
            match &info.result {
                Some(result) if self.delegate.rule_is_valid(&info.rule, &result.value) => {
                    Some(result.deps.clone())
                }
                _ => None,
            }
        };
        match reusable_deps {
            None => self.start_task(rid),
            Some(deps) if deps.is_empty() => self.complete_reuse(rid),
            Some(deps) => {
                {
                    let info = self.rules.get_mut(rid);
                    info.state = RuleState::Scanning;
                    info.scan_pending = deps.len();
                    info.scan_changed = false;
                }
                for dep in deps {
                    let dep_rid = self.demand(dep, Waiter::Scan(rid));
                    self.rules.get_mut(rid).scan_deps.push(dep_rid);
                }
            }
        }
    }

    fn start_task(&mut self, rid: RuleId) {
        let task = self.delegate.create_task(&self.rules.get(rid).rule);
        let tid = self.tasks.push(TaskInfo {
            task: Some(task),
            rule: rid,
            wait_count: 0,
            started: false,
            fired: false,
            completed: false,
            computing: false,
            requested: Vec::new(),
            discovered: Vec::new(),
        });
        self.rules.get_mut(rid).state = RuleState::Running(tid);

        let mut task = self.tasks.get_mut(tid).task.take().unwrap();
        let mut ti = TaskInterface {
            task: tid,
            ops: &mut self.ops,
            tx: &self.tx,
        };
        self.delegate.task_start(&mut ti, &mut task);
        if let Some(result) = &self.rules.get(rid).result {
            let value = result.value.clone();
            let mut ti = TaskInterface {
                task: tid,
                ops: &mut self.ops,
                tx: &self.tx,
            };
            self.delegate.task_provide_prior_value(&mut ti, &mut task, &value);
        }
        self.tasks.get_mut(tid).task = Some(task);
        // Processed after the requests buffered above, so the ready check
        // sees the final wait count.
        self.ops.push_back(EngineOp::CheckReady { task: tid });
    }

    /// Reuse a scanned-clean prior result without running a task.
    fn complete_reuse(&mut self, rid: RuleId) {
        let ts = self.current_ts;
        let info = self.rules.get_mut(rid);
        info.result.as_mut().unwrap().computed_at = ts;
        info.state = RuleState::Complete;
        self.notify_waiters(rid);
    }

    fn notify_waiters(&mut self, rid: RuleId) {
        let waiters = std::mem::take(&mut self.rules.get_mut(rid).waiters);
        for waiter in waiters {
            self.deliver(rid, waiter);
        }
    }

    fn deliver(&mut self, rid: RuleId, waiter: Waiter) {
        match waiter {
            Waiter::Task {
                task,
                input_id,
                wants_value,
            } => {
                if wants_value {
                    let value = self.rules.get(rid).result.as_ref().unwrap().value.clone();
                    self.ops.push_back(EngineOp::ProvideValue {
                        task,
                        input_id,
                        value,
                    });
                } else {
                    self.ops.push_back(EngineOp::NotifyDone { task });
                }
            }
            Waiter::Scan(scanner) => {
                let dep_built = self.rules.get(rid).result.as_ref().unwrap().built_at;
                let finished = {
                    let sinfo = self.rules.get_mut(scanner);
                    if !matches!(sinfo.state, RuleState::Scanning) {
                        return;
                    }
                    if dep_built > sinfo.result.as_ref().unwrap().computed_at {
                        sinfo.scan_changed = true;
                    }
                    sinfo.scan_pending -= 1;
                    if sinfo.scan_pending == 0 {
                        Some(sinfo.scan_changed)
                    } else {
                        None
                    }
                };
                match finished {
                    Some(true) => self.start_task(scanner),
                    Some(false) => self.complete_reuse(scanner),
                    None => {}
                }
            }
            Waiter::Ignore => {}
        }
    }

    fn run_ops(&mut self) {
        while let Some(op) = self.ops.pop_front() {
            match op {
                EngineOp::NeedsInput {
                    task,
                    key,
                    input_id,
                } => {
                    if self.tasks.get(task).completed {
                        continue;
                    }
                    self.tasks.get_mut(task).wait_count += 1;
                    let rid = self.demand(
                        key,
                        Waiter::Task {
                            task,
                            input_id,
                            wants_value: true,
                        },
                    );
                    self.tasks.get_mut(task).requested.push(rid);
                }
                EngineOp::MustFollow { task, key } => {
                    if self.tasks.get(task).completed {
                        continue;
                    }
                    self.tasks.get_mut(task).wait_count += 1;
                    let rid = self.demand(
                        key,
                        Waiter::Task {
                            task,
                            input_id: 0,
                            wants_value: false,
                        },
                    );
                    self.tasks.get_mut(task).requested.push(rid);
                }
                EngineOp::Discovered { task, key } => {
                    self.tasks.get_mut(task).discovered.push(key);
                }
                EngineOp::ProvideValue {
                    task,
                    input_id,
                    value,
                } => {
                    if self.tasks.get(task).completed {
                        continue;
                    }
                    let mut t = self.tasks.get_mut(task).task.take().unwrap();
                    let mut ti = TaskInterface {
                        task,
                        ops: &mut self.ops,
                        tx: &self.tx,
                    };
                    self.delegate.task_provide_value(&mut ti, &mut t, input_id, &value);
                    let info = self.tasks.get_mut(task);
                    info.task = Some(t);
                    info.wait_count -= 1;
                    self.maybe_fire(task);
                }
                EngineOp::NotifyDone { task } => {
                    if self.tasks.get(task).completed {
                        continue;
                    }
                    self.tasks.get_mut(task).wait_count -= 1;
                    self.maybe_fire(task);
                }
                EngineOp::CheckReady { task } => {
                    self.tasks.get_mut(task).started = true;
                    self.maybe_fire(task);
                }
            }
        }
    }

    /// Fire inputs_available exactly once, after start has returned and
    /// every requested input has been delivered.
    fn maybe_fire(&mut self, tid: TaskId) {
        {
            let info = self.tasks.get_mut(tid);
            if !info.started || info.fired || info.completed || info.wait_count > 0 {
                return;
            }
            info.fired = true;
            info.computing = true;
        }
        self.computing += 1;
        let mut task = self.tasks.get_mut(tid).task.take().unwrap();
        let mut ti = TaskInterface {
            task: tid,
            ops: &mut self.ops,
            tx: &self.tx,
        };
        self.delegate.task_inputs_available(&mut ti, &mut task);
        self.tasks.get_mut(tid).task = Some(task);
    }

    fn process_completion(&mut self, c: TaskCompletion) {
        let tid = c.task;
        let Some(info) = self.tasks.lookup(tid) else {
            return;
        };
        if info.completed {
            return;
        }
        let rid = info.rule;
        {
            let info = self.tasks.get_mut(tid);
            info.completed = true;
            info.discovered.extend(c.discovered);
            if info.computing {
                info.computing = false;
            } else {
                // Completed before inputs_available could fire; make the
                // decrement below a no-op.
                self.computing += 1;
            }
        }
        self.computing -= 1;

        // The result's dependencies are everything requested during the run
        // plus anything discovered while executing.  Discovered deps are
        // demanded now so their own results exist for the next build's scan.
        let mut deps: Vec<Vec<u8>> = self
            .tasks
            .get(tid)
            .requested
            .iter()
            .map(|&r| self.rules.get(r).key.clone())
            .collect();
        let discovered = self.tasks.get(tid).discovered.clone();
        for key in discovered {
            deps.push(key.clone());
            self.demand(key, Waiter::Ignore);
        }

        let ts = self.current_ts;
        let built_at = match &self.rules.get(rid).result {
            Some(prev) if !c.force_change && prev.value == c.value => prev.built_at,
            _ => ts,
        };

        if let (Some(trace), Some((start, end))) = (&mut self.trace, c.span) {
            let name = self.delegate.describe_key(&self.rules.get(rid).key);
            trace.write_complete(&name, c.lane, start, end);
        }

        if let Some(db) = &mut self.db {
            let key = self.rules.get(rid).key.clone();
            if let Err(err) = db.write_result(&key, &c.value, &deps) {
                self.delegate
                    .error(&format!("error writing build database: {}", err));
            }
        }

        let info = self.rules.get_mut(rid);
        info.result = Some(RuleResult {
            value: c.value,
            deps,
            computed_at: ts,
            built_at,
        });
        info.state = RuleState::Complete;
        self.notify_waiters(rid);
    }

    /// Rules this rule is waiting on, for cycle reporting.
    fn waits_on(&self, rid: RuleId) -> Vec<RuleId> {
        match self.rules.get(rid).state {
            RuleState::Scanning => self.rules.get(rid).scan_deps.clone(),
            RuleState::Running(tid) => self.tasks.get(tid).requested.clone(),
            _ => Vec::new(),
        }
    }

    fn find_cycle(
        &self,
        rid: RuleId,
        stack: &mut Vec<RuleId>,
        visited: &mut HashSet<RuleId>,
    ) -> Option<Vec<RuleId>> {
        if stack.contains(&rid) {
            let mut cycle = stack.clone();
            cycle.push(rid);
            return Some(cycle);
        }
        if !visited.insert(rid) {
            return None;
        }
        stack.push(rid);
        for dep in self.waits_on(rid) {
            if matches!(self.rules.get(dep).state, RuleState::Complete) {
                continue;
            }
            if let Some(cycle) = self.find_cycle(dep, stack, visited) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    fn report_cycle(&mut self, root: RuleId) {
        let mut stack = Vec::new();
        let mut visited = HashSet::new();
        match self.find_cycle(root, &mut stack, &mut visited) {
            Some(cycle) => {
                let keys: Vec<Vec<u8>> = cycle
                    .iter()
                    .map(|&r| self.rules.get(r).key.clone())
                    .collect();
                self.delegate.cycle_detected(&keys);
            }
            None => {
                // Should be impossible; some task failed to ever complete.
                self.delegate.error("build stalled without making progress");
            }
        }
    }
}
