//! Task and dependency state machines.
//!
//! All worker bookkeeping lives in [`WorkerState`]: the task map, the
//! dependency map, the data store, the symmetric peer indices, the in-flight
//! accounting, and the ready queue. Tasks and dependencies reference each
//! other by key through plain maps, never by pointer. The runtime guards the
//! whole structure with one mutex, so every method here runs under the single
//! state mutator discipline.
//!
//! State transitions are exhaustive matches over `(from, to)` pairs; pairs
//! outside the lifecycle are logged no-ops. Outbound scheduler messages
//! produced by transitions accumulate in an outbox the runtime drains after
//! every locked section, preserving the order of their triggering
//! transitions.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use rand::seq::SliceRandom;
use rmpv::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::executor::TaskOutcome;
use crate::packing::pack_data;
use crate::proto::{keys_value, value_nbytes, Key, Msg};

/// Failed location rounds beyond which a dependency is poisoned.
pub const SUSPICION_THRESHOLD: u32 = 3;

/// Maximum keys bundled into one fetch request.
const MAX_KEYS_PER_FETCH: usize = 1024;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for dependency data.
    Waiting,
    /// All inputs present; queued for execution.
    Ready,
    /// Running in the executor.
    Executing,
    /// Result is in the data store.
    Memory,
}

/// Lifecycle of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    /// Wanted but not yet requested.
    Waiting,
    /// Being fetched from exactly one peer.
    Flight,
    /// Value is in the data store.
    Memory,
}

/// Serialized payload of one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Opaque function payload.
    pub func: Vec<u8>,
    /// Positional arguments; leaves may name dependency keys.
    pub args: Value,
    /// Keyword arguments; leaves may name dependency keys.
    pub kwargs: Value,
}

/// Priority of a task: the scheduler-assigned tuple with the worker's
/// arrival counter spliced in at index 2. Smaller tuples run first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Priority(Vec<i64>);

impl Priority {
    /// Build a priority from the scheduler tuple and the arrival counter.
    pub fn new(mut scheduler: Vec<i64>, counter: i64) -> Self {
        let idx = scheduler.len().min(2);
        scheduler.insert(idx, counter);
        Self(scheduler)
    }

    /// The full tuple.
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }
}

/// A task popped for execution, with dependency values already packed in.
#[derive(Debug)]
pub struct ExecuteJob {
    /// Task key.
    pub key: Key,
    /// Opaque function payload.
    pub func: Vec<u8>,
    /// Arguments after placeholder substitution.
    pub args: Value,
    /// Keyword arguments after placeholder substitution.
    pub kwargs: Value,
}

/// One step of the fetch loop.
#[derive(Debug)]
pub enum FetchPlan {
    /// Fire one `get_data` request for these deps to this peer.
    Dispatch {
        /// Chosen peer.
        addr: Address,
        /// Deps transitioned to flight for this request.
        deps: Vec<Key>,
    },
    /// These deps have no known peer; ask the scheduler.
    MissingDeps {
        /// Deps needing location.
        deps: Vec<Key>,
    },
    /// Nothing to do right now.
    Idle,
}

/// Load gauges reported to the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct Gauges {
    /// Tasks currently executing.
    pub executing: usize,
    /// Tasks queued ready.
    pub ready: usize,
    /// Deps currently in flight.
    pub in_flight: usize,
    /// Values held in the data store.
    pub in_memory: usize,
}

/// All mutable worker bookkeeping.
#[derive(Debug)]
pub struct WorkerState {
    total_connections: usize,

    tasks: HashMap<Key, TaskSpec>,
    task_state: HashMap<Key, TaskState>,
    priorities: HashMap<Key, Priority>,
    priority_counter: i64,
    ready: BinaryHeap<Reverse<(Priority, Key)>>,
    executing: HashSet<Key>,

    data: HashMap<Key, Value>,
    nbytes: HashMap<Key, usize>,

    dep_state: HashMap<Key, DepState>,
    dependencies: HashMap<Key, HashSet<Key>>,
    dependents: HashMap<Key, HashSet<Key>>,
    waiting_for_data: HashMap<Key, HashSet<Key>>,
    data_needed: VecDeque<Key>,

    who_has: HashMap<Key, HashSet<Address>>,
    has_what: HashMap<Address, HashSet<Key>>,
    in_flight_tasks: HashMap<Key, Address>,
    in_flight_workers: HashMap<Address, HashSet<Key>>,
    pending_data_per_worker: HashMap<Address, VecDeque<Key>>,

    suspicious_deps: HashMap<Key, u32>,
    missing_dep_flight: HashSet<Key>,

    outcomes: HashMap<Key, TaskOutcome>,
    watchers: HashMap<Key, Vec<oneshot::Sender<TaskOutcome>>>,

    outbox: Vec<Msg>,
}

impl WorkerState {
    /// Create an empty state with the given fetch-concurrency cap.
    pub fn new(total_connections: usize) -> Self {
        assert!(total_connections >= 1, "need at least one fetch connection");
        Self {
            total_connections,
            tasks: HashMap::new(),
            task_state: HashMap::new(),
            priorities: HashMap::new(),
            priority_counter: 0,
            ready: BinaryHeap::new(),
            executing: HashSet::new(),
            data: HashMap::new(),
            nbytes: HashMap::new(),
            dep_state: HashMap::new(),
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
            waiting_for_data: HashMap::new(),
            data_needed: VecDeque::new(),
            who_has: HashMap::new(),
            has_what: HashMap::new(),
            in_flight_tasks: HashMap::new(),
            in_flight_workers: HashMap::new(),
            pending_data_per_worker: HashMap::new(),
            suspicious_deps: HashMap::new(),
            missing_dep_flight: HashSet::new(),
            outcomes: HashMap::new(),
            watchers: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Scheduler-directed operations
    // ------------------------------------------------------------------

    /// Accept one `compute-task`.
    ///
    /// `who_has` carries the task's dependencies and the peers advertised to
    /// hold them. Resubmitting a key already in memory echoes one extra
    /// `task-finished` without re-executing anything.
    pub fn add_task(
        &mut self,
        key: Key,
        spec: TaskSpec,
        scheduler_priority: Vec<i64>,
        who_has: Vec<(Key, Vec<Address>)>,
    ) {
        if let Some(state) = self.task_state.get(&key) {
            if *state == TaskState::Memory {
                self.report_task_finished(&key);
            } else {
                debug!(key = %key, state = ?state, "duplicate submission ignored");
            }
            return;
        }

        self.priority_counter -= 1;
        let priority = Priority::new(scheduler_priority, self.priority_counter);
        self.priorities.insert(key.clone(), priority);
        self.tasks.insert(key.clone(), spec);

        if self.data.contains_key(&key) {
            // The value arrived before the task did.
            self.task_state.insert(key.clone(), TaskState::Memory);
            self.report_task_finished(&key);
            return;
        }

        let mut waiting = HashSet::new();
        let mut deps = HashSet::new();
        for (dep, addrs) in who_has {
            deps.insert(dep.clone());
            self.dependents.entry(dep.clone()).or_default().insert(key.clone());
            self.update_who_has(&dep, &addrs);
            if self.data.contains_key(&dep) {
                self.dep_state.entry(dep).or_insert(DepState::Memory);
            } else {
                self.dep_state.entry(dep.clone()).or_insert(DepState::Waiting);
                waiting.insert(dep);
            }
        }
        self.dependencies.insert(key.clone(), deps);
        self.task_state.insert(key.clone(), TaskState::Waiting);
        let fetch_needed = !waiting.is_empty();
        self.waiting_for_data.insert(key.clone(), waiting);

        if fetch_needed {
            self.enqueue_data_needed(&key);
            debug!(key = %key, "task waiting for data");
        } else {
            self.transition_task(&key, TaskState::Ready);
        }
    }

    /// Handle `release-task`.
    ///
    /// A `"stolen"` reason is a no-op while the task is executing or already
    /// in memory; any other release is authoritative from any state.
    pub fn release_key(&mut self, key: &str, cause: &str, reason: Option<&str>) {
        let Some(state) = self.task_state.get(key).copied() else {
            debug!(key = %key, "release for unknown task ignored");
            return;
        };
        if reason == Some("stolen") && matches!(state, TaskState::Executing | TaskState::Memory) {
            debug!(key = %key, state = ?state, "steal release ignored");
            return;
        }

        self.tasks.remove(key);
        self.task_state.remove(key);
        self.priorities.remove(key);
        self.executing.remove(key);
        self.waiting_for_data.remove(key);
        self.outcomes.remove(key);
        // Dropping the senders settles pending subscriptions with a closed
        // channel.
        self.watchers.remove(key);

        if let Some(deps) = self.dependencies.remove(key) {
            for dep in deps {
                let orphaned = match self.dependents.get_mut(&dep) {
                    Some(set) => {
                        set.remove(key);
                        set.is_empty()
                    }
                    None => false,
                };
                if orphaned {
                    self.release_dep(&dep);
                }
            }
        }

        if !self.dep_state.contains_key(key) {
            self.data.remove(key);
            self.nbytes.remove(key);
        }

        self.outbox.push(Msg::new("release").with("key", key).with("cause", cause));
        info!(key = %key, cause = cause, "released task");
    }

    /// Drop a dependency record and everything hanging off it.
    fn release_dep(&mut self, dep: &str) {
        self.dependents.remove(dep);
        let state = self.dep_state.remove(dep);
        if state.is_some() {
            debug!(dep = %dep, "released dependency");
        }
        if let Some(addr) = self.in_flight_tasks.remove(dep) {
            self.remove_in_flight_worker(&addr, dep);
        }
        if let Some(addrs) = self.who_has.remove(dep) {
            for addr in addrs {
                self.remove_has_what(&addr, dep);
            }
        }
        self.suspicious_deps.remove(dep);
        self.missing_dep_flight.remove(dep);
        if !self.task_state.contains_key(dep) {
            self.data.remove(dep);
            self.nbytes.remove(dep);
        }
    }

    /// Handle `delete-data`.
    pub fn delete_data(&mut self, keys: &[Key]) {
        for key in keys {
            if self.task_state.contains_key(key) {
                self.release_key(key, "delete-data", None);
            }
            if self.dep_state.contains_key(key) {
                self.release_dep(key);
            }
            self.data.remove(key);
            self.nbytes.remove(key);
        }
    }

    /// Handle `update_data`: values handed in directly.
    ///
    /// Returns the per-key stored sizes. When `report` is set an `add-keys`
    /// message is queued for the scheduler.
    pub fn update_data(&mut self, pairs: Vec<(Key, Value)>, report: bool) -> HashMap<Key, usize> {
        let mut sizes = HashMap::new();
        let mut keys = Vec::new();
        for (key, value) in pairs {
            self.put_key_in_memory(&key, value);
            sizes.insert(key.clone(), self.nbytes.get(&key).copied().unwrap_or(0));
            keys.push(key);
        }
        if report && !keys.is_empty() {
            self.outbox.push(Msg::new("add-keys").with("keys", keys_value(keys.iter())));
        }
        sizes
    }

    /// Deposit a value and fire the transitions it unlocks.
    pub fn put_key_in_memory(&mut self, key: &str, value: Value) {
        self.nbytes.insert(key.to_string(), value_nbytes(&value));
        self.data.insert(key.to_string(), value);

        if matches!(self.dep_state.get(key), Some(DepState::Waiting | DepState::Flight)) {
            self.transition_dep(key, DepState::Memory, None);
        }
        match self.task_state.get(key) {
            Some(TaskState::Waiting | TaskState::Ready) => {
                self.transition_task(key, TaskState::Memory);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Move a task to `to`; pairs outside the lifecycle are logged no-ops.
    fn transition_task(&mut self, key: &str, to: TaskState) {
        let Some(from) = self.task_state.get(key).copied() else {
            warn!(key = %key, to = ?to, "transition for unknown task ignored");
            return;
        };
        match (from, to) {
            (TaskState::Waiting, TaskState::Ready) => {
                let drained =
                    self.waiting_for_data.remove(key).map_or(true, |set| set.is_empty());
                assert!(drained, "task {key} became ready with undrained deps");
                let priority = self.priorities.get(key).cloned().unwrap_or_default();
                self.ready.push(Reverse((priority, key.to_string())));
                self.task_state.insert(key.to_string(), TaskState::Ready);
                debug!(key = %key, "task ready");
            }
            (TaskState::Waiting, TaskState::Memory) | (TaskState::Ready, TaskState::Memory) => {
                // Value arrived by another route; ready-queue entries are
                // skipped lazily.
                self.waiting_for_data.remove(key);
                self.task_state.insert(key.to_string(), TaskState::Memory);
                self.report_task_finished(key);
            }
            (TaskState::Ready, TaskState::Executing) => {
                self.executing.insert(key.to_string());
                self.task_state.insert(key.to_string(), TaskState::Executing);
            }
            (TaskState::Executing, TaskState::Memory) => {
                // The caller reports task-finished or task-erred depending on
                // the executor outcome.
                self.executing.remove(key);
                self.task_state.insert(key.to_string(), TaskState::Memory);
            }
            (from, to) => {
                debug!(key = %key, from = ?from, to = ?to, "invalid task transition ignored");
            }
        }
    }

    /// Move a dependency to `to`; `addr` names the peer for flight entry.
    fn transition_dep(&mut self, dep: &str, to: DepState, addr: Option<&Address>) {
        let Some(from) = self.dep_state.get(dep).copied() else {
            warn!(dep = %dep, to = ?to, "transition for unknown dependency ignored");
            return;
        };
        match (from, to) {
            (DepState::Waiting, DepState::Flight) => {
                let addr = addr.expect("flight transition needs a peer");
                self.in_flight_tasks.insert(dep.to_string(), addr.clone());
                self.in_flight_workers.entry(addr.clone()).or_default().insert(dep.to_string());
                self.dep_state.insert(dep.to_string(), DepState::Flight);
            }
            (DepState::Flight, DepState::Memory) => {
                if let Some(addr) = self.in_flight_tasks.remove(dep) {
                    self.remove_in_flight_worker(&addr, dep);
                }
                self.dep_state.insert(dep.to_string(), DepState::Memory);
                self.deliver_dep(dep);
            }
            (DepState::Flight, DepState::Waiting) => {
                if let Some(addr) = self.in_flight_tasks.remove(dep) {
                    self.remove_in_flight_worker(&addr, dep);
                }
                self.dep_state.insert(dep.to_string(), DepState::Waiting);
                // Tasks needing this dep go back onto the fetch queue.
                for task in self.dependents.get(dep).cloned().unwrap_or_default() {
                    if matches!(self.task_state.get(&task), Some(TaskState::Waiting)) {
                        self.enqueue_data_needed(&task);
                    }
                }
            }
            (DepState::Waiting, DepState::Memory) => {
                self.dep_state.insert(dep.to_string(), DepState::Memory);
                self.deliver_dep(dep);
            }
            (from, to) => {
                // Memory never refetches.
                debug!(dep = %dep, from = ?from, to = ?to, "invalid dependency transition ignored");
            }
        }
    }

    /// A dep reached memory: drain it from dependents' waiting sets.
    fn deliver_dep(&mut self, dep: &str) {
        let dependents = self.dependents.get(dep).cloned().unwrap_or_default();
        for task in dependents {
            let drained = match self.waiting_for_data.get_mut(&task) {
                Some(set) => {
                    set.remove(dep);
                    set.is_empty()
                }
                None => false,
            };
            if drained && matches!(self.task_state.get(&task), Some(TaskState::Waiting)) {
                self.transition_task(&task, TaskState::Ready);
            }
        }
    }

    // ------------------------------------------------------------------
    // Fetch planning
    // ------------------------------------------------------------------

    /// Plan the next fetch, transitioning the chosen deps to flight.
    ///
    /// Honors the fetch-concurrency cap; peeks only the oldest key needing
    /// data, dispatching one peer request per call. Deps with no advertised
    /// peer and no local task to produce them are reported for missing-dep
    /// recovery (and marked, so each is reported once per recovery round).
    pub fn plan_fetch(&mut self) -> FetchPlan {
        if self.in_flight_workers.len() >= self.total_connections {
            return FetchPlan::Idle;
        }
        loop {
            let Some(key) = self.data_needed.front().cloned() else {
                return FetchPlan::Idle;
            };
            if !matches!(self.task_state.get(&key), Some(TaskState::Waiting)) {
                self.data_needed.pop_front();
                continue;
            }
            let waiting_deps: Vec<Key> = match self.waiting_for_data.get(&key) {
                Some(set) if !set.is_empty() => set
                    .iter()
                    .filter(|d| matches!(self.dep_state.get(*d), Some(DepState::Waiting)))
                    .cloned()
                    .collect(),
                _ => {
                    self.data_needed.pop_front();
                    continue;
                }
            };
            if waiting_deps.is_empty() {
                // Everything already dispatched.
                self.data_needed.pop_front();
                continue;
            }

            let mut missing = Vec::new();
            for dep in &waiting_deps {
                let advertised = self.who_has.get(dep).is_some_and(|s| !s.is_empty());
                if !advertised {
                    let locally_pending = self.task_state.contains_key(dep);
                    if !locally_pending && !self.missing_dep_flight.contains(dep) {
                        missing.push(dep.clone());
                    }
                    continue;
                }
                let free_peers: Vec<Address> = self.who_has[dep]
                    .iter()
                    .filter(|a| !self.in_flight_workers.contains_key(*a))
                    .cloned()
                    .collect();
                let Some(addr) = free_peers.choose(&mut rand::thread_rng()).cloned() else {
                    // All advertised peers busy; retried when one frees up.
                    continue;
                };

                let batch = self.fill_fetch_batch(dep, &addr);
                for d in &batch {
                    self.transition_dep(d, DepState::Flight, Some(&addr));
                }
                let none_waiting = self.waiting_for_data.get(&key).map_or(true, |set| {
                    set.iter().all(|d| !matches!(self.dep_state.get(d), Some(DepState::Waiting)))
                });
                if none_waiting {
                    self.data_needed.pop_front();
                }
                debug!(addr = %addr, deps = batch.len(), "dispatching fetch");
                return FetchPlan::Dispatch { addr, deps: batch };
            }

            if !missing.is_empty() {
                for dep in &missing {
                    self.missing_dep_flight.insert(dep.clone());
                }
                return FetchPlan::MissingDeps { deps: missing };
            }
            // Head key is blocked on busy peers, pending recovery, or local
            // computation; nothing to dispatch this round.
            return FetchPlan::Idle;
        }
    }

    /// Start from `dep` and opportunistically add other waiting deps pending
    /// for the same peer.
    fn fill_fetch_batch(&mut self, dep: &str, addr: &Address) -> Vec<Key> {
        let mut batch = vec![dep.to_string()];
        let Some(pending) = self.pending_data_per_worker.get_mut(addr) else {
            return batch;
        };
        while batch.len() < MAX_KEYS_PER_FETCH {
            let Some(candidate) = pending.pop_front() else {
                break;
            };
            if candidate != dep
                && matches!(self.dep_state.get(&candidate), Some(DepState::Waiting))
                && self.who_has.get(&candidate).map_or(false, |s| s.contains(addr))
                && !batch.contains(&candidate)
            {
                batch.push(candidate);
            }
        }
        batch
    }

    /// Apply a successful `get_data` reply for deps fetched from `addr`.
    ///
    /// Returns deps that lost their last peer and need missing-dep recovery.
    pub fn gather_succeeded(
        &mut self,
        addr: &Address,
        deps: &[Key],
        mut fetched: HashMap<Key, Value>,
    ) -> Vec<Key> {
        let mut arrived = Vec::new();
        let mut missing = Vec::new();
        for dep in deps {
            match self.dep_state.get(dep) {
                Some(DepState::Flight) => {
                    if let Some(value) = fetched.remove(dep) {
                        self.put_key_in_memory(dep, value);
                        arrived.push(dep.clone());
                    } else {
                        // Peer answered but no longer holds the value.
                        self.transition_dep(dep, DepState::Waiting, None);
                        self.remove_peer_for_dep(dep, addr);
                        if self.needs_recovery(dep) {
                            self.missing_dep_flight.insert(dep.clone());
                            missing.push(dep.clone());
                        }
                    }
                }
                _ => self.clear_stale_flight(dep, addr),
            }
        }
        // Opportunistic extras the peer bundled in.
        for (key, value) in fetched {
            if matches!(self.dep_state.get(&key), Some(DepState::Waiting | DepState::Flight)) {
                self.put_key_in_memory(&key, value);
                arrived.push(key);
            }
        }
        if !arrived.is_empty() {
            self.outbox.push(Msg::new("add-keys").with("keys", keys_value(arrived.iter())));
        }
        missing
    }

    /// Unwind a failed `get_data` call: evict the peer and revert the deps.
    ///
    /// Returns deps that lost their last peer and need missing-dep recovery.
    pub fn gather_failed(&mut self, addr: &Address, deps: &[Key]) -> Vec<Key> {
        warn!(addr = %addr, deps = deps.len(), "fetch failed, evicting peer");
        if let Some(keys) = self.has_what.remove(addr) {
            for key in keys {
                if let Some(set) = self.who_has.get_mut(&key) {
                    set.remove(addr);
                    if set.is_empty() {
                        self.who_has.remove(&key);
                    }
                }
            }
        }
        self.pending_data_per_worker.remove(addr);

        let mut missing = Vec::new();
        for dep in deps {
            if matches!(self.dep_state.get(dep), Some(DepState::Flight)) {
                self.transition_dep(dep, DepState::Waiting, None);
                if self.needs_recovery(dep) {
                    self.missing_dep_flight.insert(dep.clone());
                    missing.push(dep.clone());
                }
            } else {
                self.clear_stale_flight(dep, addr);
            }
        }
        self.in_flight_workers.remove(addr);
        missing
    }

    fn needs_recovery(&self, dep: &str) -> bool {
        let advertised = self.who_has.get(dep).is_some_and(|s| !s.is_empty());
        !advertised
            && !self.task_state.contains_key(dep)
            && !self.missing_dep_flight.contains(dep)
            && self.dependents.get(dep).is_some_and(|d| !d.is_empty())
    }

    // ------------------------------------------------------------------
    // Missing-dep recovery
    // ------------------------------------------------------------------

    /// Count a location round for each dep; return those now poisoned.
    pub fn tick_suspicion(&mut self, deps: &[Key]) -> Vec<Key> {
        let mut poisoned = Vec::new();
        for dep in deps {
            let count = self.suspicious_deps.entry(dep.clone()).or_insert(0);
            *count += 1;
            if *count > SUSPICION_THRESHOLD {
                poisoned.push(dep.clone());
            }
        }
        poisoned
    }

    /// Poison a dep: fail every dependent task with a synthetic error and
    /// release the dep.
    pub fn poison_dep(&mut self, dep: &str) {
        warn!(dep = %dep, "dependency poisoned");
        let exception = format!("DependencyPoisoned: {dep} could not be found on any peer");
        let traceback = format!("while locating dependency {dep}");
        for task in self.dependents.get(dep).cloned().unwrap_or_default() {
            self.fail_task(&task, exception.clone(), traceback.clone());
        }
        self.release_dep(dep);
    }

    /// Merge a scheduler `who_has` reply and settle the queried deps.
    ///
    /// Deps the scheduler still knows nothing about are released, cascading
    /// to their dependent tasks (which are released and thereby reported).
    pub fn apply_who_has_reply(&mut self, queried: &[Key], reply: Vec<(Key, Vec<Address>)>) {
        for (dep, addrs) in reply {
            if !addrs.is_empty() {
                self.update_who_has(&dep, &addrs);
            }
        }
        for dep in queried {
            self.missing_dep_flight.remove(dep);
            let has_peers = self.who_has.get(dep).is_some_and(|s| !s.is_empty());
            if has_peers || self.task_state.contains_key(dep) {
                continue;
            }
            info!(dep = %dep, "no peers known for dependency, releasing dependents");
            for task in self.dependents.get(dep).cloned().unwrap_or_default() {
                self.release_key(&task, "no-workers-found", None);
            }
            if self.dep_state.contains_key(dep) {
                self.release_dep(dep);
            }
        }
    }

    /// Suspicion count for a dep.
    pub fn suspicion_of(&self, dep: &str) -> u32 {
        self.suspicious_deps.get(dep).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Pop the highest-priority ready task and transition it to executing.
    pub fn next_executable(&mut self) -> Option<ExecuteJob> {
        while let Some(Reverse((_, key))) = self.ready.pop() {
            if !matches!(self.task_state.get(&key), Some(TaskState::Ready)) {
                // Stale heap entry from a release or an early arrival.
                continue;
            }
            self.transition_task(&key, TaskState::Executing);
            let spec = self.tasks.get(&key).expect("executing task has a spec");
            let args = pack_data(&spec.args, &self.data);
            let kwargs = pack_data(&spec.kwargs, &self.data);
            return Some(ExecuteJob { key: key.clone(), func: spec.func.clone(), args, kwargs });
        }
        None
    }

    /// Record an executor outcome.
    ///
    /// Results for tasks released mid-run are discarded.
    pub fn finish_execution(&mut self, key: &str, outcome: TaskOutcome) {
        if !self.executing.contains(key) || !self.tasks.contains_key(key) {
            debug!(key = %key, "discarding result for released task");
            return;
        }
        match outcome {
            TaskOutcome::Finished(value) => {
                self.nbytes.insert(key.to_string(), value_nbytes(&value));
                self.data.insert(key.to_string(), value.clone());
                self.transition_task(key, TaskState::Memory);
                self.report_task_finished(key);
                if matches!(self.dep_state.get(key), Some(DepState::Waiting | DepState::Flight)) {
                    self.transition_dep(key, DepState::Memory, None);
                }
                self.settle(key, TaskOutcome::Finished(value));
            }
            TaskOutcome::Erred { exception, traceback } => {
                self.fail_task(key, exception, traceback);
            }
        }
    }

    /// Fail a task: its error becomes its value, the scheduler hears
    /// `task-erred`, and subscribers are settled with the exception.
    fn fail_task(&mut self, key: &str, exception: String, traceback: String) {
        let value = error_value(&exception, &traceback);
        self.nbytes.insert(key.to_string(), value_nbytes(&value));
        self.data.insert(key.to_string(), value);
        self.executing.remove(key);
        self.waiting_for_data.remove(key);
        self.task_state.insert(key.to_string(), TaskState::Memory);
        if matches!(self.dep_state.get(key), Some(DepState::Waiting | DepState::Flight)) {
            self.transition_dep(key, DepState::Memory, None);
        }
        self.outbox.push(
            Msg::new("task-erred")
                .with("key", key)
                .with("exception", exception.as_str())
                .with("traceback", traceback.as_str()),
        );
        self.settle(key, TaskOutcome::Erred { exception, traceback });
    }

    /// Settle subscribers and remember the outcome for late ones.
    fn settle(&mut self, key: &str, outcome: TaskOutcome) {
        if let Some(senders) = self.watchers.remove(key) {
            for sender in senders {
                let _ = sender.send(outcome.clone());
            }
        }
        self.outcomes.insert(key.to_string(), outcome);
    }

    /// Subscribe to a task's outcome.
    pub fn subscribe(&mut self, key: &str) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Some(outcome) = self.outcomes.get(key) {
            let _ = tx.send(outcome.clone());
        } else {
            self.watchers.entry(key.to_string()).or_default().push(tx);
        }
        rx
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Reply map for `get_data`: only the keys actually held.
    pub fn get_data_reply(&self, keys: &[Key]) -> Msg {
        let mut reply = Msg::empty();
        for key in keys {
            if let Some(value) = self.data.get(key) {
                reply.insert(key, value.clone());
            }
        }
        reply
    }

    /// Keys currently in the data store.
    pub fn stored_keys(&self) -> Vec<Key> {
        self.data.keys().cloned().collect()
    }

    /// Whether a key's value is held locally.
    pub fn holds(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Load gauges for registration and heartbeats.
    pub fn gauges(&self) -> Gauges {
        Gauges {
            executing: self.executing.len(),
            ready: self.task_state.values().filter(|s| matches!(s, TaskState::Ready)).count(),
            in_flight: self.in_flight_tasks.len(),
            in_memory: self.data.len(),
        }
    }

    /// Drain queued outbound scheduler messages.
    pub fn take_outbox(&mut self) -> Vec<Msg> {
        std::mem::take(&mut self.outbox)
    }

    /// Current state of a task, if known.
    pub fn task_state_of(&self, key: &str) -> Option<TaskState> {
        self.task_state.get(key).copied()
    }

    /// Current state of a dependency, if known.
    pub fn dep_state_of(&self, key: &str) -> Option<DepState> {
        self.dep_state.get(key).copied()
    }

    // ------------------------------------------------------------------
    // Internal bookkeeping
    // ------------------------------------------------------------------

    fn report_task_finished(&mut self, key: &str) {
        let nbytes = self.nbytes.get(key).copied().unwrap_or(0);
        self.outbox.push(
            Msg::new("task-finished")
                .with("key", key)
                .with("status", "OK")
                .with("nbytes", nbytes as i64),
        );
    }

    fn enqueue_data_needed(&mut self, key: &str) {
        if !self.data_needed.iter().any(|k| k == key) {
            self.data_needed.push_back(key.to_string());
        }
    }

    fn update_who_has(&mut self, dep: &str, addrs: &[Address]) {
        for addr in addrs {
            self.who_has.entry(dep.to_string()).or_default().insert(addr.clone());
            self.has_what.entry(addr.clone()).or_default().insert(dep.to_string());
            let pending = self.pending_data_per_worker.entry(addr.clone()).or_default();
            if !pending.iter().any(|k| k == dep) {
                pending.push_back(dep.to_string());
            }
        }
    }

    fn remove_peer_for_dep(&mut self, dep: &str, addr: &Address) {
        if let Some(set) = self.who_has.get_mut(dep) {
            set.remove(addr);
            if set.is_empty() {
                self.who_has.remove(dep);
            }
        }
        self.remove_has_what(addr, dep);
    }

    fn remove_has_what(&mut self, addr: &Address, dep: &str) {
        if let Some(set) = self.has_what.get_mut(addr) {
            set.remove(dep);
            if set.is_empty() {
                self.has_what.remove(addr);
            }
        }
    }

    fn remove_in_flight_worker(&mut self, addr: &Address, dep: &str) {
        if let Some(set) = self.in_flight_workers.get_mut(addr) {
            set.remove(dep);
            if set.is_empty() {
                self.in_flight_workers.remove(addr);
            }
        }
    }

    fn clear_stale_flight(&mut self, dep: &str, addr: &Address) {
        if self.in_flight_tasks.get(dep) == Some(addr) {
            self.in_flight_tasks.remove(dep);
            self.remove_in_flight_worker(addr, dep);
        }
    }

    /// Check the cross-map invariants; test and debug aid.
    pub fn assert_invariants(&self) {
        // Peer-index symmetry.
        for (key, addrs) in &self.who_has {
            for addr in addrs {
                assert!(
                    self.has_what.get(addr).is_some_and(|s| s.contains(key)),
                    "who_has/has_what asymmetry for {key} at {addr}"
                );
            }
        }
        for (addr, keys) in &self.has_what {
            for key in keys {
                assert!(
                    self.who_has.get(key).is_some_and(|s| s.contains(addr)),
                    "has_what/who_has asymmetry for {key} at {addr}"
                );
            }
        }
        // Concurrency bound.
        assert!(
            self.in_flight_workers.len() <= self.total_connections,
            "fetch concurrency exceeded"
        );
        // Waiting tasks and only waiting tasks have pending deps.
        for (key, state) in &self.task_state {
            match state {
                TaskState::Waiting => assert!(
                    self.waiting_for_data.get(key).is_some_and(|s| !s.is_empty()),
                    "waiting task {key} has no pending deps"
                ),
                _ => assert!(
                    self.waiting_for_data.get(key).map_or(true, |s| s.is_empty()),
                    "non-waiting task {key} still waits for data"
                ),
            }
            // Memory implies data, and data implies memory unless a dep
            // record in memory owns the value.
            if matches!(state, TaskState::Memory) {
                assert!(self.data.contains_key(key), "task {key} in memory without data");
            } else if !matches!(self.dep_state.get(key), Some(DepState::Memory)) {
                assert!(!self.data.contains_key(key), "task {key} has data outside memory");
            }
        }
        // Unique in-flight entries.
        for (dep, state) in &self.dep_state {
            if matches!(state, DepState::Flight) {
                let addr = self
                    .in_flight_tasks
                    .get(dep)
                    .unwrap_or_else(|| panic!("flight dep {dep} has no in-flight entry"));
                let members = self
                    .in_flight_workers
                    .iter()
                    .filter(|(_, keys)| keys.contains(dep))
                    .count();
                assert_eq!(members, 1, "flight dep {dep} tracked by {members} workers");
                assert!(
                    self.in_flight_workers[addr].contains(dep),
                    "flight dep {dep} not tracked under {addr}"
                );
            }
            if matches!(state, DepState::Memory) {
                assert!(self.data.contains_key(dep), "dep {dep} in memory without data");
            }
        }
    }
}

/// The value deposited for a failed task.
fn error_value(exception: &str, traceback: &str) -> Value {
    Value::Map(vec![
        (Value::from("exception"), Value::from(exception)),
        (Value::from("traceback"), Value::from(traceback)),
    ])
}
