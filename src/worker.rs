//! Worker runtime: listener, handler table, compute-stream dispatch, and the
//! coupled fetch/execute loops.
//!
//! One logical event loop per worker: accepted connections and completions of
//! spawned fetch or execute tasks all funnel their state changes through the
//! single mutex around [`WorkerState`]. Spawned tasks never touch the maps
//! directly; they re-enter through the ensure loops.
//!
//! Tiger Style:
//! - Bounded fetch concurrency via the `total_connections` accounting
//! - Explicit error handling on every connection
//! - Clean shutdown via cancellation token and task tracker

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rmpv::Value;
use snafu::ResultExt;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::comm::batched::BatchedSender;
use crate::comm::connection::{Connection, MessageReader};
use crate::comm::pool::ConnectionPool;
use crate::comm::rpc::Rpc;
use crate::config::WorkerConfig;
use crate::error::{ConnectSnafu, Result, TransportSnafu};
use crate::executor::{Executor, TaskOutcome};
use crate::proto::{keys_value, value_as_text, Key, Msg};
use crate::scheduler::{heartbeat_msg, RegisterInfo, SchedulerClient};
use crate::state::{ExecuteJob, FetchPlan, TaskSpec, WorkerState};

/// Lifecycle of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Bound but not yet registered.
    Starting,
    /// Registered and serving.
    Running,
    /// Shutdown in progress.
    Closing,
    /// Fully stopped.
    Closed,
}

/// A running worker node.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    config: WorkerConfig,
    address: Address,
    scheduler: SchedulerClient,
    state: Mutex<WorkerState>,
    rpc: Rpc,
    batched: Mutex<Option<BatchedSender>>,
    status: Mutex<WorkerStatus>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    executor: Arc<dyn Executor>,
}

impl Worker {
    /// Bind the listener, register with the scheduler, and start serving.
    ///
    /// Registration failure is a hard startup failure.
    pub async fn start(config: WorkerConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let listen = config.listen()?;
        let listener = TcpListener::bind(listen.host_port())
            .await
            .context(ConnectSnafu { address: listen.to_string() })?;
        let port = listener.local_addr().context(TransportSnafu)?.port();
        let address = listen.with_port(port);

        let pool = Arc::new(ConnectionPool::new(config.pool_limit, config.pool_per_address));
        let rpc = Rpc::new(pool);
        let scheduler = SchedulerClient::new(config.scheduler()?, rpc.clone());
        let total_connections = config.total_connections;

        let inner = Arc::new(WorkerInner {
            address,
            scheduler,
            state: Mutex::new(WorkerState::new(total_connections)),
            rpc,
            batched: Mutex::new(None),
            status: Mutex::new(WorkerStatus::Starting),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            executor,
            config,
        });

        // Listener first, so the scheduler can reach back right away.
        inner.tracker.spawn(run_listener(inner.clone(), listener));

        let register = {
            let state = inner.state.lock().await;
            RegisterInfo {
                address: inner.address.clone(),
                ncores: inner.config.ncores,
                keys: state.stored_keys(),
                memory_limit: inner.config.memory_limit,
                gauges: state.gauges(),
                services: inner.config.services.clone(),
            }
        };
        if let Err(err) = inner.scheduler.register(register).await {
            inner.cancel.cancel();
            inner.tracker.close();
            return Err(err);
        }
        *inner.status.lock().await = WorkerStatus::Running;

        inner.tracker.spawn(run_heartbeat(inner.clone()));

        info!(address = %inner.address, scheduler = %inner.scheduler.address(), "worker started");
        Ok(Self { inner })
    }

    /// The address peers and the scheduler reach this worker at.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> WorkerStatus {
        *self.inner.status.lock().await
    }

    /// Subscribe to a task's outcome (the deferred-result handle for
    /// co-resident clients). The channel closes without a value if the task
    /// is released first.
    pub async fn subscribe(&self, key: &str) -> oneshot::Receiver<TaskOutcome> {
        self.inner.state.lock().await.subscribe(key)
    }

    /// Whether a key's value is held locally.
    pub async fn holds(&self, key: &str) -> bool {
        self.inner.state.lock().await.holds(key)
    }

    /// Shut down: unregister (unless `report` is false), flush the batched
    /// stream, stop the listener, and wait for in-flight tasks.
    pub async fn close(&self, report: bool) -> Result<()> {
        close_worker(&self.inner, report).await;
        Ok(())
    }
}

async fn close_worker(inner: &Arc<WorkerInner>, report: bool) {
    {
        let mut status = inner.status.lock().await;
        if matches!(*status, WorkerStatus::Closing | WorkerStatus::Closed) {
            return;
        }
        *status = WorkerStatus::Closing;
    }
    info!("Stopping worker at {}", inner.address);

    if report {
        if let Err(err) = inner.scheduler.unregister(&inner.address).await {
            debug!(error = %err, "unregister failed during shutdown");
        }
    }
    if let Some(sender) = inner.batched.lock().await.take() {
        sender.close().await;
    }
    inner.cancel.cancel();
    inner.tracker.close();
    inner.tracker.wait().await;
    inner.rpc.pool().close().await;
    *inner.status.lock().await = WorkerStatus::Closed;
}

// ----------------------------------------------------------------------
// Accept side
// ----------------------------------------------------------------------

async fn run_listener(inner: Arc<WorkerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    let conn = Connection::from_stream(
                        stream,
                        Address::tcp(peer.ip().to_string(), peer.port()),
                    );
                    inner.tracker.spawn(handle_connection(inner.clone(), conn));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                }
            },
        }
    }
}

/// What a handled message means for the connection.
enum HandlerFlow {
    Continue,
    Close,
    ComputeStream,
}

async fn handle_connection(inner: Arc<WorkerInner>, mut conn: Connection) {
    loop {
        let frames = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            frames = conn.recv() => frames,
        };
        let frames = match frames {
            Ok(Some(frames)) => frames,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "connection lost");
                return;
            }
        };
        for frame in frames {
            let Some(msg) = Msg::from_value(frame) else {
                warn!("non-map frame on request connection dropped");
                continue;
            };
            match handle_op(&inner, &mut conn, msg).await {
                Ok(HandlerFlow::Continue) => {}
                Ok(HandlerFlow::Close) => return,
                Ok(HandlerFlow::ComputeStream) => {
                    run_compute_stream(&inner, conn).await;
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "failed to answer request");
                    return;
                }
            }
        }
    }
}

/// Reply when the message asks for one; `reply` defaults to true.
async fn maybe_reply(conn: &mut Connection, msg: &Msg, reply: Value) -> Result<()> {
    if msg.bool_field("reply", true) {
        conn.send(&[reply]).await?;
    }
    Ok(())
}

async fn handle_op(
    inner: &Arc<WorkerInner>,
    conn: &mut Connection,
    mut msg: Msg,
) -> Result<HandlerFlow> {
    match msg.op() {
        Some("get_data") => {
            let keys = msg.keys_field("keys");
            let reply = inner.state.lock().await.get_data_reply(&keys);
            if let Some(who) = msg.str_field("who") {
                debug!(who = who, keys = keys.len(), "served get_data");
            }
            maybe_reply(conn, &msg, reply.into_value()).await?;
            Ok(HandlerFlow::Continue)
        }
        Some("gather") => {
            let reply = handle_gather(inner, &msg).await;
            maybe_reply(conn, &msg, reply.into_value()).await?;
            Ok(HandlerFlow::Continue)
        }
        Some("update_data") => {
            let pairs = match msg.take("data").and_then(|v| Msg::from_value(v)) {
                Some(data) => data
                    .fields()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect::<Vec<_>>(),
                None => Vec::new(),
            };
            let report = msg.bool_field("report", true);
            let sizes = {
                let mut state = inner.state.lock().await;
                state.update_data(pairs, report)
            };
            flush_outbox(inner).await;
            ensure_computing(inner).await;
            ensure_communicating(inner).await;

            let mut nbytes = Msg::empty();
            for (key, size) in &sizes {
                nbytes.insert(key, Value::from(*size as i64));
            }
            let reply = Msg::empty().with("status", "OK").with("nbytes", nbytes.into_value());
            maybe_reply(conn, &msg, reply.into_value()).await?;
            Ok(HandlerFlow::Continue)
        }
        Some("delete_data") => {
            let keys = msg.keys_field("keys");
            inner.state.lock().await.delete_data(&keys);
            flush_outbox(inner).await;
            Ok(HandlerFlow::Continue)
        }
        Some("terminate") => {
            let report = msg.bool_field("report", true);
            maybe_reply(conn, &msg, Value::from("OK")).await?;
            let inner = inner.clone();
            // Untracked: close waits on the tracker this handler runs under.
            tokio::spawn(async move { close_worker(&inner, report).await });
            Ok(HandlerFlow::Close)
        }
        Some("keys") => {
            let keys = inner.state.lock().await.stored_keys();
            maybe_reply(conn, &msg, keys_value(keys.iter())).await?;
            Ok(HandlerFlow::Continue)
        }
        Some("close") => {
            maybe_reply(conn, &msg, Value::from("OK")).await?;
            Ok(HandlerFlow::Close)
        }
        Some("compute-stream") => Ok(HandlerFlow::ComputeStream),
        Some(op) => {
            // Unknown op: log, drop the message, keep the connection.
            warn!(op = op, "unknown operation");
            Ok(HandlerFlow::Continue)
        }
        None => {
            warn!("message without an op dropped");
            Ok(HandlerFlow::Continue)
        }
    }
}

async fn handle_gather(inner: &Arc<WorkerInner>, msg: &Msg) -> Msg {
    let mut who_has: HashMap<Key, HashSet<Address>> = HashMap::new();
    if let Some(entries) = msg.map_field("who_has") {
        for (key, value) in entries {
            let Some(key) = value_as_text(key) else { continue };
            let addrs: HashSet<Address> = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(value_as_text)
                    .filter_map(|s| Address::parse(&s).ok())
                    .collect(),
                _ => HashSet::new(),
            };
            who_has.insert(key, addrs);
        }
    }
    {
        let state = inner.state.lock().await;
        who_has.retain(|key, _| !state.holds(key));
    }
    if who_has.is_empty() {
        return Msg::empty().with("status", "OK");
    }

    let outcome =
        crate::gather::gather_from_workers(&inner.rpc, &inner.address, &who_has).await;
    let pairs: Vec<(Key, Value)> = outcome.results.into_iter().collect();
    inner.state.lock().await.update_data(pairs, false);
    flush_outbox(inner).await;
    ensure_computing(inner).await;

    if outcome.bad_keys.is_empty() {
        Msg::empty().with("status", "OK")
    } else {
        Msg::empty()
            .with("status", "missing-data")
            .with("keys", keys_value(outcome.bad_keys.iter()))
    }
}

// ----------------------------------------------------------------------
// Compute stream
// ----------------------------------------------------------------------

/// Serve a connection switched into compute-stream mode.
///
/// The write half becomes the batched stream all outbound state updates
/// coalesce onto; the read half delivers pushed `compute-task` /
/// `release-task` / `delete-data` ops. Losing this connection while running
/// shuts the worker down.
async fn run_compute_stream(inner: &Arc<WorkerInner>, conn: Connection) {
    info!(peer = %conn.peer(), "compute stream opened");
    let (mut reader, writer) = conn.into_split();
    {
        let mut batched = inner.batched.lock().await;
        if let Some(old) = batched.take() {
            // A reconnect replaces the stream; the stale one is abandoned.
            old.abort();
        }
        *batched = Some(BatchedSender::new(writer, inner.config.batch_interval()));
    }

    loop {
        let frames = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            frames = recv_stream(&mut reader) => frames,
        };
        let frames = match frames {
            Some(frames) => frames,
            None => break,
        };
        for frame in frames {
            let Some(msg) = Msg::from_value(frame) else {
                warn!("non-map frame on compute stream dropped");
                continue;
            };
            dispatch_compute_op(inner, msg).await;
        }
        // One pass over the loops per delivered batch keeps scheduler
        // ordering: every op in the batch has been applied by now.
        flush_outbox(inner).await;
        ensure_communicating(inner).await;
        ensure_computing(inner).await;
    }

    // Scheduler connection lost: log and shut down.
    warn!("compute stream lost, shutting down");
    let inner = inner.clone();
    tokio::spawn(async move { close_worker(&inner, false).await });
}

async fn recv_stream(reader: &mut MessageReader<BufReader<OwnedReadHalf>>) -> Option<Vec<Value>> {
    match reader.recv().await {
        Ok(Some(frames)) => Some(frames),
        Ok(None) => None,
        Err(err) => {
            debug!(error = %err, "compute stream read failed");
            None
        }
    }
}

async fn dispatch_compute_op(inner: &Arc<WorkerInner>, msg: Msg) {
    match msg.op() {
        Some("compute-task") => handle_compute_task(inner, msg).await,
        Some("release-task") => {
            let Some(key) = msg.str_field("key").map(str::to_string) else {
                warn!("release-task without a key dropped");
                return;
            };
            let reason = msg.str_field("reason").map(str::to_string);
            let cause = reason.clone().unwrap_or_else(|| "release-task".to_string());
            inner.state.lock().await.release_key(&key, &cause, reason.as_deref());
        }
        Some("delete-data") => {
            let keys = msg.keys_field("keys");
            inner.state.lock().await.delete_data(&keys);
        }
        Some(op) => warn!(op = op, "unknown compute-stream op"),
        None => warn!("compute-stream message without an op dropped"),
    }
}

async fn handle_compute_task(inner: &Arc<WorkerInner>, mut msg: Msg) {
    let Some(key) = msg.str_field("key").map(str::to_string) else {
        warn!("compute-task without a key dropped");
        return;
    };

    // A malformed payload fails the task up front; it never enters waiting.
    let func = match msg.take("func") {
        Some(value) => match value.as_slice() {
            Some(bytes) => bytes.to_vec(),
            None => {
                report_deserialization_failure(inner, &key, "function payload is not bytes").await;
                return;
            }
        },
        None => {
            report_deserialization_failure(inner, &key, "no function payload").await;
            return;
        }
    };
    let args = msg.take("args").unwrap_or(Value::Nil);
    let kwargs = msg.take("kwargs").unwrap_or(Value::Nil);
    let priority = parse_priority(msg.get("priority"));
    let who_has = parse_who_has(&msg);

    let spec = TaskSpec { func, args, kwargs };
    inner.state.lock().await.add_task(key, spec, priority, who_has);
}

async fn report_deserialization_failure(inner: &Arc<WorkerInner>, key: &str, reason: &str) {
    warn!(key = %key, reason = reason, "dropping undeserializable task");
    let msg = Msg::new("task-erred")
        .with("key", key)
        .with("exception", format!("DeserializationFailed: {reason}"))
        .with("traceback", "while reading the compute-task message");
    send_to_scheduler(inner, vec![msg]).await;
}

fn parse_priority(value: Option<&Value>) -> Vec<i64> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
        Some(single) => single.as_i64().map(|n| vec![n]).unwrap_or_default(),
        None => Vec::new(),
    }
}

fn parse_who_has(msg: &Msg) -> Vec<(Key, Vec<Address>)> {
    let Some(entries) = msg.map_field("who_has") else {
        return Vec::new();
    };
    let mut parsed = Vec::new();
    for (key, value) in entries {
        let Some(key) = value_as_text(key) else {
            warn!("who_has entry with a non-text key dropped");
            continue;
        };
        let addrs = match value {
            Value::Array(items) => items
                .iter()
                .filter_map(value_as_text)
                .filter_map(|s| Address::parse(&s).ok())
                .collect(),
            _ => Vec::new(),
        };
        parsed.push((key, addrs));
    }
    parsed
}

// ----------------------------------------------------------------------
// Heartbeats
// ----------------------------------------------------------------------

/// Periodically report load gauges on the batched stream.
///
/// Heartbeats only flow once the stream exists; before the first
/// `compute-stream` op they are skipped.
async fn run_heartbeat(inner: Arc<WorkerInner>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let gauges = inner.state.lock().await.gauges();
        let batched = inner.batched.lock().await;
        if let Some(sender) = batched.as_ref() {
            let msg = heartbeat_msg(&inner.address, gauges);
            if sender.send(msg.into_value()).is_err() {
                debug!("heartbeat skipped, stream closed");
            }
        }
    }
}

// ----------------------------------------------------------------------
// Outbound scheduler traffic
// ----------------------------------------------------------------------

/// Drain the state outbox onto the scheduler stream.
async fn flush_outbox(inner: &Arc<WorkerInner>) {
    let msgs = inner.state.lock().await.take_outbox();
    send_to_scheduler(inner, msgs).await;
}

async fn send_to_scheduler(inner: &Arc<WorkerInner>, msgs: Vec<Msg>) {
    if msgs.is_empty() {
        return;
    }
    {
        let batched = inner.batched.lock().await;
        if let Some(sender) = batched.as_ref() {
            for msg in &msgs {
                if let Err(err) = sender.send(msg.clone().into_value()) {
                    warn!(error = %err, "dropping scheduler updates, stream closed");
                    return;
                }
            }
            return;
        }
    }
    // No batched stream yet: fall back to a one-way message.
    if let Err(err) = inner.scheduler.send_oneway(msgs).await {
        debug!(error = %err, "could not report to scheduler");
    }
}

// ----------------------------------------------------------------------
// The coupled fetch and execute loops
// ----------------------------------------------------------------------

/// Drain fetchable work: dispatch gather requests while the concurrency
/// budget allows and deps with peers remain.
async fn ensure_communicating(inner: &Arc<WorkerInner>) {
    loop {
        let plan = inner.state.lock().await.plan_fetch();
        match plan {
            FetchPlan::Dispatch { addr, deps } => spawn_gather(inner.clone(), addr, deps),
            FetchPlan::MissingDeps { deps } => spawn_recovery(inner.clone(), deps),
            FetchPlan::Idle => break,
        }
    }
}

/// Drain the ready queue into the executor.
async fn ensure_computing(inner: &Arc<WorkerInner>) {
    loop {
        let job = inner.state.lock().await.next_executable();
        match job {
            Some(job) => spawn_execute(inner.clone(), job),
            None => break,
        }
    }
}

fn spawn_gather(inner: Arc<WorkerInner>, addr: Address, deps: Vec<Key>) {
    inner.tracker.clone().spawn(async move {
        let msg = Msg::new("get_data")
            .with("keys", keys_value(deps.iter()))
            .with("who", inner.address.to_string());
        let reply = inner.rpc.call(&addr, msg).await;

        let missing = {
            let mut state = inner.state.lock().await;
            match reply.ok().and_then(Msg::from_value) {
                Some(reply) => {
                    let fetched: HashMap<Key, Value> =
                        reply.fields().map(|(k, v)| (k.to_string(), v.clone())).collect();
                    state.gather_succeeded(&addr, &deps, fetched)
                }
                None => state.gather_failed(&addr, &deps),
            }
        };
        flush_outbox(&inner).await;
        if !missing.is_empty() {
            recover_missing_deps(&inner, missing).await;
        }
        ensure_communicating(&inner).await;
        ensure_computing(&inner).await;
    });
}

fn spawn_recovery(inner: Arc<WorkerInner>, deps: Vec<Key>) {
    inner.tracker.clone().spawn(async move {
        recover_missing_deps(&inner, deps).await;
    });
}

fn spawn_execute(inner: Arc<WorkerInner>, job: ExecuteJob) {
    inner.tracker.clone().spawn(async move {
        let ExecuteJob { key, func, args, kwargs } = job;
        debug!(key = %key, "executing task");
        let outcome = inner.executor.execute(&func, args, kwargs).await;
        inner.state.lock().await.finish_execution(&key, outcome);
        flush_outbox(&inner).await;
        ensure_computing(&inner).await;
        ensure_communicating(&inner).await;
    });
}

/// Missing-dep recovery: ask the scheduler where the deps live, poison deps
/// past the suspicion threshold, release deps nobody can produce.
async fn recover_missing_deps(inner: &Arc<WorkerInner>, deps: Vec<Key>) {
    let (poisoned, to_query) = {
        let mut state = inner.state.lock().await;
        let poisoned = state.tick_suspicion(&deps);
        for dep in &poisoned {
            state.poison_dep(dep);
        }
        let to_query: Vec<Key> =
            deps.iter().filter(|d| !poisoned.contains(*d)).cloned().collect();
        (poisoned, to_query)
    };
    if !poisoned.is_empty() {
        flush_outbox(inner).await;
    }
    if to_query.is_empty() {
        ensure_computing(inner).await;
        return;
    }

    debug!(deps = to_query.len(), "asking scheduler who has missing deps");
    let reply = inner.scheduler.who_has(&to_query).await.unwrap_or_default();
    {
        let mut state = inner.state.lock().await;
        state.apply_who_has_reply(&to_query, reply);
    }
    flush_outbox(inner).await;
    ensure_communicating(inner).await;
    ensure_computing(inner).await;
}
