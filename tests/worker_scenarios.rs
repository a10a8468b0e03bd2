//! End-to-end scenarios for the worker runtime.
//!
//! Each test drives a real worker over TCP against a scripted scheduler.
//!
//! # Test Categories
//!
//! 1. **Session** - registration, termination, the request handler table
//! 2. **Execution** - single tasks, dependent tasks, error propagation
//! 3. **Fetching** - peer-to-peer dependency gathering, dead peers
//! 4. **Cancellation** - release semantics, steal no-ops, resubmission
//!
//! Tiger Style:
//! - Bounded timeouts on every await that could hang
//! - Scripted scheduler replies, no sleeps for correctness

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dask_worker::comm::{Connection, ConnectionPool, Rpc};
use dask_worker::executor::{ArithmeticExecutor, Executor, TaskOutcome};
use dask_worker::proto::{keys_value, Msg};
use dask_worker::{Address, Worker, WorkerConfig};
use rmpv::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

/// Timeout for any single await in these tests.
const OP_TIMEOUT: Duration = Duration::from_secs(10);
/// Window used to assert that a message does NOT arrive.
const SILENCE_WINDOW: Duration = Duration::from_millis(300);
/// Poll interval when watching the scheduler inbox.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Harness
// ============================================================================

/// A scripted scheduler: answers `register`/`unregister`/`who_has`, records
/// everything it hears.
#[derive(Clone)]
struct MockScheduler {
    addr: Address,
    inbox: Arc<Mutex<Vec<Msg>>>,
    who_has: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl MockScheduler {
    async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = Address::tcp("127.0.0.1", listener.local_addr()?.port());
        let scheduler = Self {
            addr,
            inbox: Arc::new(Mutex::new(Vec::new())),
            who_has: Arc::new(Mutex::new(HashMap::new())),
        };
        let accept = scheduler.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let conn =
                    Connection::from_stream(stream, Address::tcp("127.0.0.1", peer.port()));
                let scheduler = accept.clone();
                tokio::spawn(async move { scheduler.serve(conn).await });
            }
        });
        Ok(scheduler)
    }

    async fn serve(&self, mut conn: Connection) {
        while let Ok(Some(frames)) = conn.recv().await {
            for frame in frames {
                let Some(msg) = Msg::from_value(frame) else { continue };
                let wants_reply = msg.bool_field("reply", false);
                let op = msg.op().map(str::to_string);
                self.inbox.lock().await.push(msg);
                if !wants_reply {
                    continue;
                }
                let reply = match op.as_deref() {
                    Some("register") | Some("unregister") => Value::from("OK"),
                    Some("who_has") => {
                        let known = self.who_has.lock().await;
                        let mut reply = Msg::empty();
                        for (key, addrs) in known.iter() {
                            reply.insert(
                                key,
                                Value::Array(
                                    addrs.iter().map(|a| Value::from(a.as_str())).collect(),
                                ),
                            );
                        }
                        reply.into_value()
                    }
                    _ => Value::from("OK"),
                };
                if conn.send(&[reply]).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Configure the `who_has` answer for a key.
    async fn advertise(&self, key: &str, addrs: Vec<String>) {
        self.who_has.lock().await.insert(key.to_string(), addrs);
    }

    /// Wait until a recorded message satisfies the predicate.
    async fn wait_for<F>(&self, what: &str, pred: F) -> Result<Msg>
    where
        F: Fn(&Msg) -> bool,
    {
        let deadline = tokio::time::Instant::now() + OP_TIMEOUT;
        loop {
            if let Some(found) = self.inbox.lock().await.iter().find(|m| pred(m)) {
                return Ok(found.clone());
            }
            if tokio::time::Instant::now() > deadline {
                bail!("timed out waiting for {what}");
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// The scheduler's side of a compute-stream connection to a worker.
struct ComputeStream {
    conn: Connection,
    seen: Vec<Msg>,
}

impl ComputeStream {
    /// Connect to the worker and switch the connection into stream mode.
    async fn open(worker: &Address) -> Result<Self> {
        let mut conn = Connection::connect(worker).await?;
        conn.send(&[Msg::new("compute-stream").with("reply", false).into_value()]).await?;
        Ok(Self { conn, seen: Vec::new() })
    }

    /// Push ops to the worker as one wire message.
    async fn send(&mut self, msgs: Vec<Msg>) -> Result<()> {
        let frames: Vec<Value> = msgs.into_iter().map(Msg::into_value).collect();
        self.conn.send(&frames).await?;
        Ok(())
    }

    /// Read worker reports until one matches.
    async fn recv_until<F>(&mut self, what: &str, pred: F) -> Result<Msg>
    where
        F: Fn(&Msg) -> bool,
    {
        if let Some(found) = self.seen.iter().find(|m| pred(m)) {
            return Ok(found.clone());
        }
        let deadline = tokio::time::Instant::now() + OP_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .with_context(|| format!("timed out waiting for {what}"))?;
            let frames = timeout(remaining, self.conn.recv())
                .await
                .with_context(|| format!("timed out waiting for {what}"))??
                .with_context(|| format!("stream closed waiting for {what}"))?;
            for frame in frames {
                if let Some(msg) = Msg::from_value(frame) {
                    self.seen.push(msg);
                }
            }
            if let Some(found) = self.seen.iter().find(|m| pred(m)) {
                return Ok(found.clone());
            }
        }
    }

    /// Collect whatever arrives within the window.
    async fn drain_for(&mut self, window: Duration) -> Vec<Msg> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                break;
            };
            match timeout(remaining, self.conn.recv()).await {
                Ok(Ok(Some(frames))) => {
                    for frame in frames {
                        if let Some(msg) = Msg::from_value(frame) {
                            self.seen.push(msg);
                        }
                    }
                }
                _ => break,
            }
        }
        self.seen.clone()
    }
}

fn is_op_for(msg: &Msg, op: &str, key: &str) -> bool {
    msg.op() == Some(op) && msg.str_field("key") == Some(key)
}

fn compute_task(key: &str, func: &[u8], args: Value) -> Msg {
    Msg::new("compute-task")
        .with("key", key)
        .with("func", Value::Binary(func.to_vec()))
        .with("args", args)
        .with("priority", Value::Array(vec![Value::from(0i64)]))
}

fn with_who_has(msg: Msg, entries: Vec<(&str, Vec<String>)>) -> Msg {
    let map = Value::Map(
        entries
            .into_iter()
            .map(|(dep, addrs)| {
                (
                    Value::from(dep),
                    Value::Array(addrs.into_iter().map(Value::from).collect()),
                )
            })
            .collect(),
    );
    msg.with("who_has", map)
}

async fn start_worker(scheduler: &MockScheduler, executor: Arc<dyn Executor>) -> Result<Worker> {
    let config = WorkerConfig::for_scheduler(&scheduler.addr);
    let worker = timeout(OP_TIMEOUT, Worker::start(config, executor)).await??;
    Ok(worker)
}

fn test_rpc() -> Rpc {
    Rpc::new(Arc::new(ConnectionPool::new(8, 4)))
}

/// An executor that counts invocations before delegating.
struct CountingExecutor {
    count: Arc<AtomicUsize>,
    inner: ArithmeticExecutor,
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn execute(&self, func: &[u8], args: Value, kwargs: Value) -> TaskOutcome {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(func, args, kwargs).await
    }
}

/// An executor slow enough that a release can race it deliberately.
struct SlowExecutor {
    delay: Duration,
    inner: ArithmeticExecutor,
}

#[async_trait]
impl Executor for SlowExecutor {
    async fn execute(&self, func: &[u8], args: Value, kwargs: Value) -> TaskOutcome {
        sleep(self.delay).await;
        self.inner.execute(func, args, kwargs).await
    }
}

/// A peer that accepts connections and never answers.
async fn blackhole_peer() -> Result<(Address, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = Address::tcp("127.0.0.1", listener.local_addr()?.port());
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    Ok((addr, handle))
}

/// A freed port nothing listens on.
async fn dead_peer() -> Result<Address> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = Address::tcp("127.0.0.1", listener.local_addr()?.port());
    drop(listener);
    Ok(addr)
}

// ============================================================================
// Session
// ============================================================================

#[tokio::test]
async fn worker_registers_with_the_scheduler() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;

    let register = scheduler.wait_for("register", |m| m.op() == Some("register")).await?;
    assert_eq!(register.str_field("address"), Some(worker.address().to_string().as_str()));
    assert!(register.int_field("ncores").unwrap_or(0) >= 1);
    assert!(register.get("now").is_some());
    assert!(register.get("services").is_some());

    worker.close(true).await?;
    scheduler.wait_for("unregister", |m| m.op() == Some("unregister")).await?;
    Ok(())
}

#[tokio::test]
async fn registration_failure_is_fatal() -> Result<()> {
    // A scheduler address nothing listens on.
    let addr = dead_peer().await?;
    let config = WorkerConfig::for_scheduler(&addr);
    let result = timeout(OP_TIMEOUT, Worker::start(config, Arc::new(ArithmeticExecutor))).await?;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn update_data_keys_and_delete_data_handlers() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let rpc = test_rpc();

    let update = Msg::new("update_data")
        .with("data", Msg::empty().with("K", 42i64).into_value())
        .with("report", true);
    let reply = timeout(OP_TIMEOUT, rpc.call(worker.address(), update)).await??;
    let reply = Msg::from_value(reply).context("update_data reply is a map")?;
    assert_eq!(reply.str_field("status"), Some("OK"));
    assert!(reply.get("nbytes").is_some());

    // The report path tells the scheduler about the new key.
    scheduler
        .wait_for("add-keys", |m| {
            m.op() == Some("add-keys") && m.keys_field("keys") == vec!["K".to_string()]
        })
        .await?;

    let keys = timeout(OP_TIMEOUT, rpc.call(worker.address(), Msg::new("keys"))).await??;
    assert_eq!(keys, Value::Array(vec![Value::from("K")]));

    let delete = Msg::new("delete_data").with("keys", keys_value(["K"])).with("reply", false);
    rpc.send_oneway(worker.address(), vec![delete]).await?;
    let deadline = tokio::time::Instant::now() + OP_TIMEOUT;
    while worker.holds("K").await {
        assert!(tokio::time::Instant::now() < deadline, "K never deleted");
        sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

#[tokio::test]
async fn terminate_replies_then_shuts_down() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let rpc = test_rpc();

    let reply =
        timeout(OP_TIMEOUT, rpc.call(worker.address(), Msg::new("terminate"))).await??;
    assert_eq!(reply, Value::from("OK"));

    scheduler.wait_for("unregister", |m| m.op() == Some("unregister")).await?;
    let deadline = tokio::time::Instant::now() + OP_TIMEOUT;
    while worker.status().await != dask_worker::WorkerStatus::Closed {
        assert!(tokio::time::Instant::now() < deadline, "worker never closed");
        sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

#[tokio::test]
async fn unknown_ops_keep_the_connection_alive() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;

    let mut conn = Connection::connect(worker.address()).await?;
    conn.send(&[Msg::new("launch-missiles").with("reply", false).into_value()]).await?;
    // The connection still answers afterwards.
    conn.send(&[Msg::new("keys").with("reply", true).into_value()]).await?;
    let frames = timeout(OP_TIMEOUT, conn.recv()).await??.context("reply expected")?;
    assert_eq!(frames[0], Value::Array(vec![]));
    Ok(())
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test]
async fn single_add_and_execute() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let mut stream = ComputeStream::open(worker.address()).await?;

    stream
        .send(vec![compute_task("A", b"int", Value::Array(vec![Value::from(2.0f64)]))])
        .await?;
    let finished =
        stream.recv_until("task-finished A", |m| is_op_for(m, "task-finished", "A")).await?;
    assert_eq!(finished.str_field("status"), Some("OK"));
    assert!(finished.int_field("nbytes").unwrap_or(0) > 0);

    let rpc = test_rpc();
    let reply = timeout(
        OP_TIMEOUT,
        rpc.call(worker.address(), Msg::new("get_data").with("keys", keys_value(["A"]))),
    )
    .await??;
    let reply = Msg::from_value(reply).context("get_data reply is a map")?;
    assert_eq!(reply.get("A"), Some(&Value::from(2i64)));
    Ok(())
}

#[tokio::test]
async fn dependent_computation_completes_in_order() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let mut stream = ComputeStream::open(worker.address()).await?;

    // B arrives before the task that produces its input.
    let b = with_who_has(
        compute_task("B", b"add", Value::Array(vec![Value::from(5i64), Value::from("A")])),
        vec![("A", vec![])],
    );
    let a = compute_task("A", b"int", Value::Array(vec![Value::from(2.0f64)]));
    stream.send(vec![b, a]).await?;

    stream.recv_until("task-finished B", |m| is_op_for(m, "task-finished", "B")).await?;
    let finish_order: Vec<&str> = stream
        .seen
        .iter()
        .filter(|m| m.op() == Some("task-finished"))
        .filter_map(|m| m.str_field("key"))
        .collect();
    assert_eq!(finish_order, vec!["A", "B"], "A must complete before B");

    let rpc = test_rpc();
    let reply = timeout(
        OP_TIMEOUT,
        rpc.call(worker.address(), Msg::new("get_data").with("keys", keys_value(["B"]))),
    )
    .await??;
    let reply = Msg::from_value(reply).context("get_data reply is a map")?;
    assert_eq!(reply.get("B"), Some(&Value::from(7i64)));
    Ok(())
}

#[tokio::test]
async fn errors_propagate_to_dependents_as_values() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let mut stream = ComputeStream::open(worker.address()).await?;

    stream
        .send(vec![compute_task("C", b"int", Value::Array(vec![Value::from(2.3f64)]))])
        .await?;
    let erred = stream.recv_until("task-erred C", |m| is_op_for(m, "task-erred", "C")).await?;
    assert_eq!(erred.str_field("exception"), Some("InexactError"));

    // A dependent receives the error as its input value.
    let d = with_who_has(
        compute_task("D", b"identity", Value::Array(vec![Value::from("C")])),
        vec![("C", vec![])],
    );
    stream.send(vec![d]).await?;
    stream.recv_until("task-finished D", |m| is_op_for(m, "task-finished", "D")).await?;

    let rpc = test_rpc();
    let reply = timeout(
        OP_TIMEOUT,
        rpc.call(worker.address(), Msg::new("get_data").with("keys", keys_value(["D"]))),
    )
    .await??;
    let reply = Msg::from_value(reply).context("get_data reply is a map")?;
    let value = Msg::from_value(reply.get("D").cloned().context("D present")?)
        .context("D's value is the error map")?;
    assert_eq!(value.str_field("exception"), Some("InexactError"));
    Ok(())
}

#[tokio::test]
async fn malformed_tasks_err_without_entering_the_state_machine() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let mut stream = ComputeStream::open(worker.address()).await?;

    // No func payload at all.
    let msg = Msg::new("compute-task").with("key", "bad");
    stream.send(vec![msg]).await?;
    let erred =
        stream.recv_until("task-erred bad", |m| is_op_for(m, "task-erred", "bad")).await?;
    assert!(erred.str_field("exception").unwrap_or("").contains("DeserializationFailed"));
    assert!(!worker.holds("bad").await);
    Ok(())
}

// ============================================================================
// Fetching
// ============================================================================

#[tokio::test]
async fn dependencies_are_fetched_from_peers() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let holder = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let runner = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let rpc = test_rpc();

    // Seed the holder with A = 42.
    let update = Msg::new("update_data")
        .with("data", Msg::empty().with("A", 42i64).into_value())
        .with("report", false);
    timeout(OP_TIMEOUT, rpc.call(holder.address(), update)).await??;

    // B = 1 + A runs on the other worker and must gather A first.
    let mut stream = ComputeStream::open(runner.address()).await?;
    let b = with_who_has(
        compute_task("B", b"add", Value::Array(vec![Value::from(1i64), Value::from("A")])),
        vec![("A", vec![holder.address().to_string()])],
    );
    stream.send(vec![b]).await?;
    stream.recv_until("task-finished B", |m| is_op_for(m, "task-finished", "B")).await?;

    // The arrival was announced.
    let added = stream
        .seen
        .iter()
        .any(|m| m.op() == Some("add-keys") && m.keys_field("keys").contains(&"A".to_string()));
    assert!(added, "add-keys for the fetched dependency");

    let reply = timeout(
        OP_TIMEOUT,
        rpc.call(runner.address(), Msg::new("get_data").with("keys", keys_value(["B"]))),
    )
    .await??;
    let reply = Msg::from_value(reply).context("get_data reply is a map")?;
    assert_eq!(reply.get("B"), Some(&Value::from(43i64)));
    Ok(())
}

#[tokio::test]
async fn gather_handler_fetches_and_reports_missing() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let holder = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let runner = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let rpc = test_rpc();

    let update = Msg::new("update_data")
        .with("data", Msg::empty().with("X", 7i64).into_value())
        .with("report", false);
    timeout(OP_TIMEOUT, rpc.call(holder.address(), update)).await??;

    let gather = Msg::new("gather").with(
        "who_has",
        Value::Map(vec![(
            Value::from("X"),
            Value::Array(vec![Value::from(holder.address().to_string())]),
        )]),
    );
    let reply = timeout(OP_TIMEOUT, rpc.call(runner.address(), gather)).await??;
    let reply = Msg::from_value(reply).context("gather reply is a map")?;
    assert_eq!(reply.str_field("status"), Some("OK"));
    assert!(runner.holds("X").await);

    // A key advertised only on a dead peer comes back as missing-data.
    let dead = dead_peer().await?;
    let gather = Msg::new("gather").with(
        "who_has",
        Value::Map(vec![(
            Value::from("Y"),
            Value::Array(vec![Value::from(dead.to_string())]),
        )]),
    );
    let reply = timeout(OP_TIMEOUT, rpc.call(runner.address(), gather)).await??;
    let reply = Msg::from_value(reply).context("gather reply is a map")?;
    assert_eq!(reply.str_field("status"), Some("missing-data"));
    assert_eq!(reply.keys_field("keys"), vec!["Y".to_string()]);
    Ok(())
}

#[tokio::test]
async fn unreachable_peers_poison_the_dependency() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    let dead = dead_peer().await?;
    // The scheduler keeps advertising the same dead peer: no help.
    scheduler.advertise("D", vec![dead.to_string()]).await;

    let mut stream = ComputeStream::open(worker.address()).await?;
    let t = with_who_has(
        compute_task("T", b"identity", Value::Array(vec![Value::from("D")])),
        vec![("D", vec![dead.to_string()])],
    );
    stream.send(vec![t]).await?;

    let erred = stream.recv_until("task-erred T", |m| is_op_for(m, "task-erred", "T")).await?;
    assert!(erred.str_field("exception").unwrap_or("").contains("DependencyPoisoned"));
    Ok(())
}

#[tokio::test]
async fn deps_nobody_has_release_their_dependents() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    // Scheduler who_has answers are empty: nobody has D anywhere.

    let mut stream = ComputeStream::open(worker.address()).await?;
    let t = with_who_has(
        compute_task("T", b"identity", Value::Array(vec![Value::from("D")])),
        vec![("D", vec![])],
    );
    stream.send(vec![t]).await?;

    let released = stream.recv_until("release T", |m| is_op_for(m, "release", "T")).await?;
    assert_eq!(released.str_field("cause"), Some("no-workers-found"));
    Ok(())
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn release_while_waiting_removes_the_task_silently() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let worker = start_worker(&scheduler, Arc::new(ArithmeticExecutor)).await?;
    // A peer that accepts the fetch and never answers keeps E waiting.
    let (blackhole, _guard) = blackhole_peer().await?;

    let mut stream = ComputeStream::open(worker.address()).await?;
    let e = with_who_has(
        compute_task("E", b"identity", Value::Array(vec![Value::from("X")])),
        vec![("X", vec![blackhole.to_string()])],
    );
    stream.send(vec![e]).await?;
    stream
        .send(vec![Msg::new("release-task").with("key", "E").with("reason", "stolen")])
        .await?;

    let seen = stream.drain_for(SILENCE_WINDOW).await;
    let release_seen = seen.iter().any(|m| is_op_for(m, "release", "E"));
    assert!(release_seen, "the release is reported");
    let finished = seen.iter().any(|m| is_op_for(m, "task-finished", "E"));
    assert!(!finished, "no task-finished for a released task");
    assert!(!worker.holds("E").await);
    Ok(())
}

#[tokio::test]
async fn steal_release_is_ignored_while_executing() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let executor =
        Arc::new(SlowExecutor { delay: Duration::from_millis(300), inner: ArithmeticExecutor });
    let worker = start_worker(&scheduler, executor).await?;
    let mut stream = ComputeStream::open(worker.address()).await?;

    stream
        .send(vec![compute_task("E", b"int", Value::Array(vec![Value::from(2.0f64)]))])
        .await?;
    // Let it enter the executor, then try to steal it back.
    sleep(Duration::from_millis(100)).await;
    stream
        .send(vec![Msg::new("release-task").with("key", "E").with("reason", "stolen")])
        .await?;

    let finished =
        stream.recv_until("task-finished E", |m| is_op_for(m, "task-finished", "E")).await?;
    assert_eq!(finished.str_field("status"), Some("OK"));
    Ok(())
}

#[tokio::test]
async fn resubmission_echoes_without_reexecution() -> Result<()> {
    let scheduler = MockScheduler::spawn().await?;
    let count = Arc::new(AtomicUsize::new(0));
    let executor =
        Arc::new(CountingExecutor { count: count.clone(), inner: ArithmeticExecutor });
    let worker = start_worker(&scheduler, executor).await?;
    let mut stream = ComputeStream::open(worker.address()).await?;

    let f = compute_task("F", b"int", Value::Array(vec![Value::from(2.0f64)]));
    stream.send(vec![f.clone()]).await?;
    stream.recv_until("task-finished F", |m| is_op_for(m, "task-finished", "F")).await?;

    stream.send(vec![f]).await?;
    let deadline = tokio::time::Instant::now() + OP_TIMEOUT;
    loop {
        let finishes = stream
            .seen
            .iter()
            .filter(|m| is_op_for(m, "task-finished", "F"))
            .count();
        if finishes >= 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "second echo never arrived");
        stream.drain_for(POLL_INTERVAL).await;
    }
    assert_eq!(count.load(Ordering::SeqCst), 1, "the function ran exactly once");
    Ok(())
}
