//! Scheduler session: registration, location queries, unregistration.

use rmpv::Value;
use tracing::{debug, info};

use crate::address::Address;
use crate::comm::rpc::Rpc;
use crate::error::{Result, WorkerError};
use crate::proto::{keys_value, value_as_text, Key, Msg};
use crate::state::Gauges;

/// RPC surface of the central scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    addr: Address,
    rpc: Rpc,
}

/// Everything a `register` call reports about this worker.
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    /// Address peers can reach this worker at.
    pub address: Address,
    /// Executor slots.
    pub ncores: usize,
    /// Keys already held in memory.
    pub keys: Vec<Key>,
    /// Memory budget in bytes; 0 when unlimited.
    pub memory_limit: u64,
    /// Current load gauges.
    pub gauges: Gauges,
    /// Auxiliary services, name to port.
    pub services: Vec<(String, u16)>,
}

impl SchedulerClient {
    /// Create a client for the scheduler at `addr`.
    pub fn new(addr: Address, rpc: Rpc) -> Self {
        Self { addr, rpc }
    }

    /// The scheduler's address.
    pub fn address(&self) -> &Address {
        &self.addr
    }

    /// Register this worker; errors are a hard startup failure.
    pub async fn register(&self, info: RegisterInfo) -> Result<()> {
        let msg = Msg::new("register")
            .with("address", info.address.to_string())
            .with("ncores", info.ncores as i64)
            .with("keys", keys_value(info.keys.iter()))
            .with("memory_limit", info.memory_limit as i64)
            .with("now", now_seconds())
            .with("executing", info.gauges.executing as i64)
            .with("in_memory", info.gauges.in_memory as i64)
            .with("ready", info.gauges.ready as i64)
            .with("in_flight", info.gauges.in_flight as i64)
            .with(
                "services",
                Value::Map(
                    info.services
                        .iter()
                        .map(|(name, port)| (Value::from(name.as_str()), Value::from(*port)))
                        .collect(),
                ),
            );
        let reply = self.rpc.call(&self.addr, msg).await?;
        if reply_is_ok(&reply) {
            info!(scheduler = %self.addr, "registered with scheduler");
            Ok(())
        } else {
            Err(WorkerError::SchedulerRejected { status: format!("{reply}") })
        }
    }

    /// Ask where the given keys live.
    pub async fn who_has(&self, keys: &[Key]) -> Result<Vec<(Key, Vec<Address>)>> {
        let msg = Msg::new("who_has").with("keys", keys_value(keys.iter()));
        let reply = self.rpc.call(&self.addr, msg).await?;
        let Some(reply) = Msg::from_value(reply) else {
            return Ok(Vec::new());
        };
        let mut located = Vec::new();
        for (key, value) in reply.fields() {
            let addrs = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| value_as_text(v))
                    .filter_map(|s| Address::parse(&s).ok())
                    .collect(),
                _ => Vec::new(),
            };
            located.push((key.to_string(), addrs));
        }
        debug!(keys = located.len(), "scheduler located dependencies");
        Ok(located)
    }

    /// Tell the scheduler this worker is going away.
    pub async fn unregister(&self, address: &Address) -> Result<()> {
        let msg = Msg::new("unregister").with("address", address.to_string());
        self.rpc.call(&self.addr, msg).await?;
        Ok(())
    }

    /// Fire-and-forget messages for when no batched stream exists yet.
    pub async fn send_oneway(&self, msgs: Vec<Msg>) -> Result<()> {
        self.rpc.send_oneway(&self.addr, msgs).await
    }
}

/// Build the periodic heartbeat message.
pub fn heartbeat_msg(address: &Address, gauges: Gauges) -> Msg {
    Msg::new("heartbeat")
        .with("address", address.to_string())
        .with("now", now_seconds())
        .with("executing", gauges.executing as i64)
        .with("in_memory", gauges.in_memory as i64)
        .with("ready", gauges.ready as i64)
        .with("in_flight", gauges.in_flight as i64)
}

/// Accept both `"OK"` and `{status: "OK"}` shaped replies.
fn reply_is_ok(reply: &Value) -> bool {
    if let Some(text) = value_as_text(reply) {
        return text == "OK";
    }
    Msg::from_value(reply.clone())
        .and_then(|m| m.str_field("status").map(str::to_string))
        .is_some_and(|s| s == "OK")
}

/// Wall-clock seconds since the epoch, as the protocol's float timestamp.
fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
