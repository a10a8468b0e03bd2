//! One-shot request/reply over pooled connections.

use std::sync::Arc;

use rmpv::Value;
use tracing::debug;

use crate::address::Address;
use crate::comm::pool::ConnectionPool;
use crate::error::{Result, WorkerError};
use crate::proto::Msg;

/// RPC client over a shared connection pool.
#[derive(Debug, Clone)]
pub struct Rpc {
    pool: Arc<ConnectionPool>,
}

impl Rpc {
    /// Create a client over the given pool.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Send one request and await the single reply frame.
    ///
    /// `reply: true` is stamped onto the message. The connection returns to
    /// the pool on success and is dropped on failure.
    pub async fn call(&self, addr: &Address, msg: Msg) -> Result<Value> {
        let msg = msg.with("reply", true);
        let mut conn = self.pool.acquire(addr).await?;
        let result = exchange(&mut conn, msg).await;
        match result {
            Ok(value) => {
                self.pool.release(conn).await;
                Ok(value)
            }
            Err(err) => {
                debug!(addr = %addr, error = %err, "rpc failed");
                Err(err)
            }
        }
    }

    /// Send messages without awaiting any reply.
    pub async fn send_oneway(&self, addr: &Address, msgs: Vec<Msg>) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        let frames: Vec<Value> = msgs
            .into_iter()
            .map(|m| m.with("reply", false).into_value())
            .collect();
        let mut conn = self.pool.acquire(addr).await?;
        conn.send(&frames).await?;
        self.pool.release(conn).await;
        Ok(())
    }
}

async fn exchange(conn: &mut crate::comm::connection::Connection, msg: Msg) -> Result<Value> {
    conn.send(&[msg.into_value()]).await?;
    let frames = conn.recv().await?;
    match frames {
        Some(mut frames) if !frames.is_empty() => Ok(frames.remove(0)),
        _ => Err(WorkerError::PeerMissing { address: conn.peer().to_string() }),
    }
}
