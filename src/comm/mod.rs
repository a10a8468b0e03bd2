//! Connection handling: framed connections, batched sending, pooling, RPC.

pub mod batched;
pub mod connection;
pub mod pool;
pub mod rpc;

pub use batched::BatchedSender;
pub use connection::{Connection, MessageReader, MessageWriter};
pub use pool::ConnectionPool;
pub use rpc::Rpc;
