//! Worker node for a Dask-protocol distributed task-execution cluster.
//!
//! A central scheduler assigns serialized computations to workers; a worker
//! fetches missing inputs from peer workers, executes the computation, holds
//! results in memory, and reports state back. This crate is the worker's
//! runtime: the per-task and per-dependency state machines, the coupled
//! fetch/execute scheduler, the peer data-gathering protocol, and the framed
//! connection layer underneath them.
//!
//! ```ignore
//! use std::sync::Arc;
//! use dask_worker::{ArithmeticExecutor, Worker, WorkerConfig};
//!
//! let config = WorkerConfig {
//!     scheduler_address: "tcp://10.0.0.1:8786".into(),
//!     ..WorkerConfig::default()
//! };
//! let worker = Worker::start(config, Arc::new(ArithmeticExecutor)).await?;
//! // ... serve until terminated ...
//! worker.close(true).await?;
//! ```

#![warn(missing_docs)]

/// Endpoint addresses of the form `scheme://host:port`.
pub mod address;
/// Connection handling: framed connections, batched sending, pooling, RPC.
pub mod comm;
/// Worker configuration.
pub mod config;
/// Error types.
pub mod error;
/// Pluggable task execution.
pub mod executor;
/// Concurrent multi-peer data gathering.
pub mod gather;
/// Placeholder substitution inside structured arguments.
pub mod packing;
/// Protocol message model and framed wire format.
pub mod proto;
/// Scheduler session: registration, location queries, unregistration.
pub mod scheduler;
/// Task and dependency state machines.
pub mod state;
/// Worker runtime.
pub mod worker;

pub use address::Address;
pub use config::WorkerConfig;
pub use error::{ErrorKind, Result, WorkerError};
pub use executor::{ArithmeticExecutor, Executor, TaskOutcome};
pub use proto::{Key, Msg};
pub use worker::{Worker, WorkerStatus};
