//! Worker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{Result, WorkerError};

/// Default cap on concurrent peer fetches.
pub const DEFAULT_TOTAL_CONNECTIONS: usize = 50;

/// Default batched-sender flush interval.
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 2;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Configuration for one worker.
///
/// Durations are carried as integer milliseconds so the struct stays
/// TOML-friendly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Address of the central scheduler.
    pub scheduler_address: String,
    /// Address to listen on; port 0 picks an ephemeral port.
    pub listen_address: String,
    /// Executor slots advertised to the scheduler.
    pub ncores: usize,
    /// Memory budget in bytes advertised to the scheduler; 0 means
    /// unlimited.
    pub memory_limit: u64,
    /// Cap on concurrent peer fetches.
    pub total_connections: usize,
    /// Batched-sender flush interval in milliseconds.
    pub batch_interval_ms: u64,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Cap on idle pooled connections across all peers.
    pub pool_limit: usize,
    /// Cap on idle pooled connections per peer.
    pub pool_per_address: usize,
    /// Auxiliary services advertised at registration, name to port.
    pub services: Vec<(String, u16)>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scheduler_address: "tcp://127.0.0.1:8786".to_string(),
            listen_address: "tcp://127.0.0.1:0".to_string(),
            ncores: std::thread::available_parallelism().map_or(1, |n| n.get()),
            memory_limit: 0,
            total_connections: DEFAULT_TOTAL_CONNECTIONS,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            pool_limit: crate::comm::pool::DEFAULT_POOL_LIMIT,
            pool_per_address: crate::comm::pool::DEFAULT_PER_ADDRESS_LIMIT,
            services: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// A config pointed at the given scheduler, defaults elsewhere.
    pub fn for_scheduler(scheduler: &Address) -> Self {
        Self { scheduler_address: scheduler.to_string(), ..Self::default() }
    }

    /// Fail fast on inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.ncores == 0 {
            return Err(WorkerError::InvalidConfig { reason: "ncores must be at least 1".into() });
        }
        if self.total_connections == 0 {
            return Err(WorkerError::InvalidConfig {
                reason: "total_connections must be at least 1".into(),
            });
        }
        if self.pool_limit == 0 || self.pool_per_address == 0 {
            return Err(WorkerError::InvalidConfig {
                reason: "connection pool limits must be at least 1".into(),
            });
        }
        Address::parse(&self.scheduler_address)?;
        Address::parse(&self.listen_address)?;
        Ok(())
    }

    /// Parsed scheduler address.
    pub fn scheduler(&self) -> Result<Address> {
        Address::parse(&self.scheduler_address)
    }

    /// Parsed listen address.
    pub fn listen(&self) -> Result<Address> {
        Address::parse(&self.listen_address)
    }

    /// Batched-sender interval as a duration.
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.total_connections, 50);
        assert_eq!(config.batch_interval(), Duration::from_millis(2));
    }

    #[test]
    fn bad_settings_fail_fast() {
        let config = WorkerConfig { ncores: 0, ..WorkerConfig::default() };
        assert!(config.validate().is_err());

        let config = WorkerConfig { total_connections: 0, ..WorkerConfig::default() };
        assert!(config.validate().is_err());

        let config =
            WorkerConfig { scheduler_address: "://".to_string(), ..WorkerConfig::default() };
        assert!(config.validate().is_err());
    }
}
