//! Error types for the worker.

use snafu::Snafu;

/// Result type for worker operations.
pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

/// Errors that can occur while running a worker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WorkerError {
    /// An endpoint string could not be parsed.
    #[snafu(display("invalid address: {input}"))]
    AddressParse {
        /// Input that failed to parse.
        input: String,
    },

    /// Dialing a remote endpoint failed.
    #[snafu(display("failed to connect to {address}: {source}"))]
    Connect {
        /// Address that was dialed.
        address: String,
        /// Source error.
        source: std::io::Error,
    },

    /// A read or write on an established connection failed.
    #[snafu(display("transport I/O failed: {source}"))]
    Transport {
        /// Source error.
        source: std::io::Error,
    },

    /// The peer closed the connection in the middle of a message.
    #[snafu(display("connection closed mid-message"))]
    TransportTruncated,

    /// A frame header announced a length beyond the configured limit.
    #[snafu(display("frame of {length} bytes exceeds limit of {max} bytes"))]
    FrameTooLarge {
        /// Announced frame length.
        length: u64,
        /// Maximum allowed length.
        max: u64,
    },

    /// A message could not be encoded.
    #[snafu(display("failed to encode message: {source}"))]
    Encode {
        /// Source error.
        source: rmpv::encode::Error,
    },

    /// Send on a batched sender that has been closed.
    #[snafu(display("send on closed batched sender"))]
    SenderClosed,

    /// Acquire on a connection pool that has been closed.
    #[snafu(display("connection pool is closed"))]
    PoolClosed,

    /// A peer refused the request or closed without replying.
    #[snafu(display("no reply from peer {address}"))]
    PeerMissing {
        /// Peer that went missing.
        address: String,
    },

    /// The scheduler did not accept this worker's registration.
    #[snafu(display("scheduler rejected registration: {status}"))]
    SchedulerRejected {
        /// Status the scheduler returned.
        status: String,
    },

    /// A task payload was malformed and could not be turned into a task.
    #[snafu(display("bad task payload: {reason}"))]
    Deserialization {
        /// Reason the payload is unusable.
        reason: String,
    },

    /// Executing user code failed.
    #[snafu(display("execution failed: {exception}"))]
    Execution {
        /// Exception text.
        exception: String,
    },

    /// A dependency could not be located after repeated rounds.
    #[snafu(display("dependency {key} could not be located on any peer"))]
    DependencyPoisoned {
        /// Dependency key that was poisoned.
        key: String,
    },

    /// A message violated the protocol.
    #[snafu(display("protocol violation: {reason}"))]
    ProtocolViolation {
        /// What the message did wrong.
        reason: String,
    },

    /// Worker configuration failed validation.
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        /// Reason the configuration is invalid.
        reason: String,
    },
}

/// Error kinds, for routing recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A connection broke mid-operation.
    TransportLost,
    /// A peer refused or never replied.
    PeerMissing,
    /// A task payload could not be deserialized.
    DeserializationFailed,
    /// User code threw.
    ExecutionFailed,
    /// A dependency exhausted its location attempts.
    DependencyPoisoned,
    /// A malformed or unknown message arrived.
    ProtocolViolation,
}

impl WorkerError {
    /// Get the error kind for recovery routing.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. }
            | Self::Transport { .. }
            | Self::TransportTruncated
            | Self::SenderClosed
            | Self::PoolClosed => ErrorKind::TransportLost,
            Self::PeerMissing { .. } | Self::SchedulerRejected { .. } => ErrorKind::PeerMissing,
            Self::Deserialization { .. } => ErrorKind::DeserializationFailed,
            Self::Execution { .. } => ErrorKind::ExecutionFailed,
            Self::DependencyPoisoned { .. } => ErrorKind::DependencyPoisoned,
            Self::AddressParse { .. }
            | Self::FrameTooLarge { .. }
            | Self::Encode { .. }
            | Self::ProtocolViolation { .. }
            | Self::InvalidConfig { .. } => ErrorKind::ProtocolViolation,
        }
    }

    /// Check whether the error means the connection it occurred on is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransportLost | ErrorKind::PeerMissing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_the_taxonomy() {
        let err = WorkerError::TransportTruncated;
        assert_eq!(err.kind(), ErrorKind::TransportLost);
        assert!(err.is_transport());

        let err = WorkerError::Deserialization { reason: "func missing".into() };
        assert_eq!(err.kind(), ErrorKind::DeserializationFailed);
        assert!(!err.is_transport());

        let err = WorkerError::DependencyPoisoned { key: "x".into() };
        assert_eq!(err.kind(), ErrorKind::DependencyPoisoned);
    }
}
