// ABOUTME: Error family for acquiring, using and releasing pooled management connections
//
// Every failure in the crate surfaces as a ConnectionError. Variants carry the
// originating cause as an Arc so an error can be handed to every caller that
// was waiting on the same pid.

//! Error types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Shared, clonable error cause
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Result type for pool and connection operations
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Wrap any error as a shared cause
pub fn cause<E>(err: E) -> Cause
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(err)
}

/// Failure reported by a helper process through the handshake channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HelperFailure {
    /// Message exactly as the helper sent it
    pub message: String,
}

impl HelperFailure {
    /// Wrap a helper's failure message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Ways a caller can misuse `ConnectionPool::release`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    /// No entry exists for the pid
    UnknownPid,
    /// The entry exists but its connection is still being set up
    NotReady,
    /// The connection handed back is not the one the pool holds for the pid
    ConnectionMismatch,
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPid => write!(f, "unknown pid"),
            Self::NotReady => write!(f, "connection not established yet"),
            Self::ConnectionMismatch => write!(f, "connection does not belong to this pid"),
        }
    }
}

/// Coarse classification of a ConnectionError
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Owner of the target process could not be determined
    Resolution,
    /// Helper process could not be launched
    Spawn,
    /// Helper did not report within the handshake timeout
    HandshakeTimeout,
    /// Helper reported an internal failure
    HandshakeFailure,
    /// Connecting to, or talking over, the management endpoint failed
    ProtocolConnect,
    /// The pool API was used incorrectly
    Misuse,
}

/// Errors produced while acquiring, using or releasing a management connection
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Owner username of the process could not be resolved
    #[error("Unable to resolve owner of process {pid}: {cause}")]
    Resolution {
        /// Target process id
        pid: u32,
        /// Underlying error
        #[source]
        cause: Cause,
    },

    /// Helper process could not be launched
    #[error("Failed to spawn helper for process {pid}: {cause}")]
    Spawn {
        /// Target process id
        pid: u32,
        /// Underlying error
        #[source]
        cause: Cause,
    },

    /// Helper did not report an endpoint in time
    #[error("Helper for process {pid} did not report within {timeout:?}")]
    HandshakeTimeout {
        /// Target process id
        pid: u32,
        /// Handshake timeout that elapsed
        timeout: Duration,
    },

    /// Helper reported that it could not expose the management endpoint
    #[error("Helper for process {pid} reported failure: {cause}")]
    HandshakeFailure {
        /// Target process id
        pid: u32,
        /// Underlying error
        #[source]
        cause: Cause,
    },

    /// Connecting to the endpoint or talking over it failed
    #[error("Management connection to process {pid} at {endpoint} failed: {cause}")]
    ProtocolConnect {
        /// Target process id
        pid: u32,
        /// Endpoint being connected to or used
        endpoint: String,
        /// Underlying error
        #[source]
        cause: Cause,
    },

    /// Object name handed to `create_proxy` is malformed or unsuitable
    #[error("Invalid object name '{name}': {reason}")]
    InvalidObjectName {
        /// Name as given
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Remote side answered a request with an error
    #[error("Process {pid} rejected {operation} on {object}: {message}")]
    Remote {
        /// Target process id
        pid: u32,
        /// Object the request addressed
        object: String,
        /// Request that failed
        operation: String,
        /// Error text from the target
        message: String,
    },

    /// Connection was already closed
    #[error("Management connection to process {pid} is closed")]
    Closed {
        /// Target process id
        pid: u32,
    },

    /// Pool API misuse
    #[error("Invalid release for process {pid}: {misuse}")]
    Misuse {
        /// Target process id
        pid: u32,
        /// What was wrong with the call
        misuse: Misuse,
    },

    /// Handshake channel could not be set up or failed underneath a helper
    #[error("Handshake channel error: {cause}")]
    HandshakeChannel {
        /// Underlying error
        #[source]
        cause: Cause,
    },

    /// Setup for the pid was abandoned before it completed
    #[error("Connection setup for process {pid} was abandoned")]
    Aborted {
        /// Target process id
        pid: u32,
    },
}

impl ConnectionError {
    /// Map onto the coarse error taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Self::HandshakeFailure { .. } | Self::HandshakeChannel { .. } | Self::Aborted { .. } => {
                ErrorKind::HandshakeFailure
            }
            Self::ProtocolConnect { .. }
            | Self::InvalidObjectName { .. }
            | Self::Remote { .. }
            | Self::Closed { .. } => ErrorKind::ProtocolConnect,
            Self::Misuse { .. } => ErrorKind::Misuse,
        }
    }

    /// The pid the error relates to, if any
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Resolution { pid, .. }
            | Self::Spawn { pid, .. }
            | Self::HandshakeTimeout { pid, .. }
            | Self::HandshakeFailure { pid, .. }
            | Self::ProtocolConnect { pid, .. }
            | Self::Remote { pid, .. }
            | Self::Closed { pid }
            | Self::Misuse { pid, .. }
            | Self::Aborted { pid } => Some(*pid),
            Self::InvalidObjectName { .. } | Self::HandshakeChannel { .. } => None,
        }
    }

    pub(crate) fn protocol(pid: u32, endpoint: impl fmt::Display, err: impl Into<Cause>) -> Self {
        Self::ProtocolConnect {
            pid,
            endpoint: endpoint.to_string(),
            cause: err.into(),
        }
    }
}
