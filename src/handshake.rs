// ABOUTME: Single-assignment handshake slot between a helper report and the waiting connector
//
// A Handshake starts Pending and moves exactly once to Resolved(endpoint) or
// Failed(reason). The reporting side (handshake server task) and the waiting
// side (connector) are different tasks; waiting is a bounded watch-channel
// wait, never a poll. A timed-out wait does not touch the state, and reports
// arriving after the first terminal assignment are rejected.

//! Helper handshake slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{cause, ConnectionError, HelperFailure, Result};

/// Observable handshake state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// No report yet
    Pending,
    /// Helper reported its endpoint
    Resolved(Endpoint),
    /// Helper reported an internal failure
    Failed(HelperFailure),
}

impl HandshakeState {
    /// Returns true for Resolved and Failed
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Write-once handshake result shared by reporter and waiter
///
/// Cloning yields another handle to the same slot.
#[derive(Debug, Clone)]
pub struct Handshake {
    pid: u32,
    state: Arc<watch::Sender<HandshakeState>>,
}

impl Handshake {
    /// Create a pending handshake for `pid`
    #[must_use]
    pub fn new(pid: u32) -> Self {
        let (tx, _rx) = watch::channel(HandshakeState::Pending);
        Self {
            pid,
            state: Arc::new(tx),
        }
    }

    /// Target pid this handshake belongs to
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    /// Record the endpoint. Returns false if a terminal state was already set.
    pub fn resolve(&self, endpoint: Endpoint) -> bool {
        self.assign(HandshakeState::Resolved(endpoint))
    }

    /// Record a helper failure. Returns false if a terminal state was already set.
    pub fn fail(&self, failure: HelperFailure) -> bool {
        self.assign(HandshakeState::Failed(failure))
    }

    fn assign(&self, next: HandshakeState) -> bool {
        let pid = self.pid;
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                warn!(pid = pid, current = ?current, rejected = ?next, "Discarding late handshake report");
                false
            } else {
                debug!(pid = pid, state = ?next, "Handshake settled");
                *current = next;
                true
            }
        })
    }

    /// Wait up to `timeout` for a terminal state
    ///
    /// Terminal states return immediately without waiting. An elapsed timeout
    /// yields `HandshakeTimeout` and leaves the state Pending.
    pub async fn wait(&self, timeout: Duration) -> Result<Endpoint> {
        let mut rx = self.state.subscribe();

        let settled = if rx.borrow().is_terminal() {
            rx.borrow().clone()
        } else {
            match tokio::time::timeout(timeout, rx.wait_for(HandshakeState::is_terminal)).await {
                Ok(Ok(state)) => state.clone(),
                // Sender lives as long as self, so the channel cannot close here
                Ok(Err(_closed)) => {
                    return Err(ConnectionError::Aborted { pid: self.pid });
                }
                Err(_elapsed) => {
                    return Err(ConnectionError::HandshakeTimeout {
                        pid: self.pid,
                        timeout,
                    });
                }
            }
        };

        self.outcome(settled)
    }

    fn outcome(&self, state: HandshakeState) -> Result<Endpoint> {
        match state {
            HandshakeState::Resolved(endpoint) => Ok(endpoint),
            HandshakeState::Failed(failure) => Err(ConnectionError::HandshakeFailure {
                pid: self.pid,
                cause: cause(failure),
            }),
            HandshakeState::Pending => Err(ConnectionError::Aborted { pid: self.pid }),
        }
    }
}
