// ABOUTME: Establishes one management session for a pid: resolve owner, spawn helper, handshake, connect
//
// The connector owns the pool's handshake server and the three OS seams
// (owner resolver, helper launcher, dialer). It never retries; every failure
// is classified, cleaned up and returned to the pool.

//! Per-pid connection setup.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{Dialer, ManagementConnection};
use crate::endpoint::Endpoint;
use crate::error::{cause, ConnectionError, Result};
use crate::helper::{HelperArgs, HelperLauncher, HelperProcessClient};
use crate::ipc::HandshakeServer;
use crate::owner::OwnerResolver;

/// A ready connection together with the helper that serves it
///
/// Closed as one unit when the pool drops the last reference.
#[derive(Debug)]
pub struct Session {
    connection: Arc<ManagementConnection>,
    helper: HelperProcessClient,
}

impl Session {
    /// Open management connection
    #[must_use]
    pub fn connection(&self) -> &Arc<ManagementConnection> {
        &self.connection
    }

    /// Close the connection, then detach the helper
    ///
    /// The helper is detached even when closing the connection fails.
    pub async fn close(self) -> Result<()> {
        let result = self.connection.close().await;
        self.helper.detach().await;
        result
    }
}

/// Builds sessions for individual pids
pub struct Connector {
    config: PoolConfig,
    resolver: Arc<dyn OwnerResolver>,
    launcher: Arc<dyn HelperLauncher>,
    dialer: Arc<dyn Dialer>,
    server: HandshakeServer,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("server", &self.server)
            .field("handshake_timeout", &self.config.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Bind the handshake server and wire the seams together
    ///
    /// # Errors
    /// Returns `HandshakeChannel` if the handshake socket cannot be bound
    pub fn new(
        config: PoolConfig,
        resolver: Arc<dyn OwnerResolver>,
        launcher: Arc<dyn HelperLauncher>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let server = HandshakeServer::bind(&config)
            .map_err(|e| ConnectionError::HandshakeChannel { cause: cause(e) })?;

        Ok(Self {
            config,
            resolver,
            launcher,
            dialer,
            server,
        })
    }

    /// Settings the connector was built with
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Handshake server helpers report to
    #[must_use]
    pub fn server(&self) -> &HandshakeServer {
        &self.server
    }

    /// Establish a session for `pid`
    ///
    /// # Errors
    /// `Resolution`, `Spawn`, `HandshakeTimeout`, `HandshakeFailure` or
    /// `ProtocolConnect` depending on the stage that failed
    pub async fn connect(&self, pid: u32) -> Result<Session> {
        let username = self
            .resolver
            .resolve_owner(pid)
            .map_err(|e| ConnectionError::Resolution { pid, cause: cause(e) })?;

        debug!(pid = pid, user = %username, "Resolved process owner");

        let mut pending = self.server.register(pid, &username);
        let args = HelperArgs {
            pid,
            username,
            ipc_socket: self.server.socket_path().to_path_buf(),
            server_name: pending.server_name().to_string(),
        };

        let timeout = self.config.handshake_timeout;
        let deadline = Instant::now() + timeout;
        let mut helper =
            HelperProcessClient::spawn(self.launcher.as_ref(), &args, self.config.detach_timeout)
                .await?;

        let endpoint = match helper.attach(&mut pending, deadline, timeout).await {
            Ok(endpoint) => endpoint,
            Err(e @ ConnectionError::HandshakeTimeout { .. }) => {
                warn!(
                    pid = pid,
                    timeout = ?timeout,
                    "Helper did not report in time, leaving it running"
                );
                helper.abandon();
                return Err(e);
            }
            Err(e) => {
                warn!(pid = pid, error = %e, "Handshake failed");
                helper.detach().await;
                return Err(e);
            }
        };
        drop(pending);

        match self.open(pid, &endpoint).await {
            Ok(connection) => {
                info!(pid = pid, endpoint = %endpoint, "Session established");
                Ok(Session {
                    connection: Arc::new(connection),
                    helper,
                })
            }
            Err(e) => {
                warn!(pid = pid, endpoint = %endpoint, error = %e, "Connecting to endpoint failed");
                helper.detach().await;
                Err(e)
            }
        }
    }

    /// Dial the endpoint and run discovery within the connect timeout
    async fn open(&self, pid: u32, endpoint: &Endpoint) -> Result<ManagementConnection> {
        let connect = async {
            let stream = self
                .dialer
                .dial(endpoint)
                .await
                .map_err(|e| ConnectionError::protocol(pid, endpoint, cause(e)))?;
            ManagementConnection::open(pid, endpoint.clone(), stream).await
        };

        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::protocol(
                pid,
                endpoint,
                cause(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {:?}", self.config.connect_timeout),
                )),
            )),
        }
    }
}
