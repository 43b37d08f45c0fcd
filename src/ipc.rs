// ABOUTME: Pool-side end of the handshake channel that helper processes report to
// ABOUTME: Unix socket server routing hello/ready/failed reports to the pending handshake for each pid

//! Handshake channel server.
//!
//! One `HandshakeServer` exists per pool. Every registration gets its own
//! attempt name (the server name plus a per-attempt suffix), which is passed
//! to the helper on the command line together with the socket path. A helper
//! connects, identifies the pid and attempt it serves, receives verbs on the
//! same connection, and reports the endpoint it exposed (or why it could
//! not). A hello carrying the name of an earlier attempt for the same pid is
//! refused, so a helper that outlived its deadline cannot answer for a newer
//! attempt.
//!
//! # Wire format
//!
//! JSON Lines in both directions:
//!
//! ```text
//! helper → pool   {"type":"hello","pid":100,"server":"mgmt-pool-3f2a…-7"}
//! pool   → helper {"verb":"attach"}
//! helper → pool   {"type":"ready","pid":100,"endpoint":"tcp://127.0.0.1:4000"}
//!                 {"type":"failed","pid":100,"error":"..."}
//! pool   → helper {"verb":"detach"}
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{cause, ConnectionError, HelperFailure, Result};
use crate::handshake::{Handshake, HandshakeState};
use crate::owner::username_for_uid;

// === Wire Messages ===

/// Messages a helper sends to the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperReport {
    /// Helper is up and serves `pid` for the attempt named `server`
    Hello {
        /// Target process id
        pid: u32,
        /// Attempt name from the helper's command line
        server: String,
    },
    /// Management endpoint is listening
    Ready {
        /// Target process id
        pid: u32,
        /// Endpoint address as a URL
        endpoint: String,
    },
    /// Helper could not expose the endpoint
    Failed {
        /// Target process id
        pid: u32,
        /// Helper's description of the failure
        error: String,
    },
}

/// Verbs the pool sends to a helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum HelperVerb {
    /// Attach to the target process and report the endpoint
    Attach,
    /// Tear down and exit
    Detach,
}

// === Control Channel ===

/// Sender half for verbs addressed to one connected helper
#[derive(Debug, Clone)]
pub struct ControlChannel {
    pid: u32,
    tx: mpsc::Sender<HelperVerb>,
}

impl ControlChannel {
    /// Queue a verb for the helper
    ///
    /// # Errors
    /// Returns `BrokenPipe` once the helper connection is gone
    pub async fn send(&self, verb: HelperVerb) -> io::Result<()> {
        self.tx.send(verb).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("helper for process {} is no longer connected", self.pid),
            )
        })
    }

    /// Target pid the helper serves
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }
}

// === Registry ===

struct Registration {
    token: u64,
    attempt: String,
    owner: String,
    handshake: Handshake,
    control_tx: Option<oneshot::Sender<ControlChannel>>,
}

type Registry = Arc<Mutex<HashMap<u32, Registration>>>;

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<u32, Registration>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_current(registry: &Registry, pid: u32, token: u64) -> bool {
    lock(registry).get(&pid).is_some_and(|r| r.token == token)
}

/// A pid waiting for its helper to report
///
/// Dropping it withdraws the registration; later reports are discarded.
pub struct PendingHelper {
    pid: u32,
    token: u64,
    attempt: String,
    handshake: Handshake,
    control_rx: Option<oneshot::Receiver<ControlChannel>>,
    registry: Registry,
}

impl PendingHelper {
    /// Target pid of this registration
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Attempt name the helper must present in its hello
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.attempt
    }

    /// Handshake slot the helper's report lands in
    #[must_use]
    pub const fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Wait until the helper has connected and said hello
    ///
    /// # Errors
    /// `HandshakeTimeout` when `deadline` passes first, `HandshakeChannel`
    /// when the server dropped the registration
    pub async fn control_channel(
        &mut self,
        deadline: Instant,
        timeout: std::time::Duration,
    ) -> Result<ControlChannel> {
        let rx = self.control_rx.as_mut().ok_or_else(|| ConnectionError::HandshakeChannel {
            cause: cause(io::Error::new(
                io::ErrorKind::Other,
                "control channel already taken",
            )),
        })?;

        let result = tokio::time::timeout_at(deadline, rx).await;
        match result {
            Ok(Ok(channel)) => {
                self.control_rx = None;
                Ok(channel)
            }
            // Rejected helpers fail the handshake before dropping the channel
            Ok(Err(_)) => match self.handshake.state() {
                HandshakeState::Failed(failure) => Err(ConnectionError::HandshakeFailure {
                    pid: self.pid,
                    cause: cause(failure),
                }),
                HandshakeState::Pending | HandshakeState::Resolved(_) => {
                    Err(ConnectionError::HandshakeChannel {
                        cause: cause(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            format!("registration for process {} was withdrawn", self.pid),
                        )),
                    })
                }
            },
            Err(_elapsed) => Err(ConnectionError::HandshakeTimeout {
                pid: self.pid,
                timeout,
            }),
        }
    }
}

impl Drop for PendingHelper {
    fn drop(&mut self) {
        let mut map = lock(&self.registry);
        if map.get(&self.pid).is_some_and(|r| r.token == self.token) {
            map.remove(&self.pid);
            debug!(pid = self.pid, "Handshake registration withdrawn");
        }
    }
}

// === Handshake Server ===

/// Unix socket server receiving helper reports
pub struct HandshakeServer {
    server_name: String,
    socket_path: PathBuf,
    registry: Registry,
    next_token: AtomicU64,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HandshakeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeServer")
            .field("server_name", &self.server_name)
            .field("socket_path", &self.socket_path)
            .field("pending", &lock(&self.registry).len())
            .finish()
    }
}

impl HandshakeServer {
    /// Bind a fresh uniquely named socket in the configured directory
    ///
    /// # Errors
    /// Returns error if the socket directory or listener cannot be created
    pub fn bind(config: &PoolConfig) -> io::Result<Self> {
        let server_name = config.unique_server_name();
        let socket_path = config.get_socket_path(&server_name)?;

        // Remove stale socket file if exists
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;

        // Helpers run as the target's owner, so any local user may connect;
        // peer credentials are checked per connection instead.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o666);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            config.verify_peer_owner,
            server_name.clone(),
        ));

        info!(server = %server_name, socket = %socket_path.display(), "Handshake server listening");

        Ok(Self {
            server_name,
            socket_path,
            registry,
            next_token: AtomicU64::new(1),
            accept_handle: Mutex::new(Some(accept_handle)),
        })
    }

    /// Unique name of this server; attempt names extend it
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Socket path helpers connect to
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of pids waiting for their helper
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Expect a helper for `pid` whose peer credentials belong to `owner`
    pub fn register(&self, pid: u32, owner: &str) -> PendingHelper {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let attempt = format!("{}-{token}", self.server_name);
        let handshake = Handshake::new(pid);
        let (control_tx, control_rx) = oneshot::channel();

        let previous = lock(&self.registry).insert(
            pid,
            Registration {
                token,
                attempt: attempt.clone(),
                owner: owner.to_string(),
                handshake: handshake.clone(),
                control_tx: Some(control_tx),
            },
        );
        if previous.is_some() {
            warn!(pid = pid, "Replacing an existing handshake registration");
        }

        PendingHelper {
            pid,
            token,
            attempt,
            handshake,
            control_rx: Some(control_rx),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Stop accepting helpers and remove the socket file
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .accept_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
            lock(&self.registry).clear();
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(error = %e, socket = %self.socket_path.display(), "Failed to remove handshake socket");
                }
            }
            info!(server = %self.server_name, "Handshake server stopped");
        }
    }
}

impl Drop for HandshakeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accept loop - runs as background task until aborted
async fn accept_loop(listener: UnixListener, registry: Registry, verify_peer: bool, server: String) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!(server = %server, "Helper connected");
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handle_helper(stream, registry, verify_peer).await {
                        debug!(error = %e, "Helper connection ended with error");
                    }
                });
            }
            Err(e) => {
                error!(server = %server, error = %e, "Failed to accept helper connection");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Bound state of one helper connection after its hello
struct BoundHelper {
    pid: u32,
    token: u64,
    handshake: Handshake,
}

/// Serve one helper connection: hello, reports, then verbs until it disconnects
async fn handle_helper(stream: UnixStream, registry: Registry, verify_peer: bool) -> io::Result<()> {
    let peer_uid = stream.peer_cred().ok().map(|cred| cred.uid());
    let (read_half, write_half) = stream.into_split();
    let mut write_half = Some(write_half);
    let mut lines = BufReader::new(read_half).lines();
    let mut bound: Option<BoundHelper> = None;
    let mut writer_handle: Option<JoinHandle<()>> = None;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let report: HelperReport = match serde_json::from_str(&line) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed helper report");
                continue;
            }
        };

        match report {
            HelperReport::Hello { pid, server } => {
                if bound.is_some() {
                    warn!(pid = pid, "Ignoring repeated hello");
                    continue;
                }

                let (token, owner, handshake, control_tx) = {
                    let mut map = lock(&registry);
                    let Some(registration) = map.get_mut(&pid) else {
                        warn!(pid = pid, "Hello from helper for a pid nobody is waiting on");
                        return Ok(());
                    };
                    if registration.attempt != server {
                        warn!(
                            pid = pid,
                            server = %server,
                            expected = %registration.attempt,
                            "Hello from a helper of an earlier attempt"
                        );
                        return Ok(());
                    }
                    (
                        registration.token,
                        registration.owner.clone(),
                        registration.handshake.clone(),
                        registration.control_tx.take(),
                    )
                };

                let Some(control_tx) = control_tx else {
                    warn!(pid = pid, "A helper for this pid is already connected");
                    return Ok(());
                };

                if verify_peer {
                    if let Err(reason) = check_peer(peer_uid, &owner) {
                        warn!(pid = pid, reason = %reason, "Rejecting helper connection");
                        handshake.fail(HelperFailure::new(reason));
                        return Ok(());
                    }
                }

                let (tx, rx) = mpsc::channel(4);
                if let Some(writer) = write_half.take() {
                    writer_handle = Some(tokio::spawn(verb_writer_loop(writer, rx, pid)));
                }
                if control_tx.send(ControlChannel { pid, tx }).is_err() {
                    debug!(pid = pid, "Connector stopped waiting before hello arrived");
                }
                bound = Some(BoundHelper {
                    pid,
                    token,
                    handshake,
                });
            }
            HelperReport::Ready { pid, endpoint } => {
                let Some(helper) = bound_for(&bound, pid) else {
                    continue;
                };
                if !is_current(&registry, pid, helper.token) {
                    warn!(pid = pid, endpoint = %endpoint, "Discarding late endpoint report");
                    continue;
                }
                match endpoint.parse() {
                    Ok(parsed) => {
                        info!(pid = pid, endpoint = %endpoint, "Helper reported endpoint");
                        helper.handshake.resolve(parsed);
                    }
                    Err(e) => {
                        helper
                            .handshake
                            .fail(HelperFailure::new(format!("helper reported {e}")));
                    }
                }
            }
            HelperReport::Failed { pid, error } => {
                let Some(helper) = bound_for(&bound, pid) else {
                    continue;
                };
                if !is_current(&registry, pid, helper.token) {
                    warn!(pid = pid, error = %error, "Discarding late failure report");
                    continue;
                }
                warn!(pid = pid, error = %error, "Helper reported failure");
                helper.handshake.fail(HelperFailure::new(error));
            }
        }
    }

    if let Some(helper) = bound {
        if helper.handshake.state().is_terminal() {
            debug!(pid = helper.pid, "Helper disconnected");
        } else if is_current(&registry, helper.pid, helper.token) {
            helper.handshake.fail(HelperFailure::new(
                "helper closed the handshake channel before reporting",
            ));
        }
    }

    if let Some(handle) = writer_handle {
        handle.abort();
    }

    Ok(())
}

fn bound_for(bound: &Option<BoundHelper>, pid: u32) -> Option<&BoundHelper> {
    match bound {
        Some(helper) if helper.pid == pid => Some(helper),
        Some(helper) => {
            warn!(pid = pid, bound_pid = helper.pid, "Ignoring report for another pid");
            None
        }
        None => {
            warn!(pid = pid, "Ignoring report sent before hello");
            None
        }
    }
}

/// Helper must run as the target's owner or as root
fn check_peer(peer_uid: Option<u32>, owner: &str) -> std::result::Result<(), String> {
    let uid = peer_uid.ok_or_else(|| "peer credentials unavailable".to_string())?;
    if uid == 0 {
        return Ok(());
    }
    let name = username_for_uid(uid).map_err(|e| e.to_string())?;
    if name == owner {
        Ok(())
    } else {
        Err(format!("helper runs as '{name}' but process is owned by '{owner}'"))
    }
}

/// Write queued verbs to the helper as JSON lines
async fn verb_writer_loop(writer: OwnedWriteHalf, mut rx: mpsc::Receiver<HelperVerb>, pid: u32) {
    let mut writer = BufWriter::new(writer);

    while let Some(verb) = rx.recv().await {
        let mut line = match serde_json::to_vec(&verb) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(pid = pid, error = %e, "Failed to encode verb");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = writer.write_all(&line).await {
            warn!(pid = pid, verb = ?verb, error = %e, "Failed to send verb to helper");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(pid = pid, verb = ?verb, error = %e, "Failed to flush verb to helper");
            break;
        }
        debug!(pid = pid, verb = ?verb, "Sent verb to helper");
    }
}

// === Helper-side client ===

/// Helper-side connection to a handshake server
///
/// Used by helper implementations (and tests standing in for them) to speak
/// the handshake protocol.
pub struct HelperConnection {
    lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl HelperConnection {
    /// Connect to the server socket and announce `pid` for the attempt `server_name`
    pub async fn connect(socket_path: &Path, pid: u32, server_name: &str) -> io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, writer) = stream.into_split();
        let mut conn = Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        conn.send(&HelperReport::Hello {
            pid,
            server: server_name.to_string(),
        })
        .await?;
        Ok(conn)
    }

    /// Send a report line
    pub async fn send(&mut self, report: &HelperReport) -> io::Result<()> {
        let mut line = serde_json::to_vec(report)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }

    /// Next verb from the pool; `None` once the pool hangs up
    pub async fn next_verb(&mut self) -> io::Result<Option<HelperVerb>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let verb = serde_json::from_str(&line)?;
            return Ok(Some(verb));
        }
        Ok(None)
    }
}
