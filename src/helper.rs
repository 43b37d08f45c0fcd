// ABOUTME: Helper process launching and the attach/detach verbs sent to a running helper
//
// A helper is a small privileged program that runs as the target process's
// owner, attaches to the target and exposes a management endpoint. The pool
// starts one per pid with four positional arguments (pid, username, handshake
// socket path, attempt name) and inherited stdio, then drives it through the
// handshake channel. Helpers are never killed by the pool: a helper that
// misses its deadline is handed to a background reaper that logs its exit.

//! Helper processes.

#![allow(clippy::missing_const_for_fn)]

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::endpoint::Endpoint;
use crate::error::{cause, ConnectionError, Result};
use crate::ipc::{ControlChannel, HelperVerb, PendingHelper};

// === Launch Arguments ===

/// Everything a helper needs on its command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperArgs {
    /// Target process id
    pub pid: u32,
    /// Account the helper must run as
    pub username: String,
    /// Handshake socket to report to
    pub ipc_socket: PathBuf,
    /// Name of this attempt on the pool's handshake server, echoed in the hello
    pub server_name: String,
}

impl HelperArgs {
    /// Positional argv in the order helpers expect
    #[must_use]
    pub fn to_argv(&self) -> Vec<OsString> {
        vec![
            OsString::from(self.pid.to_string()),
            OsString::from(&self.username),
            self.ipc_socket.clone().into_os_string(),
            OsString::from(&self.server_name),
        ]
    }
}

/// Exit status of a helper process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

impl HelperExit {
    /// Whether the helper exited with code 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for HelperExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

// === Launcher Seam ===

/// A running helper process
#[async_trait]
pub trait HelperProcess: Send {
    /// OS process id of the helper, when known
    fn id(&self) -> Option<u32>;

    /// Wait for the helper to exit
    async fn wait(&mut self) -> io::Result<HelperExit>;
}

/// Starts helper processes
#[async_trait]
pub trait HelperLauncher: Send + Sync {
    /// Start a helper with `args` as its command line
    async fn launch(&self, args: &HelperArgs) -> io::Result<Box<dyn HelperProcess>>;
}

/// Production launcher running the helper executable via `tokio::process`
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    config: PoolConfig,
}

impl CommandLauncher {
    /// Launcher for the configured helper command
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HelperLauncher for CommandLauncher {
    async fn launch(&self, args: &HelperArgs) -> io::Result<Box<dyn HelperProcess>> {
        let program = self.config.resolve_helper_path()?;

        debug!(program = %program.display(), pid = args.pid, user = %args.username, "Launching helper");

        let child = Command::new(&program)
            .args(args.to_argv())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            // The pool never kills helpers; they exit on detach
            .kill_on_drop(false)
            .spawn()?;

        Ok(Box::new(ChildHelper { child }))
    }
}

struct ChildHelper {
    child: Child,
}

#[async_trait]
impl HelperProcess for ChildHelper {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<HelperExit> {
        let status = self.child.wait().await?;
        Ok(HelperExit {
            code: status.code(),
        })
    }
}

// === Helper Client ===

/// Pool-side handle on one running helper
///
/// Lives from spawn until `detach` (or `abandon`).
pub struct HelperProcessClient {
    pid: u32,
    process: Box<dyn HelperProcess>,
    control: Option<ControlChannel>,
    detach_timeout: Duration,
}

impl fmt::Debug for HelperProcessClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperProcessClient")
            .field("pid", &self.pid)
            .field("helper_pid", &self.process.id())
            .field("attached", &self.control.is_some())
            .finish()
    }
}

impl HelperProcessClient {
    /// Launch a helper for `args.pid`
    ///
    /// # Errors
    /// Returns `Spawn` if the helper could not be started
    pub async fn spawn(
        launcher: &dyn HelperLauncher,
        args: &HelperArgs,
        detach_timeout: Duration,
    ) -> Result<Self> {
        let process = launcher
            .launch(args)
            .await
            .map_err(|e| ConnectionError::Spawn {
                pid: args.pid,
                cause: cause(e),
            })?;

        info!(pid = args.pid, helper_pid = ?process.id(), "Helper spawned");

        Ok(Self {
            pid: args.pid,
            process,
            control: None,
            detach_timeout,
        })
    }

    /// Target pid this helper serves
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// OS pid of the helper itself
    #[must_use]
    pub fn helper_id(&self) -> Option<u32> {
        self.process.id()
    }

    /// Whether the helper has connected to the handshake channel
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.control.is_some()
    }

    /// Drive the handshake: wait for hello, send `attach`, wait for the report
    ///
    /// The whole exchange is bounded by `deadline`; `timeout` is the configured
    /// duration reported in a `HandshakeTimeout`.
    pub async fn attach(
        &mut self,
        pending: &mut PendingHelper,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Endpoint> {
        let control = pending.control_channel(deadline, timeout).await?;
        control
            .send(HelperVerb::Attach)
            .await
            .map_err(|e| ConnectionError::HandshakeFailure {
                pid: self.pid,
                cause: cause(e),
            })?;
        self.control = Some(control);

        let remaining = deadline.saturating_duration_since(Instant::now());
        match pending.handshake().wait(remaining).await {
            Err(ConnectionError::HandshakeTimeout { pid, .. }) => {
                Err(ConnectionError::HandshakeTimeout { pid, timeout })
            }
            other => other,
        }
    }

    /// Send `detach` and wait for the helper to exit
    ///
    /// Best effort: failures are logged, never returned. A helper that outlives
    /// the detach timeout is left to the reaper.
    pub async fn detach(mut self) {
        if let Some(control) = self.control.take() {
            if let Err(e) = control.send(HelperVerb::Detach).await {
                debug!(pid = self.pid, error = %e, "Could not deliver detach");
            }
        }

        let outcome = tokio::time::timeout(self.detach_timeout, self.process.wait()).await;
        match outcome {
            Ok(Ok(exit)) if exit.success() => {
                debug!(pid = self.pid, "Helper exited");
            }
            Ok(Ok(exit)) => {
                warn!(pid = self.pid, status = %exit, "Helper exited with failure status");
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Failed to wait for helper");
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    timeout_ms = u64::try_from(self.detach_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Helper did not exit after detach"
                );
                self.abandon();
            }
        }
    }

    /// Leave the helper running and log its exit from a background task
    pub fn abandon(self) {
        let pid = self.pid;
        let mut process = self.process;
        let helper_pid = process.id();
        debug!(pid = pid, helper_pid = ?helper_pid, "Handing helper to reaper");

        tokio::spawn(async move {
            match process.wait().await {
                Ok(exit) if exit.success() => {
                    debug!(pid = pid, helper_pid = ?helper_pid, "Abandoned helper exited");
                }
                Ok(exit) => {
                    warn!(pid = pid, helper_pid = ?helper_pid, status = %exit, "Abandoned helper exited with failure status");
                }
                Err(e) => {
                    warn!(pid = pid, helper_pid = ?helper_pid, error = %e, "Failed to reap abandoned helper");
                }
            }
        });
    }
}
