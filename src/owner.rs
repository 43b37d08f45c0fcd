// ABOUTME: Maps a process id to the OS username that owns the process
//
// The helper must run with the target's identity, so the pool resolves the
// owner before spawning anything. Unresolvable owners (process gone, no
// permission, uid without a passwd entry) stop the acquire early.

//! Process owner lookup.

use std::io;

use nix::unistd::{Uid, User};
use thiserror::Error;

/// Errors while resolving a process owner
#[derive(Debug, Error)]
pub enum OwnerError {
    /// No such process (or it exited)
    #[error("Process {0} not found")]
    NoSuchProcess(u32),

    /// Process information could not be read
    #[error("Unable to read process {pid} information: {source}")]
    Unreadable {
        /// Target process id
        pid: u32,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Process status did not contain a usable uid
    #[error("Process {pid} status has no usable Uid line")]
    MissingUid {
        /// Target process id
        pid: u32,
    },

    /// Uid has no account
    #[error("No user account for uid {0}")]
    UnknownUid(u32),

    /// Passwd database lookup failed
    #[error("Account lookup for uid {uid} failed: {source}")]
    AccountLookup {
        /// Uid from the status file
        uid: u32,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Owner lookup is not available here
    #[error("Process owner lookup is not supported on this platform")]
    Unsupported,
}

/// Resolves the owning username of a process
#[cfg_attr(test, mockall::automock)]
pub trait OwnerResolver: Send + Sync {
    /// Owner username of `pid`
    fn resolve_owner(&self, pid: u32) -> Result<String, OwnerError>;
}

/// Production resolver backed by `/proc/<pid>/status` and the passwd database
#[derive(Debug, Clone, Default)]
pub struct ProcOwnerResolver;

impl ProcOwnerResolver {
    /// Resolver reading the local `/proc`
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Real uid of `pid`
    pub fn owner_uid(&self, pid: u32) -> Result<u32, OwnerError> {
        let path = format!("/proc/{pid}/status");
        let status = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => OwnerError::NoSuchProcess(pid),
            _ => OwnerError::Unreadable { pid, source: e },
        })?;
        parse_real_uid(&status).ok_or(OwnerError::MissingUid { pid })
    }
}

impl OwnerResolver for ProcOwnerResolver {
    fn resolve_owner(&self, pid: u32) -> Result<String, OwnerError> {
        if !cfg!(target_os = "linux") {
            return Err(OwnerError::Unsupported);
        }
        let uid = self.owner_uid(pid)?;
        username_for_uid(uid)
    }
}

/// Look up the account name for a uid
pub fn username_for_uid(uid: u32) -> Result<String, OwnerError> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(OwnerError::UnknownUid(uid)),
        Err(errno) => Err(OwnerError::AccountLookup {
            uid,
            source: io::Error::from(errno),
        }),
    }
}

/// First field of the `Uid:` line (real uid)
fn parse_real_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}
