// ABOUTME: Reference-counted pool of management connections keyed by target pid
// ABOUTME: Concurrent acquires for one pid share a single setup; the last release closes the session

//! Management connection pool.
//!
//! `ConnectionPool` is the facade callers use. `acquire(pid)` returns the
//! shared connection for a process, setting it up on first use; `release`
//! hands a reference back and closes the connection when nobody holds it any
//! more.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ConnectionPool                         │
//! │  entries: Mutex<HashMap<u32, Entry>>                         │
//! │     4242 -> Entry { usage: 3, Ready(conn), session }         │
//! │     4711 -> Entry { usage: 1, Connecting }                   │
//! │                                                              │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │ Connector                                            │    │
//! │  │  OwnerResolver -> HelperLauncher -> HandshakeServer  │    │
//! │  │                -> Dialer -> ManagementConnection     │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The map lock is held only for bookkeeping. Setup runs outside it; its
//! outcome is published to every waiter of the entry through a watch channel.
//!
//! # Usage
//!
//! ```ignore
//! let pool = ConnectionPool::with_system_defaults(PoolConfig::load_or_default()?)?;
//!
//! let conn = pool.acquire(4242).await?;
//! let memory: MemoryProxy = conn.create_proxy("runtime:type=Memory")?;
//! // ...
//! pool.release(4242, &conn).await?;
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{Dialer, ManagementConnection, NetDialer};
use crate::connector::{Connector, Session};
use crate::error::{cause, ConnectionError, Misuse, Result};
use crate::helper::{CommandLauncher, HelperLauncher};
use crate::owner::{OwnerResolver, ProcOwnerResolver};

// === Entries ===

/// Setup progress of one entry, observed by every acquirer of the pid
#[derive(Debug, Clone)]
enum EntryState {
    Connecting,
    Ready(Arc<ManagementConnection>),
    Failed(ConnectionError),
}

struct Entry {
    /// Distinguishes this entry from later entries for the same pid
    generation: u64,
    usage_count: usize,
    state: watch::Receiver<EntryState>,
    /// Present once Ready
    session: Option<Session>,
}

impl Entry {
    fn connection(&self) -> Option<Arc<ManagementConnection>> {
        match &*self.state.borrow() {
            EntryState::Ready(conn) => Some(Arc::clone(conn)),
            EntryState::Connecting | EntryState::Failed(_) => None,
        }
    }
}

type Entries = Mutex<HashMap<u32, Entry>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<u32, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Close a session from synchronous context
fn spawn_close(pid: u32, session: Session) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = session.close().await {
                    warn!(pid = pid, error = %e, "Failed to close connection");
                }
            });
        }
        Err(_) => {
            warn!(pid = pid, "No runtime available, dropping connection without closing it");
        }
    }
}

// === Cancellation Guards ===

/// Armed while the acquirer that created an entry is setting it up
///
/// If that acquire is dropped, the entry is removed and its waiters fail
/// with `Aborted`.
struct SetupGuard<'a> {
    entries: &'a Entries,
    pid: u32,
    generation: u64,
    publisher: watch::Sender<EntryState>,
    armed: bool,
}

impl SetupGuard<'_> {
    /// Publish the final state, disarming the guard
    fn publish(&mut self, state: EntryState) {
        self.armed = false;
        self.publisher.send_replace(state);
    }
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        {
            let mut entries = lock(self.entries);
            if entries
                .get(&self.pid)
                .is_some_and(|e| e.generation == self.generation)
            {
                entries.remove(&self.pid);
            }
        }

        warn!(pid = self.pid, "Connection setup abandoned by caller");
        self.publisher
            .send_replace(EntryState::Failed(ConnectionError::Aborted { pid: self.pid }));
    }
}

/// Armed while an acquirer waits on someone else's setup
///
/// If that acquire is dropped, its usage increment is undone.
struct WaitGuard<'a> {
    entries: &'a Entries,
    pid: u32,
    generation: u64,
    armed: bool,
}

impl WaitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let session = {
            let mut entries = lock(self.entries);
            match entries.get_mut(&self.pid) {
                Some(entry) if entry.generation == self.generation => {
                    entry.usage_count = entry.usage_count.saturating_sub(1);
                    debug!(pid = self.pid, usage = entry.usage_count, "Waiting acquire dropped");
                    if entry.usage_count == 0 {
                        entries.remove(&self.pid).and_then(|e| e.session)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(session) = session {
            spawn_close(self.pid, session);
        }
    }
}

enum Role {
    Create(watch::Sender<EntryState>, u64),
    Wait(watch::Receiver<EntryState>, u64),
}

// === Connection Pool ===

/// Pool of shared management connections keyed by pid
///
/// Constructed explicitly by the composition root and shared by reference
/// (typically inside an `Arc`).
pub struct ConnectionPool {
    entries: Entries,
    next_generation: AtomicU64,
    connector: Connector,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("pids", &self.pids())
            .field("connector", &self.connector)
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool with explicit collaborators
    ///
    /// Must be called within a Tokio runtime; the handshake server starts
    /// accepting helpers immediately.
    ///
    /// # Errors
    /// Returns `HandshakeChannel` if the handshake socket cannot be bound
    pub fn new(
        config: PoolConfig,
        resolver: Arc<dyn OwnerResolver>,
        launcher: Arc<dyn HelperLauncher>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let connector = Connector::new(config, resolver, launcher, dialer)?;
        info!(socket = %connector.server().socket_path().display(), "Connection pool created");

        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            connector,
        })
    }

    /// Create a pool backed by `/proc`, the configured helper executable and
    /// real sockets
    ///
    /// # Errors
    /// Returns `HandshakeChannel` if the handshake socket cannot be bound
    pub fn with_system_defaults(config: PoolConfig) -> Result<Self> {
        let launcher = CommandLauncher::new(config.clone());
        Self::new(
            config,
            Arc::new(ProcOwnerResolver::new()),
            Arc::new(launcher),
            Arc::new(NetDialer),
        )
    }

    /// Settings the pool was built with
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        self.connector.config()
    }

    /// Socket path helpers report to
    #[must_use]
    pub fn handshake_socket(&self) -> &Path {
        self.connector.server().socket_path()
    }

    /// Acquire the shared connection for `pid`
    ///
    /// The first acquire for a pid sets the connection up; concurrent and
    /// later acquires share it and each add one to the usage count. Every
    /// successful acquire must be paired with a `release`.
    ///
    /// # Errors
    /// Any setup failure. Every caller waiting on the same setup receives the
    /// same error and no entry is left behind.
    pub async fn acquire(&self, pid: u32) -> Result<Arc<ManagementConnection>> {
        let role = {
            let mut entries = lock(&self.entries);
            if let Some(entry) = entries.get_mut(&pid) {
                entry.usage_count += 1;
                debug!(pid = pid, usage = entry.usage_count, "Reusing pooled connection");
                if let Some(conn) = entry.connection() {
                    return Ok(conn);
                }
                Role::Wait(entry.state.clone(), entry.generation)
            } else {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let (publisher, state) = watch::channel(EntryState::Connecting);
                entries.insert(
                    pid,
                    Entry {
                        generation,
                        usage_count: 1,
                        state,
                        session: None,
                    },
                );
                Role::Create(publisher, generation)
            }
        };

        match role {
            Role::Create(publisher, generation) => self.create(pid, generation, publisher).await,
            Role::Wait(state, generation) => self.wait(pid, generation, state).await,
        }
    }

    /// Run setup for a freshly inserted entry and publish the outcome
    async fn create(
        &self,
        pid: u32,
        generation: u64,
        publisher: watch::Sender<EntryState>,
    ) -> Result<Arc<ManagementConnection>> {
        let mut guard = SetupGuard {
            entries: &self.entries,
            pid,
            generation,
            publisher,
            armed: true,
        };

        info!(pid = pid, "Establishing management connection");

        match self.connector.connect(pid).await {
            Ok(session) => {
                let conn = Arc::clone(session.connection());
                let orphaned = {
                    let mut entries = lock(&self.entries);
                    match entries.get_mut(&pid) {
                        Some(entry) if entry.generation == generation => {
                            entry.session = Some(session);
                            guard.publish(EntryState::Ready(Arc::clone(&conn)));
                            None
                        }
                        _ => Some(session),
                    }
                };

                let Some(session) = orphaned else {
                    return Ok(conn);
                };

                // Entry was drained by shutdown while connecting
                let err = ConnectionError::Aborted { pid };
                guard.publish(EntryState::Failed(err.clone()));
                if let Err(e) = session.close().await {
                    warn!(pid = pid, error = %e, "Failed to close orphaned connection");
                }
                Err(err)
            }
            Err(err) => {
                {
                    let mut entries = lock(&self.entries);
                    if entries
                        .get(&pid)
                        .is_some_and(|e| e.generation == generation)
                    {
                        entries.remove(&pid);
                    }
                    guard.publish(EntryState::Failed(err.clone()));
                }
                warn!(pid = pid, error = %err, "Failed to establish management connection");
                Err(err)
            }
        }
    }

    /// Wait for another acquirer's setup to finish
    async fn wait(
        &self,
        pid: u32,
        generation: u64,
        mut state: watch::Receiver<EntryState>,
    ) -> Result<Arc<ManagementConnection>> {
        let guard = WaitGuard {
            entries: &self.entries,
            pid,
            generation,
            armed: true,
        };

        let settled = state
            .wait_for(|s| !matches!(s, EntryState::Connecting))
            .await
            .map(|s| (*s).clone());

        match settled {
            Ok(EntryState::Ready(conn)) => {
                guard.disarm();
                Ok(conn)
            }
            // The failed entry was removed along with this waiter's usage
            Ok(EntryState::Failed(err)) => {
                guard.disarm();
                Err(err)
            }
            Ok(EntryState::Connecting) | Err(_) => {
                guard.disarm();
                Err(ConnectionError::Aborted { pid })
            }
        }
    }

    /// Hand back one reference to `conn`
    ///
    /// At zero the entry is removed, the connection closed and the helper
    /// detached.
    ///
    /// # Errors
    /// `Misuse` (usage untouched) when the pid is unknown, still connecting, or
    /// `conn` is not the pooled connection for `pid`. A failure to close is
    /// returned after the entry has been removed.
    pub async fn release(&self, pid: u32, conn: &Arc<ManagementConnection>) -> Result<()> {
        let session = {
            let mut entries = lock(&self.entries);
            let misuse = |misuse| ConnectionError::Misuse { pid, misuse };

            let entry = entries
                .get_mut(&pid)
                .ok_or_else(|| misuse(Misuse::UnknownPid))?;
            let held = entry
                .connection()
                .ok_or_else(|| misuse(Misuse::NotReady))?;
            if !Arc::ptr_eq(&held, conn) {
                return Err(misuse(Misuse::ConnectionMismatch));
            }

            entry.usage_count -= 1;
            if entry.usage_count > 0 {
                debug!(pid = pid, usage = entry.usage_count, "Released pooled connection");
                return Ok(());
            }

            entries.remove(&pid).and_then(|e| e.session)
        };

        let Some(session) = session else {
            return Ok(());
        };

        info!(pid = pid, "Last reference released, closing connection");

        // Closing continues even if this release is dropped
        match tokio::spawn(session.close()).await {
            Ok(result) => result,
            Err(e) => Err(ConnectionError::protocol(pid, conn.endpoint(), cause(e))),
        }
    }

    /// Close every pooled connection and stop the handshake server
    ///
    /// Setups still in progress finish with `Aborted`.
    ///
    /// # Errors
    /// Returns the first close failure after attempting every close
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<(u32, Entry)> = lock(&self.entries).drain().collect();
        info!(entries = drained.len(), "Shutting down connection pool");

        let closes = drained.into_iter().filter_map(|(pid, entry)| {
            entry.session.map(|session| async move { (pid, session.close().await) })
        });

        let mut first_error = None;
        for (pid, result) in join_all(closes).await {
            if let Err(e) = result {
                warn!(pid = pid, error = %e, "Failed to close connection during shutdown");
                first_error.get_or_insert(e);
            }
        }

        self.connector.server().shutdown();

        first_error.map_or(Ok(()), Err)
    }

    // === Inspection ===

    /// Current usage count for `pid`
    #[must_use]
    pub fn usage_count(&self, pid: u32) -> Option<usize> {
        lock(&self.entries).get(&pid).map(|e| e.usage_count)
    }

    /// Whether `pid` has an entry, ready or still being set up
    #[must_use]
    pub fn contains(&self, pid: u32) -> bool {
        lock(&self.entries).contains_key(&pid)
    }

    /// Whether the entry for `pid` has a published connection
    #[must_use]
    pub fn is_ready(&self, pid: u32) -> bool {
        lock(&self.entries)
            .get(&pid)
            .is_some_and(|e| e.connection().is_some())
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether the pool holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Pids with an entry, sorted
    #[must_use]
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = lock(&self.entries).keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}
